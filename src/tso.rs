use crate::error::CoordError;
use std::sync::atomic::{AtomicU64, Ordering};

/// Cluster-wide logical timestamp.
pub type Timestamp = u64;

/// Allocator of strictly increasing logical timestamps.
pub trait TimestampSource: Send + Sync + 'static {
    fn allocate(&self) -> Result<Timestamp, CoordError>;

    /// Ensures every later allocation is greater than `ts`. Called after
    /// startup replay with the highest recovered timestamp.
    fn advance_past(&self, _ts: Timestamp) {}
}

/// Process-local counter, used when the coordinator runs standalone.
#[derive(Debug)]
pub struct LocalTimestampSource {
    next: AtomicU64,
}

impl Default for LocalTimestampSource {
    fn default() -> Self {
        Self::starting_at(1)
    }
}

impl LocalTimestampSource {
    pub fn starting_at(first: Timestamp) -> Self {
        Self {
            next: AtomicU64::new(first),
        }
    }

    pub fn peek(&self) -> Timestamp {
        self.next.load(Ordering::Acquire)
    }
}

impl TimestampSource for LocalTimestampSource {
    fn allocate(&self) -> Result<Timestamp, CoordError> {
        let ts = self.next.fetch_add(1, Ordering::AcqRel);
        if ts == Timestamp::MAX {
            return Err(CoordError::IntegrityError {
                message: "logical timestamp space exhausted".into(),
            });
        }
        Ok(ts)
    }

    fn advance_past(&self, ts: Timestamp) {
        self.next.fetch_max(ts.saturating_add(1), Ordering::AcqRel);
    }
}
