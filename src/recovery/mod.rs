use crate::config::RecoveryMode;
use crate::error::CoordError;
use crate::registry::{FunctionRegistry, RegistrySnapshot};
use crate::store::{MetaStore, decode_record};
use crate::tso::Timestamp;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RecoveryReport {
    pub functions: usize,
    pub skipped: usize,
    /// Highest `registered_at` seen; zero for an empty store.
    pub max_registered_at: Timestamp,
    /// Highest timestamp the store has applied, at least `max_registered_at`.
    /// New timestamps must be allocated above it.
    pub high_water_mark: Timestamp,
}

/// Replays every store record into `registry` and opens it for reads.
///
/// The registry stays in its recovering state if replay fails.
pub fn rebuild_registry(
    store: &dyn MetaStore,
    registry: &FunctionRegistry,
    mode: RecoveryMode,
) -> Result<RecoveryReport, CoordError> {
    let started = Instant::now();
    info!("recovery: scan metadata store");
    let entries = store.scan()?;
    let mut snapshot = RegistrySnapshot::new();
    let mut report = RecoveryReport::default();
    for (name, bytes) in entries {
        let record = match decode_record(&bytes) {
            Ok(record) => record,
            Err(e) if mode == RecoveryMode::Strict => {
                return Err(CoordError::Decode(format!("function '{name}': {e}")));
            }
            Err(e) => {
                warn!(function = %name, error = %e, "recovery: skipping undecodable record");
                report.skipped += 1;
                continue;
            }
        };
        report.max_registered_at = report.max_registered_at.max(record.registered_at);
        let definition = record.into_definition(name.clone());
        snapshot.insert(name, Arc::new(definition));
    }
    report.functions = snapshot.len();
    report.high_water_mark = store.high_water_mark()?.max(report.max_registered_at);
    registry.install(snapshot);
    info!(
        functions = report.functions,
        skipped = report.skipped,
        high_water_mark = report.high_water_mark,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "recovery: registry ready"
    );
    Ok(report)
}
