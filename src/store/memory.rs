use crate::error::CoordError;
use crate::store::MetaStore;
use crate::tso::Timestamp;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Volatile store for tests and embedded use.
#[derive(Debug, Default)]
pub struct MemoryMetaStore {
    entries: Mutex<BTreeMap<String, Vec<u8>>>,
    max_ts: AtomicU64,
}

impl MemoryMetaStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Writes a raw entry, bypassing the conditional path. Lets tests seed a
    /// store as if another process had written it.
    pub fn insert_raw(&self, key: &str, value: Vec<u8>) {
        self.entries.lock().insert(key.to_string(), value);
    }
}

impl MetaStore for MemoryMetaStore {
    fn put_if_absent(&self, key: &str, value: &[u8], ts: Timestamp) -> Result<bool, CoordError> {
        let mut entries = self.entries.lock();
        if entries.contains_key(key) {
            return Ok(false);
        }
        entries.insert(key.to_string(), value.to_vec());
        self.max_ts.fetch_max(ts, Ordering::AcqRel);
        Ok(true)
    }

    fn delete(&self, key: &str, ts: Timestamp) -> Result<bool, CoordError> {
        let removed = self.entries.lock().remove(key).is_some();
        if removed {
            self.max_ts.fetch_max(ts, Ordering::AcqRel);
        }
        Ok(removed)
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CoordError> {
        Ok(self.entries.lock().get(key).cloned())
    }

    fn scan(&self) -> Result<Vec<(String, Vec<u8>)>, CoordError> {
        Ok(self
            .entries
            .lock()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn high_water_mark(&self) -> Result<Timestamp, CoordError> {
        Ok(self.max_ts.load(Ordering::Acquire))
    }
}
