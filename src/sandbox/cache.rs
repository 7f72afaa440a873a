use crate::error::CoordError;
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

/// Compiled modules keyed by the BLAKE3 digest of their binary.
pub struct ModuleCache<M> {
    entries: Option<Mutex<LruCache<[u8; 32], M>>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<M: Clone> ModuleCache<M> {
    /// A zero capacity disables caching; every lookup compiles.
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: NonZeroUsize::new(capacity).map(|cap| Mutex::new(LruCache::new(cap))),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn get_or_compile<F>(&self, binary: &[u8], compile: F) -> Result<M, CoordError>
    where
        F: FnOnce(&[u8]) -> Result<M, CoordError>,
    {
        let key = *blake3::hash(binary).as_bytes();
        if let Some(entries) = &self.entries
            && let Some(module) = entries.lock().get(&key)
        {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(module.clone());
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        // Compile outside the lock; a racing miss on the same binary just
        // compiles twice.
        let module = compile(binary)?;
        if let Some(entries) = &self.entries {
            entries.lock().put(key, module.clone());
        }
        Ok(module)
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.entries.as_ref().map_or(0, |e| e.lock().len()),
        }
    }
}
