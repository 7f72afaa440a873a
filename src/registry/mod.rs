pub mod types;

use crate::error::CoordError;
use crate::registry::types::FunctionDefinition;
use im::HashMap;
use parking_lot::RwLock;
use std::sync::Arc;

pub type RegistrySnapshot = HashMap<String, Arc<FunctionDefinition>>;

#[derive(Debug)]
enum RegistryState {
    /// Startup replay has not finished; reads are refused.
    Recovering,
    Ready(RegistrySnapshot),
}

/// Process-resident view of every registered function.
///
/// Mutations swap entries under a short write lock, so a reader observes the
/// map either before or after a put/remove, never in between. Reads hand out
/// `Arc`s and never block on the sandbox or the store.
#[derive(Debug)]
pub struct FunctionRegistry {
    state: RwLock<RegistryState>,
}

impl Default for FunctionRegistry {
    fn default() -> Self {
        Self::new_recovering()
    }
}

impl FunctionRegistry {
    pub fn new_recovering() -> Self {
        Self {
            state: RwLock::new(RegistryState::Recovering),
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(*self.state.read(), RegistryState::Ready(_))
    }

    /// Replaces the whole content with replayed entries and opens the registry
    /// for reads.
    pub(crate) fn install(&self, entries: RegistrySnapshot) {
        *self.state.write() = RegistryState::Ready(entries);
    }

    pub fn get(&self, name: &str) -> Result<Arc<FunctionDefinition>, CoordError> {
        match &*self.state.read() {
            RegistryState::Recovering => Err(CoordError::NotReady),
            RegistryState::Ready(map) => map
                .get(name)
                .cloned()
                .ok_or_else(|| CoordError::not_found(name)),
        }
    }

    pub fn contains(&self, name: &str) -> Result<bool, CoordError> {
        match &*self.state.read() {
            RegistryState::Recovering => Err(CoordError::NotReady),
            RegistryState::Ready(map) => Ok(map.contains_key(name)),
        }
    }

    pub fn snapshot(&self) -> Result<RegistrySnapshot, CoordError> {
        match &*self.state.read() {
            RegistryState::Recovering => Err(CoordError::NotReady),
            RegistryState::Ready(map) => Ok(map.clone()),
        }
    }

    pub fn list(&self) -> Result<Vec<String>, CoordError> {
        let mut names: Vec<String> = self.snapshot()?.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    pub fn len(&self) -> usize {
        match &*self.state.read() {
            RegistryState::Recovering => 0,
            RegistryState::Ready(map) => map.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn put(
        &self,
        definition: FunctionDefinition,
    ) -> Result<Arc<FunctionDefinition>, CoordError> {
        let mut state = self.state.write();
        let RegistryState::Ready(map) = &mut *state else {
            return Err(CoordError::NotReady);
        };
        if map.contains_key(&definition.name) {
            return Err(CoordError::already_exists(&definition.name));
        }
        let definition = Arc::new(definition);
        map.insert(definition.name.clone(), Arc::clone(&definition));
        Ok(definition)
    }

    pub(crate) fn remove(&self, name: &str) -> Result<Arc<FunctionDefinition>, CoordError> {
        let mut state = self.state.write();
        let RegistryState::Ready(map) = &mut *state else {
            return Err(CoordError::NotReady);
        };
        map.remove(name).ok_or_else(|| CoordError::not_found(name))
    }
}

#[cfg(test)]
mod tests {
    use super::{FunctionRegistry, RegistrySnapshot};
    use crate::error::CoordError;
    use crate::registry::types::{DataType, FunctionDefinition};
    use std::sync::Arc;

    fn def(name: &str, ts: u64) -> FunctionDefinition {
        FunctionDefinition {
            name: name.into(),
            binary: vec![0, 1, 2],
            arg_types: vec![DataType::Int32],
            registered_at: ts,
        }
    }

    fn ready() -> FunctionRegistry {
        let registry = FunctionRegistry::new_recovering();
        registry.install(RegistrySnapshot::new());
        registry
    }

    #[test]
    fn recovering_registry_is_not_readable() {
        let registry = FunctionRegistry::new_recovering();
        assert!(!registry.is_ready());
        assert!(matches!(registry.get("f"), Err(CoordError::NotReady)));
        assert!(matches!(registry.list(), Err(CoordError::NotReady)));
        assert!(matches!(registry.put(def("f", 1)), Err(CoordError::NotReady)));

        registry.install(RegistrySnapshot::new());
        assert!(registry.is_ready());
        assert!(registry.is_empty());
        assert!(matches!(registry.get("f"), Err(CoordError::NotFound { .. })));
    }

    #[test]
    fn put_rejects_duplicates_and_keeps_first_definition() {
        let registry = ready();
        registry.put(def("f", 1)).expect("first put");
        let err = registry.put(def("f", 2)).expect_err("duplicate");
        assert_eq!(err.code_str(), "already_exists");
        assert_eq!(registry.get("f").expect("get").registered_at, 1);
    }

    #[test]
    fn remove_missing_is_not_found() {
        let registry = ready();
        assert!(matches!(
            registry.remove("nope"),
            Err(CoordError::NotFound { .. })
        ));
        registry.put(def("f", 1)).expect("put");
        registry.remove("f").expect("remove");
        assert!(registry.is_empty());
    }

    #[test]
    fn snapshots_are_isolated_from_later_mutations() {
        let registry = ready();
        registry.put(def("a", 1)).expect("put a");
        let before = registry.snapshot().expect("snapshot");
        registry.put(def("b", 2)).expect("put b");
        registry.remove("a").expect("remove a");
        assert_eq!(before.len(), 1);
        assert!(before.contains_key("a"));
        assert_eq!(registry.list().expect("list"), vec!["b".to_string()]);
    }

    #[test]
    fn concurrent_readers_see_whole_entries() {
        let registry = Arc::new(ready());
        let writer = {
            let registry = Arc::clone(&registry);
            std::thread::spawn(move || {
                for ts in 1..=500u64 {
                    registry.put(def("hot", ts)).expect("put");
                    registry.remove("hot").expect("remove");
                }
            })
        };
        let readers: Vec<_> = (0..4)
            .map(|_| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    for _ in 0..2_000 {
                        match registry.get("hot") {
                            Ok(d) => {
                                assert_eq!(d.name, "hot");
                                assert_eq!(d.binary, vec![0, 1, 2]);
                            }
                            Err(CoordError::NotFound { .. }) => {}
                            Err(other) => panic!("unexpected error: {other:?}"),
                        }
                    }
                })
            })
            .collect();
        writer.join().expect("writer");
        for r in readers {
            r.join().expect("reader");
        }
    }
}
