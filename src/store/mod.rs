pub mod frame;
pub mod log;
pub mod memory;

use crate::error::CoordError;
use crate::registry::types::{DataType, FunctionDefinition};
use crate::tso::Timestamp;
use serde::{Deserialize, Serialize};

pub use log::LogMetaStore;
pub use memory::MemoryMetaStore;

/// Narrow interface to the durable metadata store. Keys are function names,
/// values are encoded [`StoredFunction`] records.
///
/// Implementations must be linearizable per key: once `put_if_absent`
/// returns `Ok(true)` a subsequent `get` observes the value.
pub trait MetaStore: Send + Sync + 'static {
    /// Writes `value` under `key` unless the key is present. Returns whether
    /// the write happened.
    fn put_if_absent(&self, key: &str, value: &[u8], ts: Timestamp) -> Result<bool, CoordError>;

    /// Removes `key`. Returns whether it was present.
    fn delete(&self, key: &str, ts: Timestamp) -> Result<bool, CoordError>;

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CoordError>;

    /// Every live entry, in key order.
    fn scan(&self) -> Result<Vec<(String, Vec<u8>)>, CoordError>;

    /// Highest timestamp of any write the store has applied, deletes
    /// included. Zero when the store does not track it.
    fn high_water_mark(&self) -> Result<Timestamp, CoordError> {
        Ok(0)
    }
}

/// Persisted form of a function definition. The name is the store key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoredFunction {
    #[serde(with = "serde_bytes")]
    pub binary: Vec<u8>,
    pub arg_types: Vec<DataType>,
    pub registered_at: Timestamp,
}

impl StoredFunction {
    pub fn from_definition(definition: &FunctionDefinition) -> Self {
        Self {
            binary: definition.binary.clone(),
            arg_types: definition.arg_types.clone(),
            registered_at: definition.registered_at,
        }
    }

    pub fn into_definition(self, name: String) -> FunctionDefinition {
        FunctionDefinition {
            name,
            binary: self.binary,
            arg_types: self.arg_types,
            registered_at: self.registered_at,
        }
    }
}

pub fn encode_record(record: &StoredFunction) -> Result<Vec<u8>, CoordError> {
    rmp_serde::to_vec(record).map_err(|e| CoordError::Encode(e.to_string()))
}

pub fn decode_record(bytes: &[u8]) -> Result<StoredFunction, CoordError> {
    rmp_serde::from_slice(bytes).map_err(|e| CoordError::Decode(e.to_string()))
}
