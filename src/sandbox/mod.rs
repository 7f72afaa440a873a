pub mod cache;
pub mod wasm;

use crate::config::SandboxConfig;
use crate::error::CoordError;
use crate::registry::types::{DataType, Value};
use std::time::Duration;

pub use cache::{CacheStats, ModuleCache};
pub use wasm::WasmSandbox;

/// Ceilings applied to one invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvokeLimits {
    pub max_execution: Duration,
    pub max_memory_bytes: usize,
}

impl InvokeLimits {
    pub fn from_config(config: &SandboxConfig) -> Self {
        Self {
            max_execution: config.max_execution(),
            max_memory_bytes: config.max_memory_bytes,
        }
    }

    /// A caller timeout can only shorten the configured limit.
    pub fn tightened(self, timeout: Option<Duration>) -> Self {
        match timeout {
            Some(timeout) if timeout < self.max_execution => Self {
                max_execution: timeout,
                ..self
            },
            _ => self,
        }
    }
}

/// Execution capability behind RunFunction.
///
/// Every `invoke` must run in a fresh isolated context that is torn down on
/// return, whatever the outcome.
pub trait SandboxEngine: Send + Sync + 'static {
    type Module: Clone + Send + Sync + 'static;

    /// Runs outside fuel and the execution deadline, so its cost scales with
    /// the binary size. Callers bound their wait for compile plus invoke
    /// from the outside.
    fn compile(&self, binary: &[u8]) -> Result<Self::Module, CoordError>;

    fn invoke(
        &self,
        module: &Self::Module,
        entry: &str,
        arg_types: &[DataType],
        args: &[Value],
        limits: &InvokeLimits,
    ) -> Result<Vec<Value>, CoordError>;

    fn cache_stats(&self) -> CacheStats {
        CacheStats::default()
    }
}
