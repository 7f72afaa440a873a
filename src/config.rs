use crate::error::CoordError;
use crate::store::frame::MAX_FRAME_BODY_BYTES;
use std::time::Duration;

/// Room a stored record needs besides the binary and the name: MessagePack
/// headers, frame header fields and `registered_at`.
const RECORD_OVERHEAD_BYTES: usize = 1024;
/// Upper bound on one encoded `DataType`.
const ARG_TYPE_BYTES: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DurabilityMode {
    /// Every store write is fsynced before the mutation is acknowledged.
    Full,
    OsBuffered,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryMode {
    Strict,
    Permissive,
}

/// Limits for the sandbox engine. Fixed for the lifetime of the process.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Wall-clock ceiling per invocation.
    pub max_execution_ms: u64,
    pub max_memory_bytes: usize,
    pub max_stack_bytes: usize,
    /// Compiled modules kept in the LRU. Zero disables caching.
    pub module_cache_capacity: usize,
    /// Fuel granted per millisecond of `max_execution_ms`. Zero disables fuel
    /// metering and leaves only the wall-clock deadline.
    pub fuel_per_ms: u64,
    /// Granularity of the epoch ticker that enforces the wall-clock deadline.
    pub epoch_tick_ms: u64,
    /// Accept the WebAssembly text format in addition to the binary format.
    pub allow_text_format: bool,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            max_execution_ms: 1_000,
            max_memory_bytes: 64 * 1024 * 1024,
            max_stack_bytes: 512 * 1024,
            module_cache_capacity: 128,
            fuel_per_ms: 100_000,
            epoch_tick_ms: 10,
            allow_text_format: true,
        }
    }
}

impl SandboxConfig {
    pub fn max_execution(&self) -> Duration {
        Duration::from_millis(self.max_execution_ms)
    }
}

/// Shape limits checked during Prepare.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestLimits {
    pub max_function_name_bytes: usize,
    pub max_binary_bytes: usize,
    pub max_arguments: usize,
}

impl Default for RequestLimits {
    fn default() -> Self {
        Self {
            max_function_name_bytes: 255,
            max_binary_bytes: 16 * 1024 * 1024,
            max_arguments: 64,
        }
    }
}

/// Runtime configuration for a coordinator instance.
#[derive(Debug, Clone)]
pub struct CoordConfig {
    pub sandbox: SandboxConfig,
    pub limits: RequestLimits,
    pub max_inflight_mutations: usize,
    /// Bound on queue admission and on waiting for a mutation result.
    pub mutation_timeout_ms: u64,
    /// Bound on a single metadata store call.
    pub store_timeout_ms: u64,
    pub max_concurrent_runs: usize,
    pub durability_mode: DurabilityMode,
    pub recovery_mode: RecoveryMode,
}

impl Default for CoordConfig {
    fn default() -> Self {
        Self {
            sandbox: SandboxConfig::default(),
            limits: RequestLimits::default(),
            max_inflight_mutations: 256,
            mutation_timeout_ms: 10_000,
            store_timeout_ms: 5_000,
            max_concurrent_runs: std::thread::available_parallelism()
                .map(|n| n.get().max(2))
                .unwrap_or(4),
            durability_mode: DurabilityMode::Full,
            recovery_mode: RecoveryMode::Strict,
        }
    }
}

impl CoordConfig {
    pub fn production() -> Self {
        Self {
            durability_mode: DurabilityMode::Full,
            recovery_mode: RecoveryMode::Strict,
            sandbox: SandboxConfig {
                allow_text_format: false,
                ..SandboxConfig::default()
            },
            ..Self::default()
        }
    }

    pub fn development() -> Self {
        Self {
            durability_mode: DurabilityMode::OsBuffered,
            recovery_mode: RecoveryMode::Permissive,
            sandbox: SandboxConfig {
                max_execution_ms: 5_000,
                module_cache_capacity: 16,
                ..SandboxConfig::default()
            },
            ..Self::default()
        }
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    pub fn mutation_timeout(&self) -> Duration {
        Duration::from_millis(self.mutation_timeout_ms)
    }
}

pub fn validate_config(config: &CoordConfig) -> Result<(), CoordError> {
    fn invalid(message: &str) -> Result<(), CoordError> {
        Err(CoordError::InvalidConfig {
            message: message.into(),
        })
    }
    if config.max_inflight_mutations == 0 {
        return invalid("max_inflight_mutations must be > 0");
    }
    if config.max_concurrent_runs == 0 {
        return invalid("max_concurrent_runs must be > 0");
    }
    if config.mutation_timeout_ms == 0 || config.store_timeout_ms == 0 {
        return invalid("mutation_timeout_ms and store_timeout_ms must be > 0");
    }
    if config.store_timeout_ms > config.mutation_timeout_ms {
        return invalid("store_timeout_ms must not exceed mutation_timeout_ms");
    }
    let sandbox = &config.sandbox;
    if sandbox.max_execution_ms == 0 {
        return invalid("sandbox.max_execution_ms must be > 0");
    }
    if sandbox.epoch_tick_ms == 0 || sandbox.epoch_tick_ms > sandbox.max_execution_ms {
        return invalid("sandbox.epoch_tick_ms must be in 1..=max_execution_ms");
    }
    if sandbox.max_memory_bytes < 64 * 1024 {
        return invalid("sandbox.max_memory_bytes must allow at least one wasm page");
    }
    if sandbox.max_stack_bytes == 0 {
        return invalid("sandbox.max_stack_bytes must be > 0");
    }
    if sandbox
        .fuel_per_ms
        .checked_mul(sandbox.max_execution_ms)
        .is_none()
    {
        return invalid("sandbox.fuel_per_ms * max_execution_ms overflows");
    }
    let limits = &config.limits;
    if limits.max_function_name_bytes == 0 || limits.max_binary_bytes == 0 {
        return invalid("request limits must be > 0");
    }
    let largest_record = limits
        .max_binary_bytes
        .saturating_add(limits.max_function_name_bytes)
        .saturating_add(limits.max_arguments.saturating_mul(ARG_TYPE_BYTES))
        .saturating_add(RECORD_OVERHEAD_BYTES);
    if largest_record > MAX_FRAME_BODY_BYTES {
        return Err(CoordError::InvalidConfig {
            message: format!(
                "limits.max_binary_bytes of {} leaves no room for a stored record under the \
                 {MAX_FRAME_BODY_BYTES} byte frame limit",
                limits.max_binary_bytes
            ),
        });
    }
    Ok(())
}
