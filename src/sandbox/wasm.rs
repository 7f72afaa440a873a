use crate::config::SandboxConfig;
use crate::error::{CoordError, SandboxResource};
use crate::registry::types::{DataType, Value, check_arguments};
use crate::sandbox::cache::{CacheStats, ModuleCache};
use crate::sandbox::{InvokeLimits, SandboxEngine};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, warn};
use wasmtime::{
    Config, Engine, FuncType, Instance, Module, ResourceLimiter, Store, Trap, Val, ValType,
};

const WASM_MAGIC: &[u8; 4] = b"\0asm";

/// WebAssembly sandbox on wasmtime.
///
/// Wall-clock limits use epoch interruption: a ticker thread bumps the engine
/// epoch every `epoch_tick_ms` and each store traps once its deadline in
/// ticks has passed. Fuel, when enabled, bounds the step count as well.
pub struct WasmSandbox {
    engine: Engine,
    config: SandboxConfig,
    cache: ModuleCache<Module>,
    _ticker: EpochTicker,
}

impl WasmSandbox {
    pub fn new(config: SandboxConfig) -> Result<Self, CoordError> {
        let mut wasm_config = Config::new();
        wasm_config
            .consume_fuel(config.fuel_per_ms > 0)
            .epoch_interruption(true)
            .max_wasm_stack(config.max_stack_bytes);
        let engine = Engine::new(&wasm_config).map_err(|e| CoordError::InvalidConfig {
            message: format!("wasm engine: {e:#}"),
        })?;
        let ticker = EpochTicker::start(
            engine.clone(),
            Duration::from_millis(config.epoch_tick_ms.max(1)),
        )?;
        Ok(Self {
            cache: ModuleCache::new(config.module_cache_capacity),
            engine,
            config,
            _ticker: ticker,
        })
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    fn deadline_ticks(&self, max_execution: Duration) -> u64 {
        let tick = self.config.epoch_tick_ms.max(1);
        duration_ms(max_execution).div_ceil(tick).max(1) + 1
    }
}

impl SandboxEngine for WasmSandbox {
    type Module = Module;

    fn compile(&self, binary: &[u8]) -> Result<Module, CoordError> {
        if binary.is_empty() {
            return Err(CoordError::CompileError("empty module binary".into()));
        }
        let is_binary = binary.starts_with(WASM_MAGIC);
        if !is_binary && !self.config.allow_text_format {
            return Err(CoordError::CompileError(
                "not a WebAssembly binary (missing \\0asm header)".into(),
            ));
        }
        self.cache.get_or_compile(binary, |bytes| {
            let compiled = if is_binary {
                Module::from_binary(&self.engine, bytes)
            } else {
                Module::new(&self.engine, bytes)
            };
            compiled.map_err(|e| CoordError::CompileError(format!("{e:#}")))
        })
    }

    fn invoke(
        &self,
        module: &Module,
        entry: &str,
        arg_types: &[DataType],
        args: &[Value],
        limits: &InvokeLimits,
    ) -> Result<Vec<Value>, CoordError> {
        check_arguments(entry, arg_types, args)?;

        let mut store = Store::new(
            &self.engine,
            InvocationState {
                limiter: MemoryCeiling::new(limits.max_memory_bytes),
            },
        );
        store.limiter(|state| &mut state.limiter);
        if self.config.fuel_per_ms > 0 {
            let fuel = self
                .config
                .fuel_per_ms
                .saturating_mul(duration_ms(limits.max_execution));
            store
                .set_fuel(fuel)
                .map_err(|e| CoordError::SandboxTrap(format!("set fuel: {e:#}")))?;
        }
        store.set_epoch_deadline(self.deadline_ticks(limits.max_execution));
        store.epoch_deadline_trap();

        let instance = Instance::new(&mut store, module, &[])
            .map_err(|e| classify(&store, e, Phase::Instantiate, limits))?;
        let func = instance.get_func(&mut store, entry).ok_or_else(|| {
            CoordError::CompileError(format!("module does not export function '{entry}'"))
        })?;
        let ty = func.ty(&store);
        check_signature(entry, arg_types, &ty)?;

        let params: Vec<Val> = args.iter().map(lower).collect();
        let mut results = vec![Val::I32(0); ty.results().len()];
        func.call(&mut store, &params, &mut results)
            .map_err(|e| classify(&store, e, Phase::Call, limits))?;
        debug!(entry, results = results.len(), "sandbox invocation finished");
        results.iter().map(lift).collect()
    }

    fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }
}

struct InvocationState {
    limiter: MemoryCeiling,
}

const MAX_MEMORIES: usize = 4;
const MAX_TABLES: usize = 4;
const MAX_TABLE_ELEMENTS: usize = 100_000;

/// Per-store memory limiter. The ceiling covers the sum of every linear
/// memory in the store. Growth past it aborts the call instead of letting
/// `memory.grow` return -1.
struct MemoryCeiling {
    max_bytes: usize,
    reserved_bytes: usize,
    exceeded: bool,
}

impl MemoryCeiling {
    fn new(max_bytes: usize) -> Self {
        Self {
            max_bytes,
            reserved_bytes: 0,
            exceeded: false,
        }
    }
}

impl ResourceLimiter for MemoryCeiling {
    fn memory_growing(
        &mut self,
        current: usize,
        desired: usize,
        _maximum: Option<usize>,
    ) -> wasmtime::Result<bool> {
        let total = self
            .reserved_bytes
            .saturating_sub(current)
            .saturating_add(desired);
        if total > self.max_bytes {
            self.exceeded = true;
            return Err(wasmtime::Error::msg(format!(
                "memory growth to {total} bytes across all memories exceeds ceiling of {} bytes",
                self.max_bytes
            )));
        }
        self.reserved_bytes = total;
        Ok(true)
    }

    fn table_growing(
        &mut self,
        _current: usize,
        desired: usize,
        _maximum: Option<usize>,
    ) -> wasmtime::Result<bool> {
        Ok(desired <= MAX_TABLE_ELEMENTS)
    }

    fn instances(&self) -> usize {
        1
    }

    fn tables(&self) -> usize {
        MAX_TABLES
    }

    fn memories(&self) -> usize {
        MAX_MEMORIES
    }
}

struct EpochTicker {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl EpochTicker {
    fn start(engine: Engine, tick: Duration) -> Result<Self, CoordError> {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        let handle = std::thread::Builder::new()
            .name("udf-epoch-ticker".into())
            .spawn(move || {
                while !stop_flag.load(Ordering::Acquire) {
                    std::thread::sleep(tick);
                    engine.increment_epoch();
                }
            })?;
        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }
}

impl Drop for EpochTicker {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take()
            && handle.join().is_err()
        {
            warn!("epoch ticker thread panicked");
        }
    }
}

#[derive(Clone, Copy)]
enum Phase {
    Instantiate,
    Call,
}

fn classify(
    store: &Store<InvocationState>,
    err: wasmtime::Error,
    phase: Phase,
    limits: &InvokeLimits,
) -> CoordError {
    let ceiling = &store.data().limiter;
    if ceiling.exceeded {
        return CoordError::ResourceExceeded {
            resource: SandboxResource::Memory,
            detail: format!("memory ceiling of {} bytes", ceiling.max_bytes),
        };
    }
    if let Some(trap) = err.downcast_ref::<Trap>() {
        return match trap {
            Trap::OutOfFuel => CoordError::ResourceExceeded {
                resource: SandboxResource::Fuel,
                detail: "fuel exhausted".into(),
            },
            Trap::Interrupt => CoordError::ResourceExceeded {
                resource: SandboxResource::ExecutionTime,
                detail: format!("exceeded {} ms", limits.max_execution.as_millis()),
            },
            Trap::StackOverflow => CoordError::ResourceExceeded {
                resource: SandboxResource::Stack,
                detail: "call stack exhausted".into(),
            },
            other => CoordError::SandboxTrap(other.to_string()),
        };
    }
    match phase {
        Phase::Instantiate => CoordError::CompileError(format!("instantiation failed: {err:#}")),
        Phase::Call => CoordError::SandboxTrap(format!("{err:#}")),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AbiType {
    I32,
    I64,
    F32,
    F64,
}

impl AbiType {
    fn of(ty: &ValType) -> Option<Self> {
        match ty {
            ValType::I32 => Some(AbiType::I32),
            ValType::I64 => Some(AbiType::I64),
            ValType::F32 => Some(AbiType::F32),
            ValType::F64 => Some(AbiType::F64),
            _ => None,
        }
    }

    fn lowered(data_type: DataType) -> Self {
        match data_type {
            DataType::Bool | DataType::Int8 | DataType::Int16 | DataType::Int32 => AbiType::I32,
            DataType::Int64 => AbiType::I64,
            DataType::Float => AbiType::F32,
            DataType::Double => AbiType::F64,
        }
    }

    fn lifted(self) -> DataType {
        match self {
            AbiType::I32 => DataType::Int32,
            AbiType::I64 => DataType::Int64,
            AbiType::F32 => DataType::Float,
            AbiType::F64 => DataType::Double,
        }
    }
}

fn check_signature(entry: &str, arg_types: &[DataType], ty: &FuncType) -> Result<(), CoordError> {
    let params = ty
        .params()
        .map(|p| AbiType::of(&p))
        .collect::<Option<Vec<_>>>()
        .ok_or_else(|| {
            CoordError::CompileError(format!("'{entry}' takes a non-scalar parameter"))
        })?;
    if ty.results().any(|r| AbiType::of(&r).is_none()) {
        return Err(CoordError::CompileError(format!(
            "'{entry}' returns a non-scalar result"
        )));
    }
    let declared: Vec<AbiType> = arg_types.iter().copied().map(AbiType::lowered).collect();
    if declared != params {
        return Err(CoordError::ArgumentTypeMismatch {
            function: entry.to_string(),
            expected: arg_types.to_vec(),
            actual: params.into_iter().map(AbiType::lifted).collect(),
        });
    }
    Ok(())
}

fn lower(value: &Value) -> Val {
    match *value {
        Value::Bool(v) => Val::I32(i32::from(v)),
        Value::Int8(v) => Val::I32(i32::from(v)),
        Value::Int16(v) => Val::I32(i32::from(v)),
        Value::Int32(v) => Val::I32(v),
        Value::Int64(v) => Val::I64(v),
        Value::Float(v) => Val::F32(v.to_bits()),
        Value::Double(v) => Val::F64(v.to_bits()),
    }
}

fn lift(val: &Val) -> Result<Value, CoordError> {
    match val {
        Val::I32(v) => Ok(Value::Int32(*v)),
        Val::I64(v) => Ok(Value::Int64(*v)),
        Val::F32(bits) => Ok(Value::Float(f32::from_bits(*bits))),
        Val::F64(bits) => Ok(Value::Double(f64::from_bits(*bits))),
        other => Err(CoordError::SandboxTrap(format!(
            "unsupported result value {other:?}"
        ))),
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
