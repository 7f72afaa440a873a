pub mod config;
pub mod error;
pub mod recovery;
pub mod registry;
pub mod sandbox;
pub mod store;
pub mod task;
pub mod tso;

use crate::config::{CoordConfig, validate_config};
use crate::error::CoordError;
use crate::recovery::{RecoveryReport, rebuild_registry};
use crate::registry::FunctionRegistry;
use crate::registry::types::{DataType, Value, check_arguments};
use crate::sandbox::{CacheStats, InvokeLimits, SandboxEngine, WasmSandbox};
use crate::store::{LogMetaStore, MetaStore};
use crate::task::executor::{ExecutorMetrics, Mutation, MutationExecutor};
use crate::task::{
    CreateFunctionRequest, DropFunctionRequest, FunctionInfo, GetFunctionInfoRequest,
    RunFunctionRequest, Task, TaskOutput, TaskRequest,
};
use crate::tso::{LocalTimestampSource, Timestamp, TimestampSource};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{info, warn};

#[derive(Debug, Default)]
struct RunTelemetry {
    runs_total: AtomicU64,
    run_errors: AtomicU64,
    resource_exceeded: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoordinatorMetrics {
    pub executor: ExecutorMetrics,
    pub registered_functions: usize,
    pub runs_total: u64,
    pub run_errors: u64,
    pub runs_resource_exceeded: u64,
    pub module_cache: CacheStats,
}

/// Control-plane coordinator for user-defined functions.
///
/// Owns the registry, the single mutation writer and the sandbox. Mutations
/// are ordered through the writer; reads go straight to the registry; runs
/// execute on the blocking pool, bounded by `max_concurrent_runs`.
pub struct FunctionCoordinator<S: SandboxEngine = WasmSandbox> {
    config: Arc<CoordConfig>,
    registry: Arc<FunctionRegistry>,
    sandbox: Arc<S>,
    executor: MutationExecutor,
    run_permits: Arc<Semaphore>,
    run_telemetry: RunTelemetry,
    recovery: RecoveryReport,
}

impl FunctionCoordinator<WasmSandbox> {
    /// Opens a coordinator over a `LogMetaStore` in `dir` with a local
    /// timestamp source and the wasmtime sandbox.
    pub fn open(config: CoordConfig, dir: &Path) -> Result<Self, CoordError> {
        validate_config(&config)?;
        let store = Arc::new(LogMetaStore::open(
            dir,
            config.durability_mode,
            config.recovery_mode,
        )?);
        let sandbox = Arc::new(WasmSandbox::new(config.sandbox.clone())?);
        Self::with_components(
            config,
            store,
            Arc::new(LocalTimestampSource::default()),
            sandbox,
        )
    }
}

impl<S: SandboxEngine> FunctionCoordinator<S> {
    /// Must be called inside a tokio runtime. Replays `store` before
    /// returning, so the registry is ready once this succeeds.
    pub fn with_components(
        config: CoordConfig,
        store: Arc<dyn MetaStore>,
        tso: Arc<dyn TimestampSource>,
        sandbox: Arc<S>,
    ) -> Result<Self, CoordError> {
        validate_config(&config)?;
        info!(
            max_inflight_mutations = config.max_inflight_mutations,
            mutation_timeout_ms = config.mutation_timeout_ms,
            store_timeout_ms = config.store_timeout_ms,
            max_concurrent_runs = config.max_concurrent_runs,
            max_execution_ms = config.sandbox.max_execution_ms,
            max_memory_bytes = config.sandbox.max_memory_bytes,
            module_cache_capacity = config.sandbox.module_cache_capacity,
            durability_mode = ?config.durability_mode,
            recovery_mode = ?config.recovery_mode,
            "opening function coordinator"
        );
        let registry = Arc::new(FunctionRegistry::new_recovering());
        let recovery = rebuild_registry(store.as_ref(), &registry, config.recovery_mode)?;
        tso.advance_past(recovery.high_water_mark);
        let executor = MutationExecutor::start(
            store,
            tso,
            Arc::clone(&registry),
            &config,
            recovery.high_water_mark,
        )?;
        Ok(Self {
            run_permits: Arc::new(Semaphore::new(config.max_concurrent_runs)),
            config: Arc::new(config),
            registry,
            sandbox,
            executor,
            run_telemetry: RunTelemetry::default(),
            recovery,
        })
    }

    pub fn config(&self) -> &CoordConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<FunctionRegistry> {
        &self.registry
    }

    pub fn recovery_report(&self) -> RecoveryReport {
        self.recovery
    }

    /// Prepares and executes a task in one step.
    pub async fn submit(&self, mut task: Task) -> Result<TaskOutput, CoordError> {
        task.prepare(&self.config.limits)?;
        self.execute(&mut task).await
    }

    /// Executes a prepared task. The task ends `Executed` or `Failed`.
    pub async fn execute(&self, task: &mut Task) -> Result<TaskOutput, CoordError> {
        task.ensure_prepared()?;
        let result = self.dispatch(task.request()).await;
        let result = match result {
            Ok(output) => match output.committed_ts() {
                Some(ts) => task.assign_ts(ts).map(|()| output),
                None => Ok(output),
            },
            Err(e) => Err(e),
        };
        task.finish(result.is_ok());
        result
    }

    async fn dispatch(&self, request: &TaskRequest) -> Result<TaskOutput, CoordError> {
        let msg_id = request.base().msg_id;
        match request {
            TaskRequest::CreateFunction(req) => {
                let mutation = Mutation::Create {
                    name: req.function_name.clone(),
                    binary: req.binary.clone(),
                    arg_types: req.arg_types.clone(),
                };
                let ts = self.executor.submit(mutation, msg_id).await?;
                Ok(TaskOutput::Created { ts })
            }
            TaskRequest::DropFunction(req) => {
                let mutation = Mutation::Drop {
                    name: req.function_name.clone(),
                };
                let ts = self.executor.submit(mutation, msg_id).await?;
                Ok(TaskOutput::Dropped { ts })
            }
            TaskRequest::GetFunctionInfo(req) => {
                let definition = self.registry.get(&req.function_name)?;
                Ok(TaskOutput::Info(FunctionInfo::from(&*definition)))
            }
            TaskRequest::RunFunction(req) => self
                .run(&req.function_name, &req.args, req.timeout)
                .await
                .map(TaskOutput::Ran),
        }
    }

    async fn run(
        &self,
        name: &str,
        args: &[Value],
        timeout: Option<Duration>,
    ) -> Result<Vec<Value>, CoordError> {
        self.run_telemetry.runs_total.fetch_add(1, Ordering::Relaxed);
        let result = self.run_inner(name, args, timeout).await;
        if let Err(e) = &result {
            self.run_telemetry.run_errors.fetch_add(1, Ordering::Relaxed);
            if let CoordError::ResourceExceeded { resource, .. } = e {
                self.run_telemetry
                    .resource_exceeded
                    .fetch_add(1, Ordering::Relaxed);
                warn!(function = name, %resource, "function run aborted at sandbox limit");
            }
        }
        result
    }

    async fn run_inner(
        &self,
        name: &str,
        args: &[Value],
        timeout: Option<Duration>,
    ) -> Result<Vec<Value>, CoordError> {
        let definition = self.registry.get(name)?;
        check_arguments(name, &definition.arg_types, args)?;
        let limits = InvokeLimits::from_config(&self.config.sandbox).tightened(timeout);
        let permit = tokio::time::timeout(
            self.config.mutation_timeout(),
            Arc::clone(&self.run_permits).acquire_owned(),
        )
        .await
        .map_err(|_| CoordError::Timeout("waiting for a sandbox slot".into()))?
        .map_err(|_| CoordError::Unavailable {
            message: "sandbox slots closed".into(),
        })?;
        let sandbox = Arc::clone(&self.sandbox);
        let args = args.to_vec();
        // The slot stays taken until the blocking call returns, even if the
        // caller stops waiting.
        let budget = self.config.mutation_timeout() + limits.max_execution;
        let call = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            let module = sandbox.compile(&definition.binary)?;
            sandbox.invoke(
                &module,
                &definition.name,
                &definition.arg_types,
                &args,
                &limits,
            )
        });
        match tokio::time::timeout(budget, call).await {
            Ok(joined) => {
                joined.map_err(|e| CoordError::SandboxTrap(format!("sandbox worker failed: {e}")))?
            }
            Err(_) => {
                warn!(
                    function = name,
                    budget_ms = budget.as_millis() as u64,
                    "sandbox call overran its budget"
                );
                Err(CoordError::Timeout(format!(
                    "function '{name}' did not finish compiling and running within {} ms",
                    budget.as_millis()
                )))
            }
        }
    }

    pub async fn create_function(
        &self,
        name: &str,
        binary: Vec<u8>,
        arg_types: Vec<DataType>,
    ) -> Result<Timestamp, CoordError> {
        let task = Task::new(CreateFunctionRequest::new(name, binary, arg_types));
        match self.submit(task).await? {
            TaskOutput::Created { ts } => Ok(ts),
            other => Err(unexpected_output(&other)),
        }
    }

    pub async fn drop_function(&self, name: &str) -> Result<Timestamp, CoordError> {
        match self.submit(Task::new(DropFunctionRequest::new(name))).await? {
            TaskOutput::Dropped { ts } => Ok(ts),
            other => Err(unexpected_output(&other)),
        }
    }

    pub async fn get_function_info(&self, name: &str) -> Result<FunctionInfo, CoordError> {
        match self
            .submit(Task::new(GetFunctionInfoRequest::new(name)))
            .await?
        {
            TaskOutput::Info(info) => Ok(info),
            other => Err(unexpected_output(&other)),
        }
    }

    pub async fn run_function(
        &self,
        name: &str,
        args: Vec<Value>,
        timeout: Option<Duration>,
    ) -> Result<Vec<Value>, CoordError> {
        let mut request = RunFunctionRequest::new(name, args);
        request.timeout = timeout;
        match self.submit(Task::new(request)).await? {
            TaskOutput::Ran(values) => Ok(values),
            other => Err(unexpected_output(&other)),
        }
    }

    /// Registered function names, sorted.
    pub fn list_functions(&self) -> Result<Vec<String>, CoordError> {
        self.registry.list()
    }

    pub fn metrics(&self) -> CoordinatorMetrics {
        CoordinatorMetrics {
            executor: self.executor.metrics(),
            registered_functions: self.registry.len(),
            runs_total: self.run_telemetry.runs_total.load(Ordering::Relaxed),
            run_errors: self.run_telemetry.run_errors.load(Ordering::Relaxed),
            runs_resource_exceeded: self.run_telemetry.resource_exceeded.load(Ordering::Relaxed),
            module_cache: self.sandbox.cache_stats(),
        }
    }

    /// Drains queued mutations and stops the writer. Reads keep working.
    pub async fn shutdown(&self) {
        self.executor.shutdown().await;
        info!("function coordinator shut down");
    }
}

fn unexpected_output(output: &TaskOutput) -> CoordError {
    CoordError::InvalidTaskState {
        message: format!("unexpected task output {output:?}"),
    }
}
