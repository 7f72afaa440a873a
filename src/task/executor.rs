use crate::config::CoordConfig;
use crate::error::CoordError;
use crate::registry::FunctionRegistry;
use crate::registry::types::{DataType, FunctionDefinition};
use crate::store::{MetaStore, StoredFunction, encode_record};
use crate::tso::{Timestamp, TimestampSource};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// A metadata mutation serialized through the single writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    Create {
        name: String,
        binary: Vec<u8>,
        arg_types: Vec<DataType>,
    },
    Drop {
        name: String,
    },
}

impl Mutation {
    fn name(&self) -> &str {
        match self {
            Mutation::Create { name, .. } | Mutation::Drop { name } => name,
        }
    }
}

struct MutationRequest {
    mutation: Mutation,
    msg_id: u64,
    hand_off: Arc<HandOff>,
    result_tx: oneshot::Sender<Result<Timestamp, CoordError>>,
}

const QUEUED: u8 = 0;
const CLAIMED: u8 = 1;
const ABANDONED: u8 = 2;

/// Decides who owns a queued request. The writer claims it before applying;
/// a caller whose wait ran out abandons it. Only the first to move it off
/// `QUEUED` wins, so an abandoned request is never applied.
#[derive(Debug, Default)]
struct HandOff(AtomicU8);

impl HandOff {
    fn claim(&self) -> bool {
        self.transition(CLAIMED)
    }

    fn abandon(&self) -> bool {
        self.transition(ABANDONED)
    }

    fn transition(&self, to: u8) -> bool {
        self.0
            .compare_exchange(QUEUED, to, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

#[derive(Debug, Default)]
struct ExecutorTelemetry {
    inflight_mutations: AtomicUsize,
    mutations_total: AtomicU64,
    mutation_errors: AtomicU64,
    queue_full_rejections: AtomicU64,
    timeout_rejections: AtomicU64,
    abandoned_mutations: AtomicU64,
    store_timeouts: AtomicU64,
    total_latency_micros: AtomicU64,
    last_committed_ts: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutorMetrics {
    pub inflight_mutations: usize,
    pub mutations_total: u64,
    pub mutation_errors: u64,
    pub queue_full_rejections: u64,
    pub timeout_rejections: u64,
    /// Requests dropped unapplied because their caller timed out in the queue.
    pub abandoned_mutations: u64,
    pub store_timeouts: u64,
    pub avg_mutation_latency_micros: u64,
    pub last_committed_ts: Timestamp,
    pub poisoned: bool,
}

/// Single writer for CreateFunction and DropFunction.
///
/// Requests are queued on a bounded channel and applied one at a time:
/// timestamp allocation, conditional store write, then registry update. Once
/// the store and registry may have diverged the executor is poisoned and
/// every later mutation fails with `Unavailable` until a restart replays the
/// store.
pub struct MutationExecutor {
    ingress_tx: Mutex<Option<mpsc::Sender<MutationRequest>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
    telemetry: Arc<ExecutorTelemetry>,
    poisoned: Arc<AtomicBool>,
    mutation_timeout: Duration,
}

struct WriterState {
    store: Arc<dyn MetaStore>,
    tso: Arc<dyn TimestampSource>,
    registry: Arc<FunctionRegistry>,
    store_timeout: Duration,
    last_committed: Timestamp,
    poisoned: Arc<AtomicBool>,
    telemetry: Arc<ExecutorTelemetry>,
}

impl MutationExecutor {
    /// Spawns the writer on the current tokio runtime. `last_committed` is
    /// the highest timestamp already present in the store.
    pub fn start(
        store: Arc<dyn MetaStore>,
        tso: Arc<dyn TimestampSource>,
        registry: Arc<FunctionRegistry>,
        config: &CoordConfig,
        last_committed: Timestamp,
    ) -> Result<Self, CoordError> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|e| {
            CoordError::Unavailable {
                message: format!("mutation executor needs a tokio runtime: {e}"),
            }
        })?;
        let (ingress_tx, ingress_rx) = mpsc::channel(config.max_inflight_mutations);
        let telemetry = Arc::new(ExecutorTelemetry::default());
        telemetry
            .last_committed_ts
            .store(last_committed, Ordering::Relaxed);
        let poisoned = Arc::new(AtomicBool::new(false));
        let state = WriterState {
            store,
            tso,
            registry,
            store_timeout: config.store_timeout(),
            last_committed,
            poisoned: Arc::clone(&poisoned),
            telemetry: Arc::clone(&telemetry),
        };
        let writer = runtime.spawn(run_writer(state, ingress_rx));
        Ok(Self {
            ingress_tx: Mutex::new(Some(ingress_tx)),
            writer: Mutex::new(Some(writer)),
            telemetry,
            poisoned,
            mutation_timeout: config.mutation_timeout(),
        })
    }

    /// Queues `mutation` and waits for its outcome.
    ///
    /// `Timeout` means the request was still queued when `mutation_timeout`
    /// ran out and will never be applied. Once the writer has claimed a
    /// request the caller waits for its result, which the store timeout
    /// bounds.
    pub async fn submit(&self, mutation: Mutation, msg_id: u64) -> Result<Timestamp, CoordError> {
        if self.poisoned.load(Ordering::Acquire) {
            return Err(poisoned_error());
        }
        let ingress_tx = self
            .ingress_tx
            .lock()
            .clone()
            .ok_or_else(|| CoordError::Unavailable {
                message: "mutation executor is shut down".into(),
            })?;
        let (result_tx, mut result_rx) = oneshot::channel();
        let hand_off = Arc::new(HandOff::default());
        let request = MutationRequest {
            mutation,
            msg_id,
            hand_off: Arc::clone(&hand_off),
            result_tx,
        };
        match ingress_tx.try_send(request) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.telemetry
                    .queue_full_rejections
                    .fetch_add(1, Ordering::Relaxed);
                return Err(CoordError::QueueFull);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                return Err(CoordError::Unavailable {
                    message: "mutation queue closed".into(),
                });
            }
        }
        self.telemetry
            .inflight_mutations
            .fetch_add(1, Ordering::Relaxed);
        let received = match tokio::time::timeout(self.mutation_timeout, &mut result_rx).await {
            Ok(received) => Some(received),
            Err(_) if hand_off.abandon() => None,
            // Already claimed by the writer.
            Err(_) => Some(result_rx.await),
        };
        self.telemetry
            .inflight_mutations
            .fetch_sub(1, Ordering::Relaxed);
        match received {
            Some(Ok(result)) => result,
            Some(Err(e)) => Err(CoordError::Unavailable {
                message: format!("mutation result channel closed: {e}"),
            }),
            None => {
                self.telemetry
                    .timeout_rejections
                    .fetch_add(1, Ordering::Relaxed);
                Err(CoordError::Timeout(format!(
                    "mutation still queued after {} ms; not applied",
                    self.mutation_timeout.as_millis()
                )))
            }
        }
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::Acquire)
    }

    pub fn metrics(&self) -> ExecutorMetrics {
        let mutations_total = self.telemetry.mutations_total.load(Ordering::Relaxed);
        let total_latency = self.telemetry.total_latency_micros.load(Ordering::Relaxed);
        let avg_mutation_latency_micros = if mutations_total == 0 {
            0
        } else {
            total_latency / mutations_total
        };
        ExecutorMetrics {
            inflight_mutations: self.telemetry.inflight_mutations.load(Ordering::Relaxed),
            mutations_total,
            mutation_errors: self.telemetry.mutation_errors.load(Ordering::Relaxed),
            queue_full_rejections: self.telemetry.queue_full_rejections.load(Ordering::Relaxed),
            timeout_rejections: self.telemetry.timeout_rejections.load(Ordering::Relaxed),
            abandoned_mutations: self.telemetry.abandoned_mutations.load(Ordering::Relaxed),
            store_timeouts: self.telemetry.store_timeouts.load(Ordering::Relaxed),
            avg_mutation_latency_micros,
            last_committed_ts: self.telemetry.last_committed_ts.load(Ordering::Relaxed),
            poisoned: self.is_poisoned(),
        }
    }

    /// Stops accepting mutations and waits for queued ones to drain.
    pub async fn shutdown(&self) {
        drop(self.ingress_tx.lock().take());
        let writer = self.writer.lock().take();
        if let Some(writer) = writer
            && let Err(e) = writer.await
        {
            warn!(error = %e, "mutation writer ended abnormally");
        }
    }
}

impl Drop for MutationExecutor {
    fn drop(&mut self) {
        if let Some(writer) = self.writer.lock().take() {
            writer.abort();
        }
    }
}

async fn run_writer(mut state: WriterState, mut ingress_rx: mpsc::Receiver<MutationRequest>) {
    while let Some(request) = ingress_rx.recv().await {
        if !request.hand_off.claim() {
            state
                .telemetry
                .abandoned_mutations
                .fetch_add(1, Ordering::Relaxed);
            debug!(
                msg_id = request.msg_id,
                function = request.mutation.name(),
                "skipping mutation abandoned by its caller"
            );
            continue;
        }
        let started = Instant::now();
        let name = request.mutation.name().to_string();
        let result = state.apply(request.mutation).await;
        let elapsed_micros = u64::try_from(started.elapsed().as_micros()).unwrap_or(u64::MAX);
        let telemetry = &state.telemetry;
        telemetry.mutations_total.fetch_add(1, Ordering::Relaxed);
        telemetry
            .total_latency_micros
            .fetch_add(elapsed_micros, Ordering::Relaxed);
        match &result {
            Ok(ts) => debug!(msg_id = request.msg_id, function = %name, ts, "mutation committed"),
            Err(e) => {
                telemetry.mutation_errors.fetch_add(1, Ordering::Relaxed);
                debug!(msg_id = request.msg_id, function = %name, error = %e, "mutation rejected");
            }
        }
        // Caller task may have been cancelled.
        let _ = request.result_tx.send(result);
    }
    debug!("mutation writer stopped");
}

impl WriterState {
    async fn apply(&mut self, mutation: Mutation) -> Result<Timestamp, CoordError> {
        if self.poisoned.load(Ordering::Acquire) {
            return Err(poisoned_error());
        }
        match mutation {
            Mutation::Create {
                name,
                binary,
                arg_types,
            } => self.create(name, binary, arg_types).await,
            Mutation::Drop { name } => self.drop_function(name).await,
        }
    }

    async fn create(
        &mut self,
        name: String,
        binary: Vec<u8>,
        arg_types: Vec<DataType>,
    ) -> Result<Timestamp, CoordError> {
        if self.registry.contains(&name)? {
            return Err(CoordError::already_exists(&name));
        }
        let ts = self.next_ts()?;
        let definition = FunctionDefinition {
            name,
            binary,
            arg_types,
            registered_at: ts,
        };
        let record = encode_record(&StoredFunction::from_definition(&definition))?;
        let store = Arc::clone(&self.store);
        let key = definition.name.clone();
        let written = self
            .store_call("put_if_absent", move || store.put_if_absent(&key, &record, ts))
            .await?;
        if !written {
            warn!(function = %definition.name, "store already holds a record the registry does not");
            return Err(CoordError::already_exists(&definition.name));
        }
        self.commit_ts(ts);
        let name = definition.name.clone();
        if let Err(e) = self.registry.put(definition) {
            return Err(self.poison(format!(
                "store committed '{name}' at ts {ts} but the registry rejected it: {e}"
            )));
        }
        info!(function = %name, ts, "function created");
        Ok(ts)
    }

    async fn drop_function(&mut self, name: String) -> Result<Timestamp, CoordError> {
        if !self.registry.contains(&name)? {
            return Err(CoordError::not_found(&name));
        }
        let ts = self.next_ts()?;
        let store = Arc::clone(&self.store);
        let key = name.clone();
        let removed = self
            .store_call("delete", move || store.delete(&key, ts))
            .await?;
        if !removed {
            // The store is authoritative; bring the registry in line.
            warn!(function = %name, "registry held a function missing from the store");
            if let Err(e) = self.registry.remove(&name) {
                return Err(self.poison(format!("failed to drop stale entry '{name}': {e}")));
            }
            return Err(CoordError::not_found(&name));
        }
        self.commit_ts(ts);
        if let Err(e) = self.registry.remove(&name) {
            return Err(self.poison(format!(
                "store deleted '{name}' at ts {ts} but the registry still holds it: {e}"
            )));
        }
        info!(function = %name, ts, "function dropped");
        Ok(ts)
    }

    fn next_ts(&mut self) -> Result<Timestamp, CoordError> {
        let ts = self.tso.allocate()?;
        if ts <= self.last_committed {
            error!(ts, last_committed = self.last_committed, "timestamp source went backwards");
            return Err(CoordError::IntegrityError {
                message: format!(
                    "allocated timestamp {ts} is not above last committed {}",
                    self.last_committed
                ),
            });
        }
        Ok(ts)
    }

    fn commit_ts(&mut self, ts: Timestamp) {
        self.last_committed = ts;
        self.telemetry
            .last_committed_ts
            .store(ts, Ordering::Relaxed);
    }

    /// Runs a blocking store call on the blocking pool, bounded by the store
    /// timeout. A timeout or a panicking call leaves the outcome unknown and
    /// poisons the executor.
    async fn store_call<T, F>(&self, op: &'static str, call: F) -> Result<T, CoordError>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T, CoordError> + Send + 'static,
    {
        match tokio::time::timeout(self.store_timeout, tokio::task::spawn_blocking(call)).await {
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(e))) => {
                warn!(op, error = %e, "metadata store call failed");
                Err(match e {
                    CoordError::Store(_) => e,
                    other => CoordError::Store(other.to_string()),
                })
            }
            Ok(Err(join_err)) => Err(self.poison(format!("metadata store {op} panicked: {join_err}"))),
            Err(_) => {
                self.telemetry.store_timeouts.fetch_add(1, Ordering::Relaxed);
                let message = format!(
                    "metadata store {op} exceeded {} ms",
                    self.store_timeout.as_millis()
                );
                self.poison(message.clone());
                Err(CoordError::Timeout(message))
            }
        }
    }

    fn poison(&self, message: String) -> CoordError {
        self.poisoned.store(true, Ordering::Release);
        error!(
            reason = %message,
            "registry and metadata store may have diverged, refusing further mutations"
        );
        CoordError::IntegrityError { message }
    }
}

fn poisoned_error() -> CoordError {
    CoordError::Unavailable {
        message: "mutation executor poisoned after a partial failure; restart to replay the store"
            .into(),
    }
}
