//! Worker pool for request handlers
//!
//! Architecture:
//! - N dedicated threads, each owning exactly one handler built on that thread
//! - A FIFO semaphore admits at most N assignments; callers beyond that wait in arrival order
//! - Idle workers live on a stack, so the critical section is a single push or pop
//! - Each slot guards its own state transitions, so reclaiming one worker never stalls another
//! - A worker that ignores an interrupt past the grace period is abandoned and its slot respawned

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc, oneshot};

use crate::error::{HandlerError, PoolError};
use crate::handler::{CloseHooks, Control, Handler, HandlerFactory, InvokeContext, Reply};
use crate::interrupt::InterruptToken;
use crate::request::Request;

// ========== Configuration ==========

/// Configuration for the worker pool
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Number of worker threads (default: num_cpus)
    pub num_workers: usize,
    /// Request deadline measured from arrival, in milliseconds (0 = no deadline)
    pub request_timeout_ms: u64,
    /// How long an interrupted worker gets to return before it is replaced
    pub reclaim_grace_ms: u64,
    /// Pin worker threads to CPU cores
    pub pin_workers: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            num_workers: default_num_workers(),
            request_timeout_ms: 60_000,
            reclaim_grace_ms: 1_000,
            pin_workers: false,
        }
    }
}

impl PoolConfig {
    /// Create config from environment variables
    ///
    /// Environment variables:
    /// - APPD_WORKERS: Number of worker threads (default: num_cpus)
    /// - APPD_REQUEST_TIMEOUT_MS: Request deadline in ms (0 = none)
    /// - APPD_RECLAIM_GRACE_MS: Interrupt grace period in ms
    /// - APPD_PIN_WORKERS: Pin workers to cores (default: false)
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            num_workers: env_parse("APPD_WORKERS").unwrap_or(defaults.num_workers),
            request_timeout_ms: env_parse("APPD_REQUEST_TIMEOUT_MS")
                .unwrap_or(defaults.request_timeout_ms),
            reclaim_grace_ms: env_parse("APPD_RECLAIM_GRACE_MS")
                .unwrap_or(defaults.reclaim_grace_ms),
            pin_workers: std::env::var("APPD_PIN_WORKERS")
                .map(|v| v != "false" && v != "0")
                .unwrap_or(defaults.pin_workers),
        }
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        (self.request_timeout_ms > 0).then(|| Duration::from_millis(self.request_timeout_ms))
    }

    pub fn reclaim_grace(&self) -> Duration {
        Duration::from_millis(self.reclaim_grace_ms)
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.parse().ok())
}

fn default_num_workers() -> usize {
    num_cpus::get().max(1)
}

// ========== Worker State ==========

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Idle,
    Busy,
    Reclaiming,
    Dead,
}

/// Counters for monitoring pool health
#[derive(Default)]
pub struct PoolMetrics {
    pub total_requests: AtomicU64,
    pub total_tasks: AtomicU64,
    pub handler_failures: AtomicU64,
    pub reclaims: AtomicU64,
    pub recovered: AtomicU64,
    pub replacements: AtomicU64,
}

impl PoolMetrics {
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "total_requests": self.total_requests.load(Ordering::Relaxed),
            "total_tasks": self.total_tasks.load(Ordering::Relaxed),
            "handler_failures": self.handler_failures.load(Ordering::Relaxed),
            "reclaims": self.reclaims.load(Ordering::Relaxed),
            "recovered": self.recovered.load(Ordering::Relaxed),
            "replacements": self.replacements.load(Ordering::Relaxed),
        })
    }
}

// ========== Jobs ==========

enum Work {
    Invoke {
        request: Arc<Request>,
        reply: oneshot::Sender<Result<Reply, HandlerError>>,
    },
    Task {
        name: String,
        reply: oneshot::Sender<Result<(), HandlerError>>,
    },
}

/// Internal job sent to a worker thread
struct Job {
    assignment: u64,
    token: Arc<InterruptToken>,
    hooks: CloseHooks,
    work: Work,
}

/// A finished job whose reply has not been sent yet.
enum Finished {
    Invoke(
        oneshot::Sender<Result<Reply, HandlerError>>,
        Result<Reply, HandlerError>,
    ),
    Task(oneshot::Sender<Result<(), HandlerError>>, Result<(), HandlerError>),
}

impl Finished {
    fn deliver(self) {
        match self {
            Finished::Invoke(tx, result) => {
                let _ = tx.send(result);
            }
            Finished::Task(tx, result) => {
                let _ = tx.send(result);
            }
        }
    }
}

/// The assignment a busy slot is serving. Dropping it returns the pool permit.
struct Assignment {
    id: u64,
    token: Arc<InterruptToken>,
    started_at: Instant,
    _permit: OwnedSemaphorePermit,
}

struct SlotInner {
    state: WorkerState,
    generation: u64,
    sender: Option<mpsc::UnboundedSender<Job>>,
    assignment: Option<Assignment>,
    served: u64,
}

struct Slot {
    inner: Mutex<SlotInner>,
}

// ========== Main Pool ==========

struct Shared {
    config: PoolConfig,
    factory: HandlerFactory,
    control: Arc<dyn Control>,
    slots: Vec<Slot>,
    idle: Mutex<Vec<usize>>,
    permits: Arc<Semaphore>,
    metrics: PoolMetrics,
    assignment_seq: AtomicU64,
    core_ids: Option<Vec<core_affinity::CoreId>>,
}

/// The worker pool manager
#[derive(Clone)]
pub struct WorkerPool {
    shared: Arc<Shared>,
}

impl WorkerPool {
    /// Start `config.num_workers` workers, each with a handler from `factory`.
    pub fn new(config: PoolConfig, factory: HandlerFactory, control: Arc<dyn Control>) -> Self {
        let num_workers = config.num_workers.max(1);
        let core_ids = if config.pin_workers {
            core_affinity::get_core_ids().filter(|ids| !ids.is_empty())
        } else {
            None
        };

        tracing::info!(
            "Initializing worker pool: {} workers, request timeout {}ms",
            num_workers,
            config.request_timeout_ms
        );

        let slots = (0..num_workers)
            .map(|_| Slot {
                inner: Mutex::new(SlotInner {
                    state: WorkerState::Idle,
                    generation: 0,
                    sender: None,
                    assignment: None,
                    served: 0,
                }),
            })
            .collect();

        let shared = Arc::new(Shared {
            config,
            factory,
            control,
            slots,
            // Reversed so slot 0 is handed out first.
            idle: Mutex::new((0..num_workers).rev().collect()),
            permits: Arc::new(Semaphore::new(num_workers)),
            metrics: PoolMetrics::default(),
            assignment_seq: AtomicU64::new(1),
            core_ids,
        });

        for index in 0..num_workers {
            let sender = shared.spawn_worker(index, 0);
            shared.slots[index].inner.lock().sender = Some(sender);
        }

        Self { shared }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    pub fn size(&self) -> usize {
        self.shared.slots.len()
    }

    pub fn idle_count(&self) -> usize {
        self.shared.idle.lock().len()
    }

    pub fn worker_state(&self, slot: usize) -> Option<WorkerState> {
        self.shared.slots.get(slot).map(|s| s.inner.lock().state)
    }

    /// How many times the worker in `slot` has been replaced.
    pub fn generation(&self, slot: usize) -> Option<u64> {
        self.shared.slots.get(slot).map(|s| s.inner.lock().generation)
    }

    pub fn metrics(&self) -> &PoolMetrics {
        &self.shared.metrics
    }

    /// Wait for an idle worker and start `request` on it.
    pub async fn execute(
        &self,
        request: Arc<Request>,
        hooks: CloseHooks,
    ) -> Result<InFlight<Result<Reply, HandlerError>>, PoolError> {
        let (reply, rx) = oneshot::channel();
        self.shared
            .metrics
            .total_requests
            .fetch_add(1, Ordering::Relaxed);
        self.assign(Work::Invoke { request, reply }, hooks, rx).await
    }

    /// Borrow a worker to run a named task and wait for it to finish.
    pub async fn run_task(&self, name: &str) -> Result<Result<(), HandlerError>, PoolError> {
        let (reply, rx) = oneshot::channel();
        self.shared.metrics.total_tasks.fetch_add(1, Ordering::Relaxed);
        let work = Work::Task {
            name: name.to_string(),
            reply,
        };
        let mut in_flight = self.assign(work, CloseHooks::new(), rx).await?;
        in_flight.wait().await
    }

    async fn assign<T>(
        &self,
        work: Work,
        hooks: CloseHooks,
        reply: oneshot::Receiver<T>,
    ) -> Result<InFlight<T>, PoolError> {
        let permit = Arc::clone(&self.shared.permits)
            .acquire_owned()
            .await
            .map_err(|_| PoolError::Closed)?;
        // A permit is only ever returned after its slot is back on the idle stack.
        let index = self.shared.idle.lock().pop().ok_or(PoolError::Closed)?;

        let assignment = self.shared.assignment_seq.fetch_add(1, Ordering::Relaxed);
        let token = InterruptToken::new();
        let job = Job {
            assignment,
            token: Arc::clone(&token),
            hooks,
            work,
        };
        self.shared.start(
            index,
            job,
            Assignment {
                id: assignment,
                token,
                started_at: Instant::now(),
                _permit: permit,
            },
        )?;

        Ok(InFlight {
            slot: index,
            assignment,
            reply,
            pool: self.clone(),
        })
    }

    /// Interrupt the call `assignment` running on `slot`.
    ///
    /// The slot moves to `Reclaiming`; it returns to `Idle` when the call
    /// unwinds, or is replaced with a fresh worker if the call is still running
    /// once the grace period is over. Returns false if the slot has already
    /// moved on to something else.
    pub fn forcibly_reclaim(&self, slot: usize, assignment: u64) -> bool {
        let Some(target) = self.shared.slots.get(slot) else {
            return false;
        };
        let token = {
            let mut inner = target.inner.lock();
            match inner.assignment.as_ref() {
                Some(current) if current.id == assignment && inner.state == WorkerState::Busy => {
                    let token = Arc::clone(&current.token);
                    inner.state = WorkerState::Reclaiming;
                    token
                }
                _ => return false,
            }
        };

        let released = token.interrupt();
        self.shared.metrics.reclaims.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(
            "reclaiming worker {} (assignment {}), force-released {} locks",
            slot,
            assignment,
            released
        );

        let shared = Arc::clone(&self.shared);
        let grace = self.shared.config.reclaim_grace();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    tokio::time::sleep(grace).await;
                    shared.replace_if_stuck(slot, assignment);
                });
            }
            Err(_) => {
                thread::spawn(move || {
                    thread::sleep(grace);
                    shared.replace_if_stuck(slot, assignment);
                });
            }
        }
        true
    }

    /// Stop handing out workers; threads exit once their current job is done.
    pub fn shutdown(&self) {
        self.shared.permits.close();
        for slot in &self.shared.slots {
            slot.inner.lock().sender.take();
        }
        tracing::info!("worker pool shut down");
    }

    /// Get full pool stats as JSON
    pub fn stats(&self) -> serde_json::Value {
        let workers: Vec<serde_json::Value> = self
            .shared
            .slots
            .iter()
            .enumerate()
            .map(|(index, slot)| {
                let inner = slot.inner.lock();
                serde_json::json!({
                    "slot": index,
                    "state": inner.state,
                    "generation": inner.generation,
                    "served": inner.served,
                    "busy_ms": inner
                        .assignment
                        .as_ref()
                        .map(|a| a.started_at.elapsed().as_millis() as u64),
                })
            })
            .collect();

        serde_json::json!({
            "config": {
                "num_workers": self.shared.slots.len(),
                "request_timeout_ms": self.shared.config.request_timeout_ms,
                "reclaim_grace_ms": self.shared.config.reclaim_grace_ms,
                "pin_workers": self.shared.config.pin_workers,
            },
            "idle": self.idle_count(),
            "metrics": self.shared.metrics.to_json(),
            "workers": workers,
        })
    }
}

impl Shared {
    fn spawn_worker(self: &Arc<Self>, index: usize, generation: u64) -> mpsc::UnboundedSender<Job> {
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::clone(self);
        let core_id = self
            .core_ids
            .as_ref()
            .and_then(|ids| ids.get(index % ids.len()).cloned());

        let spawned = thread::Builder::new()
            .name(format!("worker-{}", index))
            .spawn(move || {
                if let Some(core_id) = core_id {
                    core_affinity::set_for_current(core_id);
                }
                let handler = (shared.factory)(index);
                let worker = WorkerThread {
                    index,
                    generation,
                    shared,
                    handler,
                };
                worker.run(rx);
            });
        if let Err(err) = spawned {
            tracing::error!("failed to spawn worker {}: {}", index, err);
        }
        tx
    }

    fn start(self: &Arc<Self>, index: usize, job: Job, assignment: Assignment) -> Result<(), PoolError> {
        let mut inner = self.slots[index].inner.lock();
        inner.state = WorkerState::Busy;
        inner.assignment = Some(assignment);

        let job = match inner.sender.as_ref() {
            Some(sender) => match sender.send(job) {
                Ok(()) => return Ok(()),
                Err(mpsc::error::SendError(job)) => job,
            },
            None => {
                let assignment = inner.assignment.take();
                inner.state = WorkerState::Idle;
                drop(inner);
                self.idle.lock().push(index);
                drop(assignment);
                return Err(PoolError::Closed);
            }
        };

        tracing::error!("worker {} exited unexpectedly; respawning", index);
        self.respawn_locked(index, &mut inner);
        inner.state = WorkerState::Busy;
        let sent = inner
            .sender
            .as_ref()
            .is_some_and(|sender| sender.send(job).is_ok());
        if sent {
            Ok(())
        } else {
            let assignment = inner.assignment.take();
            inner.state = WorkerState::Dead;
            drop(assignment);
            Err(PoolError::WorkerLost(index))
        }
    }

    fn respawn_locked(self: &Arc<Self>, index: usize, inner: &mut SlotInner) {
        inner.generation += 1;
        inner.sender = Some(self.spawn_worker(index, inner.generation));
        inner.state = WorkerState::Idle;
        self.metrics.replacements.fetch_add(1, Ordering::Relaxed);
    }

    /// Return a worker to the idle stack. False if the worker was replaced meanwhile.
    fn release(&self, index: usize, generation: u64) -> bool {
        let mut inner = self.slots[index].inner.lock();
        if inner.generation != generation {
            return false;
        }
        if inner.state == WorkerState::Reclaiming {
            tracing::info!("worker {} recovered from interrupt", index);
            self.metrics.recovered.fetch_add(1, Ordering::Relaxed);
        }
        inner.state = WorkerState::Idle;
        inner.served += 1;
        let assignment = inner.assignment.take();
        drop(inner);

        self.idle.lock().push(index);
        drop(assignment);
        true
    }

    fn replace_if_stuck(self: &Arc<Self>, index: usize, assignment: u64) {
        let mut inner = self.slots[index].inner.lock();
        let stuck = inner.state == WorkerState::Reclaiming
            && inner.assignment.as_ref().is_some_and(|a| a.id == assignment);
        if !stuck {
            return;
        }

        inner.state = WorkerState::Dead;
        tracing::error!(
            "worker {} ignored interrupt for {}ms; replacing it",
            index,
            self.config.reclaim_grace_ms
        );
        let abandoned = inner.assignment.take();
        self.respawn_locked(index, &mut inner);
        drop(inner);

        self.idle.lock().push(index);
        drop(abandoned);
    }
}

/// A job running on a worker.
pub struct InFlight<T> {
    slot: usize,
    assignment: u64,
    reply: oneshot::Receiver<T>,
    pool: WorkerPool,
}

impl<T> InFlight<T> {
    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn reclaimer(&self) -> ReclaimHandle {
        ReclaimHandle {
            pool: self.pool.clone(),
            slot: self.slot,
            assignment: self.assignment,
        }
    }

    pub async fn wait(&mut self) -> Result<T, PoolError> {
        (&mut self.reply)
            .await
            .map_err(|_| PoolError::WorkerLost(self.slot))
    }
}

/// Detached capability to reclaim one specific assignment.
#[derive(Clone)]
pub struct ReclaimHandle {
    pool: WorkerPool,
    slot: usize,
    assignment: u64,
}

impl ReclaimHandle {
    pub fn reclaim(&self) -> bool {
        self.pool.forcibly_reclaim(self.slot, self.assignment)
    }
}

// ========== Worker Thread ==========

/// Worker thread that owns one handler
struct WorkerThread {
    index: usize,
    generation: u64,
    shared: Arc<Shared>,
    handler: Box<dyn Handler>,
}

impl WorkerThread {
    fn run(mut self, mut rx: mpsc::UnboundedReceiver<Job>) {
        tracing::debug!("Worker {} started (generation {})", self.index, self.generation);

        while let Some(job) = rx.blocking_recv() {
            let finished = self.process(job);
            // Release before replying so a caller that submits again right away
            // finds this worker idle.
            let current = self.shared.release(self.index, self.generation);
            finished.deliver();
            if !current {
                tracing::debug!(
                    "Worker {} generation {} was replaced; exiting",
                    self.index,
                    self.generation
                );
                return;
            }
        }

        tracing::debug!("Worker {} shutting down", self.index);
    }

    fn process(&mut self, job: Job) -> Finished {
        let Job {
            assignment,
            token,
            hooks,
            work,
        } = job;
        let mut ctx = InvokeContext::new(
            self.index,
            Arc::clone(&token),
            Arc::clone(&self.shared.control),
            hooks,
        );
        let handler = &mut self.handler;

        match work {
            Work::Invoke { request, reply } => {
                let result = guarded(|| handler.invoke(&request, &mut ctx));
                let result = settle(&token, result);
                if let Err(err) = &result {
                    self.record_failure(assignment, err);
                }
                Finished::Invoke(reply, result)
            }
            Work::Task { name, reply } => {
                let result = guarded(|| handler.run_task(&name, &mut ctx));
                let result = settle(&token, result);
                if let Err(err) = &result {
                    self.record_failure(assignment, err);
                }
                Finished::Task(reply, result)
            }
        }
    }

    fn record_failure(&self, assignment: u64, err: &HandlerError) {
        if matches!(err, HandlerError::Interrupted) {
            tracing::debug!("worker {} assignment {} interrupted", self.index, assignment);
            return;
        }
        self.shared
            .metrics
            .handler_failures
            .fetch_add(1, Ordering::Relaxed);
        tracing::error!("worker {} assignment {}: {}", self.index, assignment, err);
    }
}

fn guarded<T>(call: impl FnOnce() -> Result<T, HandlerError>) -> Result<T, HandlerError> {
    match catch_unwind(AssertUnwindSafe(call)) {
        Ok(result) => result,
        Err(payload) => {
            let message = if let Some(text) = payload.downcast_ref::<&str>() {
                (*text).to_string()
            } else if let Some(text) = payload.downcast_ref::<String>() {
                text.clone()
            } else {
                "unknown panic".to_string()
            };
            Err(HandlerError::Panicked(message))
        }
    }
}

/// Once interrupted, whatever the call produced is discarded.
fn settle<T>(token: &InterruptToken, result: Result<T, HandlerError>) -> Result<T, HandlerError> {
    if token.is_interrupted() {
        Err(HandlerError::Interrupted)
    } else {
        result
    }
}
