use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;

use crate::admission::AdmissionGate;
use crate::cache::{CacheConfig, ResponseCache};
use crate::config::ServerConfig;
use crate::park::ParkingTable;
use crate::scheduler::PeriodicScheduler;
use pool::{Control, HandlerFactory, NotifyOutcome, TimeoutReclaimer, WorkerPool};

/// The dispatch core: one worker pool plus the registries every request passes through.
pub struct Engine {
    pub(crate) config: ServerConfig,
    pub(crate) pool: WorkerPool,
    pub(crate) reclaimer: TimeoutReclaimer,
    pub(crate) gate: Arc<AdmissionGate>,
    pub(crate) parking: Arc<ParkingTable>,
    pub(crate) cache: Option<Arc<ResponseCache>>,
    scheduler: Arc<PeriodicScheduler>,
    request_seq: AtomicU64,
    background: Mutex<Vec<JoinHandle<()>>>,
}

/// What a running handler can reach through its invoke context.
struct EngineControl {
    gate: Arc<AdmissionGate>,
    parking: Arc<ParkingTable>,
}

impl Control for EngineControl {
    fn notify(&self, token: &str, outcome: NotifyOutcome) -> usize {
        self.parking.notify(token, outcome)
    }

    fn block(&self, identity: &str, duration: Duration) {
        self.gate.register_block(identity, duration)
    }
}

impl Engine {
    pub fn new(config: ServerConfig, factory: HandlerFactory) -> Arc<Self> {
        let gate = Arc::new(AdmissionGate::new(config.block_status, config.block_hold_slots));
        let parking = Arc::new(ParkingTable::new());
        let control = Arc::new(EngineControl {
            gate: Arc::clone(&gate),
            parking: Arc::clone(&parking),
        });

        let pool = WorkerPool::new(config.pool_config(), factory, control);
        let reclaimer = TimeoutReclaimer::with_timeout(pool.clone(), config.request_timeout());
        let cache = config.cache_enabled.then(|| {
            Arc::new(ResponseCache::new(CacheConfig {
                limit_bytes: config.cache_limit_bytes,
                entry_limit_bytes: config.cache_entry_limit_bytes,
                refresh_ahead: config.refresh_ahead(),
            }))
        });
        let scheduler = Arc::new(PeriodicScheduler::new(pool.clone()));

        Arc::new(Self {
            config,
            pool,
            reclaimer,
            gate,
            parking,
            cache,
            scheduler,
            request_seq: AtomicU64::new(1),
            background: Mutex::new(Vec::new()),
        })
    }

    /// Start the block sweeper and the periodic scheduler. Needs a tokio runtime.
    pub fn start(&self) {
        let mut background = self.background.lock();
        if !background.is_empty() {
            return;
        }
        background.push(self.gate.spawn_sweeper(self.config.block_sweep_interval()));
        background.push(self.scheduler.spawn());
        tracing::info!(
            "engine started: {} workers, request timeout {:?}, cache {}",
            self.pool.size(),
            self.config.request_timeout(),
            if self.cache.is_some() { "on" } else { "off" }
        );
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    pub fn scheduler(&self) -> &Arc<PeriodicScheduler> {
        &self.scheduler
    }

    pub fn admission(&self) -> &Arc<AdmissionGate> {
        &self.gate
    }

    pub fn parking(&self) -> &Arc<ParkingTable> {
        &self.parking
    }

    pub fn cache(&self) -> Option<&Arc<ResponseCache>> {
        self.cache.as_ref()
    }

    pub(crate) fn next_request_id(&self) -> u64 {
        self.request_seq.fetch_add(1, Ordering::Relaxed)
    }

    /// Resolve parked requests from outside any handler.
    pub fn notify(&self, tokens: &str, outcome: NotifyOutcome) -> usize {
        self.parking.notify(tokens, outcome)
    }

    pub fn block(&self, identity: &str, duration: Duration) {
        self.gate.register_block(identity, duration)
    }

    pub fn stats(&self) -> serde_json::Value {
        serde_json::json!({
            "pool": self.pool.stats(),
            "cache": self.cache.as_ref().map(|cache| cache.stats()),
            "blocked_identities": self.gate.len(),
            "parked_tokens": self.parking.len(),
            "tasks": self.scheduler.stats(),
        })
    }

    /// Stop background loops and the worker pool.
    pub fn shutdown(&self) {
        for handle in self.background.lock().drain(..) {
            handle.abort();
        }
        self.pool.shutdown();
    }
}
