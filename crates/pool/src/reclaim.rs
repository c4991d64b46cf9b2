//! Request deadlines.
//!
//! A request's deadline runs from its arrival, so time spent waiting for a
//! worker counts against it. Expiry while queued abandons the request without
//! ever touching a worker; expiry while running interrupts the worker.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::error::{HandlerError, PoolError};
use crate::handler::{CloseHooks, Reply};
use crate::request::Request;
use crate::worker_pool::WorkerPool;

#[derive(Debug)]
pub enum Resolution {
    Completed {
        slot: usize,
        result: Result<Reply, HandlerError>,
    },
    /// `slot` is `None` when the deadline passed before a worker was assigned.
    TimedOut { slot: Option<usize> },
}

#[derive(Clone)]
pub struct TimeoutReclaimer {
    pool: WorkerPool,
    timeout: Option<Duration>,
}

impl TimeoutReclaimer {
    /// Uses the pool's configured request timeout.
    pub fn new(pool: WorkerPool) -> Self {
        let timeout = pool.config().request_timeout();
        Self { pool, timeout }
    }

    pub fn with_timeout(pool: WorkerPool, timeout: Option<Duration>) -> Self {
        Self { pool, timeout }
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn deadline_for(&self, request: &Request) -> Option<Instant> {
        self.timeout
            .map(|timeout| Instant::from_std(request.arrived_at + timeout))
    }

    /// Run `request` against its arrival-based deadline.
    pub async fn run(&self, request: Arc<Request>, hooks: CloseHooks) -> Result<Resolution, PoolError> {
        let deadline = self.deadline_for(&request);
        self.run_until(request, hooks, deadline).await
    }

    /// Run `request` against an explicit deadline. `None` waits indefinitely.
    pub async fn run_until(
        &self,
        request: Arc<Request>,
        hooks: CloseHooks,
        deadline: Option<Instant>,
    ) -> Result<Resolution, PoolError> {
        let Some(deadline) = deadline else {
            let mut in_flight = self.pool.execute(request, hooks).await?;
            let slot = in_flight.slot();
            let result = in_flight.wait().await?;
            return Ok(Resolution::Completed { slot, result });
        };

        if Instant::now() >= deadline {
            tracing::warn!("{} {} expired before dispatch", request.method, request.target());
            return Ok(Resolution::TimedOut { slot: None });
        }

        let target = request.target();
        let mut in_flight =
            match tokio::time::timeout_at(deadline, self.pool.execute(request, hooks)).await {
                Ok(started) => started?,
                Err(_) => {
                    tracing::warn!("{} timed out waiting for a worker", target);
                    return Ok(Resolution::TimedOut { slot: None });
                }
            };

        let slot = in_flight.slot();
        let reclaim = in_flight.reclaimer();
        tokio::select! {
            biased;
            reply = in_flight.wait() => Ok(Resolution::Completed { slot, result: reply? }),
            _ = tokio::time::sleep_until(deadline) => {
                tracing::warn!("{} timed out on worker {}", target, slot);
                reclaim.reclaim();
                Ok(Resolution::TimedOut { slot: Some(slot) })
            }
        }
    }
}
