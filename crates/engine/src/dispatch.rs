use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::admission::{Admission, identity_of};
use crate::cache::{ResponseCache, VARY_COOKIES_HEADER};
use crate::engine::Engine;
use crate::park::ParkResolution;
use pool::{
    CloseHooks, Closed, NotifyOutcome, PoolError, Reply, Request, Resolution, Response,
};

/// Response header asking the server to block the requesting identity for N seconds.
pub const BLOCK_HEADER: &str = "x-block";

/// Close status for a request whose caller went away before a response existed.
pub const ABANDONED_STATUS: u16 = 499;

/// Where a delivered response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Worker,
    Cache,
    Rejected,
    TimedOut,
    Park,
}

impl Source {
    fn as_str(self) -> &'static str {
        match self {
            Source::Worker => "worker",
            Source::Cache => "cache",
            Source::Rejected => "rejected",
            Source::TimedOut => "timeout",
            Source::Park => "park",
        }
    }
}

/// A response ready to be written. Its [`Completion`] runs the request's close
/// hooks when dropped, so the transport keeps it alive until the body is flushed.
pub struct Delivery {
    pub response: Response,
    pub source: Source,
    pub slot: Option<usize>,
    pub completion: Completion,
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("response", &self.response)
            .field("source", &self.source)
            .field("slot", &self.slot)
            .finish_non_exhaustive()
    }
}

impl Delivery {
    pub fn status(&self) -> u16 {
        self.response.status
    }

    pub fn into_parts(self) -> (Response, Completion) {
        (self.response, self.completion)
    }
}

pub struct Completion {
    hooks: CloseHooks,
    closed: Closed,
    log: Option<AccessLog>,
}

struct AccessLog {
    method: String,
    target: String,
    identity: String,
    source: Source,
    slot: Option<usize>,
    started: Instant,
}

impl Completion {
    pub fn request_id(&self) -> u64 {
        self.closed.request_id
    }

    /// Run close hooks now instead of on drop.
    pub fn complete(self) {}
}

impl Drop for Completion {
    fn drop(&mut self) {
        let Some(log) = self.log.take() else {
            return;
        };
        self.hooks.close(self.closed);
        tracing::info!(
            target: "access",
            "{} {} {} {}ms slot={} identity={} source={}",
            log.method,
            log.target,
            self.closed.status,
            log.started.elapsed().as_millis(),
            log.slot.map(|slot| slot.to_string()).unwrap_or_else(|| "-".to_string()),
            log.identity,
            log.source.as_str()
        );
    }
}

/// Closes the request's hooks with [`ABANDONED_STATUS`] if dispatch is dropped
/// before handing them to a [`Completion`].
struct PendingClose {
    hooks: CloseHooks,
    request_id: u64,
    armed: bool,
}

impl PendingClose {
    fn new(request_id: u64) -> Self {
        Self {
            hooks: CloseHooks::new(),
            request_id,
            armed: true,
        }
    }

    fn hooks(&self) -> &CloseHooks {
        &self.hooks
    }

    fn disarm(mut self) -> CloseHooks {
        self.armed = false;
        self.hooks.clone()
    }
}

impl Drop for PendingClose {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if self.hooks.close(Closed {
            request_id: self.request_id,
            status: ABANDONED_STATUS,
        }) {
            tracing::debug!("request {} abandoned before a response", self.request_id);
        }
    }
}

struct Outcome {
    response: Response,
    source: Source,
    slot: Option<usize>,
}

impl Outcome {
    fn synthesized(status: u16, source: Source, slot: Option<usize>) -> Self {
        Self {
            response: synthesized(status),
            source,
            slot,
        }
    }
}

/// Body-only response for statuses the server produces itself.
pub fn synthesized(status: u16) -> Response {
    let reason = match status {
        204 | 304 => return Response::new(status),
        403 => "Forbidden",
        429 => "Too Many Requests",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => "",
    };
    Response::text(status, reason)
}

impl Engine {
    /// Run one request through admission, cache, and the worker pool.
    pub async fn dispatch(self: &Arc<Self>, mut request: Request) -> Delivery {
        let started = Instant::now();
        request.id = self.next_request_id();
        let identity = identity_of(&request, &self.config.identity_header);
        let pending = PendingClose::new(request.id);

        if let Admission::Reject(status) = self.gate.admit(&identity).await {
            let outcome = Outcome::synthesized(status, Source::Rejected, None);
            return deliver(&request, identity, outcome, pending, started);
        }

        if let Some(cache) = &self.cache {
            if let Some(hit) = cache.lookup(&request) {
                if hit.refresh {
                    self.refresh(&request, cache);
                }
                let outcome = Outcome {
                    response: hit.response,
                    source: Source::Cache,
                    slot: None,
                };
                return deliver(&request, identity, outcome, pending, started);
            }
        }

        let request = Arc::new(request);
        let outcome = self
            .execute(Arc::clone(&request), &identity, pending.hooks())
            .await;
        deliver(&request, identity, outcome, pending, started)
    }

    async fn execute(&self, mut request: Arc<Request>, identity: &str, hooks: &CloseHooks) -> Outcome {
        let mut deadline = self.reclaimer.deadline_for(&request);
        let mut parked = false;

        loop {
            let resolution = match self
                .reclaimer
                .run_until(Arc::clone(&request), hooks.clone(), deadline)
                .await
            {
                Ok(resolution) => resolution,
                Err(err) => {
                    tracing::error!("{} {}: {}", request.method, request.target(), err);
                    let status = match err {
                        PoolError::Closed => 503,
                        PoolError::WorkerLost(_) => 500,
                    };
                    return Outcome::synthesized(status, Source::Worker, None);
                }
            };

            let (slot, result) = match resolution {
                Resolution::TimedOut { slot } => {
                    return Outcome::synthesized(self.config.timeout_status, Source::TimedOut, slot);
                }
                Resolution::Completed { slot, result } => (slot, result),
            };

            let spec = match result {
                Ok(Reply::Respond(response)) => {
                    let response = self.apply_directives(&request, identity, response, !parked);
                    return Outcome {
                        response,
                        source: Source::Worker,
                        slot: Some(slot),
                    };
                }
                Ok(Reply::Park(spec)) => spec,
                Err(err) => {
                    tracing::error!(
                        "{} {} failed on worker {}: {}",
                        request.method,
                        request.target(),
                        slot,
                        err
                    );
                    return Outcome::synthesized(500, Source::Worker, Some(slot));
                }
            };

            parked = true;
            match self.parking.park(&spec).wait().await {
                ParkResolution::TimedOut(status) => {
                    return Outcome::synthesized(status, Source::Park, None);
                }
                ParkResolution::Notified(NotifyOutcome::Terminal { status, body }) => {
                    return Outcome {
                        response: Response::new(status).with_body(body),
                        source: Source::Park,
                        slot: None,
                    };
                }
                ParkResolution::Notified(NotifyOutcome::Retry(arg)) => {
                    tracing::debug!("retrying {} with park arg {:?}", request.target(), arg);
                    let mut retried = Request::clone(&request);
                    retried.set_park_arg(arg);
                    request = Arc::new(retried);
                    deadline = self.config.retry_timeout().map(|timeout| Instant::now() + timeout);
                }
            }
        }
    }

    /// Strip server directives from a handler response, acting on them, and
    /// cache it if allowed.
    fn apply_directives(
        &self,
        request: &Request,
        identity: &str,
        mut response: Response,
        cacheable: bool,
    ) -> Response {
        let vary_cookies = response.remove_header(VARY_COOKIES_HEADER);

        if let Some(raw) = response.remove_header(BLOCK_HEADER) {
            match raw.trim().parse::<u64>() {
                Ok(seconds) => self.gate.register_block(identity, Duration::from_secs(seconds)),
                Err(_) => tracing::warn!("ignoring {} header {:?}", BLOCK_HEADER, raw),
            }
            return response;
        }

        if cacheable {
            if let Some(cache) = &self.cache {
                cache.store(request, &response, vary_cookies.as_deref());
            }
        }
        response
    }

    /// Re-render a soon-to-expire cache entry in the background.
    fn refresh(self: &Arc<Self>, request: &Request, cache: &Arc<ResponseCache>) {
        let key = ResponseCache::key(request);
        if !cache.begin_refresh(&key) {
            return;
        }

        let engine = Arc::clone(self);
        let cache = Arc::clone(cache);
        let mut fresh = request.clone();
        fresh.id = self.next_request_id();
        fresh.arrived_at = std::time::Instant::now();

        tokio::spawn(async move {
            let request_id = fresh.id;
            let identity = identity_of(&fresh, &engine.config.identity_header);
            let hooks = CloseHooks::new();
            let outcome = engine.execute(Arc::new(fresh), &identity, &hooks).await;
            hooks.close(Closed {
                request_id,
                status: outcome.response.status,
            });
            cache.end_refresh(&key);
            tracing::debug!("refreshed {} ({})", key, outcome.response.status);
        });
    }
}

fn deliver(
    request: &Request,
    identity: String,
    outcome: Outcome,
    pending: PendingClose,
    started: Instant,
) -> Delivery {
    let hooks = pending.disarm();
    let closed = Closed {
        request_id: request.id,
        status: outcome.response.status,
    };
    Delivery {
        completion: Completion {
            hooks,
            closed,
            log: Some(AccessLog {
                method: request.method.clone(),
                target: request.target(),
                identity,
                source: outcome.source,
                slot: outcome.slot,
                started,
            }),
        },
        response: outcome.response,
        source: outcome.source,
        slot: outcome.slot,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn synthesized_responses_carry_reason_text() {
        let response = synthesized(502);
        assert_eq!(response.status, 502);
        assert_eq!(response.body, "Bad Gateway");
        assert!(synthesized(204).body.is_empty());
    }

    fn recording(pending: &PendingClose) -> Arc<parking_lot::Mutex<Vec<u16>>> {
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        pending
            .hooks()
            .push(Box::new(move |closed| sink.lock().push(closed.status)));
        seen
    }

    #[test]
    fn completion_closes_once_on_drop() {
        let request = Request::new("GET", "/");
        let pending = PendingClose::new(request.id);
        let hooks = pending.hooks().clone();
        let seen = recording(&pending);

        let outcome = Outcome::synthesized(429, Source::Rejected, None);
        let delivery = deliver(&request, "-".to_string(), outcome, pending, Instant::now());
        assert!(!hooks.is_closed());

        let (_, completion) = delivery.into_parts();
        completion.complete();
        assert_eq!(*seen.lock(), vec![429]);
        assert!(hooks.is_closed());
    }

    #[test]
    fn abandoned_request_closes_with_499() {
        let pending = PendingClose::new(7);
        let hooks = pending.hooks().clone();
        let seen = recording(&pending);

        drop(pending);
        assert_eq!(*seen.lock(), vec![ABANDONED_STATUS]);
        assert!(!hooks.close(Closed {
            request_id: 7,
            status: 200,
        }));
        assert_eq!(seen.lock().len(), 1);
    }
}
