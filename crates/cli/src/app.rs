//! Demo application served by `appd` when no other handler is wired in.
//!
//! Each route exercises one piece of the dispatch core: slow and stuck
//! handlers, cacheable pages, close hooks, per-worker state, blocking and
//! parking.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use pool::{
    ContextLock, Handler, HandlerError, HandlerFactory, InvokeContext, NotifyOutcome, Reply,
    Request, Response,
};

/// Name of the periodic task that logs a heartbeat from a worker.
pub const HEARTBEAT: &str = "heartbeat";

/// Tokens a `/park/park` request waits on.
pub const PARK_TOKENS: &str = "12345, 12346";
pub const PARK_TIMEOUT: Duration = Duration::from_secs(6);
pub const PARK_FALLBACK_STATUS: u16 = 504;

/// State shared by every worker's handler.
#[derive(Clone)]
pub struct DemoShared {
    closes: Arc<AtomicUsize>,
    log_lock: ContextLock,
}

impl DemoShared {
    pub fn new() -> Self {
        Self {
            closes: Arc::new(AtomicUsize::new(0)),
            log_lock: ContextLock::new("log"),
        }
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

impl Default for DemoShared {
    fn default() -> Self {
        Self::new()
    }
}

pub struct DemoApp {
    slot: usize,
    shared: DemoShared,
    // Per-worker counter for `/thread-local/`.
    counter: u64,
    served: u64,
}

pub fn factory(shared: DemoShared) -> HandlerFactory {
    Arc::new(move |slot| {
        Box::new(DemoApp {
            slot,
            shared: shared.clone(),
            counter: 0,
            served: 0,
        })
    })
}

impl Handler for DemoApp {
    fn invoke(&mut self, request: &Request, ctx: &mut InvokeContext) -> Result<Reply, HandlerError> {
        self.served += 1;
        let path = request.path.as_str();

        if let Some(action) = path.strip_prefix("/park/") {
            return Ok(self.park_route(action, request, ctx));
        }
        if path.starts_with("/block/") {
            return Ok(Reply::Respond(
                Response::ok("blocked")
                    .with_header("Content-Type", "text/html")
                    .with_header("X-Block", "2"),
            ));
        }

        match path {
            "/wait/" => std::thread::sleep(Duration::from_secs(1)),
            "/wait10/" => {
                for _ in 0..100 {
                    ctx.sleep(Duration::from_millis(100))?;
                }
            }
            "/slowlog/" => {
                let _guard = ctx.lock(&self.shared.log_lock)?;
                // Formatting the log line is slow and cannot be interrupted.
                std::thread::sleep(Duration::from_secs(2));
                tracing::error!(target: "demo", "slow log line from worker {}", self.slot);
            }
            "/time/" => {
                let now = chrono::Utc::now().timestamp_millis() as f64 / 1000.0;
                return Ok(Reply::Respond(
                    Response::ok(format!("{:.3}", now))
                        .with_header("Content-Type", "text/html")
                        .with_header("Cache-Control", "max-age=60")
                        .with_header("Vary", "Cookie"),
                ));
            }
            _ => {}
        }

        let body = if path.starts_with("/echo/") {
            bytes::Bytes::from(request.path.clone())
        } else if path.starts_with("/close/") {
            let closes = Arc::clone(&self.shared.closes);
            ctx.on_close(move |_| {
                closes.fetch_add(1, Ordering::SeqCst);
            });
            bytes::Bytes::from(self.shared.closes().to_string())
        } else if path.starts_with("/thread-local/") {
            self.counter += 1;
            bytes::Bytes::from(self.counter.to_string())
        } else if request.method == "POST" {
            bytes::Bytes::from(format!("received {} bytes", request.body.len()))
        } else {
            bytes::Bytes::from_static(b"hello from appd")
        };

        Ok(Reply::Respond(
            Response::ok(body)
                .with_header("Content-Type", "text/html")
                .with_header("Set-Cookie", "cookie1=cookievalue1")
                .with_header("Set-Cookie", "cookie2=cookievalue2")
                .with_header("Set-Cookie", "cookie3=cookievalue3")
                .with_header("Vary", "Cookie"),
        ))
    }

    fn run_task(&mut self, task: &str, ctx: &mut InvokeContext) -> Result<(), HandlerError> {
        match task {
            HEARTBEAT => {
                tracing::info!(
                    "heartbeat from worker {} ({} requests served)",
                    ctx.slot(),
                    self.served
                );
                Ok(())
            }
            other => Err(HandlerError::failed(format!("unknown task '{}'", other))),
        }
    }
}

impl DemoApp {
    fn park_route(&self, action: &str, request: &Request, ctx: &InvokeContext) -> Reply {
        let notified = || {
            Reply::Respond(Response::ok("notified!").with_header("Content-Type", "text/html"))
        };
        match action {
            "park" => match request.park_arg() {
                Some(arg) => Reply::Respond(Response::ok(arg.to_string())),
                None => ctx.park([PARK_TOKENS], PARK_TIMEOUT, PARK_FALLBACK_STATUS),
            },
            "notify_204" => {
                ctx.notify("12345", NotifyOutcome::status(204));
                notified()
            }
            "notify_retry" => {
                ctx.notify("12345", NotifyOutcome::retry("retry_arg"));
                notified()
            }
            "notify_wrong" => {
                ctx.notify("555", NotifyOutcome::status(504));
                notified()
            }
            _ => Reply::Respond(Response::text(404, "Not Found")),
        }
    }
}
