use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::error::{HandlerError, Interrupted};
use crate::interrupt::{ContextLock, ContextLockGuard, InterruptToken};
use crate::request::{Request, Response};

/// A request handler bound to one worker for the worker's whole lifetime.
///
/// Handlers are constructed on the worker thread by a [`HandlerFactory`] and
/// never leave it, so any state kept in `self` is per-worker state: it persists
/// across calls on the same worker and is invisible to other workers.
pub trait Handler {
    fn invoke(&mut self, request: &Request, ctx: &mut InvokeContext) -> Result<Reply, HandlerError>;

    /// Run a named periodic task on this worker.
    fn run_task(&mut self, task: &str, ctx: &mut InvokeContext) -> Result<(), HandlerError> {
        let _ = ctx;
        tracing::warn!("handler has no task named '{}'", task);
        Ok(())
    }
}

/// Builds the handler for a worker slot. Called on the worker thread.
pub type HandlerFactory = Arc<dyn Fn(usize) -> Box<dyn Handler> + Send + Sync>;

#[derive(Debug)]
pub enum Reply {
    Respond(Response),
    /// Suspend the request until notified or until the park times out.
    Park(ParkSpec),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParkSpec {
    pub tokens: Vec<String>,
    pub timeout: Duration,
    pub fallback_status: u16,
}

impl ParkSpec {
    pub fn new<I, S>(tokens: I, timeout: Duration, fallback_status: u16) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut collected = Vec::new();
        for token in tokens {
            for part in split_tokens(&token.into()) {
                if !collected.contains(&part) {
                    collected.push(part);
                }
            }
        }
        Self {
            tokens: collected,
            timeout,
            fallback_status,
        }
    }
}

/// Split a comma-separated token list, dropping blanks.
pub fn split_tokens(list: &str) -> Vec<String> {
    list.split(',')
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .map(str::to_string)
        .collect()
}

/// How a notification resolves a parked request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotifyOutcome {
    Terminal { status: u16, body: Bytes },
    Retry(String),
}

impl NotifyOutcome {
    pub fn status(status: u16) -> Self {
        Self::Terminal {
            status,
            body: Bytes::new(),
        }
    }

    pub fn retry(arg: impl Into<String>) -> Self {
        Self::Retry(arg.into())
    }
}

/// Server operations a running handler may call back into.
pub trait Control: Send + Sync {
    /// Resolve parked requests waiting on `token`. Returns how many were resolved.
    fn notify(&self, token: &str, outcome: NotifyOutcome) -> usize;

    /// Hold and then reject requests from `identity` for `duration`.
    fn block(&self, identity: &str, duration: Duration);
}

/// Control that resolves nothing and blocks nobody.
pub struct NoopControl;

impl Control for NoopControl {
    fn notify(&self, _token: &str, _outcome: NotifyOutcome) -> usize {
        0
    }

    fn block(&self, _identity: &str, _duration: Duration) {}
}

/// Final status handed to close hooks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Closed {
    pub request_id: u64,
    pub status: u16,
}

pub type CloseHook = Box<dyn FnOnce(&Closed) + Send>;

/// Close hooks of one request. Shared by every invocation of that request,
/// drained exactly once when its response has been delivered.
#[derive(Clone, Default)]
pub struct CloseHooks {
    inner: Arc<Mutex<CloseState>>,
}

#[derive(Default)]
struct CloseState {
    closed: Option<Closed>,
    hooks: Vec<CloseHook>,
}

impl CloseHooks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a hook. A hook added after the request closed runs immediately.
    pub fn push(&self, hook: CloseHook) {
        let mut state = self.inner.lock();
        match state.closed {
            Some(closed) => {
                drop(state);
                hook(&closed);
            }
            None => state.hooks.push(hook),
        }
    }

    /// Run every pending hook. Returns false if the request was already closed.
    pub fn close(&self, closed: Closed) -> bool {
        let hooks = {
            let mut state = self.inner.lock();
            if state.closed.is_some() {
                return false;
            }
            state.closed = Some(closed);
            std::mem::take(&mut state.hooks)
        };
        for hook in hooks {
            hook(&closed);
        }
        true
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed.is_some()
    }
}

/// Everything a handler call can reach besides the request itself.
pub struct InvokeContext {
    slot: usize,
    token: Arc<InterruptToken>,
    control: Arc<dyn Control>,
    hooks: CloseHooks,
}

impl InvokeContext {
    pub fn new(
        slot: usize,
        token: Arc<InterruptToken>,
        control: Arc<dyn Control>,
        hooks: CloseHooks,
    ) -> Self {
        Self {
            slot,
            token,
            control,
            hooks,
        }
    }

    /// Index of the worker running this call.
    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn interrupt_token(&self) -> &Arc<InterruptToken> {
        &self.token
    }

    pub fn is_interrupted(&self) -> bool {
        self.token.is_interrupted()
    }

    /// Fail fast once this call has been interrupted.
    pub fn checkpoint(&self) -> Result<(), Interrupted> {
        self.token.check()
    }

    pub fn sleep(&self, duration: Duration) -> Result<(), Interrupted> {
        self.token.sleep(duration)
    }

    pub fn lock(&self, lock: &ContextLock) -> Result<ContextLockGuard, Interrupted> {
        lock.acquire(&self.token)
    }

    pub fn notify(&self, token: &str, outcome: NotifyOutcome) -> usize {
        self.control.notify(token, outcome)
    }

    pub fn block(&self, identity: &str, duration: Duration) {
        self.control.block(identity, duration)
    }

    /// Run `hook` once the response to the current request has been delivered.
    pub fn on_close(&self, hook: impl FnOnce(&Closed) + Send + 'static) {
        self.hooks.push(Box::new(hook));
    }

    /// Build a park reply. The worker is released as soon as the handler returns it.
    pub fn park<I, S>(&self, tokens: I, timeout: Duration, fallback_status: u16) -> Reply
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Reply::Park(ParkSpec::new(tokens, timeout, fallback_status))
    }
}
