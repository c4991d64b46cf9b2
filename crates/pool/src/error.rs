use thiserror::Error;

/// Returned by interruptible operations once the running assignment has been interrupted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("execution interrupted")]
pub struct Interrupted;

/// Failure of a single handler call.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("execution interrupted")]
    Interrupted,

    #[error("handler failed: {0}")]
    Failed(String),

    #[error("handler panicked: {0}")]
    Panicked(String),
}

impl HandlerError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

impl From<Interrupted> for HandlerError {
    fn from(_: Interrupted) -> Self {
        Self::Interrupted
    }
}

/// Failure of the pool itself, never of the handler.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("worker pool is shut down")]
    Closed,

    #[error("worker {0} dropped the reply channel")]
    WorkerLost(usize),
}
