use renderfarm_core::decode::DecodeError;
use renderfarm_core::CoreError;
use renderfarm_server::executable::ExecutableError;
use renderfarm_server::RenderClientError;

use crate::worker::BoxError;

/// Errors from pool and renderer operations.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    /// A worker could not bring up its resources; the pool did not start.
    #[error("Worker {worker} failed to start: {source}")]
    StartupFailure {
        worker: usize,
        #[source]
        source: BoxError,
    },

    /// A worker task ended before reporting its startup outcome.
    #[error("Worker {worker} exited during startup")]
    WorkerLost { worker: usize },

    #[error("Executor has already been started")]
    AlreadyStarted,

    #[error("Executor has not been started")]
    NotStarted,

    #[error("Executor has been shut down")]
    Stopped,

    /// The result for a submitted task will never arrive.
    #[error("Result channel closed before a result was delivered")]
    ResultChannelClosed,

    #[error(transparent)]
    Render(#[from] RenderError),

    #[error(transparent)]
    Config(#[from] CoreError),

    #[error(transparent)]
    Executable(#[from] ExecutableError),
}

/// Failure of a single batch, delivered to its destination.
#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    #[error("Render server on port {port} is not connected")]
    NotConnected { port: u16 },

    #[error("Render RPC failed: {0}")]
    Transport(#[from] RenderClientError),

    #[error("Failed to decode render response: {0}")]
    Decode(#[from] DecodeError),
}
