//! Generic queue worker.
//!
//! A [`QueueWorker`] supplies the three hooks; [`run_worker`] drives the
//! lifecycle around them: start up, serve tasks one at a time until
//! cancelled, then tear down.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{oneshot, watch};
use tokio_util::sync::CancellationToken;

use crate::queue::{Polled, QueueReceiver, Task};

/// Boxed startup error reported back to the pool.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Lifecycle of one worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    NotStarted,
    Starting,
    Running,
    ShuttingDown,
    Stopped,
}

/// Behaviour plugged into the generic worker loop.
///
/// A worker exclusively owns whatever `on_run` acquires; nothing else in
/// the pool touches it.
#[async_trait]
pub trait QueueWorker: Send + 'static {
    type Workload: Send + 'static;
    type Output: Send + 'static;
    type StartError: std::error::Error + Send + Sync + 'static;

    /// Acquire resources. Failure aborts pool startup.
    async fn on_run(&mut self, cancel: &CancellationToken) -> Result<(), Self::StartError>;

    /// Handle one workload. Never called concurrently on the same worker.
    async fn process(&mut self, workload: Self::Workload) -> Self::Output;

    /// Release resources. Runs exactly once, after the last `process`.
    async fn on_shutdown(&mut self);
}

/// Everything a spawned worker task needs besides the worker itself.
pub(crate) struct WorkerContext<P, O> {
    pub index: usize,
    pub queue: QueueReceiver<Task<P, O>>,
    pub poll_interval: Duration,
    pub cancel: CancellationToken,
    pub state: watch::Sender<WorkerState>,
    pub started: oneshot::Sender<Result<(), BoxError>>,
}

/// Run a worker to completion.
///
/// Cancellation is checked between tasks only; a task already taken off
/// the queue always runs to the end and its result is always sent.
pub(crate) async fn run_worker<W: QueueWorker>(
    mut worker: W,
    ctx: WorkerContext<W::Workload, W::Output>,
) {
    let WorkerContext {
        index,
        queue,
        poll_interval,
        cancel,
        state,
        started,
    } = ctx;

    state.send_replace(WorkerState::Starting);
    if let Err(e) = worker.on_run(&cancel).await {
        tracing::error!(worker = index, error = %e, "Worker failed to start");
        state.send_replace(WorkerState::ShuttingDown);
        worker.on_shutdown().await;
        state.send_replace(WorkerState::Stopped);
        let error: BoxError = Box::new(e);
        let _ = started.send(Err(error));
        return;
    }

    state.send_replace(WorkerState::Running);
    let _ = started.send(Ok(()));
    tracing::debug!(worker = index, "Worker running");

    let mut processed: u64 = 0;
    while !cancel.is_cancelled() {
        let polled = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            polled = queue.poll(poll_interval) => polled,
        };

        match polled {
            Polled::Task(Task {
                payload,
                destination,
            }) => {
                let output = worker.process(payload).await;
                processed += 1;
                if destination.send(output).is_err() {
                    tracing::debug!(worker = index, "Result destination dropped");
                }
            }
            Polled::Timeout => continue,
            Polled::Closed => break,
        }
    }

    state.send_replace(WorkerState::ShuttingDown);
    tracing::debug!(worker = index, processed, "Worker shutting down");
    worker.on_shutdown().await;
    state.send_replace(WorkerState::Stopped);
}
