//! Fixed-size worker pool over a shared task queue.
//!
//! [`QueueExecutor`] owns the queue and one tokio task per worker. It knows
//! nothing about what the workers do; see [`crate::renderer`] for the
//! render-specific layer on top.

use std::time::Duration;

use futures::future::join_all;
use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::ExecutorError;
use crate::queue::{Task, TaskQueue};
use crate::worker::{run_worker, QueueWorker, WorkerContext, WorkerState};

/// Pool-wide timing knobs.
#[derive(Debug, Clone)]
pub struct ExecutorOptions {
    /// Idle queue wait before a worker rechecks for shutdown.
    pub poll_interval: Duration,
    /// Delay between consecutive worker spawns.
    pub startup_stagger: Duration,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            startup_stagger: Duration::from_millis(500),
        }
    }
}

/// Coarse pool state, readable without locking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolPhase {
    Idle,
    Starting,
    Running,
    Stopped,
}

struct RunningWorker {
    index: usize,
    handle: JoinHandle<()>,
    state: watch::Receiver<WorkerState>,
}

enum Lifecycle<W> {
    Idle(Vec<W>),
    Running(Vec<RunningWorker>),
    Stopped(Vec<watch::Receiver<WorkerState>>),
}

/// A pool of `W` workers consuming one queue.
pub struct QueueExecutor<W: QueueWorker> {
    queue: TaskQueue<Task<W::Workload, W::Output>>,
    lifecycle: Mutex<Lifecycle<W>>,
    phase: watch::Sender<PoolPhase>,
    cancel: CancellationToken,
    options: ExecutorOptions,
}

impl<W: QueueWorker> QueueExecutor<W> {
    pub fn new(workers: Vec<W>, options: ExecutorOptions) -> Self {
        let (phase, _) = watch::channel(PoolPhase::Idle);
        Self {
            queue: TaskQueue::new(),
            lifecycle: Mutex::new(Lifecycle::Idle(workers)),
            phase,
            cancel: CancellationToken::new(),
            options,
        }
    }

    pub fn phase(&self) -> PoolPhase {
        *self.phase.borrow()
    }

    /// Spawn every worker and wait until all of them are running.
    ///
    /// The first worker to fail aborts startup: workers still starting are
    /// cancelled, every spawned worker is shut down and the pool ends up
    /// stopped.
    pub async fn start(&self) -> Result<(), ExecutorError> {
        let mut lifecycle = self.lifecycle.lock().await;
        let workers = match &mut *lifecycle {
            Lifecycle::Idle(workers) => std::mem::take(workers),
            _ => return Err(ExecutorError::AlreadyStarted),
        };
        self.phase.send_replace(PoolPhase::Starting);
        tracing::info!(workers = workers.len(), "Starting worker pool");

        let mut running = Vec::with_capacity(workers.len());
        let mut startups = Vec::with_capacity(workers.len());

        for (index, worker) in workers.into_iter().enumerate() {
            if index > 0 && !self.options.startup_stagger.is_zero() {
                tokio::time::sleep(self.options.startup_stagger).await;
            }
            let (started_tx, started_rx) = oneshot::channel();
            let (state_tx, state_rx) = watch::channel(WorkerState::NotStarted);
            let ctx = WorkerContext {
                index,
                queue: self.queue.receiver(),
                poll_interval: self.options.poll_interval,
                cancel: self.cancel.child_token(),
                state: state_tx,
                started: started_tx,
            };
            running.push(RunningWorker {
                index,
                handle: tokio::spawn(run_worker(worker, ctx)),
                state: state_rx,
            });
            startups.push(started_rx);
        }

        let mut pending: FuturesUnordered<_> = startups
            .into_iter()
            .enumerate()
            .map(|(index, started)| async move { (index, started.await) })
            .collect();

        while let Some((index, outcome)) = pending.next().await {
            let failure = match outcome {
                Ok(Ok(())) => continue,
                Ok(Err(source)) => ExecutorError::StartupFailure {
                    worker: index,
                    source,
                },
                Err(_) => ExecutorError::WorkerLost { worker: index },
            };

            tracing::error!(error = %failure, "Worker pool startup failed, stopping started workers");
            self.cancel.cancel();
            let states = join_workers(running).await;
            self.queue.close().await;
            *lifecycle = Lifecycle::Stopped(states);
            self.phase.send_replace(PoolPhase::Stopped);
            return Err(failure);
        }

        *lifecycle = Lifecycle::Running(running);
        self.phase.send_replace(PoolPhase::Running);
        tracing::info!("Worker pool running");
        Ok(())
    }

    /// Queue `payload`; its result is sent to `destination`.
    pub fn execute(
        &self,
        payload: W::Workload,
        destination: mpsc::UnboundedSender<W::Output>,
    ) -> Result<(), ExecutorError> {
        match self.phase() {
            PoolPhase::Running => {}
            PoolPhase::Stopped => return Err(ExecutorError::Stopped),
            PoolPhase::Idle | PoolPhase::Starting => return Err(ExecutorError::NotStarted),
        }
        self.queue
            .submit(Task {
                payload,
                destination,
            })
            .map_err(|_| ExecutorError::Stopped)
    }

    /// Stop every worker and wait for all of them.
    ///
    /// In-flight tasks finish and deliver their result. Tasks still queued
    /// are dropped, which closes their destinations. Safe to call more
    /// than once.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let mut lifecycle = self.lifecycle.lock().await;
        let states = match std::mem::replace(&mut *lifecycle, Lifecycle::Stopped(Vec::new())) {
            Lifecycle::Running(workers) => {
                tracing::info!(workers = workers.len(), "Shutting down worker pool");
                join_workers(workers).await
            }
            Lifecycle::Idle(_) => Vec::new(),
            stopped @ Lifecycle::Stopped(_) => {
                *lifecycle = stopped;
                return;
            }
        };

        let discarded = self.queue.close().await;
        if discarded > 0 {
            tracing::warn!(discarded, "Dropped queued tasks at shutdown");
        }
        *lifecycle = Lifecycle::Stopped(states);
        self.phase.send_replace(PoolPhase::Stopped);
        tracing::info!("Worker pool shut down");
    }

    /// Current state of every worker, in spawn order.
    pub async fn worker_states(&self) -> Vec<WorkerState> {
        match &*self.lifecycle.lock().await {
            Lifecycle::Idle(workers) => vec![WorkerState::NotStarted; workers.len()],
            Lifecycle::Running(workers) => workers.iter().map(|w| *w.state.borrow()).collect(),
            Lifecycle::Stopped(states) => states.iter().map(|s| *s.borrow()).collect(),
        }
    }
}

/// Await every worker task, logging panics. Returns their state handles.
async fn join_workers(workers: Vec<RunningWorker>) -> Vec<watch::Receiver<WorkerState>> {
    let (handles, states): (Vec<_>, Vec<_>) = workers
        .into_iter()
        .map(|w| ((w.index, w.handle), w.state))
        .unzip();

    let results = join_all(handles.into_iter().map(|(index, handle)| async move {
        (index, handle.await)
    }))
    .await;

    for (index, result) in results {
        if let Err(e) = result {
            tracing::error!(worker = index, error = %e, "Worker task ended abnormally");
        }
    }
    states
}
