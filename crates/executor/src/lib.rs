//! Worker pool and render dispatcher.
//!
//! [`QueueExecutor`] runs a fixed set of [`QueueWorker`]s over one shared
//! task queue. [`Renderer`] specializes it with one [`RenderWorker`] per
//! render server slot and hot-swappable renderer config.

pub mod error;
pub mod pool;
pub mod queue;
pub mod render_worker;
pub mod renderer;
pub mod worker;

pub use error::{ExecutorError, RenderError};
pub use pool::{ExecutorOptions, PoolPhase, QueueExecutor};
pub use render_worker::{RenderOutput, RenderWorker, StampedWorkload};
pub use renderer::{ConfigSnapshot, Renderer};
pub use worker::{QueueWorker, WorkerState};
