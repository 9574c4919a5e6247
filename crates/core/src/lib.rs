//! Shared domain types for the renderfarm workspace.
//!
//! Holds the pool configuration, the render batch model, the render
//! service wire messages, and response decoding. Nothing here performs
//! I/O beyond reading the initial renderer config file.

pub mod batch;
pub mod config;
pub mod decode;
pub mod error;
pub mod protocol;
pub mod slots;

pub use batch::{build_render_batch_request, Batch, Seed, StreamArray};
pub use config::{DeploymentOptions, RemoteRendererConfig, RendererConfig, StartupRetry};
pub use error::CoreError;
pub use slots::ServerSlot;
