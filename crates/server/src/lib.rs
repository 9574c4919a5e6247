//! Render server client and process supervision.
//!
//! Provides the HTTP render service client, the connect-with-retry
//! handshake, server process launch/termination, and renderer executable
//! resolution for one worker slot.

pub mod client;
pub mod connect;
pub mod executable;
pub mod process;
pub mod supervisor;

pub use client::{RenderClient, RenderClientError, RenderService};
pub use connect::{connect_with_retry, ConnectError, Connector, HttpConnector};
pub use supervisor::{launch, LaunchError, ServerHandle};
