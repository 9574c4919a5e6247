//! Connect-with-retry handshake for render servers.
//!
//! A freshly spawned server needs a while before it accepts requests, so
//! [`connect_with_retry`] keeps attempting the handshake with a linearly
//! growing delay until it succeeds, the attempts run out, or the
//! [`CancellationToken`] fires. A server that never becomes reachable will
//! not heal by itself, so exhaustion is final.

use std::time::Duration;

use async_trait::async_trait;
use renderfarm_core::{ServerSlot, StartupRetry};
use tokio_util::sync::CancellationToken;

use crate::client::{RenderClient, RenderClientError, RenderService};

/// Opens an RPC connection to the server bound to a slot.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Service: RenderService + 'static;

    /// Perform one connection attempt, including the readiness check.
    async fn connect(&self, slot: ServerSlot) -> Result<Self::Service, RenderClientError>;
}

/// [`Connector`] for the HTTP render service.
#[derive(Debug, Clone)]
pub struct HttpConnector {
    host: String,
    timeout: Duration,
}

impl HttpConnector {
    /// * `host`    - host every slot's server listens on.
    /// * `timeout` - per-attempt handshake timeout.
    pub fn new(host: impl Into<String>, timeout: Duration) -> Self {
        Self {
            host: host.into(),
            timeout,
        }
    }
}

#[async_trait]
impl Connector for HttpConnector {
    type Service = RenderClient;

    async fn connect(&self, slot: ServerSlot) -> Result<RenderClient, RenderClientError> {
        let client = RenderClient::new(&self.host, slot.port);
        client.health(self.timeout).await?;
        tracing::info!(
            device = slot.device,
            port = slot.port,
            "Connected to render server at {}",
            client.base_url(),
        );
        Ok(client)
    }
}

/// Errors from the startup handshake.
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    /// Every attempt failed.
    #[error("Could not connect to render server on port {port} after {attempts} attempts: {last}")]
    Exhausted {
        port: u16,
        attempts: u32,
        last: RenderClientError,
    },

    /// Shutdown was requested before a connection succeeded.
    #[error("Connection to port {port} cancelled")]
    Cancelled { port: u16 },
}

/// Connect to the server bound to `slot`, retrying per `retry`.
pub async fn connect_with_retry<C: Connector>(
    connector: &C,
    slot: ServerSlot,
    retry: &StartupRetry,
    cancel: &CancellationToken,
) -> Result<C::Service, ConnectError> {
    let mut last = RenderClientError::Connection("no connection attempt made".to_string());

    for attempt in 0..retry.attempts {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(ConnectError::Cancelled { port: slot.port });
            }
            result = connector.connect(slot) => {
                match result {
                    Ok(service) => return Ok(service),
                    Err(e) => {
                        tracing::warn!(
                            device = slot.device,
                            port = slot.port,
                            attempt = attempt + 1,
                            error = %e,
                            "Cannot reach render server, retrying. If this persists check \
                             /tmp/StandaloneRenderer.{}.log",
                            slot.port,
                        );
                        last = e;
                    }
                }
            }
        }

        if attempt + 1 == retry.attempts {
            break;
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ConnectError::Cancelled { port: slot.port }),
            _ = tokio::time::sleep(retry.delay_after(attempt)) => {}
        }
    }

    Err(ConnectError::Exhausted {
        port: slot.port,
        attempts: retry.attempts,
        last,
    })
}
