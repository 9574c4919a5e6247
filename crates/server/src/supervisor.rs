//! Bring-up and tear-down of one slot's render server.
//!
//! [`launch`] spawns the server when the slot owns it, then runs the
//! connect-with-retry handshake. A detached deployment skips the spawn and
//! only connects, so everything downstream behaves the same either way.

use std::time::Duration;

use renderfarm_core::{DeploymentOptions, RemoteRendererConfig, ServerSlot};
use tokio_util::sync::CancellationToken;

use crate::connect::{connect_with_retry, ConnectError, Connector};
use crate::process::{server_command_line, ProcessError, ServerProcess};

/// Errors that abort a worker's startup.
#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error(transparent)]
    Process(#[from] ProcessError),

    #[error(transparent)]
    Connect(#[from] ConnectError),
}

/// A connected render server, plus the process when this slot owns it.
#[derive(Debug)]
pub struct ServerHandle<S> {
    slot: ServerSlot,
    process: Option<ServerProcess>,
    service: S,
}

impl<S> ServerHandle<S> {
    pub fn slot(&self) -> ServerSlot {
        self.slot
    }

    pub fn service(&self) -> &S {
        &self.service
    }

    /// Whether the server process was spawned (and will be stopped) by us.
    pub fn owns_process(&self) -> bool {
        self.process.is_some()
    }

    /// OS pid of the owned server, if any.
    pub fn process_id(&self) -> Option<u32> {
        self.process.as_ref().and_then(ServerProcess::id)
    }

    /// Drop the connection and stop the owned process, if any. A server
    /// started by someone else is left running.
    pub async fn shutdown(self, grace: Duration) -> Result<(), ProcessError> {
        let Self { slot, process, service } = self;
        drop(service);
        if let Some(process) = process {
            tracing::info!(device = slot.device, port = slot.port, "Stopping render server");
            process.terminate(grace).await?;
        }
        Ok(())
    }
}

/// Start (when owned) and connect to the server bound to `slot`.
///
/// If the handshake never succeeds the freshly spawned process is stopped
/// before the error is returned.
pub async fn launch<C: Connector>(
    connector: &C,
    slot: ServerSlot,
    config: &RemoteRendererConfig,
    deployment: &DeploymentOptions,
    host: &str,
    cancel: &CancellationToken,
) -> Result<ServerHandle<C::Service>, LaunchError> {
    let mut process = None;

    if config.spawn_servers {
        let spec = server_command_line(config, slot, host, &deployment.display)?;
        if deployment.detached {
            tracing::warn!(
                device = slot.device,
                port = slot.port,
                display = %format!(":{}.{}", deployment.display, slot.device),
                "Detached mode, start the render server manually: {}",
                spec.display_command(),
            );
        } else {
            process = Some(ServerProcess::spawn(&spec, slot.port)?);
        }
    }

    match connect_with_retry(connector, slot, &config.startup_retry, cancel).await {
        Ok(service) => Ok(ServerHandle {
            slot,
            process,
            service,
        }),
        Err(e) => {
            if let Some(process) = process {
                if let Err(stop_err) = process.terminate(config.shutdown_grace).await {
                    tracing::error!(
                        port = slot.port,
                        error = %stop_err,
                        "Failed to stop unreachable render server",
                    );
                }
            }
            Err(e.into())
        }
    }
}
