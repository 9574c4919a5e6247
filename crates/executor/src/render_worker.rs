//! Worker bound to one render server slot.
//!
//! On startup it launches (or attaches to) the server for its slot. Each
//! task carries the config snapshot that was current at submission; the
//! worker pushes a newer config to its server before rendering, then
//! decodes the response into the batch.

use std::sync::Arc;

use async_trait::async_trait;
use renderfarm_core::decode::convert_render_batch_response;
use renderfarm_core::protocol::UpdateRequest;
use renderfarm_core::{
    build_render_batch_request, Batch, DeploymentOptions, RemoteRendererConfig, ServerSlot,
};
use renderfarm_server::{launch, Connector, LaunchError, RenderService, ServerHandle};
use tokio_util::sync::CancellationToken;

use crate::error::RenderError;
use crate::renderer::ConfigSnapshot;
use crate::worker::QueueWorker;

/// A batch stamped with the renderer config it must be rendered under.
#[derive(Debug)]
pub struct StampedWorkload {
    pub config: Arc<ConfigSnapshot>,
    pub batch: Batch,
}

/// What a render task delivers to its destination.
pub type RenderOutput = Result<Batch, RenderError>;

/// Settings shared by every worker of one renderer.
pub(crate) struct WorkerShared<C> {
    pub connector: Arc<C>,
    pub config: Arc<RemoteRendererConfig>,
    pub deployment: Arc<DeploymentOptions>,
    pub host: Arc<str>,
}

impl<C> Clone for WorkerShared<C> {
    fn clone(&self) -> Self {
        Self {
            connector: Arc::clone(&self.connector),
            config: Arc::clone(&self.config),
            deployment: Arc::clone(&self.deployment),
            host: Arc::clone(&self.host),
        }
    }
}

pub struct RenderWorker<C: Connector> {
    slot: ServerSlot,
    shared: WorkerShared<C>,
    server: Option<ServerHandle<C::Service>>,
    /// Version of the last config pushed to the server. Version 0 is the
    /// config the server was launched with.
    applied_config_version: u64,
}

impl<C: Connector> RenderWorker<C> {
    pub(crate) fn new(slot: ServerSlot, shared: WorkerShared<C>) -> Self {
        Self {
            slot,
            shared,
            server: None,
            applied_config_version: 0,
        }
    }

    pub fn slot(&self) -> ServerSlot {
        self.slot
    }

    pub fn applied_config_version(&self) -> u64 {
        self.applied_config_version
    }

    async fn render(&mut self, workload: StampedWorkload) -> RenderOutput {
        let StampedWorkload { config, mut batch } = workload;
        let service = self
            .server
            .as_ref()
            .map(ServerHandle::service)
            .ok_or(RenderError::NotConnected {
                port: self.slot.port,
            })?;

        if config.version > self.applied_config_version {
            service.update(&UpdateRequest::from(&config.config)).await?;
            tracing::info!(
                port = self.slot.port,
                config_version = config.version,
                previous_version = self.applied_config_version,
                "Renderer config applied",
            );
            self.applied_config_version = config.version;
        }

        let request = build_render_batch_request(&batch, &self.shared.config);
        let response = service.render_batch(&request).await?;
        let streams = convert_render_batch_response(&response, &self.shared.config, batch.len())?;
        batch.merge_streams(streams);

        tracing::debug!(
            port = self.slot.port,
            batch_size = batch.len(),
            config_version = config.version,
            "Batch rendered",
        );
        Ok(batch)
    }
}

#[async_trait]
impl<C: Connector> QueueWorker for RenderWorker<C> {
    type Workload = StampedWorkload;
    type Output = RenderOutput;
    type StartError = LaunchError;

    async fn on_run(&mut self, cancel: &CancellationToken) -> Result<(), LaunchError> {
        let handle = launch(
            self.shared.connector.as_ref(),
            self.slot,
            &self.shared.config,
            &self.shared.deployment,
            &self.shared.host,
            cancel,
        )
        .await?;
        self.server = Some(handle);
        Ok(())
    }

    async fn process(&mut self, workload: StampedWorkload) -> RenderOutput {
        let port = self.slot.port;
        let result = self.render(workload).await;
        if let Err(e) = &result {
            tracing::error!(port, error = %e, "Render batch failed");
        }
        result
    }

    async fn on_shutdown(&mut self) {
        if let Some(server) = self.server.take() {
            if let Err(e) = server.shutdown(self.shared.config.shutdown_grace).await {
                tracing::error!(
                    device = self.slot.device,
                    port = self.slot.port,
                    error = %e,
                    "Failed to stop render server",
                );
            }
        }
    }
}
