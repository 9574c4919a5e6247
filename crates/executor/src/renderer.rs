//! Render dispatcher.
//!
//! [`Renderer`] is a [`QueueExecutor`] of [`RenderWorker`]s plus the
//! versioned renderer config. Every submitted batch is stamped with the
//! config snapshot current at submission time, so a config update is
//! visible to all batches submitted after it and to none before it.
//!
//! The snapshot lives in a [`watch`] channel holding an `Arc`: an update
//! swaps in a new immutable snapshot with the next version in one step,
//! and readers just clone the `Arc`.

use std::sync::Arc;

use renderfarm_core::config::{load_renderer_config, RENDERER_VERSION};
use renderfarm_core::slots::resolve_slots;
use renderfarm_core::{Batch, DeploymentOptions, RemoteRendererConfig, RendererConfig, ServerSlot};
use renderfarm_server::executable::renderer_executable;
use renderfarm_server::process::server_bind_host;
use renderfarm_server::{Connector, HttpConnector};
use tokio::sync::{mpsc, watch};

use crate::error::ExecutorError;
use crate::pool::{ExecutorOptions, QueueExecutor};
use crate::render_worker::{RenderOutput, RenderWorker, StampedWorkload, WorkerShared};

/// An immutable renderer config together with its version.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigSnapshot {
    pub version: u64,
    pub config: RendererConfig,
}

/// A pool of render servers behind one submission API.
pub struct Renderer<C: Connector> {
    name: String,
    slots: Vec<ServerSlot>,
    config: Arc<RemoteRendererConfig>,
    snapshot: watch::Sender<Arc<ConfigSnapshot>>,
    executor: QueueExecutor<RenderWorker<C>>,
}

impl Renderer<HttpConnector> {
    /// Renderer talking HTTP to servers on this machine.
    pub fn http(
        name: impl Into<String>,
        slots: Vec<ServerSlot>,
        config: RemoteRendererConfig,
        deployment: DeploymentOptions,
    ) -> Result<Self, ExecutorError> {
        let connector = HttpConnector::new(server_bind_host(), config.connect_timeout);
        Self::new(name, slots, config, deployment, connector)
    }
}

impl<C: Connector> Renderer<C> {
    /// Build a renderer with one worker per slot. Nothing is started yet.
    ///
    /// Applies the `minimal` override to `slots`, loads the initial
    /// renderer config (relative to `asset_basedir`) and resolves the
    /// server executable when servers are spawned but none is configured.
    pub fn new(
        name: impl Into<String>,
        slots: Vec<ServerSlot>,
        mut config: RemoteRendererConfig,
        deployment: DeploymentOptions,
        connector: C,
    ) -> Result<Self, ExecutorError> {
        let name = name.into();
        let slots = resolve_slots(slots, deployment.minimal)?;

        let initial = match &config.renderer_config_path {
            Some(path) => load_renderer_config(&config.asset_basedir, path)?,
            None => RendererConfig::default(),
        };

        if config.spawn_servers && config.renderer_local_binary.is_none() {
            let version = config.renderer_version.as_deref().unwrap_or(RENDERER_VERSION);
            config.renderer_local_binary = Some(renderer_executable(Some(version))?);
        }

        tracing::info!(
            renderer = %name,
            slots = slots.len(),
            detached = deployment.detached,
            spawn_servers = config.spawn_servers,
            "Renderer configured",
        );

        let options = ExecutorOptions {
            poll_interval: config.poll_interval,
            startup_stagger: config.startup_stagger,
        };
        let config = Arc::new(config);
        let shared = WorkerShared {
            connector: Arc::new(connector),
            config: Arc::clone(&config),
            deployment: Arc::new(deployment),
            host: Arc::from(server_bind_host()),
        };
        let workers: Vec<RenderWorker<C>> = slots
            .iter()
            .map(|&slot| RenderWorker::new(slot, shared.clone()))
            .collect();

        let (snapshot, _) = watch::channel(Arc::new(ConfigSnapshot {
            version: 0,
            config: initial,
        }));

        Ok(Self {
            name,
            slots,
            config,
            snapshot,
            executor: QueueExecutor::new(workers, options),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Slots in use after deployment overrides.
    pub fn slots(&self) -> &[ServerSlot] {
        &self.slots
    }

    pub fn config(&self) -> &RemoteRendererConfig {
        &self.config
    }

    /// Bring up every server and connect to it.
    pub async fn start(&self) -> Result<(), ExecutorError> {
        self.executor.start().await
    }

    /// The config snapshot new batches are stamped with.
    pub fn renderer_config(&self) -> Arc<ConfigSnapshot> {
        self.snapshot.borrow().clone()
    }

    /// Publish a new renderer config and return its version.
    ///
    /// Workers push it to their server before the first batch stamped with
    /// it; batches already queued keep the config they were stamped with.
    pub fn update_config(&self, config: RendererConfig) -> u64 {
        let mut version = 0;
        self.snapshot.send_modify(|current| {
            version = current.version + 1;
            *current = Arc::new(ConfigSnapshot { version, config });
        });
        tracing::info!(renderer = %self.name, config_version = version, "Renderer config updated");
        version
    }

    /// Queue `batch`; the rendered batch or its error is sent to
    /// `destination`.
    pub fn render_batch_async(
        &self,
        batch: Batch,
        destination: mpsc::UnboundedSender<RenderOutput>,
    ) -> Result<(), ExecutorError> {
        let workload = StampedWorkload {
            config: self.renderer_config(),
            batch,
        };
        self.executor.execute(workload, destination)
    }

    /// Render `batch` and wait for the result.
    pub async fn render_batch(&self, batch: Batch) -> Result<Batch, ExecutorError> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        self.render_batch_async(batch, tx)?;
        match rx.recv().await {
            Some(result) => Ok(result?),
            None => Err(ExecutorError::ResultChannelClosed),
        }
    }

    /// Stop every worker and its server. Queued batches are dropped.
    pub async fn shutdown(&self) {
        tracing::info!(renderer = %self.name, "Shutting down renderer");
        self.executor.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use assert_matches::assert_matches;
    use renderfarm_server::executable::ExecutableError;

    use super::*;

    fn external_servers() -> RemoteRendererConfig {
        RemoteRendererConfig {
            spawn_servers: false,
            ..Default::default()
        }
    }

    fn slots(n: u16) -> Vec<ServerSlot> {
        (0..n).map(|i| ServerSlot::new(0, 7000 + i)).collect()
    }

    #[test]
    fn minimal_override_truncates_slots() {
        let deployment = DeploymentOptions {
            minimal: Some(1),
            ..Default::default()
        };
        let renderer = Renderer::http("test", slots(4), external_servers(), deployment)
            .expect("renderer");
        assert_eq!(renderer.name(), "test");
        assert_eq!(renderer.slots(), &[ServerSlot::new(0, 7000)]);
        assert!(!renderer.config().spawn_servers);
    }

    #[test]
    fn configured_binary_skips_executable_lookup() {
        let config = RemoteRendererConfig {
            renderer_local_binary: Some("/opt/renderer/run.sh".into()),
            ..Default::default()
        };
        let renderer =
            Renderer::http("test", slots(1), config, DeploymentOptions::default()).expect("renderer");
        assert_eq!(
            renderer.config().renderer_local_binary.as_deref(),
            Some(std::path::Path::new("/opt/renderer/run.sh"))
        );
    }

    #[test]
    fn empty_slot_list_is_rejected() {
        let result = Renderer::http(
            "test",
            Vec::new(),
            external_servers(),
            DeploymentOptions::default(),
        );
        assert_matches!(result.err(), Some(ExecutorError::Config(_)));
    }

    #[test]
    fn initial_config_is_version_zero() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut file = std::fs::File::create(dir.path().join("scene.json")).expect("create");
        write!(file, r#"{{"components": [{{"type": "lighting"}}]}}"#).expect("write");

        let config = RemoteRendererConfig {
            asset_basedir: dir.path().to_path_buf(),
            renderer_config_path: Some("scene.json".into()),
            ..external_servers()
        };
        let renderer =
            Renderer::http("test", slots(1), config, DeploymentOptions::default()).expect("renderer");

        let snapshot = renderer.renderer_config();
        assert_eq!(snapshot.version, 0);
        assert_eq!(snapshot.config.components.len(), 1);
    }

    #[test]
    fn updates_get_increasing_versions() {
        let renderer = Renderer::http("test", slots(1), external_servers(), DeploymentOptions::default())
            .expect("renderer");
        let first = renderer.update_config(RendererConfig::default());
        let second = renderer.update_config(RendererConfig {
            components: vec![serde_json::json!({"type": "fog"})],
        });

        assert_eq!((first, second), (1, 2));
        let snapshot = renderer.renderer_config();
        assert_eq!(snapshot.version, 2);
        assert_eq!(snapshot.config.components.len(), 1);
    }

    #[test]
    fn missing_executable_is_reported() {
        use renderfarm_server::executable::ENV_BINARIES_DIR;

        let dir = tempfile::tempdir().expect("tempdir");
        let previous = std::env::var_os(ENV_BINARIES_DIR);
        std::env::set_var(ENV_BINARIES_DIR, dir.path());
        let result = Renderer::http(
            "test",
            slots(1),
            RemoteRendererConfig::default(),
            DeploymentOptions::default(),
        );
        match previous {
            Some(value) => std::env::set_var(ENV_BINARIES_DIR, value),
            None => std::env::remove_var(ENV_BINARIES_DIR),
        }

        assert_matches!(
            result.err(),
            Some(ExecutorError::Executable(ExecutableError::Missing { .. }))
        );
    }

    #[tokio::test]
    async fn render_before_start_is_rejected() {
        let renderer = Renderer::http("test", slots(1), external_servers(), DeploymentOptions::default())
            .expect("renderer");
        let batch = Batch::with_batch_seed(vec![vec![0.0]], 0).expect("batch");
        assert_matches!(
            renderer.render_batch(batch).await,
            Err(ExecutorError::NotStarted)
        );
    }
}
