//! Renderer pool configuration.
//!
//! [`RemoteRendererConfig`] describes what every render server in a pool
//! renders and how it is launched. [`DeploymentOptions`] carries the
//! environment-driven deployment overrides, resolved once at construction
//! time. [`RendererConfig`] is the hot-swappable scene configuration pushed
//! to running servers.

use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Renderer build this library was validated against.
pub const RENDERER_VERSION: &str = "20190514";

/// Environment variable: skip spawning servers, the operator starts them.
pub const ENV_DETACHED: &str = "RENDERFARM_DETACHED";

/// Environment variable: truncate the slot list to this many entries.
pub const ENV_MINIMAL: &str = "RENDERFARM_MINIMAL";

/// Environment variable: X display number used to build `DISPLAY`.
pub const ENV_DISPLAY: &str = "RENDERFARM_DISPLAY";

// ---------------------------------------------------------------------------
// Startup retry
// ---------------------------------------------------------------------------

/// Connect-with-retry policy used while a worker starts its server.
///
/// Attempt `n` (zero-based) that fails is followed by a sleep of
/// `base_delay + n * step`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StartupRetry {
    pub attempts: u32,
    pub base_delay: Duration,
    pub step: Duration,
}

impl StartupRetry {
    /// Delay to wait after the given failed attempt.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        self.base_delay + self.step * attempt
    }
}

impl Default for StartupRetry {
    fn default() -> Self {
        Self {
            attempts: 10,
            base_delay: Duration::from_secs(1),
            step: Duration::from_secs(1),
        }
    }
}

// ---------------------------------------------------------------------------
// RemoteRendererConfig
// ---------------------------------------------------------------------------

/// Static description of a renderer pool.
///
/// Shared read-only by every worker. The render flags and image size are
/// sent with every batch; the paths and server tuning are baked into each
/// spawned server's command line.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteRendererConfig {
    /// Cameras to render, in stream order.
    pub camera_names: Vec<String>,
    pub render_alpha: bool,
    pub render_depth: bool,
    pub render_normals: bool,
    pub render_segmentation: bool,
    pub image_width: u32,
    pub image_height: u32,

    /// When false, servers are expected to be running already.
    pub spawn_servers: bool,
    /// Explicit server executable. Resolved from `renderer_version` if unset.
    pub renderer_local_binary: Option<PathBuf>,
    pub renderer_version: Option<String>,
    pub renderer_config_path: Option<PathBuf>,
    pub model_xml_path: Option<PathBuf>,
    pub model_mapping_path: Option<PathBuf>,
    pub asset_basedir: PathBuf,

    // Tune these according to the request load placed upon each server.
    pub workers_count: u32,
    pub queues_count: u32,
    pub streams_count: u32,

    /// How long an idle worker waits on the queue before rechecking shutdown.
    pub poll_interval: Duration,
    /// Delay between consecutive worker spawns in `start`.
    pub startup_stagger: Duration,
    pub startup_retry: StartupRetry,
    /// Per-attempt timeout for the readiness handshake.
    pub connect_timeout: Duration,
    /// Time a server gets to exit after SIGTERM before it is killed.
    pub shutdown_grace: Duration,
}

impl Default for RemoteRendererConfig {
    fn default() -> Self {
        Self {
            camera_names: Vec::new(),
            render_alpha: false,
            render_depth: false,
            render_normals: false,
            render_segmentation: false,
            image_width: 100,
            image_height: 100,
            spawn_servers: true,
            renderer_local_binary: None,
            renderer_version: None,
            renderer_config_path: None,
            model_xml_path: None,
            model_mapping_path: None,
            asset_basedir: PathBuf::from("."),
            workers_count: 4,
            queues_count: 4,
            streams_count: 4,
            poll_interval: Duration::from_secs(2),
            startup_stagger: Duration::from_millis(500),
            startup_retry: StartupRetry::default(),
            connect_timeout: Duration::from_secs(10),
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

// ---------------------------------------------------------------------------
// DeploymentOptions
// ---------------------------------------------------------------------------

/// Deployment-time overrides.
///
/// These never change the worker state machine; they are consumed once
/// when a renderer is constructed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeploymentOptions {
    /// Servers are started by hand; workers only connect.
    pub detached: bool,
    /// Keep at most this many slots.
    pub minimal: Option<usize>,
    /// X display number; the worker's device id becomes the screen.
    pub display: String,
}

impl Default for DeploymentOptions {
    fn default() -> Self {
        Self {
            detached: false,
            minimal: None,
            display: "0".to_string(),
        }
    }
}

impl DeploymentOptions {
    /// Load overrides from the environment.
    ///
    /// | Env Var               | Default |
    /// |-----------------------|---------|
    /// | `RENDERFARM_DETACHED` | unset   |
    /// | `RENDERFARM_MINIMAL`  | unset   |
    /// | `RENDERFARM_DISPLAY`  | `0`     |
    pub fn from_env() -> Result<Self, CoreError> {
        let detached = std::env::var(ENV_DETACHED)
            .map(|v| !v.is_empty())
            .unwrap_or(false);

        let minimal = match std::env::var(ENV_MINIMAL) {
            Ok(v) if !v.is_empty() => Some(v.trim().parse::<usize>().map_err(|_| {
                CoreError::Config(format!("{ENV_MINIMAL} must be a positive integer, got {v:?}"))
            })?),
            _ => None,
        };

        let display = std::env::var(ENV_DISPLAY).unwrap_or_else(|_| "0".into());

        Ok(Self {
            detached,
            minimal,
            display,
        })
    }
}

// ---------------------------------------------------------------------------
// RendererConfig
// ---------------------------------------------------------------------------

/// Scene configuration pushed to servers with `Update`.
///
/// Components are opaque to this library and forwarded as-is.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RendererConfig {
    #[serde(default)]
    pub components: Vec<serde_json::Value>,
}

/// Resolve `path` against `base_dir` unless it is already absolute.
///
/// The result is normalized lexically: `.` segments are removed and `..`
/// consumes the segment before it. Symlinks are not followed.
pub fn resolve_path(base_dir: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        return normalize(path);
    }
    let base = if base_dir.is_absolute() {
        base_dir.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(base_dir))
            .unwrap_or_else(|_| base_dir.to_path_buf())
    };
    normalize(&base.join(path))
}

fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => match out.components().next_back() {
                Some(Component::Normal(_)) => {
                    out.pop();
                }
                // `..` at the root stays at the root.
                Some(Component::RootDir | Component::Prefix(_)) => {}
                _ => out.push(".."),
            },
            other => out.push(other),
        }
    }
    out
}

/// Read and parse the initial renderer config file.
pub fn load_renderer_config(base_dir: &Path, path: &Path) -> Result<RendererConfig, CoreError> {
    let resolved = resolve_path(base_dir, path);
    let text = std::fs::read_to_string(&resolved).map_err(|source| CoreError::Io {
        path: resolved.clone(),
        source,
    })?;
    tracing::info!(path = %resolved.display(), config = %text, "Renderer config loaded");
    serde_json::from_str(&text).map_err(|source| CoreError::Json {
        path: resolved,
        source,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
