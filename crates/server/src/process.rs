//! Render server process supervision.
//!
//! [`server_command_line`] builds the launch parameters for the server
//! bound to one slot. [`ServerProcess`] owns the spawned child and knows
//! how to take it down: SIGTERM, a grace period, then SIGKILL and reap.

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use renderfarm_core::{RemoteRendererConfig, ServerSlot};
use tokio::process::{Child, Command};

/// Errors from spawning or stopping a server process.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    /// A setting required on the server command line is missing.
    #[error("Cannot launch render server: {0} is not set")]
    MissingSetting(&'static str),

    /// The executable could not be started.
    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Waiting on or signalling the child failed.
    #[error("Render server process error: {0}")]
    Io(#[from] std::io::Error),
}

/// Everything needed to start one render server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    /// Extra environment on top of the inherited one.
    pub env: Vec<(String, String)>,
    pub working_directory: Option<PathBuf>,
}

impl LaunchSpec {
    /// The command as an operator would type it.
    pub fn display_command(&self) -> String {
        std::iter::once(self.program.display().to_string())
            .chain(self.args.iter().cloned())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Host the render servers bind to and clients connect to.
///
/// The machine's hostname on Linux, `localhost` everywhere else.
#[cfg(target_os = "linux")]
pub fn server_bind_host() -> String {
    let mut buf = [0u8; 256];
    // Safety: `buf` is valid for writes of `buf.len()` bytes.
    let ret = unsafe { libc::gethostname(buf.as_mut_ptr().cast(), buf.len()) };
    if ret != 0 {
        return "localhost".to_string();
    }
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    match std::str::from_utf8(&buf[..end]) {
        Ok(name) if !name.is_empty() => name.to_string(),
        _ => "localhost".to_string(),
    }
}

#[cfg(not(target_os = "linux"))]
pub fn server_bind_host() -> String {
    "localhost".to_string()
}

/// Log file the server writes for the given port.
pub fn server_log_path(port: u16) -> PathBuf {
    PathBuf::from(format!("/tmp/StandaloneRenderer.{port}.log"))
}

/// Build the launch parameters for the server bound to `slot`.
///
/// The device id selects the X screen through `DISPLAY=:<display>.<device>`.
pub fn server_command_line(
    config: &RemoteRendererConfig,
    slot: ServerSlot,
    host: &str,
    display: &str,
) -> Result<LaunchSpec, ProcessError> {
    let program = config
        .renderer_local_binary
        .clone()
        .ok_or(ProcessError::MissingSetting("renderer_local_binary"))?;
    let model_xml = required(&config.model_xml_path, "model_xml_path")?;
    let model_mapping = required(&config.model_mapping_path, "model_mapping_path")?;
    let renderer_config = required(&config.renderer_config_path, "renderer_config_path")?;

    let args = vec![
        "-logFile".to_string(),
        server_log_path(slot.port).display().to_string(),
        format!("--render_server.host={host}"),
        format!("--render_server.port={}", slot.port),
        format!("--render_server.workers_count={}", config.workers_count),
        format!("--render_server.queues_count={}", config.queues_count),
        format!("--render_server.streams_count={}", config.streams_count),
        "--main.mode=Server".to_string(),
        format!("--main.model_xml_path={}", model_xml.display()),
        format!("--main.model_mapping_path={}", model_mapping.display()),
        format!("--main.renderer_config_path={}", renderer_config.display()),
        format!("--main.asset_basedir={}", config.asset_basedir.display()),
        format!("--main.parent_pid={}", std::process::id()),
    ];

    let env = vec![(
        "DISPLAY".to_string(),
        format!(":{display}.{}", slot.device),
    )];

    let working_directory = program
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf);

    Ok(LaunchSpec {
        program,
        args,
        env,
        working_directory,
    })
}

fn required<'a>(value: &'a Option<PathBuf>, name: &'static str) -> Result<&'a Path, ProcessError> {
    value
        .as_deref()
        .ok_or(ProcessError::MissingSetting(name))
}

/// A render server spawned and owned by one worker.
///
/// The child is killed if this handle is dropped without [`terminate`].
///
/// [`terminate`]: ServerProcess::terminate
#[derive(Debug)]
pub struct ServerProcess {
    child: Child,
    port: u16,
}

impl ServerProcess {
    /// Spawn the server. Its stdout and stderr are discarded; the server
    /// writes its own log file.
    pub fn spawn(spec: &LaunchSpec, port: u16) -> Result<Self, ProcessError> {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        for (key, value) in &spec.env {
            cmd.env(key, value);
        }
        if let Some(dir) = &spec.working_directory {
            cmd.current_dir(dir);
        }

        let child = cmd.spawn().map_err(|source| ProcessError::Spawn {
            program: spec.program.clone(),
            source,
        })?;

        tracing::info!(
            port,
            pid = child.id(),
            command = %spec.display_command(),
            "Render server started",
        );

        Ok(Self { child, port })
    }

    /// OS process id, `None` once the child has been reaped.
    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Stop the server: SIGTERM, wait up to `grace`, then SIGKILL. Always
    /// reaps the child before returning.
    pub async fn terminate(mut self, grace: Duration) -> Result<ExitStatus, ProcessError> {
        if let Some(status) = self.child.try_wait()? {
            tracing::warn!(port = self.port, %status, "Render server had already exited");
            return Ok(status);
        }

        self.send_sigterm();

        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(status) => {
                let status = status?;
                tracing::info!(port = self.port, %status, "Render server stopped");
                Ok(status)
            }
            Err(_elapsed) => {
                tracing::warn!(
                    port = self.port,
                    grace_ms = grace.as_millis() as u64,
                    "Render server ignored SIGTERM, killing",
                );
                // `kill` sends SIGKILL and waits for the exit.
                self.child.kill().await?;
                Ok(self.child.wait().await?)
            }
        }
    }

    #[cfg(unix)]
    fn send_sigterm(&self) {
        if let Some(pid) = self.child.id() {
            // Safety: plain syscall on a pid we own and have not reaped.
            let ret = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
            if ret != 0 {
                tracing::warn!(
                    port = self.port,
                    error = %std::io::Error::last_os_error(),
                    "Failed to send SIGTERM",
                );
            }
        }
    }

    #[cfg(not(unix))]
    fn send_sigterm(&self) {}
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
