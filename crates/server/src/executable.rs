//! Render server executable resolution.
//!
//! Built renderers are unpacked side by side under one binaries directory,
//! one package per platform and version:
//! `<dir>/StandaloneRenderer-<os>-<arch>-<version>/run.sh`.

use std::path::{Path, PathBuf};

/// Environment variable: directory holding built renderer packages.
pub const ENV_BINARIES_DIR: &str = "RENDERFARM_BINARIES_DIR";

/// Environment variable: force a renderer version regardless of config.
pub const ENV_VERSION_OVERRIDE: &str = "RENDERFARM_VERSION_OVERRIDE";

/// Errors from executable resolution.
#[derive(Debug, thiserror::Error)]
pub enum ExecutableError {
    #[error("Cannot resolve renderer binary, no version configured")]
    NoVersion,

    #[error("Point {ENV_BINARIES_DIR} to the directory with built renderers")]
    NoBinariesDir,

    #[error("Missing run.sh in package {package} ({dir})")]
    Missing { package: String, dir: PathBuf },
}

/// Package directory name for the current platform.
pub fn package_name(version: &str) -> String {
    format!(
        "StandaloneRenderer-{}-{}-{version}",
        platform_system(),
        std::env::consts::ARCH
    )
}

/// Resolve the renderer executable from the environment.
///
/// `RENDERFARM_VERSION_OVERRIDE` wins over `version`;
/// `RENDERFARM_BINARIES_DIR` must be set.
pub fn renderer_executable(version: Option<&str>) -> Result<PathBuf, ExecutableError> {
    let override_version = std::env::var(ENV_VERSION_OVERRIDE).ok();
    if let Some(v) = &override_version {
        tracing::warn!(version = %v, "Overriding renderer version");
    }
    let version = override_version
        .as_deref()
        .or(version)
        .ok_or(ExecutableError::NoVersion)?;

    let dir = std::env::var_os(ENV_BINARIES_DIR).ok_or(ExecutableError::NoBinariesDir)?;
    renderer_executable_in(Path::new(&dir), version)
}

/// Resolve the executable for `version` inside `dir`.
pub fn renderer_executable_in(dir: &Path, version: &str) -> Result<PathBuf, ExecutableError> {
    let package = package_name(version);
    let executable = dir.join(&package).join("run.sh");
    if !executable.exists() {
        return Err(ExecutableError::Missing {
            package,
            dir: dir.to_path_buf(),
        });
    }
    Ok(executable)
}

/// Platform name as the renderer packages spell it.
fn platform_system() -> &'static str {
    match std::env::consts::OS {
        "linux" => "Linux",
        "macos" => "Darwin",
        "windows" => "Windows",
        other => other,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
