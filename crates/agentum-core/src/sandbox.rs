//! Process-level isolation for the agent child.
//!
//! The launcher turns a plain agent command vector into a bubblewrap command
//! line: fresh PID/IPC/UTS namespaces, a cleared and re-enumerated
//! environment, the session directory bound read-write at `/session`,
//! read-only system and skills mounts, and a bounded tmpfs `/tmp`.
//!
//! Fail-closed: when sandboxing is enabled and the isolation binary cannot be
//! found, the run fails — there is no silent fallback to direct execution.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Fixed in-sandbox mount point for the session directory.
pub const SESSION_MOUNT: &str = "/session";
/// Fixed in-sandbox mount point for the shared skills tree.
pub const SKILLS_MOUNT: &str = "/skills";
/// Agent working directory inside the sandbox.
pub const WORKSPACE_MOUNT: &str = "/session/workspace";

#[derive(Error, Debug)]
pub enum SandboxError {
    #[error("sandbox required but isolation binary '{0}' not found")]
    Unavailable(String),
}

/// A single bind mount.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mount {
    pub source: String,
    pub target: String,
    #[serde(default = "default_mount_mode")]
    pub mode: MountMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MountMode {
    Ro,
    Rw,
}

fn default_mount_mode() -> MountMode {
    MountMode::Ro
}

/// Environment the agent sees inside the sandbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxEnvironment {
    #[serde(default = "default_true")]
    pub clear_env: bool,
    #[serde(default = "default_home")]
    pub home: String,
    #[serde(default = "default_path")]
    pub path: String,
}

fn default_true() -> bool {
    true
}

fn default_home() -> String {
    WORKSPACE_MOUNT.to_string()
}

fn default_path() -> String {
    "/usr/bin:/bin".to_string()
}

impl Default for SandboxEnvironment {
    fn default() -> Self {
        Self {
            clear_env: true,
            home: default_home(),
            path: default_path(),
        }
    }
}

/// Security configuration document (`security.yaml`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_bwrap_path")]
    pub bwrap_path: String,
    #[serde(default = "default_true")]
    pub unshare_pid: bool,
    #[serde(default = "default_true")]
    pub unshare_ipc: bool,
    #[serde(default = "default_true")]
    pub unshare_uts: bool,
    /// Size of the `/tmp` tmpfs in bytes.
    #[serde(default = "default_tmpfs_size")]
    pub tmpfs_size: u64,
    #[serde(default = "default_system_mounts")]
    pub system_mounts: Vec<Mount>,
    #[serde(default)]
    pub environment: SandboxEnvironment,
}

fn default_bwrap_path() -> String {
    "bwrap".to_string()
}

fn default_tmpfs_size() -> u64 {
    100 * 1024 * 1024
}

fn default_system_mounts() -> Vec<Mount> {
    ["/usr", "/lib", "/bin"]
        .into_iter()
        .map(|p| Mount {
            source: p.to_string(),
            target: p.to_string(),
            mode: MountMode::Ro,
        })
        .collect()
}

impl SecurityConfig {
    /// Load `security.yaml`; a missing file yields the (sandboxed) defaults.
    pub fn load(path: &Path) -> Result<Self, std::io::Error> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::info!("no security config at {}, using defaults", path.display());
                return Ok(Self::default());
            }
            Err(e) => return Err(e),
        };
        serde_yaml::from_str(&text).map_err(std::io::Error::other)
    }
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bwrap_path: default_bwrap_path(),
            unshare_pid: true,
            unshare_ipc: true,
            unshare_uts: true,
            tmpfs_size: default_tmpfs_size(),
            system_mounts: default_system_mounts(),
            environment: SandboxEnvironment::default(),
        }
    }
}

/// Builds the isolation command line wrapping the agent process.
#[derive(Debug, Clone)]
pub struct SandboxLauncher {
    config: SecurityConfig,
    skills_dir: PathBuf,
}

impl SandboxLauncher {
    pub fn new(config: SecurityConfig, skills_dir: impl Into<PathBuf>) -> Self {
        Self {
            config,
            skills_dir: skills_dir.into(),
        }
    }

    pub fn config(&self) -> &SecurityConfig {
        &self.config
    }

    /// Wrap `agent_cmd` for execution against `session_dir`. `extra_env`
    /// entries are re-exported inside the cleared sandbox environment (the
    /// execution parameters travel to the child this way).
    ///
    /// With sandboxing disabled the command passes through unchanged (an
    /// explicit development opt-out; the caller applies `extra_env` itself).
    /// With it enabled, a missing isolation binary is a hard error.
    pub fn wrap(
        &self,
        session_dir: &Path,
        agent_cmd: &[String],
        extra_env: &[(String, String)],
    ) -> Result<Vec<String>, SandboxError> {
        if !self.config.enabled {
            log::warn!("sandbox disabled - agent runs without isolation");
            return Ok(agent_cmd.to_vec());
        }

        let bwrap = self.resolve_bwrap()?;

        let mut cmd: Vec<String> = vec![bwrap];
        if self.config.unshare_pid {
            cmd.push("--unshare-pid".to_string());
        }
        if self.config.unshare_ipc {
            cmd.push("--unshare-ipc".to_string());
        }
        if self.config.unshare_uts {
            cmd.push("--unshare-uts".to_string());
        }
        cmd.push("--die-with-parent".to_string());
        cmd.push("--new-session".to_string());

        // The session directory is the agent's entire writable world.
        cmd.push("--bind".to_string());
        cmd.push(session_dir.display().to_string());
        cmd.push(SESSION_MOUNT.to_string());

        for mount in &self.config.system_mounts {
            if !Path::new(&mount.source).exists() {
                continue;
            }
            let flag = match mount.mode {
                MountMode::Ro => "--ro-bind",
                MountMode::Rw => "--bind",
            };
            cmd.push(flag.to_string());
            cmd.push(mount.source.clone());
            cmd.push(mount.target.clone());
        }

        // /lib64 is a symlink on most distributions and easy to forget in the
        // configured mounts.
        if Path::new("/lib64").exists()
            && !self.config.system_mounts.iter().any(|m| m.source == "/lib64")
        {
            cmd.push("--ro-bind".to_string());
            cmd.push("/lib64".to_string());
            cmd.push("/lib64".to_string());
        }

        if self.skills_dir.exists() {
            cmd.push("--ro-bind".to_string());
            cmd.push(self.skills_dir.display().to_string());
            cmd.push(SKILLS_MOUNT.to_string());
        }

        cmd.push("--proc".to_string());
        cmd.push("/proc".to_string());
        cmd.push("--dev".to_string());
        cmd.push("/dev".to_string());
        cmd.push("--tmpfs".to_string());
        cmd.push(format!("/tmp:size={}", self.config.tmpfs_size));

        if self.config.environment.clear_env {
            cmd.push("--clearenv".to_string());
        }
        for (key, value) in [
            ("HOME", self.config.environment.home.as_str()),
            ("PATH", self.config.environment.path.as_str()),
        ] {
            cmd.push("--setenv".to_string());
            cmd.push(key.to_string());
            cmd.push(value.to_string());
        }
        for (key, value) in extra_env {
            cmd.push("--setenv".to_string());
            cmd.push(key.clone());
            cmd.push(value.clone());
        }

        cmd.push("--chdir".to_string());
        cmd.push(WORKSPACE_MOUNT.to_string());

        cmd.push("--".to_string());
        cmd.extend(agent_cmd.iter().cloned());
        Ok(cmd)
    }

    /// Locate the isolation binary: absolute paths must exist, bare names are
    /// searched on PATH.
    fn resolve_bwrap(&self) -> Result<String, SandboxError> {
        let configured = Path::new(&self.config.bwrap_path);
        if configured.is_absolute() {
            if configured.is_file() {
                return Ok(self.config.bwrap_path.clone());
            }
            return Err(SandboxError::Unavailable(self.config.bwrap_path.clone()));
        }

        let path_var = std::env::var_os("PATH").unwrap_or_default();
        for dir in std::env::split_paths(&path_var) {
            let candidate = dir.join(configured);
            if candidate.is_file() {
                return Ok(candidate.display().to_string());
            }
        }
        Err(SandboxError::Unavailable(self.config.bwrap_path.clone()))
    }
}
