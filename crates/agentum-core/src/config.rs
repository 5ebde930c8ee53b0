//! Service configuration.
//!
//! Loaded from `api.yaml` under the config directory, with every field
//! defaulted so a missing file yields a working development setup. The
//! permission profile (`permissions.yaml`) and sandbox document
//! (`security.yaml`) live next to it and are loaded by their own modules.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: String,
        source: serde_yaml::Error,
    },
}

/// HTTP listener settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiSection {
    #[serde(default = "default_api_port")]
    pub external_port: u16,
    #[serde(default = "default_host")]
    pub host: String,
}

fn default_api_port() -> u16 {
    8080
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

impl Default for ApiSection {
    fn default() -> Self {
        Self {
            external_port: default_api_port(),
            host: default_host(),
        }
    }
}

/// Front-end settings the API only needs for CORS defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebSection {
    #[serde(default = "default_web_port")]
    pub external_port: u16,
}

fn default_web_port() -> u16 {
    3000
}

impl Default for WebSection {
    fn default() -> Self {
        Self {
            external_port: default_web_port(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseSection {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

fn default_db_path() -> PathBuf {
    PathBuf::from("data/agentum.db")
}

impl Default for DatabaseSection {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CorsSection {
    #[serde(default)]
    pub origins: Vec<String>,
}

/// Agent child process settings and runtime bounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSection {
    /// Command vector for the agent child; the sandbox launcher wraps it.
    #[serde(default = "default_agent_command")]
    pub command: Vec<String>,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_max_turns")]
    pub max_turns: u32,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    /// Grace window between SIGTERM and SIGKILL.
    #[serde(default = "default_grace_period_seconds")]
    pub grace_period_seconds: u64,
    /// Longest stdout line accepted from the child before truncation.
    #[serde(default = "default_max_line_length")]
    pub max_line_length: usize,
}

fn default_agent_command() -> Vec<String> {
    vec!["agentum-agent".to_string()]
}

fn default_model() -> String {
    "claude-sonnet-4-20250514".to_string()
}

fn default_max_turns() -> u32 {
    50
}

fn default_timeout_seconds() -> u64 {
    600
}

fn default_grace_period_seconds() -> u64 {
    5
}

fn default_max_line_length() -> usize {
    1024 * 1024
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            command: default_agent_command(),
            model: default_model(),
            max_turns: default_max_turns(),
            timeout_seconds: default_timeout_seconds(),
            grace_period_seconds: default_grace_period_seconds(),
            max_line_length: default_max_line_length(),
        }
    }
}

/// Streaming and concurrency bounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeSection {
    #[serde(default = "default_heartbeat")]
    pub heartbeat_interval_seconds: u64,
    /// Per-subscriber event queue capacity.
    #[serde(default = "default_subscriber_buffer")]
    pub subscriber_buffer: usize,
    #[serde(default = "default_max_concurrent_sessions")]
    pub max_concurrent_sessions: usize,
}

fn default_heartbeat() -> u64 {
    30
}

fn default_subscriber_buffer() -> usize {
    256
}

fn default_max_concurrent_sessions() -> usize {
    16
}

impl Default for RuntimeSection {
    fn default() -> Self {
        Self {
            heartbeat_interval_seconds: default_heartbeat(),
            subscriber_buffer: default_subscriber_buffer(),
            max_concurrent_sessions: default_max_concurrent_sessions(),
        }
    }
}

/// Filesystem roots.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsSection {
    #[serde(default = "default_sessions_root")]
    pub sessions_root: PathBuf,
    #[serde(default = "default_skills_dir")]
    pub skills_dir: PathBuf,
    #[serde(default = "default_config_dir")]
    pub config_dir: PathBuf,
}

fn default_sessions_root() -> PathBuf {
    PathBuf::from("data/sessions")
}

fn default_skills_dir() -> PathBuf {
    PathBuf::from("skills")
}

fn default_config_dir() -> PathBuf {
    PathBuf::from("config")
}

impl Default for PathsSection {
    fn default() -> Self {
        Self {
            sessions_root: default_sessions_root(),
            skills_dir: default_skills_dir(),
            config_dir: default_config_dir(),
        }
    }
}

/// Complete service configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub api: ApiSection,
    #[serde(default)]
    pub web: WebSection,
    #[serde(default)]
    pub database: DatabaseSection,
    #[serde(default)]
    pub cors: CorsSection,
    #[serde(default)]
    pub agent: AgentSection,
    #[serde(default)]
    pub runtime: RuntimeSection,
    #[serde(default)]
    pub paths: PathsSection,
}

impl AppConfig {
    /// Load from a YAML file; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::info!("no config at {}, using defaults", path.display());
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(ConfigError::Read {
                    path: path.display().to_string(),
                    source: e,
                })
            }
        };
        serde_yaml::from_str(&text).map_err(|e| ConfigError::Parse {
            path: path.display().to_string(),
            source: e,
        })
    }

    pub fn permissions_file(&self) -> PathBuf {
        self.paths.config_dir.join("permissions.yaml")
    }

    pub fn security_file(&self) -> PathBuf {
        self.paths.config_dir.join("security.yaml")
    }

    pub fn secrets_file(&self) -> PathBuf {
        self.paths.config_dir.join("secrets.yaml")
    }

    /// CORS origins, defaulting to the local web front-end.
    pub fn cors_origins(&self) -> Vec<String> {
        if self.cors.origins.is_empty() {
            vec![format!("http://localhost:{}", self.web.external_port)]
        } else {
            self.cors.origins.clone()
        }
    }
}
