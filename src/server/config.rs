//! Embedding bridge configuration
//!
//! Loaded from TOML; every section and field has a default so a partial
//! (or missing) file works. Command-line flags are applied on top.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::client::{ClientOptions, EmbedError, EmbedResult};
use crate::worker::provisioner::default_env_root;

pub const DEFAULT_MODEL: &str = "all-MiniLM-L6-v2";
pub const DEFAULT_PORT: u16 = 8420;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    pub network: NetworkConfig,
    pub worker: WorkerConfig,
    pub timeouts: TimeoutConfig,
    pub resilience: ResilienceConfig,
    pub monitoring: MonitoringConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub bind_host: String,
    pub port: u16,
    pub max_body_bytes: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Model made active at startup
    pub model: String,
    /// Directory holding worker environments (default `~/.embedding-bridge/envs`)
    pub env_root: Option<PathBuf>,
    pub env_name: String,
    pub python_version: String,
    /// Explicit worker argv; replaces the bundled Python worker
    pub command: Option<Vec<String>>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Readiness handshake and model loads
    pub startup_secs: u64,
    /// Embed and info calls
    pub request_secs: u64,
    pub shutdown_grace_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ResilienceConfig {
    pub auto_respawn: bool,
    pub max_respawns: u32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MonitoringConfig {
    pub log_level: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_host: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            max_body_bytes: 5 * 1024 * 1024,
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            env_root: None,
            env_name: "embedding-bridge".to_string(),
            python_version: "3.11".to_string(),
            command: None,
        }
    }
}

impl WorkerConfig {
    pub fn resolved_env_root(&self) -> PathBuf {
        self.env_root.clone().unwrap_or_else(default_env_root)
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            startup_secs: 300,
            request_secs: 60,
            shutdown_grace_secs: 5,
        }
    }
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            auto_respawn: false,
            max_respawns: 3,
        }
    }
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

impl ServerConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> EmbedResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| EmbedError::ConfigError {
            message: format!("cannot read {}: {}", path.display(), e),
        })?;
        Self::from_str(&content)
    }

    pub fn from_str(content: &str) -> EmbedResult<Self> {
        let config: ServerConfig = toml::from_str(content)?;
        Ok(config)
    }

    /// Read `path` if given, otherwise start from defaults.
    pub fn load(path: Option<&Path>) -> EmbedResult<Self> {
        match path {
            Some(path) => Self::from_file(path),
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> EmbedResult<()> {
        if self.worker.model.trim().is_empty() {
            return Err(config_error("worker.model must not be empty"));
        }
        if let Some(command) = &self.worker.command {
            if command.first().map_or(true, |program| program.is_empty()) {
                return Err(config_error("worker.command must name a program"));
            }
        }
        if self.network.port == 0 {
            return Err(config_error("network.port must not be 0"));
        }
        if self.timeouts.startup_secs == 0 || self.timeouts.request_secs == 0 {
            return Err(config_error("timeouts must be at least one second"));
        }
        Ok(())
    }

    pub fn bind_address(&self) -> String {
        let host = &self.network.bind_host;
        if host.contains(':') && !host.starts_with('[') {
            format!("[{}]:{}", host, self.network.port)
        } else {
            format!("{}:{}", host, self.network.port)
        }
    }

    pub fn client_options(&self) -> ClientOptions {
        ClientOptions {
            startup_timeout: Duration::from_secs(self.timeouts.startup_secs),
            request_timeout: Duration::from_secs(self.timeouts.request_secs),
            shutdown_grace: Duration::from_secs(self.timeouts.shutdown_grace_secs),
            auto_respawn: self.resilience.auto_respawn,
            max_respawns: self.resilience.max_respawns,
        }
    }
}

fn config_error(message: &str) -> EmbedError {
    EmbedError::ConfigError {
        message: message.to_string(),
    }
}
