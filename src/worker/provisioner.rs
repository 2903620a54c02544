//! Runtime provisioning for the embedding worker
//!
//! A provisioner turns configuration into a `LaunchSpec` that can be exec'd.
//! Installing the worker's packages is outside this crate; the Python
//! provisioner only locates an interpreter and hands it the bundled script.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::client::{EmbedError, EmbedResult};
use crate::server::config::WorkerConfig;
use crate::worker::process::LaunchSpec;

/// Python source of the bundled sentence-transformers worker
pub const WORKER_SCRIPT: &str = include_str!("embed_worker.py");

/// Model the bundled worker preloads before announcing ready
pub const MODEL_ENV: &str = "EMBEDDING_BRIDGE_MODEL";

/// Produces a ready-to-exec worker
#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Resolve the command that starts a worker
    async fn provision(&self) -> EmbedResult<LaunchSpec>;

    /// Short description for logs
    fn describe(&self) -> String;
}

/// Runs the bundled script with a Python interpreter
#[derive(Debug, Clone)]
pub struct PythonProvisioner {
    env_root: PathBuf,
    env_name: String,
    python_version: String,
    model: Option<String>,
}

impl PythonProvisioner {
    pub fn new(env_root: impl Into<PathBuf>, env_name: impl Into<String>, python_version: impl Into<String>) -> Self {
        Self {
            env_root: env_root.into(),
            env_name: env_name.into(),
            python_version: python_version.into(),
            model: None,
        }
    }

    /// Have the worker preload `model` so startup needs no extra load
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into()).filter(|model| !model.is_empty());
        self
    }

    /// Interpreter inside the named environment
    pub fn env_interpreter(&self) -> PathBuf {
        let env_dir = self.env_root.join(&self.env_name);
        if cfg!(windows) {
            env_dir.join("python.exe")
        } else {
            env_dir.join("bin").join("python")
        }
    }

    fn find_interpreter(&self) -> EmbedResult<PathBuf> {
        let in_env = self.env_interpreter();
        if in_env.exists() {
            return Ok(in_env);
        }
        debug!("No interpreter at {}, searching PATH", in_env.display());

        let versioned = format!("python{}", self.python_version);
        for candidate in [versioned.as_str(), "python3", "python"] {
            if let Ok(path) = which::which(candidate) {
                return Ok(path);
            }
        }

        Err(EmbedError::LaunchError {
            message: format!(
                "no Python interpreter found (looked for {}, {} and python3/python on PATH)",
                in_env.display(),
                versioned
            ),
        })
    }
}

#[async_trait]
impl Provisioner for PythonProvisioner {
    async fn provision(&self) -> EmbedResult<LaunchSpec> {
        let interpreter = self.find_interpreter()?;
        let spec = LaunchSpec::new(interpreter)
            .arg("-u")
            .arg("-c")
            .arg(WORKER_SCRIPT)
            .env("PYTHONUNBUFFERED", "1")
            .env("TOKENIZERS_PARALLELISM", "false");
        Ok(match &self.model {
            Some(model) => spec.env(MODEL_ENV, model.as_str()),
            None => spec,
        })
    }

    fn describe(&self) -> String {
        format!(
            "python {} (env {})",
            self.python_version,
            self.env_root.join(&self.env_name).display()
        )
    }
}

/// Execs an explicit command line
#[derive(Debug, Clone)]
pub struct CommandProvisioner {
    argv: Vec<String>,
}

impl CommandProvisioner {
    pub fn new(argv: Vec<String>) -> EmbedResult<Self> {
        if argv.first().map_or(true, |program| program.is_empty()) {
            return Err(EmbedError::ConfigError {
                message: "worker command must name a program".to_string(),
            });
        }
        Ok(Self { argv })
    }
}

#[async_trait]
impl Provisioner for CommandProvisioner {
    async fn provision(&self) -> EmbedResult<LaunchSpec> {
        let mut parts = self.argv.iter();
        let program = parts.next().ok_or_else(|| EmbedError::LaunchError {
            message: "empty worker command".to_string(),
        })?;
        Ok(parts.fold(LaunchSpec::new(program), |spec, arg| spec.arg(arg.as_str())))
    }

    fn describe(&self) -> String {
        self.argv.join(" ")
    }
}

/// Pick the provisioner the worker configuration asks for
pub fn provisioner_from_config(config: &WorkerConfig) -> EmbedResult<Arc<dyn Provisioner>> {
    match &config.command {
        Some(argv) => Ok(Arc::new(CommandProvisioner::new(argv.clone())?)),
        None => Ok(Arc::new(
            PythonProvisioner::new(
                config.resolved_env_root(),
                config.env_name.clone(),
                config.python_version.clone(),
            )
            .with_model(config.model.clone()),
        )),
    }
}

/// Default location of worker environments: `~/.embedding-bridge/envs`
pub fn default_env_root() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| Path::new(".").to_path_buf())
        .join(".embedding-bridge")
        .join("envs")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_command_provisioner() {
        let provisioner =
            CommandProvisioner::new(vec!["/opt/worker".to_string(), "--fast".to_string()]).unwrap();
        let spec = provisioner.provision().await.unwrap();
        assert_eq!(spec.program, PathBuf::from("/opt/worker"));
        assert_eq!(spec.args, vec!["--fast"]);
        assert_eq!(provisioner.describe(), "/opt/worker --fast");
    }

    #[test]
    fn test_command_provisioner_rejects_empty() {
        assert!(CommandProvisioner::new(Vec::new()).is_err());
        assert!(CommandProvisioner::new(vec![String::new()]).is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_python_provisioner_prefers_env_interpreter() {
        let root = tempfile::tempdir().unwrap();
        let bin = root.path().join("bridge-env").join("bin");
        std::fs::create_dir_all(&bin).unwrap();
        std::fs::write(bin.join("python"), "#!/bin/sh\n").unwrap();

        let provisioner = PythonProvisioner::new(root.path(), "bridge-env", "3.11");
        let spec = provisioner.provision().await.unwrap();
        assert_eq!(spec.program, bin.join("python"));
        assert_eq!(spec.args[0], "-u");
        assert_eq!(spec.args[2], WORKER_SCRIPT);
        assert!(spec.env.iter().any(|(k, v)| k == "PYTHONUNBUFFERED" && v == "1"));
        assert!(spec.env.iter().all(|(k, _)| k != MODEL_ENV));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_configured_model_is_preloaded() {
        let root = tempfile::tempdir().unwrap();
        let bin = root.path().join("embedding-bridge").join("bin");
        std::fs::create_dir_all(&bin).unwrap();
        std::fs::write(bin.join("python"), "#!/bin/sh\n").unwrap();

        let config = WorkerConfig {
            model: "all-mpnet-base-v2".to_string(),
            env_root: Some(root.path().to_path_buf()),
            ..Default::default()
        };
        let spec = provisioner_from_config(&config).unwrap().provision().await.unwrap();

        assert_eq!(spec.program, bin.join("python"));
        assert!(spec
            .env
            .iter()
            .any(|(k, v)| k == MODEL_ENV && v == "all-mpnet-base-v2"));
    }

    #[test]
    fn test_worker_script_reads_model_env() {
        assert!(WORKER_SCRIPT.contains(MODEL_ENV));
    }

    #[test]
    fn test_worker_script_speaks_the_protocol() {
        assert!(WORKER_SCRIPT.contains("\"ready\""));
        for action in ["load", "embed", "info", "exit"] {
            assert!(WORKER_SCRIPT.contains(&format!("\"{}\"", action)), "missing {}", action);
        }
    }
}
