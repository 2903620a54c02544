//! Worker process management
//!
//! Spawns the embedding worker, hands its stdin/stdout to the line protocol,
//! forwards its stderr to ours and reaps it on shutdown.

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::process::Child;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::client::{EmbedError, EmbedResult};
use crate::protocol::LineChannel;

/// Everything needed to exec a worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

impl LaunchSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

/// A live worker subprocess
///
/// Its stdin and stdout belong to the `LineChannel` returned by `spawn`;
/// stderr is drained by a background task for the lifetime of the process.
pub struct WorkerProcess {
    id: Uuid,
    pid: Option<u32>,
    child: Child,
    stderr_task: Option<JoinHandle<()>>,
    exit_status: Option<ExitStatus>,
}

impl WorkerProcess {
    /// Spawn a worker and wire its pipes.
    pub fn spawn(spec: &LaunchSpec) -> EmbedResult<(Self, LineChannel)> {
        let id = Uuid::new_v4();
        info!(worker = %id, program = %spec.program.display(), "Spawning embedding worker");

        let mut command = tokio::process::Command::new(&spec.program);
        command
            .args(&spec.args)
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|e| EmbedError::LaunchError {
            message: format!("failed to start {}: {}", spec.program.display(), e),
        })?;

        let stdin = child.stdin.take().ok_or_else(|| EmbedError::LaunchError {
            message: "failed to capture worker stdin".to_string(),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| EmbedError::LaunchError {
            message: "failed to capture worker stdout".to_string(),
        })?;
        let stderr = child.stderr.take().ok_or_else(|| EmbedError::LaunchError {
            message: "failed to capture worker stderr".to_string(),
        })?;

        // Disjoint from the protocol streams, so no locking with the client
        let stderr_task = tokio::spawn(async move {
            let mut stderr = stderr;
            let mut sink = tokio::io::stderr();
            match tokio::io::copy(&mut stderr, &mut sink).await {
                Ok(bytes) => debug!(worker = %id, bytes, "Worker stderr closed"),
                Err(e) => warn!(worker = %id, "Stopped forwarding worker stderr: {}", e),
            }
        });

        let pid = child.id();
        debug!(worker = %id, pid = ?pid, "Embedding worker started");

        let process = Self {
            id,
            pid,
            child,
            stderr_task: Some(stderr_task),
            exit_status: None,
        };

        Ok((process, LineChannel::new(stdout, stdin)))
    }

    /// OS process id, `None` once the process has been reaped
    pub fn pid(&self) -> Option<u32> {
        if self.exit_status.is_some() {
            None
        } else {
            self.pid
        }
    }

    /// Check if the process is still running
    pub fn is_running(&mut self) -> bool {
        if self.exit_status.is_some() {
            return false;
        }
        match self.child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                self.exit_status = Some(status);
                false
            }
            Err(_) => false,
        }
    }

    /// Wait for the worker to exit, killing it if it outlives `grace`.
    ///
    /// The caller sends `exit` and closes stdin first. Calling this again
    /// after the process has been reaped is a no-op.
    pub async fn terminate(&mut self, grace: Duration) -> Option<ExitStatus> {
        if let Some(status) = self.exit_status {
            return Some(status);
        }

        let status = match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => Some(status),
            Ok(Err(e)) => {
                warn!(worker = %self.id, "Failed to wait for worker: {}", e);
                None
            }
            Err(_) => {
                warn!(worker = %self.id, "Worker did not exit within {:?}, killing", grace);
                if let Err(e) = self.child.kill().await {
                    warn!(worker = %self.id, "Failed to kill worker: {}", e);
                }
                self.child.wait().await.ok()
            }
        };

        if let Some(task) = self.stderr_task.take() {
            // stderr hits EOF once the process is gone; don't wait on grandchildren holding it
            if tokio::time::timeout(Duration::from_secs(1), task).await.is_err() {
                debug!(worker = %self.id, "Worker stderr still open after exit");
            }
        }

        if let Some(status) = status {
            info!(worker = %self.id, "Embedding worker exited with {}", status);
            self.exit_status = Some(status);
        }
        status
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::protocol::Command;

    fn sh(script: &str) -> LaunchSpec {
        LaunchSpec::new("sh").arg("-c").arg(script)
    }

    #[tokio::test]
    async fn test_spawn_and_exchange() {
        let spec = sh(r#"
            printf '{"status":"ready","model":"fake"}\n'
            read line
            printf '{"model":"fake","dimension":3,"ready":true}\n'
            read line
        "#);

        let (mut process, mut channel) = WorkerProcess::spawn(&spec).unwrap();
        assert!(process.pid().is_some());

        assert!(channel.recv().await.unwrap().is_ready_signal());
        channel.send(&Command::Info).await.unwrap();
        assert_eq!(channel.recv().await.unwrap().dimension, Some(3));

        channel.send(&Command::Exit).await.unwrap();
        channel.close().await;

        let status = process.terminate(Duration::from_secs(5)).await.unwrap();
        assert!(status.success());
        assert!(!process.is_running());
        assert!(process.pid().is_none());
    }

    #[tokio::test]
    async fn test_terminate_is_idempotent() {
        let (mut process, channel) = WorkerProcess::spawn(&sh("exit 3")).unwrap();
        channel.close().await;

        let first = process.terminate(Duration::from_secs(5)).await.unwrap();
        let second = process.terminate(Duration::from_secs(5)).await.unwrap();
        assert_eq!(first.code(), Some(3));
        assert_eq!(second.code(), Some(3));
    }

    #[tokio::test]
    async fn test_terminate_kills_stuck_worker() {
        let (mut process, _channel) = WorkerProcess::spawn(&sh("sleep 30")).unwrap();

        let status = process.terminate(Duration::from_millis(100)).await.unwrap();
        assert!(!status.success());
        assert!(!process.is_running());
    }

    #[tokio::test]
    async fn test_stderr_does_not_block_protocol() {
        // Fill well past a pipe buffer on stderr before answering on stdout
        let spec = sh(r#"
            i=0
            while [ $i -lt 2000 ]; do echo "warning line $i from the worker" >&2; i=$((i+1)); done
            printf '{"status":"ready","model":"noisy"}\n'
            read line
        "#);

        let (mut process, mut channel) = WorkerProcess::spawn(&spec).unwrap();
        let ready = tokio::time::timeout(Duration::from_secs(10), channel.recv())
            .await
            .expect("stderr backpressure stalled the worker")
            .unwrap();
        assert_eq!(ready.model.as_deref(), Some("noisy"));

        channel.close().await;
        process.terminate(Duration::from_secs(5)).await;
    }

    #[tokio::test]
    async fn test_missing_program_is_launch_error() {
        let spec = LaunchSpec::new("/nonexistent/worker-binary");
        match WorkerProcess::spawn(&spec) {
            Err(EmbedError::LaunchError { .. }) => {}
            Err(other) => panic!("unexpected error: {:?}", other),
            Ok(_) => panic!("spawn should fail"),
        }
    }
}
