//! Embedding client session
//!
//! `EmbedClient` owns the worker and the protocol channel behind one mutex.
//! The worker handles one command at a time and answers in order, so the
//! lock is held for a complete send-then-receive exchange; releasing it
//! between the write and the read would let another caller consume the
//! response.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{Mutex, MutexGuard, RwLock};
use tracing::{debug, info, warn};

use crate::client::{EmbedError, EmbedResult, Embedding};
use crate::protocol::{Command, LineChannel, WorkerResponse};
use crate::worker::{Provisioner, WorkerProcess};

/// Timeouts and recovery policy for a client
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Bound on the readiness handshake and on `load`
    pub startup_timeout: Duration,
    /// Bound on `embed` and `info`
    pub request_timeout: Duration,
    /// How long the worker gets to exit before it is killed
    pub shutdown_grace: Duration,
    /// Respawn a failed worker on the next call
    pub auto_respawn: bool,
    pub max_respawns: u32,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            startup_timeout: Duration::from_secs(300),
            request_timeout: Duration::from_secs(60),
            shutdown_grace: Duration::from_secs(5),
            auto_respawn: false,
            max_respawns: 3,
        }
    }
}

/// Model the worker currently serves
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModelState {
    pub model: String,
    /// Unknown until a load, an info or the first embed reports it
    pub dimension: Option<usize>,
}

/// Result of an embed call together with the model that produced it
#[derive(Debug, Clone, PartialEq)]
pub struct Embedded {
    pub embeddings: Vec<Embedding>,
    pub model: String,
    pub dimension: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Lifecycle {
    Starting,
    Ready,
    Failed { reason: String },
    Closed,
}

/// Worker connection plus its process, guarded by the client mutex
struct Session {
    lifecycle: Lifecycle,
    channel: Option<LineChannel>,
    process: Option<WorkerProcess>,
    respawns: u32,
}

impl Session {
    fn new(channel: LineChannel, process: Option<WorkerProcess>) -> Self {
        Self {
            lifecycle: Lifecycle::Starting,
            channel: Some(channel),
            process,
            respawns: 0,
        }
    }

    /// Readiness handshake, then switch to `model` if the worker announced another.
    async fn start(&mut self, model: &str, options: &ClientOptions) -> EmbedResult<ModelState> {
        let channel = self.channel.as_mut().ok_or_else(|| EmbedError::InitError {
            message: "worker has no protocol channel".to_string(),
        })?;

        // The worker speaks first; nothing is sent before the ready line.
        let first_line = tokio::time::timeout(options.startup_timeout, channel.recv()).await;
        let ready = match first_line {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                return Err(self.fail_init(format!("failed to get ready signal: {}", e)));
            }
            Err(_) => {
                return Err(self.fail_init(format!(
                    "no ready signal within {:?}",
                    options.startup_timeout
                )));
            }
        };

        if let Some(message) = ready.error_message() {
            return Err(self.fail_init(format!("worker failed to start: {}", message)));
        }
        if !ready.is_ready_signal() {
            return Err(self.fail_init(format!(
                "unexpected status: {}",
                ready.status.as_deref().unwrap_or("<none>")
            )));
        }
        let announced = match ready.model {
            Some(model) if !model.is_empty() => model,
            _ => return Err(self.fail_init("ready signal did not name a model".to_string())),
        };

        info!("Embedding service ready (model: {})", announced);
        self.lifecycle = Lifecycle::Ready;

        let mut state = ModelState {
            model: announced,
            dimension: None,
        };

        if !model.is_empty() && model != state.model {
            let (loaded, dimension) = self
                .load(model, options.startup_timeout)
                .await
                .map_err(|e| EmbedError::InitError {
                    message: format!("failed to load model {}: {}", model, e),
                })?;
            state = ModelState {
                model: loaded,
                dimension: Some(dimension),
            };
        }

        Ok(state)
    }

    fn fail_init(&mut self, message: String) -> EmbedError {
        self.lifecycle = Lifecycle::Failed {
            reason: message.clone(),
        };
        EmbedError::InitError { message }
    }

    fn ensure_ready(&self) -> EmbedResult<()> {
        match &self.lifecycle {
            Lifecycle::Ready => Ok(()),
            Lifecycle::Starting => Err(EmbedError::SessionUnavailable {
                reason: "worker is still starting".to_string(),
            }),
            Lifecycle::Failed { reason } => Err(EmbedError::SessionUnavailable {
                reason: reason.clone(),
            }),
            Lifecycle::Closed => Err(EmbedError::SessionUnavailable {
                reason: "worker has been shut down".to_string(),
            }),
        }
    }

    /// One command, one response, under a deadline.
    ///
    /// Transport failures and timeouts leave the session `Failed`; a
    /// worker-reported error does not.
    async fn exchange(&mut self, command: &Command, timeout: Duration) -> EmbedResult<WorkerResponse> {
        self.ensure_ready()?;
        let channel = self.channel.as_mut().ok_or_else(|| EmbedError::SessionUnavailable {
            reason: "worker has no protocol channel".to_string(),
        })?;

        debug!(action = command.action(), "Sending command to worker");
        let outcome = tokio::time::timeout(timeout, async {
            channel.send(command).await?;
            channel.recv().await
        })
        .await;

        match outcome {
            Ok(Ok(response)) => response.into_result(),
            Ok(Err(e)) => {
                self.fail(&e);
                Err(e)
            }
            Err(_) => {
                let e = EmbedError::Timeout { timeout };
                self.fail(&e);
                Err(e)
            }
        }
    }

    async fn load(&mut self, model: &str, timeout: Duration) -> EmbedResult<(String, usize)> {
        let response = self
            .exchange(
                &Command::Load {
                    model: model.to_string(),
                },
                timeout,
            )
            .await?;
        let (loaded, dimension) = response.loaded_model()?;
        info!("Loaded model: {} (dimension: {})", loaded, dimension);
        Ok((loaded, dimension))
    }

    fn fail(&mut self, error: &EmbedError) {
        let running = self.process.as_mut().map(|process| process.is_running());
        warn!(worker_running = ?running, "Worker session failed: {}", error);
        self.lifecycle = Lifecycle::Failed {
            reason: error.to_string(),
        };
    }

    /// Send `exit` best-effort, close stdin and reap the process.
    async fn close(&mut self, grace: Duration) {
        if let Some(mut channel) = self.channel.take() {
            let goodbye = async {
                if let Err(e) = channel.send(&Command::Exit).await {
                    debug!("Could not send exit to worker: {}", e);
                }
                channel.close().await;
            };
            if tokio::time::timeout(grace, goodbye).await.is_err() {
                debug!("Timed out sending exit to worker");
            }
        }
        if let Some(mut process) = self.process.take() {
            process.terminate(grace).await;
        }
        self.lifecycle = Lifecycle::Closed;
    }
}

/// Client for a single embedding worker
///
/// Handlers share one client behind an `Arc`; every worker call is
/// serialized on the internal session lock. Call `shutdown` once when done;
/// a client dropped without it still kills its worker process.
pub struct EmbedClient {
    session: Mutex<Session>,
    state: RwLock<ModelState>,
    options: ClientOptions,
    provisioner: Option<Arc<dyn Provisioner>>,
}

impl EmbedClient {
    /// Spawn a worker, wait for its ready signal and make `model` active.
    ///
    /// Fails closed: on any error the worker is terminated and no client
    /// is returned.
    pub async fn initialize(
        provisioner: Arc<dyn Provisioner>,
        model: &str,
        options: ClientOptions,
    ) -> EmbedResult<Self> {
        info!("Starting embedding worker: {}", provisioner.describe());
        let (session, state) = Self::launch(provisioner.as_ref(), model, &options).await?;

        Ok(Self {
            session: Mutex::new(session),
            state: RwLock::new(state),
            options,
            provisioner: Some(provisioner),
        })
    }

    /// Run the handshake over an already connected stream pair.
    ///
    /// There is no process to manage and `respawn` is unavailable.
    pub async fn connect<R, W>(reader: R, writer: W, model: &str, options: ClientOptions) -> EmbedResult<Self>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let mut session = Session::new(LineChannel::new(reader, writer), None);
        let state = match session.start(model, &options).await {
            Ok(state) => state,
            Err(e) => {
                session.close(options.shutdown_grace).await;
                return Err(e);
            }
        };

        Ok(Self {
            session: Mutex::new(session),
            state: RwLock::new(state),
            options,
            provisioner: None,
        })
    }

    async fn launch(
        provisioner: &dyn Provisioner,
        model: &str,
        options: &ClientOptions,
    ) -> EmbedResult<(Session, ModelState)> {
        let spec = provisioner.provision().await?;
        let (process, channel) = WorkerProcess::spawn(&spec)?;
        let mut session = Session::new(channel, Some(process));

        match session.start(model, options).await {
            Ok(state) => Ok((session, state)),
            Err(e) => {
                session.close(options.shutdown_grace).await;
                Err(e)
            }
        }
    }

    /// Lock the session, respawning a failed worker first when allowed.
    async fn acquire(&self) -> EmbedResult<MutexGuard<'_, Session>> {
        let mut session = self.session.lock().await;

        if let Lifecycle::Failed { reason } = &session.lifecycle {
            if self.options.auto_respawn && self.provisioner.is_some() {
                if session.respawns >= self.options.max_respawns {
                    return Err(EmbedError::SessionUnavailable {
                        reason: format!("{} (respawn limit of {} reached)", reason, self.options.max_respawns),
                    });
                }
                warn!("Respawning embedding worker after failure: {}", reason);
                self.respawn_locked(&mut session).await?;
            }
        }

        Ok(session)
    }

    async fn respawn_locked(&self, session: &mut Session) -> EmbedResult<()> {
        let provisioner = self
            .provisioner
            .as_ref()
            .ok_or_else(|| EmbedError::SessionUnavailable {
                reason: "worker was not started by this client and cannot be respawned".to_string(),
            })?;

        session.close(self.options.shutdown_grace).await;
        let respawns = session.respawns + 1;
        let target = self.state.read().await.model.clone();

        match Self::launch(provisioner.as_ref(), &target, &self.options).await {
            Ok((fresh, state)) => {
                *session = fresh;
                session.respawns = respawns;
                *self.state.write().await = state;
                info!("Embedding worker respawned ({} so far)", respawns);
                Ok(())
            }
            Err(e) => {
                session.respawns = respawns;
                session.lifecycle = Lifecycle::Failed {
                    reason: format!("respawn failed: {}", e),
                };
                Err(e)
            }
        }
    }

    /// Replace the worker with a fresh one and restore the active model.
    pub async fn respawn(&self) -> EmbedResult<()> {
        let mut session = self.session.lock().await;
        if session.lifecycle == Lifecycle::Closed {
            return Err(EmbedError::SessionUnavailable {
                reason: "client has been shut down".to_string(),
            });
        }
        self.respawn_locked(&mut session).await
    }

    /// Switch the worker to another model.
    pub async fn load_model(&self, name: &str) -> EmbedResult<(String, usize)> {
        if name.trim().is_empty() {
            return Err(EmbedError::invalid_input("model name is empty"));
        }

        let mut session = self.acquire().await?;
        let (model, dimension) = session.load(name, self.options.startup_timeout).await?;
        *self.state.write().await = ModelState {
            model: model.clone(),
            dimension: Some(dimension),
        };
        Ok((model, dimension))
    }

    /// Embed `texts`; vector `i` belongs to `texts[i]`.
    pub async fn embed(&self, texts: &[String]) -> EmbedResult<Vec<Embedding>> {
        Ok(self.embed_with_model(texts).await?.embeddings)
    }

    /// Embed `texts` and report which model produced the vectors.
    pub async fn embed_with_model(&self, texts: &[String]) -> EmbedResult<Embedded> {
        if texts.is_empty() {
            return Err(EmbedError::invalid_input("no texts provided"));
        }

        let mut session = self.acquire().await?;
        let response = session
            .exchange(
                &Command::Embed {
                    texts: texts.to_vec(),
                },
                self.options.request_timeout,
            )
            .await?;
        let embeddings = response.into_embeddings(texts.len())?;
        let dimension = embeddings.first().map(Vec::len).unwrap_or(0);

        let mut state = self.state.write().await;
        match state.dimension {
            Some(expected) if expected != dimension => {
                return Err(EmbedError::protocol(format!(
                    "model {} should produce {}-dimensional vectors, got {}",
                    state.model, expected, dimension
                )));
            }
            Some(_) => {}
            None => state.dimension = Some(dimension),
        }
        drop(session);

        Ok(Embedded {
            embeddings,
            model: state.model.clone(),
            dimension,
        })
    }

    /// Ask the worker for its current model.
    pub async fn info(&self) -> EmbedResult<WorkerResponse> {
        let mut session = self.acquire().await?;
        let response = session.exchange(&Command::Info, self.options.request_timeout).await?;

        if let Some(model) = response.model.as_ref().filter(|model| !model.is_empty()) {
            let mut state = self.state.write().await;
            if state.model != *model {
                state.model = model.clone();
                state.dimension = None;
            }
            if let Some(dimension) = response.dimension {
                state.dimension = Some(dimension);
            }
        }

        Ok(response)
    }

    /// Last known model, without talking to the worker
    pub async fn model_state(&self) -> ModelState {
        self.state.read().await.clone()
    }

    pub async fn model(&self) -> String {
        self.state.read().await.model.clone()
    }

    pub async fn is_ready(&self) -> bool {
        self.session.lock().await.lifecycle == Lifecycle::Ready
    }

    /// OS process id of the worker, if one is running
    pub async fn worker_pid(&self) -> Option<u32> {
        self.session.lock().await.process.as_ref().and_then(WorkerProcess::pid)
    }

    /// Stop the worker and reap it. Later calls are no-ops.
    pub async fn shutdown(&self) {
        let mut session = self.session.lock().await;
        if session.lifecycle == Lifecycle::Closed {
            debug!("Embedding worker already shut down");
            return;
        }

        info!("Shutting down embedding worker");
        session.close(self.options.shutdown_grace).await;
    }
}
