//! Fake embedding workers for tests

use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::task::JoinHandle;

use crate::client::{ClientOptions, EmbedClient, EmbedResult, Embedding};
use crate::protocol::{decode_command, Command, WorkerResponse};

pub(crate) const MINILM: &str = "all-MiniLM-L6-v2";
pub(crate) const MPNET: &str = "all-mpnet-base-v2";

/// Shell worker for process-level tests; always model `fake`, dimension 3.
pub(crate) const SH_WORKER: &str = r#"
printf '{"status":"ready","model":"fake"}\n'
while IFS= read -r line; do
  case "$line" in
    *'"action":"exit"'*) printf '{"status":"exiting"}\n'; exit 0 ;;
    *'"action":"info"'*) printf '{"model":"fake","dimension":3,"ready":true}\n' ;;
    *'"action":"load"'*) printf '{"status":"ok","model":"fake","dimension":3}\n' ;;
    *'"action":"embed"'*) printf '{"embeddings":[[0.1,0.2,0.3]]}\n' ;;
    *) printf '{"error":"unsupported command"}\n' ;;
  esac
done
"#;

fn dimension_of(model: &str) -> Option<usize> {
    match model {
        MINILM => Some(384),
        MPNET => Some(768),
        _ => None,
    }
}

/// What the fake worker observed
#[derive(Debug, Default)]
pub(crate) struct FakeReport {
    pub actions: Vec<String>,
    /// Commands that arrived while a previous one was still unanswered
    pub overlaps: usize,
}

/// In-memory worker behind a `tokio::io::duplex` pipe
#[derive(Debug, Clone)]
pub(crate) struct FakeWorker {
    pub model: String,
    pub ready_status: String,
    /// Never send the ready line
    pub silent: bool,
    /// Action that is read but never answered
    pub hang_on: Option<&'static str>,
    /// Action on which the worker drops its pipes
    pub die_on: Option<&'static str>,
    /// Embed requests containing this text get an error reply
    pub reject_text: Option<&'static str>,
    pub reply_delay: Duration,
}

impl FakeWorker {
    pub fn new(model: &str) -> Self {
        Self {
            model: model.to_string(),
            ready_status: "ready".to_string(),
            silent: false,
            hang_on: None,
            die_on: None,
            reject_text: None,
            reply_delay: Duration::ZERO,
        }
    }

    /// Start the worker and run the client handshake against it.
    pub async fn connect(
        self,
        model: &str,
        options: ClientOptions,
    ) -> EmbedResult<(EmbedClient, JoinHandle<FakeReport>)> {
        let (client_end, worker_end) = tokio::io::duplex(64 * 1024);
        let worker = tokio::spawn(self.run(worker_end));
        let (reader, writer) = tokio::io::split(client_end);
        let client = EmbedClient::connect(reader, writer, model, options).await?;
        Ok((client, worker))
    }

    async fn run(mut self, stream: tokio::io::DuplexStream) -> FakeReport {
        let (read, mut write) = tokio::io::split(stream);
        let mut reader = BufReader::new(read);
        let mut report = FakeReport::default();

        if self.silent {
            std::future::pending::<()>().await;
        }
        let ready = WorkerResponse {
            status: Some(self.ready_status.clone()),
            model: Some(self.model.clone()),
            ..Default::default()
        };
        if send(&mut write, &ready).await.is_err() {
            return report;
        }

        loop {
            let mut line = String::new();
            match reader.read_line(&mut line).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
            let command = match decode_command(&line) {
                Ok(command) => command,
                Err(_) => break,
            };
            let action = command.action();
            report.actions.push(action.to_string());

            if !self.reply_delay.is_zero() {
                tokio::time::sleep(self.reply_delay).await;
            }
            if !reader.buffer().is_empty() {
                report.overlaps += 1;
            } else if let Ok(Ok(pending)) =
                tokio::time::timeout(Duration::from_millis(1), reader.fill_buf()).await
            {
                if !pending.is_empty() {
                    report.overlaps += 1;
                }
            }

            if self.die_on == Some(action) {
                return report;
            }
            if self.hang_on == Some(action) {
                std::future::pending::<()>().await;
            }

            let response = match command {
                Command::Exit => break,
                Command::Load { model } => match dimension_of(&model) {
                    Some(dimension) => {
                        self.model = model.clone();
                        WorkerResponse {
                            status: Some("ok".to_string()),
                            model: Some(model),
                            dimension: Some(dimension),
                            ..Default::default()
                        }
                    }
                    None => WorkerResponse {
                        error: Some(format!("unknown model: {}", model)),
                        ..Default::default()
                    },
                },
                Command::Embed { texts } if texts.iter().any(|text| Some(text.as_str()) == self.reject_text) => {
                    WorkerResponse {
                        error: Some("cannot embed this text".to_string()),
                        ..Default::default()
                    }
                }
                Command::Embed { texts } => {
                    let dimension = dimension_of(&self.model).unwrap_or(4);
                    WorkerResponse {
                        embeddings: Some(texts.iter().map(|text| vector_for(text, dimension)).collect()),
                        model: Some(self.model.clone()),
                        dimension: Some(dimension),
                        ..Default::default()
                    }
                }
                Command::Info => WorkerResponse {
                    model: Some(self.model.clone()),
                    dimension: dimension_of(&self.model),
                    ready: Some(true),
                    ..Default::default()
                },
            };

            if send(&mut write, &response).await.is_err() {
                break;
            }
        }

        report
    }
}

/// First component carries the text length so tests can check positions.
fn vector_for(text: &str, dimension: usize) -> Embedding {
    let mut vector = vec![0.5; dimension];
    vector[0] = text.len() as f32;
    vector
}

async fn send<W>(write: &mut W, response: &WorkerResponse) -> std::io::Result<()>
where
    W: tokio::io::AsyncWrite + Unpin,
{
    let mut line = serde_json::to_vec(response)?;
    line.push(b'\n');
    write.write_all(&line).await
}
