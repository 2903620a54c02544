//! Line protocol spoken with the embedding worker
//!
//! Every message is a single JSON object terminated by one `\n`. There is no
//! length prefix and no framing beyond the newline; serde_json escapes any
//! newline inside strings so an encoded object never spans lines.
//!
//! Commands (client -> worker):
//! - `{"action":"load","model":"<name>"}`
//! - `{"action":"embed","texts":["..."]}`
//! - `{"action":"info"}`
//! - `{"action":"exit"}`
//!
//! Exactly one response line follows each command, in order. The worker also
//! emits one unsolicited line at startup: `{"status":"ready","model":"<name>"}`.

pub mod http;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

use crate::client::{EmbedError, EmbedResult, Embedding};

/// Status the worker announces once its default model is loaded
pub const STATUS_READY: &str = "ready";

/// Command sent to the worker, discriminated by `action`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum Command {
    /// Switch the active model
    Load { model: String },
    /// Embed the given texts, in order
    Embed { texts: Vec<String> },
    /// Report the active model
    Info,
    /// Ask the worker to leave its loop
    Exit,
}

impl Command {
    /// Wire name of the action
    pub fn action(&self) -> &'static str {
        match self {
            Command::Load { .. } => "load",
            Command::Embed { .. } => "embed",
            Command::Info => "info",
            Command::Exit => "exit",
        }
    }
}

/// Response line read from the worker
///
/// Which fields are present depends on the command and its outcome.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkerResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embeddings: Option<Vec<Embedding>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dimension: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ready: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl WorkerResponse {
    /// Worker-reported failure message, if any
    pub fn error_message(&self) -> Option<&str> {
        self.error.as_deref().filter(|message| !message.is_empty())
    }

    /// Turn a worker-reported failure into an `RpcError`
    pub fn into_result(self) -> EmbedResult<Self> {
        match self.error_message() {
            Some(message) => Err(EmbedError::RpcError {
                message: message.to_string(),
            }),
            None => Ok(self),
        }
    }

    pub fn is_ready_signal(&self) -> bool {
        self.status.as_deref() == Some(STATUS_READY)
    }

    /// Model and dimension of a `load` result; both are required.
    pub fn loaded_model(&self) -> EmbedResult<(String, usize)> {
        let model = self
            .model
            .clone()
            .ok_or_else(|| EmbedError::protocol("load response is missing `model`"))?;
        let dimension = self
            .dimension
            .ok_or_else(|| EmbedError::protocol("load response is missing `dimension`"))?;
        Ok((model, dimension))
    }

    /// Vectors of an `embed` result, checked against the number of inputs.
    ///
    /// All vectors must share one length.
    pub fn into_embeddings(self, expected: usize) -> EmbedResult<Vec<Embedding>> {
        let embeddings = self
            .embeddings
            .ok_or_else(|| EmbedError::protocol("embed response is missing `embeddings`"))?;

        if embeddings.len() != expected {
            return Err(EmbedError::protocol(format!(
                "expected {} embeddings, worker returned {}",
                expected,
                embeddings.len()
            )));
        }

        if let Some(first) = embeddings.first() {
            let width = first.len();
            if let Some(position) = embeddings.iter().position(|vector| vector.len() != width) {
                return Err(EmbedError::protocol(format!(
                    "embedding {} has length {}, expected {}",
                    position,
                    embeddings[position].len(),
                    width
                )));
            }
        }

        Ok(embeddings)
    }
}

/// Serialize a command into one newline-terminated line
pub fn encode_command(command: &Command) -> EmbedResult<Vec<u8>> {
    let mut line = serde_json::to_vec(command)
        .map_err(|e| EmbedError::protocol(format!("failed to encode {} command: {}", command.action(), e)))?;
    line.push(b'\n');
    Ok(line)
}

/// Parse one response line (trailing newline optional)
pub fn decode_response(line: &str) -> EmbedResult<WorkerResponse> {
    let trimmed = line.trim_end_matches(['\n', '\r']);
    serde_json::from_str(trimmed).map_err(|e| {
        EmbedError::protocol(format!("invalid response line ({}): {}", e, truncate(trimmed, 200)))
    })
}

/// Parse a command line the way a worker would
pub fn decode_command(line: &str) -> EmbedResult<Command> {
    serde_json::from_str(line.trim_end_matches(['\n', '\r']))
        .map_err(|e| EmbedError::protocol(format!("invalid command line: {}", e)))
}

fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((index, _)) => &text[..index],
        None => text,
    }
}

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Both directions of a worker connection
///
/// The channel itself does no locking; the client holds it behind its
/// session mutex so one exchange runs at a time.
pub struct LineChannel {
    reader: BufReader<BoxedReader>,
    writer: BoxedWriter,
}

impl LineChannel {
    pub fn new<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            reader: BufReader::new(Box::new(reader) as BoxedReader),
            writer: Box::new(writer),
        }
    }

    /// Write one command with a single `write_all`, then flush.
    pub async fn send(&mut self, command: &Command) -> EmbedResult<()> {
        let line = encode_command(command)?;
        self.writer
            .write_all(&line)
            .await
            .map_err(|e| EmbedError::protocol(format!("failed to write {} command: {}", command.action(), e)))?;
        self.writer
            .flush()
            .await
            .map_err(|e| EmbedError::protocol(format!("failed to flush {} command: {}", command.action(), e)))?;
        Ok(())
    }

    /// Read exactly one newline-terminated response.
    ///
    /// EOF before a complete line means the worker is gone.
    pub async fn recv(&mut self) -> EmbedResult<WorkerResponse> {
        let mut line = String::new();
        let read = self
            .reader
            .read_line(&mut line)
            .await
            .map_err(|e| EmbedError::protocol(format!("failed to read from worker: {}", e)))?;

        if read == 0 {
            return Err(EmbedError::protocol("worker closed its output stream"));
        }
        if !line.ends_with('\n') {
            return Err(EmbedError::protocol(format!(
                "worker output ended mid-line after {} bytes",
                read
            )));
        }

        decode_response(&line)
    }

    /// Close the write side so the worker sees EOF on its input.
    pub async fn close(mut self) {
        let _ = self.writer.shutdown().await;
    }
}
