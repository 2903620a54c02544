//! CLI definitions using clap, and the runners behind each mode.

use clap::{CommandFactory, Parser, Subcommand};
use serde::Serialize;
use std::io::Write;
use std::path::PathBuf;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::{debug, error, info};

use crate::client::{EmbedClient, EmbedError, EmbedResult, Embedding};
use crate::server::{EmbeddingServer, ServerConfig};

/// Embedding Bridge - text embeddings from an out-of-process model worker
#[derive(Parser, Debug)]
#[command(
    name = "embedding-bridge",
    author,
    version,
    about,
    long_about = None,
    arg_required_else_help = true
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Text to embed (words are joined with a space)
    pub text: Vec<String>,

    /// Configuration file (TOML)
    #[arg(long, global = true, env = "EMBEDDING_BRIDGE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Model to make active at startup
    #[arg(long, global = true, env = "EMBEDDING_BRIDGE_MODEL")]
    pub model: Option<String>,

    /// Directory holding worker environments (default: ~/.embedding-bridge/envs)
    #[arg(long, global = true, env = "EMBEDDING_BRIDGE_ENV")]
    pub env: Option<PathBuf>,

    /// Name of the worker environment inside the env directory
    #[arg(long, global = true, env = "EMBEDDING_BRIDGE_ENV_NAME")]
    pub env_name: Option<String>,

    /// Python version for the worker environment
    #[arg(long, global = true, env = "EMBEDDING_BRIDGE_PYTHON")]
    pub python: Option<String>,

    /// HTTP port for `serve`
    #[arg(long, global = true, env = "EMBEDDING_BRIDGE_PORT")]
    pub port: Option<u16>,

    /// Seconds to wait for each embed/info reply
    #[arg(long, global = true)]
    pub request_timeout: Option<u64>,

    /// Increase logging verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Commands {
    /// Run the HTTP server
    Serve,
    /// Embed each line of stdin, one JSON object per output line
    Batch,
}

impl Cli {
    /// Parse the process arguments
    pub fn parse_args() -> Self {
        Self::parse().with_subcommand_words()
    }

    pub fn try_parse_args<I, T>(args: I) -> Result<Self, clap::Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        Self::try_parse_from(args).map(Self::with_subcommand_words)
    }

    /// A lone `serve` or `batch` word always names the mode, never text.
    fn with_subcommand_words(mut self) -> Self {
        if self.command.is_none() && self.text.len() == 1 {
            let command = match self.text[0].as_str() {
                "serve" => Some(Commands::Serve),
                "batch" => Some(Commands::Batch),
                _ => None,
            };
            if command.is_some() {
                self.command = command;
                self.text.clear();
            }
        }
        self
    }

    /// No mode and no text: print usage instead of starting a worker
    pub fn needs_help(&self) -> bool {
        self.command.is_none() && self.text.iter().all(|word| word.trim().is_empty())
    }

    pub fn print_help() {
        if let Err(e) = Self::command().print_help() {
            eprintln!("embedding-bridge: failed to print help: {}", e);
        }
    }

    /// Load the config file (or defaults) and apply flag overrides.
    pub fn resolve_config(&self) -> EmbedResult<ServerConfig> {
        let mut config = ServerConfig::load(self.config.as_deref())?;

        if let Some(model) = &self.model {
            config.worker.model = model.clone();
        }
        if let Some(env) = &self.env {
            config.worker.env_root = Some(env.clone());
        }
        if let Some(env_name) = &self.env_name {
            config.worker.env_name = env_name.clone();
        }
        if let Some(python) = &self.python {
            config.worker.python_version = python.clone();
        }
        if let Some(port) = self.port {
            config.network.port = port;
        }
        if let Some(secs) = self.request_timeout {
            config.timeouts.request_secs = secs;
        }

        config.validate()?;
        Ok(config)
    }

    /// Filter directive for the log subscriber
    pub fn log_level(&self, config: &ServerConfig) -> String {
        match self.verbose {
            0 => config.monitoring.log_level.to_lowercase(),
            1 => "debug".to_string(),
            _ => "trace".to_string(),
        }
    }
}

/// Start the worker and run the selected mode; the worker is stopped on
/// every path once it has started.
pub async fn run(cli: Cli, config: ServerConfig) -> EmbedResult<()> {
    if cli.needs_help() {
        return Err(EmbedError::InvalidInput {
            message: "no text given".to_string(),
        });
    }

    let server = EmbeddingServer::new(config).await?;
    let client = server.client();

    let result = match cli.command {
        Some(Commands::Serve) => server.serve().await,
        Some(Commands::Batch) => {
            let stdin = tokio::io::BufReader::new(tokio::io::stdin());
            let mut stdout = std::io::stdout();
            run_batch(&client, stdin, &mut stdout).await.map(|written| {
                info!("Batch finished: {} lines embedded", written);
            })
        }
        None => run_single(&client, &cli.text.join(" ")).await,
    };

    server.shutdown().await;
    result
}

async fn run_single(client: &EmbedClient, text: &str) -> EmbedResult<()> {
    if text.trim().is_empty() {
        return Err(EmbedError::InvalidInput {
            message: "no text given".to_string(),
        });
    }

    let embedded = client.embed_with_model(&[text.to_string()]).await?;
    let embedding = embedded.embeddings.into_iter().next().unwrap_or_default();

    let rendered = render_single(text, embedding, &embedded.model)?;
    let mut stdout = std::io::stdout();
    writeln!(stdout, "{}", rendered)?;
    Ok(())
}

#[derive(Debug, Serialize)]
struct SingleOutput<'a> {
    text: &'a str,
    embedding: Embedding,
    dimension: usize,
    model: &'a str,
}

#[derive(Debug, Serialize)]
struct BatchLine<'a> {
    text: &'a str,
    embedding: &'a [f32],
}

/// Pretty JSON for a single-shot embed
pub fn render_single(text: &str, embedding: Embedding, model: &str) -> EmbedResult<String> {
    let output = SingleOutput {
        text,
        dimension: embedding.len(),
        embedding,
        model,
    };
    serde_json::to_string_pretty(&output).map_err(|e| EmbedError::IoError { error: e.into() })
}

/// Embed each non-blank input line and write one compact JSON line per
/// success. Failed lines are logged and skipped. Returns the number of
/// lines written.
pub async fn run_batch<R, W>(client: &EmbedClient, mut input: R, out: &mut W) -> EmbedResult<usize>
where
    R: AsyncBufRead + Unpin,
    W: Write,
{
    let mut raw = Vec::new();
    let mut line_no = 0usize;
    let mut written = 0usize;

    loop {
        raw.clear();
        if input.read_until(b'\n', &mut raw).await? == 0 {
            break;
        }
        line_no += 1;

        let line = match std::str::from_utf8(&raw) {
            Ok(line) => line,
            Err(e) => {
                error!("Line {}: not valid UTF-8: {}", line_no, e);
                continue;
            }
        };
        let text = line.trim();
        if text.is_empty() {
            continue;
        }

        let embedding = match client.embed(&[text.to_string()]).await {
            Ok(mut vectors) if !vectors.is_empty() => vectors.swap_remove(0),
            Ok(_) => {
                error!("Line {}: worker returned no embedding", line_no);
                continue;
            }
            Err(e) => {
                error!("Line {}: {}", line_no, e);
                continue;
            }
        };

        let json = serde_json::to_string(&BatchLine {
            text,
            embedding: &embedding,
        })
        .map_err(|e| EmbedError::IoError { error: e.into() })?;
        writeln!(out, "{}", json)?;
        out.flush()?;
        written += 1;
        debug!("Line {} embedded", line_no);
    }

    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::testing::{FakeWorker, MINILM};
    use crate::client::ClientOptions;
    use std::time::Duration;

    fn options() -> ClientOptions {
        ClientOptions {
            startup_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(5),
            shutdown_grace: Duration::from_secs(1),
            ..Default::default()
        }
    }

    #[test]
    fn test_parse_single_text() {
        let cli = Cli::try_parse_args(["embedding-bridge", "hello", "world", "--model", "m"]).unwrap();
        assert_eq!(cli.command, None);
        assert_eq!(cli.text.join(" "), "hello world");
        assert_eq!(cli.model.as_deref(), Some("m"));
        assert!(!cli.needs_help());
    }

    #[test]
    fn test_parse_subcommands() {
        let cli = Cli::try_parse_args(["embedding-bridge", "serve", "--port", "9000"]).unwrap();
        assert_eq!(cli.command, Some(Commands::Serve));
        assert_eq!(cli.port, Some(9000));
        assert!(cli.text.is_empty());

        let cli = Cli::try_parse_args(["embedding-bridge", "-vv", "batch"]).unwrap();
        assert_eq!(cli.command, Some(Commands::Batch));
        assert_eq!(cli.verbose, 2);
    }

    #[test]
    fn test_flags_before_subcommand() {
        let cli = Cli::try_parse_args(["embedding-bridge", "--port", "9000", "serve"]).unwrap();
        assert_eq!(cli.command, Some(Commands::Serve));
        assert_eq!(cli.port, Some(9000));
        assert!(cli.text.is_empty());

        let cli = Cli::try_parse_args(["embedding-bridge", "--model", "m", "batch"]).unwrap();
        assert_eq!(cli.command, Some(Commands::Batch));
        assert_eq!(cli.model.as_deref(), Some("m"));
        assert!(cli.text.is_empty());
        assert!(!cli.needs_help());
    }

    #[test]
    fn test_no_arguments_is_an_error() {
        let err = Cli::try_parse_args(["embedding-bridge"]).unwrap_err();
        assert_eq!(
            err.kind(),
            clap::error::ErrorKind::DisplayHelpOnMissingArgumentOrSubcommand
        );
    }

    #[tokio::test]
    async fn test_flags_without_text_need_help() {
        let cli = Cli::try_parse_args(["embedding-bridge", "--model", "m"]).unwrap();
        assert!(cli.needs_help());

        // refused before any worker is provisioned
        let mut config = ServerConfig::default();
        config.worker.command = Some(vec!["/nonexistent/embedding-worker".to_string()]);
        match run(cli, config).await {
            Err(EmbedError::InvalidInput { message }) => assert_eq!(message, "no text given"),
            other => panic!("expected InvalidInput, got {:?}", other.err()),
        }
    }

    #[test]
    fn test_flags_override_config() {
        let cli = Cli::try_parse_args([
            "embedding-bridge",
            "serve",
            "--model",
            "all-mpnet-base-v2",
            "--env",
            "/opt/envs",
            "--env-name",
            "custom",
            "--python",
            "3.12",
            "--port",
            "9100",
            "--request-timeout",
            "7",
            "-v",
        ])
        .unwrap();
        let config = cli.resolve_config().unwrap();

        assert_eq!(config.worker.model, "all-mpnet-base-v2");
        assert_eq!(config.worker.env_root, Some(PathBuf::from("/opt/envs")));
        assert_eq!(config.worker.resolved_env_root(), PathBuf::from("/opt/envs"));
        assert_eq!(config.worker.env_name, "custom");
        assert_eq!(config.worker.python_version, "3.12");
        assert_eq!(config.network.port, 9100);
        assert_eq!(config.timeouts.request_secs, 7);
        assert_eq!(cli.log_level(&config), "debug");
    }

    #[test]
    fn test_env_flag_sets_root_only() {
        let cli = Cli::try_parse_args(["embedding-bridge", "--env", "/opt/envs", "hello"]).unwrap();
        let config = cli.resolve_config().unwrap();

        assert_eq!(config.worker.env_root, Some(PathBuf::from("/opt/envs")));
        assert_eq!(config.worker.env_name, "embedding-bridge");
    }

    #[test]
    fn test_render_single() {
        let rendered = render_single("hello world", vec![0.25; 384], MINILM).unwrap();
        let value: serde_json::Value = serde_json::from_str(&rendered).unwrap();

        assert_eq!(value["text"], "hello world");
        assert_eq!(value["embedding"].as_array().unwrap().len(), 384);
        assert_eq!(value["dimension"], 384);
        assert_eq!(value["model"], MINILM);
        assert!(rendered.contains('\n'));
    }

    fn batch_texts(out: Vec<u8>) -> Vec<String> {
        String::from_utf8(out)
            .unwrap()
            .lines()
            .map(|line| {
                let value: serde_json::Value = serde_json::from_str(line).unwrap();
                value["text"].as_str().unwrap().to_string()
            })
            .collect()
    }

    #[tokio::test]
    async fn test_batch_skips_blank_lines() {
        let (client, _worker) = FakeWorker::new(MINILM).connect(MINILM, options()).await.unwrap();
        let mut out = Vec::new();

        let written = run_batch(&client, &b"a\n\n  \nbb\n"[..], &mut out).await.unwrap();
        assert_eq!(written, 2);

        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["text"], "a");
        assert_eq!(first["embedding"].as_array().unwrap().len(), 384);
        let second: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second["text"], "bb");
        assert_eq!(second["embedding"][0], 2.0);

        client.shutdown().await;
    }

    #[tokio::test]
    async fn test_batch_continues_after_rejected_line() {
        let mut fake = FakeWorker::new(MINILM);
        fake.reject_text = Some("bad");
        let (client, _worker) = fake.connect(MINILM, options()).await.unwrap();
        let mut out = Vec::new();

        let written = run_batch(&client, &b"first\nbad\nlast\n"[..], &mut out).await.unwrap();
        assert_eq!(written, 2);
        assert_eq!(batch_texts(out), vec!["first", "last"]);
        assert!(client.is_ready().await);

        client.shutdown().await;
    }

    #[tokio::test]
    async fn test_batch_skips_invalid_utf8_line() {
        let (client, _worker) = FakeWorker::new(MINILM).connect(MINILM, options()).await.unwrap();
        let mut out = Vec::new();

        let written = run_batch(&client, &b"a\n\xff\xfe\nb"[..], &mut out).await.unwrap();
        assert_eq!(written, 2);
        assert_eq!(batch_texts(out), vec!["a", "b"]);

        client.shutdown().await;
    }

    #[tokio::test]
    async fn test_batch_survives_dead_worker() {
        let mut fake = FakeWorker::new(MINILM);
        fake.die_on = Some("embed");
        let (client, _worker) = fake.connect(MINILM, options()).await.unwrap();
        let mut out = Vec::new();

        let written = run_batch(&client, &b"a\nb\nc\n"[..], &mut out).await.unwrap();
        assert_eq!(written, 0);
        assert!(out.is_empty());
    }
}
