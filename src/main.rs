//! Embedding Bridge Main
//!
//! Parses the command line, sets up logging on stderr and maps the outcome
//! to an exit code. Stdout carries only JSON results.

use std::process::ExitCode;
use tracing::error;

use embedding_bridge::cli::{self, Cli};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse_args();
    if cli.needs_help() {
        Cli::print_help();
        return ExitCode::from(2);
    }

    let config = match cli.resolve_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("embedding-bridge: {}", e);
            return ExitCode::FAILURE;
        }
    };

    // RUST_LOG wins over the config file and -v
    let log_level = match cli.log_level(&config).as_str() {
        "trace" => "embedding_bridge=trace,trace".to_string(),
        "debug" => "embedding_bridge=debug,debug".to_string(),
        "warn" => "embedding_bridge=warn,warn".to_string(),
        "error" => "embedding_bridge=error,error".to_string(),
        _ => "embedding_bridge=info,warn".to_string(),
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_level.into()),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .init();

    match cli::run(cli, config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}
