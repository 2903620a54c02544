//! Embedding Bridge Library
//!
//! Drives an out-of-process embedding worker over a line-oriented JSON
//! protocol and exposes it through a CLI and an HTTP server.

pub mod cli;
pub mod client;
pub mod protocol;
pub mod server;
pub mod worker;

// Re-exports
pub use client::{ClientOptions, EmbedClient, EmbedError, EmbedResult, Embedded, Embedding, ModelState};
pub use protocol::{Command, WorkerResponse};
pub use server::{start_hyper_http_server, EmbeddingServer, ServerConfig};
pub use worker::{CommandProvisioner, Provisioner, PythonProvisioner};
