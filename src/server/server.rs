//! Embedding HTTP server
//!
//! Owns the worker client for the lifetime of the HTTP surface.

use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::client::{EmbedClient, EmbedResult};
use crate::server::config::ServerConfig;
use crate::server::hyper_server::start_hyper_http_server;
use crate::worker::provisioner_from_config;

pub struct EmbeddingServer {
    config: Arc<ServerConfig>,
    client: Arc<EmbedClient>,
    server_id: Uuid,
}

impl EmbeddingServer {
    /// Start the worker and make the configured model active
    pub async fn new(config: ServerConfig) -> EmbedResult<Self> {
        config.validate()?;

        let server_id = Uuid::new_v4();
        info!("Initializing embedding server {}", server_id);

        let provisioner = provisioner_from_config(&config.worker)?;
        let client = EmbedClient::initialize(provisioner, &config.worker.model, config.client_options()).await?;
        info!("Embedding worker ready with model {}", client.model().await);

        Ok(Self {
            config: Arc::new(config),
            client: Arc::new(client),
            server_id,
        })
    }

    pub fn client(&self) -> Arc<EmbedClient> {
        Arc::clone(&self.client)
    }

    /// Serve HTTP until Ctrl+C, then stop the worker.
    pub async fn serve(&self) -> EmbedResult<()> {
        let shutdown = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Failed to listen for Ctrl+C: {}", e);
                std::future::pending::<()>().await;
            }
            info!("Shutdown signal received");
        };

        let result = start_hyper_http_server(Arc::clone(&self.config), self.client(), shutdown).await;
        self.shutdown().await;
        result
    }

    pub async fn shutdown(&self) {
        info!("Stopping embedding server {}", self.server_id);
        self.client.shutdown().await;
    }
}
