//! HTTP REST API Protocol
//!
//! Request and response bodies for the HTTP surface:
//! - `POST /embed`  body `{"text": "..."}` and/or `{"texts": ["...", ...]}`
//! - `POST /model`  body `{"model": "..."}`
//! - `GET  /health`

use serde::{Deserialize, Serialize};

use crate::client::Embedding;

/// HTTP Embedding Request
///
/// Either field may be omitted; a non-empty `text` is appended after `texts`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HttpEmbedRequest {
    /// Single text to embed
    #[serde(default)]
    pub text: String,

    /// Several texts to embed, in order
    #[serde(default)]
    pub texts: Vec<String>,
}

impl HttpEmbedRequest {
    /// Combine both fields into the list sent to the worker
    pub fn into_texts(self) -> Result<Vec<String>, String> {
        let mut texts = self.texts;
        if !self.text.is_empty() {
            texts.push(self.text);
        }

        if texts.is_empty() {
            return Err("no texts provided".to_string());
        }

        Ok(texts)
    }
}

/// HTTP Embedding Response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpEmbedResponse {
    /// One vector per input text, in input order
    pub embeddings: Vec<Embedding>,
    pub model: String,
    /// Length of the first vector
    pub dimension: usize,
}

impl HttpEmbedResponse {
    pub fn new(embeddings: Vec<Embedding>, model: impl Into<String>) -> Self {
        let dimension = embeddings.first().map(Vec::len).unwrap_or(0);
        Self {
            embeddings,
            model: model.into(),
            dimension,
        }
    }
}

/// Model switch request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpModelRequest {
    pub model: String,
}

/// Model switch response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpModelResponse {
    pub status: String,
    pub model: String,
    pub dimension: usize,
}

impl HttpModelResponse {
    pub fn ok(model: impl Into<String>, dimension: usize) -> Self {
        Self {
            status: "ok".to_string(),
            model: model.into(),
            dimension,
        }
    }
}

/// HTTP Error Response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpErrorResponse {
    /// Error message
    pub error: String,

    /// Error code (optional)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,

    /// Additional details (optional)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl HttpErrorResponse {
    /// Create a new error response
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            code: None,
            details: None,
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn bad_request(error: impl Into<String>) -> Self {
        Self::new(error).with_code("BAD_REQUEST")
    }

    pub fn method_not_allowed(method: &str) -> Self {
        Self::new(format!("{} required", method)).with_code("METHOD_NOT_ALLOWED")
    }

    pub fn body_too_large(limit: usize) -> Self {
        Self::new(format!("Request body exceeds {} bytes", limit)).with_code("BODY_TOO_LARGE")
    }

    /// Worker is unreachable or its session is dead
    pub fn worker_unavailable(details: impl Into<String>) -> Self {
        Self::new("Embedding worker is not available")
            .with_code("WORKER_UNAVAILABLE")
            .with_details(details)
    }

    pub fn internal_error(details: impl Into<String>) -> Self {
        Self::new("Embedding worker request failed")
            .with_code("INTERNAL_ERROR")
            .with_details(details)
    }
}

/// Health check response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub model: String,
    pub dimension: usize,
    pub ready: bool,
    /// Human-readable uptime, e.g. `1h 2m 3s`
    pub uptime: String,
    pub uptime_secs: u64,
    /// Completed embed requests since start
    pub requests: u64,
    pub version: String,
}

impl HealthResponse {
    pub fn healthy(
        model: impl Into<String>,
        dimension: usize,
        ready: bool,
        uptime: std::time::Duration,
        requests: u64,
    ) -> Self {
        Self {
            status: "healthy".to_string(),
            model: model.into(),
            dimension,
            ready,
            uptime: format_uptime(uptime),
            uptime_secs: uptime.as_secs(),
            requests,
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

fn format_uptime(uptime: std::time::Duration) -> String {
    let total = uptime.as_secs();
    let (hours, minutes, seconds) = (total / 3600, (total % 3600) / 60, total % 60);
    if hours > 0 {
        format!("{}h {}m {}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, seconds)
    } else {
        format!("{}.{:03}s", seconds, uptime.subsec_millis())
    }
}
