//! Hyper-based HTTP server
//!
//! Thin handlers over the shared `EmbedClient`; hyper directly, no routing
//! layer. Handlers never touch the worker streams, only the client.

use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use hyper::body::HttpBody;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::net::{TcpListener, TcpSocket};
use tracing::{debug, error, info, warn};

use crate::client::{EmbedClient, EmbedError, EmbedResult};
use crate::protocol::http::{
    HealthResponse, HttpEmbedRequest, HttpEmbedResponse, HttpErrorResponse, HttpModelRequest,
    HttpModelResponse,
};
use crate::server::config::ServerConfig;

/// Process-wide request counter and start time
///
/// Has its own atomic so counting never waits on the client's worker lock.
#[derive(Debug)]
pub struct ServerStats {
    requests: AtomicU64,
    started_at: Instant,
}

impl ServerStats {
    pub fn new() -> Self {
        Self {
            requests: AtomicU64::new(0),
            started_at: Instant::now(),
        }
    }

    pub fn record_request(&self) -> u64 {
        self.requests.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn requests(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }
}

impl Default for ServerStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared state for Hyper server
#[derive(Clone)]
struct ServerState {
    client: Arc<EmbedClient>,
    stats: Arc<ServerStats>,
    max_body_bytes: usize,
}

/// Serve HTTP until `shutdown` resolves
pub async fn start_hyper_http_server<F>(
    config: Arc<ServerConfig>,
    client: Arc<EmbedClient>,
    shutdown: F,
) -> EmbedResult<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let bind_address = config.bind_address();
    let addr: SocketAddr = bind_address.parse().map_err(|e| EmbedError::ConfigError {
        message: format!("invalid bind address {}: {}", bind_address, e),
    })?;

    let listener = bind_listener(addr)?;

    info!("Starting server on {}", bind_address);
    serve(listener.into_std()?, client, config.network.max_body_bytes, shutdown).await
}

fn bind_listener(addr: SocketAddr) -> std::io::Result<TcpListener> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_nodelay(true)?;
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    socket.listen(1024)
}

/// Serve on an already bound listener
pub async fn serve<F>(
    listener: std::net::TcpListener,
    client: Arc<EmbedClient>,
    max_body_bytes: usize,
    shutdown: F,
) -> EmbedResult<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let state = ServerState {
        client,
        stats: Arc::new(ServerStats::new()),
        max_body_bytes,
    };

    let make_svc = make_service_fn(move |_| {
        let state = state.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req| {
                let state = state.clone();
                handle_request(req, state)
            }))
        }
    });

    let local = listener.local_addr()?;
    let server = Server::from_tcp(listener)
        .map_err(|e| EmbedError::IoError {
            error: std::io::Error::new(std::io::ErrorKind::Other, e),
        })?
        .http1_keepalive(true)
        .tcp_nodelay(true)
        .tcp_sleep_on_accept_errors(true)
        .serve(make_svc)
        .with_graceful_shutdown(shutdown);

    info!("HTTP server listening on {}", local);
    info!("Endpoints:");
    info!("  POST /embed   - Generate embeddings");
    info!("  GET  /health  - Health check");
    info!("  POST /model   - Switch model");

    server.await.map_err(|e| EmbedError::IoError {
        error: std::io::Error::new(std::io::ErrorKind::Other, e),
    })?;

    info!("HTTP server stopped");
    Ok(())
}

async fn handle_request(req: Request<Body>, state: ServerState) -> Result<Response<Body>, Infallible> {
    let origin = req
        .headers()
        .get("origin")
        .cloned()
        .unwrap_or_else(|| HeaderValue::from_static("*"));

    let method = req.method().clone();
    let path = req.uri().path().to_string();
    debug!("{} {}", method, path);

    let mut response = match (&method, path.as_str()) {
        (&Method::OPTIONS, _) => handle_options(),
        (&Method::POST, "/embed") => handle_embed(req, state).await,
        (_, "/embed") => method_not_allowed("POST"),
        (&Method::GET, "/health") => handle_health(state).await,
        (_, "/health") => method_not_allowed("GET"),
        (&Method::POST, "/model") => handle_model(req, state).await,
        (_, "/model") => method_not_allowed("POST"),
        (&Method::GET, "/") => handle_root(state).await,
        _ => handle_not_found(),
    };

    let headers = response.headers_mut();
    headers.insert("access-control-allow-origin", origin);
    headers.insert(
        "access-control-allow-methods",
        HeaderValue::from_static("GET, POST, OPTIONS"),
    );
    headers.insert(
        "access-control-allow-headers",
        HeaderValue::from_static("content-type"),
    );

    Ok(response)
}

fn handle_options() -> Response<Body> {
    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::NO_CONTENT;
    response
}

fn handle_not_found() -> Response<Body> {
    json_response(StatusCode::NOT_FOUND, &HttpErrorResponse::new("Not Found"))
}

fn method_not_allowed(method: &str) -> Response<Body> {
    json_response(
        StatusCode::METHOD_NOT_ALLOWED,
        &HttpErrorResponse::method_not_allowed(method),
    )
}

async fn handle_root(state: ServerState) -> Response<Body> {
    let info = serde_json::json!({
        "name": "embedding-bridge",
        "version": env!("CARGO_PKG_VERSION"),
        "model": state.client.model().await,
        "endpoints": {
            "embed": { "method": "POST", "path": "/embed", "description": "Generate embeddings" },
            "health": { "method": "GET", "path": "/health", "description": "Health check" },
            "model": { "method": "POST", "path": "/model", "description": "Switch model" }
        }
    });
    json_response(StatusCode::OK, &info)
}

async fn handle_health(state: ServerState) -> Response<Body> {
    match state.client.info().await {
        Ok(info) => {
            let current = state.client.model_state().await;
            let response = HealthResponse::healthy(
                info.model.unwrap_or(current.model),
                info.dimension.or(current.dimension).unwrap_or(0),
                info.ready.unwrap_or(true),
                state.stats.uptime(),
                state.stats.requests(),
            );
            json_response(StatusCode::OK, &response)
        }
        Err(e) => {
            error!("Health check failed: {}", e);
            json_response(
                StatusCode::SERVICE_UNAVAILABLE,
                &HttpErrorResponse::worker_unavailable(e.to_string()),
            )
        }
    }
}

async fn handle_embed(req: Request<Body>, state: ServerState) -> Response<Body> {
    let start_time = Instant::now();

    let request: HttpEmbedRequest = match read_json(req, state.max_body_bytes).await {
        Ok(request) => request,
        Err(response) => return response,
    };
    let texts = match request.into_texts() {
        Ok(texts) => texts,
        Err(message) => {
            return json_response(StatusCode::BAD_REQUEST, &HttpErrorResponse::bad_request(message))
        }
    };

    match state.client.embed_with_model(&texts).await {
        Ok(embedded) => {
            let total = state.stats.record_request();
            debug!(
                texts = texts.len(),
                requests = total,
                "Embedded in {:?}",
                start_time.elapsed()
            );
            json_response(
                StatusCode::OK,
                &HttpEmbedResponse::new(embedded.embeddings, embedded.model),
            )
        }
        Err(e) => {
            error!("Embedding failed: {}", e);
            rpc_failure(e)
        }
    }
}

async fn handle_model(req: Request<Body>, state: ServerState) -> Response<Body> {
    let request: HttpModelRequest = match read_json(req, state.max_body_bytes).await {
        Ok(request) => request,
        Err(response) => return response,
    };

    match state.client.load_model(&request.model).await {
        Ok((model, dimension)) => {
            info!("Switched model to {} via HTTP", model);
            json_response(StatusCode::OK, &HttpModelResponse::ok(model, dimension))
        }
        Err(e) => {
            warn!("Model switch to {} failed: {}", request.model, e);
            rpc_failure(e)
        }
    }
}

fn rpc_failure(error: EmbedError) -> Response<Body> {
    match error {
        EmbedError::InvalidInput { message } => {
            json_response(StatusCode::BAD_REQUEST, &HttpErrorResponse::bad_request(message))
        }
        other => json_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            &HttpErrorResponse::internal_error(other.to_string()),
        ),
    }
}

/// Read a size-limited body and parse it as JSON; errors become 400 responses.
async fn read_json<T: DeserializeOwned>(req: Request<Body>, limit: usize) -> Result<T, Response<Body>> {
    let too_large = || json_response(StatusCode::BAD_REQUEST, &HttpErrorResponse::body_too_large(limit));

    let mut body = req.into_body();
    if body.size_hint().lower() > limit as u64 {
        return Err(too_large());
    }

    let mut bytes = Vec::new();
    while let Some(chunk) = body.data().await {
        let chunk = chunk.map_err(|_| {
            json_response(
                StatusCode::BAD_REQUEST,
                &HttpErrorResponse::bad_request("Failed to read request body"),
            )
        })?;
        if bytes.len() + chunk.len() > limit {
            return Err(too_large());
        }
        bytes.extend_from_slice(&chunk);
    }

    serde_json::from_slice(&bytes).map_err(|e| {
        json_response(
            StatusCode::BAD_REQUEST,
            &HttpErrorResponse::bad_request("Invalid JSON").with_details(e.to_string()),
        )
    })
}

fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Response<Body> {
    let (status, payload) = match serde_json::to_vec(body) {
        Ok(payload) => (status, payload),
        Err(e) => {
            error!("Failed to serialize response: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                br#"{"error":"response serialization failed"}"#.to_vec(),
            )
        }
    };

    let mut response = Response::new(Body::from(payload));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}
