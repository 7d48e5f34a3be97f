//! Prometheus Metrics HTTP Server
//!
//! Serves `GET /metrics` (text exposition format) and `GET /health` on a
//! port separate from the upload traffic.
//!
//! # Example
//!
//! ```no_run
//! use upload_gateway::metrics::server::{MetricsServer, MetricsServerConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut server = MetricsServer::new(MetricsServerConfig::for_port(9090));
//!     let addr = server.start().await?;
//!     println!("Metrics server listening on {}", addr);
//!     Ok(())
//! }
//! ```

use bytes::Bytes;
use http_body_util::Full;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use prometheus::{Encoder, TextEncoder};
use std::convert::Infallible;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::sync::oneshot;

/// Configuration for the metrics server
#[derive(Debug, Clone)]
pub struct MetricsServerConfig {
    /// Address to bind to (e.g., "127.0.0.1:9090")
    pub address: String,
}

impl MetricsServerConfig {
    /// Listen on all interfaces at `port`
    pub fn for_port(port: u16) -> Self {
        Self {
            address: format!("0.0.0.0:{}", port),
        }
    }
}

/// Metrics server error
#[derive(Debug, thiserror::Error)]
pub enum MetricsServerError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Prometheus metrics HTTP server
pub struct MetricsServer {
    config: MetricsServerConfig,
    shutdown_tx: Option<oneshot::Sender<()>>,
    server_handle: Option<tokio::task::JoinHandle<()>>,
}

impl MetricsServer {
    /// Create a new metrics server
    pub fn new(config: MetricsServerConfig) -> Self {
        Self {
            config,
            shutdown_tx: None,
            server_handle: None,
        }
    }

    /// Start the metrics server
    ///
    /// Returns the actual bound address (useful when using port 0)
    pub async fn start(&mut self) -> Result<SocketAddr, MetricsServerError> {
        let listener = TcpListener::bind(&self.config.address).await?;
        let addr = listener.local_addr()?;

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        self.shutdown_tx = Some(shutdown_tx);
        self.server_handle = Some(tokio::spawn(run_server(listener, shutdown_rx)));

        Ok(addr)
    }

    /// Shutdown the metrics server
    pub async fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.server_handle.take() {
            let _ = handle.await;
        }
    }
}

async fn run_server(listener: TcpListener, mut shutdown_rx: oneshot::Receiver<()>) {
    loop {
        tokio::select! {
            _ = &mut shutdown_rx => break,
            result = listener.accept() => {
                match result {
                    Ok((stream, _)) => {
                        let io = TokioIo::new(stream);
                        tokio::spawn(async move {
                            let _ = http1::Builder::new()
                                .serve_connection(io, service_fn(handle_request))
                                .await;
                        });
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Metrics server failed to accept connection");
                    }
                }
            }
        }
    }
}

async fn handle_request(
    req: Request<hyper::body::Incoming>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let response = match (req.method(), req.uri().path()) {
        (&Method::GET, "/metrics") => metrics_handler(),
        (&Method::GET, "/health") => {
            text(StatusCode::OK, "application/json", Bytes::from_static(br#"{"status":"ok"}"#))
        }
        _ => text(StatusCode::NOT_FOUND, "text/plain", Bytes::from_static(b"Not Found")),
    };
    Ok(response)
}

fn text(status: StatusCode, content_type: &'static str, body: Bytes) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

fn metrics_handler() -> Response<Full<Bytes>> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();

    if let Err(e) = encoder.encode(&prometheus::gather(), &mut buffer) {
        tracing::error!(error = %e, "Failed to encode metrics");
        return text(
            StatusCode::INTERNAL_SERVER_ERROR,
            "text/plain",
            Bytes::from_static(b"Failed to encode metrics"),
        );
    }

    let mut response = Response::new(Full::new(Bytes::from(buffer)));
    if let Ok(value) = HeaderValue::from_str(encoder.format_type()) {
        response.headers_mut().insert(CONTENT_TYPE, value);
    }
    response
}
