//! HTTP server for the upload gateway
//!
//! Built on `hyper` (HTTP/1.1) and `tokio`. Each connection runs in its own
//! task. Each upload runs in a spawned task that the request awaits, and
//! the request owns a cancellation guard: when the client goes away hyper
//! drops the request future, the guard fires, and the upload unwinds
//! (aborting any multipart upload in flight).
//!
//! An unwinding upload task outlives its request future until the abort
//! reaches the store. Upload tasks are tracked in [`AppState`], and shutdown
//! waits for them after the connections have drained.

use super::problem;
use super::{AppState, ServerError};
use crate::router::{RequestParser, Route};
use crate::upload::{UploadRequest, UploadRoute};
use bytes::Bytes;
use futures::{StreamExt, TryStreamExt};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::CONTENT_TYPE;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use hyper_util::server::graceful::GracefulShutdown;
use std::convert::Infallible;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Instrument};

/// Time given to open connections to finish after shutdown is requested
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// HTTP server bound to a local address
pub struct HttpServer {
    state: Arc<AppState>,
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl HttpServer {
    /// Bind to `address` immediately. Port 0 lets the OS pick a port.
    pub async fn bind(address: &str, state: AppState) -> Result<Self, ServerError> {
        let addr: SocketAddr = address
            .parse()
            .map_err(|e| ServerError::BindError(format!("Invalid address {}: {}", address, e)))?;

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::BindError(format!("Failed to bind to {}: {}", addr, e)))?;

        let local_addr = listener
            .local_addr()
            .map_err(|e| ServerError::BindError(format!("Failed to get local address: {}", e)))?;

        info!(address = %local_addr, "Server bound");

        Ok(Self {
            state: Arc::new(state),
            listener,
            local_addr,
        })
    }

    /// Get the local address the server is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Serve until the process is stopped
    pub async fn run(self) -> Result<(), ServerError> {
        self.run_until(std::future::pending()).await
    }

    /// Serve until `shutdown` resolves, then let open connections drain.
    pub async fn run_until<F>(self, shutdown: F) -> Result<(), ServerError>
    where
        F: Future<Output = ()>,
    {
        info!(address = %self.local_addr, "Starting upload gateway");

        let graceful = GracefulShutdown::new();
        tokio::pin!(shutdown);

        loop {
            let (stream, peer_addr) = tokio::select! {
                _ = &mut shutdown => break,
                accepted = self.listener.accept() => match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        error!(error = %e, "Failed to accept connection");
                        continue;
                    }
                },
            };

            let state = Arc::clone(&self.state);
            let service = service_fn(move |req| {
                let state = Arc::clone(&state);
                async move { handle_request(req, state).await }
            });

            let connection = http1::Builder::new().serve_connection(TokioIo::new(stream), service);
            let connection = graceful.watch(connection);

            tokio::spawn(async move {
                if let Err(e) = connection.await {
                    warn!(peer = %peer_addr, error = %e, "Error serving connection");
                }
            });
        }

        info!("Shutting down, waiting for open connections");
        let uploads = self.state.uploads().clone();
        uploads.close();
        let drained = async {
            graceful.shutdown().await;
            info!("All connections closed");
            uploads.wait().await;
        };
        tokio::select! {
            _ = drained => info!("All uploads finished"),
            _ = tokio::time::sleep(SHUTDOWN_GRACE) => warn!(
                uploads = uploads.len(),
                "Timed out waiting for connections and uploads to finish"
            ),
        }
        Ok(())
    }
}

/// Client disconnects surface as `ConnectionAborted`, which the pipeline
/// reports as a cancellation.
fn body_error(error: hyper::Error) -> io::Error {
    if error.is_incomplete_message() || error.is_canceled() || error.is_closed() {
        io::Error::new(io::ErrorKind::ConnectionAborted, error)
    } else {
        io::Error::other(error)
    }
}

async fn handle_request(
    req: Request<Incoming>,
    state: Arc<AppState>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    let route = match RequestParser::parse(method.as_str(), &path, req.uri().query()) {
        Ok(route) => route,
        Err(e) => {
            info!(method = %method, path = %path, error = %e, "Request not routed");
            return Ok(problem::from_router_error(&e));
        }
    };

    let response = match route {
        Route::Liveness => problem::json(
            StatusCode::OK,
            "application/json",
            br#"{"status":"ok"}"#.to_vec(),
        ),
        Route::Readiness => readiness(&state).await,
        Route::Upload { route, file_name } => {
            let span = tracing::info_span!(
                "http.request",
                http.method = %method,
                http.target = %path,
                upload.route = %route,
            );
            upload(req, route, file_name, state).instrument(span).await
        }
    };
    Ok(response)
}

async fn readiness(state: &AppState) -> Response<Full<Bytes>> {
    let store = state.service.store();
    match store.bucket_exists().await {
        Ok(true) => problem::json(
            StatusCode::OK,
            "application/json",
            br#"{"status":"Healthy"}"#.to_vec(),
        ),
        Ok(false) => {
            warn!(bucket = %store.bucket(), "Readiness check failed: bucket missing");
            problem::json(
                StatusCode::SERVICE_UNAVAILABLE,
                "application/json",
                br#"{"status":"Unhealthy"}"#.to_vec(),
            )
        }
        Err(e) => {
            warn!(bucket = %store.bucket(), error = %e, "Readiness check failed");
            problem::json(
                StatusCode::SERVICE_UNAVAILABLE,
                "application/json",
                br#"{"status":"Unhealthy"}"#.to_vec(),
            )
        }
    }
}

async fn upload(
    req: Request<Incoming>,
    route: UploadRoute,
    file_name: Option<String>,
    state: Arc<AppState>,
) -> Response<Full<Bytes>> {
    let content_type = req
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let body = req.into_body().into_data_stream().map_err(body_error).boxed();
    let request = UploadRequest {
        content_type,
        file_name,
        body,
    };

    let cancel = CancellationToken::new();
    // Cancels the upload if this future is dropped (client disconnected)
    let guard = cancel.clone().drop_guard();

    let service = state.service.clone();
    let task_cancel = cancel.clone();
    let task = state.uploads().spawn(
        async move { service.handle(route, request, &task_cancel).await }.in_current_span(),
    );

    let outcome = task.await;
    guard.disarm();

    match outcome {
        Ok(Ok(descriptor)) => match serde_json::to_vec(&descriptor) {
            Ok(body) => problem::json(StatusCode::OK, "application/json", body),
            Err(e) => {
                error!(error = %e, "Failed to serialize upload descriptor");
                problem::internal_error()
            }
        },
        Ok(Err(e)) => problem::from_upload_error(&e),
        Err(e) => {
            error!(error = %e, "Upload task failed");
            problem::internal_error()
        }
    }
}
