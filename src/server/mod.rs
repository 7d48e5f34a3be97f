//! HTTP server module
//!
//! Accepts upload requests and hands them to the [`UploadService`].

pub mod http;
pub mod problem;

use crate::upload::UploadService;
use thiserror::Error;
use tokio_util::task::TaskTracker;

pub use http::HttpServer;

/// Server errors
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("Failed to bind to address: {0}")]
    BindError(String),
}

/// State shared by all connections
#[derive(Clone)]
pub struct AppState {
    pub service: UploadService,
    /// Upload tasks, including ones still unwinding after their client left
    uploads: TaskTracker,
}

impl AppState {
    pub fn new(service: UploadService) -> Self {
        Self {
            service,
            uploads: TaskTracker::new(),
        }
    }

    pub(crate) fn uploads(&self) -> &TaskTracker {
        &self.uploads
    }

    /// Number of upload tasks that have not finished yet
    pub fn uploads_in_flight(&self) -> usize {
        self.uploads.len()
    }
}
