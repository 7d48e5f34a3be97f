//! Upload Gateway Library
//!
//! Streaming file-upload gateway in front of an S3-compatible object store.
//!
//! # Features
//!
//! - **Content Sniffing**: stored type comes from the file's bytes, not the client
//! - **Streaming Uploads**: raw and multipart bodies go straight to multipart uploads
//! - **Gzip**: in-memory or fully streamed compression through a bounded pipe
//! - **Cancellation**: a client disconnect aborts in-flight multipart uploads
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use upload_gateway::{config::Config, s3::S3Client, server::{AppState, HttpServer}};
//! use upload_gateway::upload::{UploadService, UploadSettings};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config.yaml")?;
//!     let store = Arc::new(S3Client::new(&config.storage)?);
//!     let service = UploadService::new(store, UploadSettings::from(&config.upload));
//!     let server = HttpServer::bind(&config.server.address, AppState::new(service)).await?;
//!     server.run().await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod metrics;
pub mod router;
pub mod s3;
pub mod server;
pub mod upload;

// Re-export commonly used types
pub use config::Config;
pub use server::HttpServer;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
