//! Upload module
//!
//! The streaming upload pipeline: content sniffing, stream preparation,
//! gzip compression (in memory or through a bounded pipe), single-put and
//! multipart transfer to the object store, and the orchestrator that picks
//! which of those stages a request goes through.

use crate::s3::StoreError;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::io;
use thiserror::Error;

pub mod compress;
pub mod form;
pub mod multipart;
pub mod pipe;
pub mod prepare;
pub mod put_object;
pub mod service;
pub mod sniff;
pub mod source;
pub mod temp_file;

pub use pipe::PipeError;
pub use service::{UploadRequest, UploadService, UploadSettings};
pub use source::{FormFile, UploadStream};

/// Upload errors
#[derive(Error, Debug)]
pub enum UploadError {
    #[error("No file uploaded")]
    NoFile,

    #[error("Uploaded file is empty")]
    EmptyFile,

    #[error("File size {size} exceeds maximum allowed size of {limit} bytes")]
    TooLarge { size: u64, limit: u64 },

    #[error("Missing content-type boundary")]
    MissingBoundary,

    #[error("Missing file name")]
    MissingFileName,

    #[error("Stream does not support seeking")]
    NotSeekable,

    #[error("Malformed multipart body: {0}")]
    MalformedMultipart(String),

    #[error("Upload cancelled")]
    Cancelled,

    #[error("Source stream error: {0}")]
    SourceError(#[source] io::Error),

    #[error("Object store error: {0}")]
    StoreError(#[from] StoreError),

    #[error("Transfer pipe error: {0}")]
    PipeError(#[from] PipeError),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// How an [`UploadError`] is reported to the client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Bad input; the request should not be retried as-is
    Client,
    /// The client went away or the request was cancelled
    Cancelled,
    /// Store, transport or internal failure
    Server,
}

impl UploadError {
    pub fn class(&self) -> ErrorClass {
        match self {
            UploadError::NoFile
            | UploadError::EmptyFile
            | UploadError::TooLarge { .. }
            | UploadError::MissingBoundary
            | UploadError::MissingFileName
            | UploadError::NotSeekable
            | UploadError::MalformedMultipart(_) => ErrorClass::Client,
            UploadError::Cancelled => ErrorClass::Cancelled,
            UploadError::SourceError(_)
            | UploadError::StoreError(_)
            | UploadError::PipeError(_)
            | UploadError::Internal(_) => ErrorClass::Server,
        }
    }

    /// Short label used for metrics
    pub fn kind(&self) -> &'static str {
        match self {
            UploadError::NoFile => "no_file",
            UploadError::EmptyFile => "empty_file",
            UploadError::TooLarge { .. } => "too_large",
            UploadError::MissingBoundary => "missing_boundary",
            UploadError::MissingFileName => "missing_file_name",
            UploadError::NotSeekable => "not_seekable",
            UploadError::MalformedMultipart(_) => "malformed_multipart",
            UploadError::Cancelled => "cancelled",
            UploadError::SourceError(_) => "source",
            UploadError::StoreError(_) => "store",
            UploadError::PipeError(_) => "pipe",
            UploadError::Internal(_) => "internal",
        }
    }
}

/// True for I/O errors produced when the client drops the connection.
pub(crate) fn is_disconnect(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::ConnectionAborted | io::ErrorKind::ConnectionReset
    )
}

impl From<io::Error> for UploadError {
    fn from(error: io::Error) -> Self {
        if is_disconnect(&error) {
            return UploadError::Cancelled;
        }

        // Pipe failures travel through AsyncRead as io::Error
        let is_pipe = error
            .get_ref()
            .map(|inner| inner.is::<PipeError>())
            .unwrap_or(false);
        if is_pipe {
            if let Some(inner) = error.into_inner() {
                if let Ok(pipe) = inner.downcast::<PipeError>() {
                    return UploadError::PipeError(*pipe);
                }
            }
            return UploadError::Internal("unreadable pipe error".into());
        }

        UploadError::SourceError(error)
    }
}

/// Which pipeline a request runs through
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UploadRoute {
    /// Form upload, sniffed, single put
    Buffered,
    /// Form upload, sniffed, gzip in memory, single put
    BufferedRamCompressed,
    /// Form upload, sniffed, gzip through a bounded pipe, multipart
    BufferedStreamCompressed,
    /// Raw request body straight to multipart
    Direct,
    /// First file section of a multipart body straight to multipart
    MultipartPassthrough,
}

impl UploadRoute {
    pub fn as_str(&self) -> &'static str {
        match self {
            UploadRoute::Buffered => "buffered",
            UploadRoute::BufferedRamCompressed => "buffered_ram_compressed",
            UploadRoute::BufferedStreamCompressed => "buffered_stream_compressed",
            UploadRoute::Direct => "direct",
            UploadRoute::MultipartPassthrough => "multipart_passthrough",
        }
    }
}

impl std::fmt::Display for UploadRoute {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of a store transfer
#[derive(Debug, Clone)]
pub struct UploadResult {
    pub etag: Option<String>,
    pub bytes_written: u64,
    pub parts: u32,
}

/// Returned to the caller for every successful upload
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UploadDescriptor {
    pub original_file_name: String,
    pub stored_object_name: String,
    pub storage_path: String,
    pub size_bytes: u64,
    pub content_type: String,
    pub uploaded_at_utc: DateTime<Utc>,
}

/// Generate a collision-resistant object name keeping `extension`.
///
/// `extension` may be given with or without its leading dot; an empty
/// extension produces a bare identifier.
pub fn generate_object_name(extension: &str) -> String {
    let id = uuid::Uuid::new_v4();
    let extension = extension.trim_start_matches('.');
    if extension.is_empty() {
        id.to_string()
    } else {
        format!("{}.{}", id, extension)
    }
}
