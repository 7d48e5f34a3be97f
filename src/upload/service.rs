//! Upload orchestrator
//!
//! [`UploadService::handle`] is the one place a request is routed to a
//! pipeline and its outcome is logged and counted:
//!
//! | Route | Pipeline |
//! |-------|----------|
//! | `Buffered` | form file → prepare → single put |
//! | `BufferedRamCompressed` | form file → prepare → gzip in memory → single put |
//! | `BufferedStreamCompressed` | form file → prepare → gzip ⇄ pipe ⇄ multipart |
//! | `Direct` | request body → multipart |
//! | `MultipartPassthrough` | first file section → multipart |

use super::compress::{
    compress_to_memory, compressed_object_name, gzip_attributes, upload_compressed_stream,
};
use super::form::{self, FormLimits};
use super::multipart::{MultipartUploader, UploadProgress};
use super::prepare::{prepare, PreparedUpload};
use super::put_object::PutObjectUploader;
use super::sniff::FALLBACK_MIME;
use super::source::FormFile;
use super::{generate_object_name, ErrorClass, UploadDescriptor, UploadError, UploadRoute};
use crate::config::UploadConfig;
use crate::metrics;
use crate::s3::{ObjectAttributes, ObjectStore};
use chrono::Utc;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::io::AsyncRead;
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

pub use super::form::BodyStream;

/// Tunables for the upload pipelines
#[derive(Debug, Clone)]
pub struct UploadSettings {
    pub max_buffered_size: u64,
    pub memory_threshold: usize,
    pub part_size: usize,
    pub pipe_capacity: usize,
    pub copy_buffer_size: usize,
    pub spool_dir: Option<PathBuf>,
}

impl From<&UploadConfig> for UploadSettings {
    fn from(config: &UploadConfig) -> Self {
        Self {
            max_buffered_size: config.max_buffered_size,
            memory_threshold: config.memory_threshold,
            part_size: config.part_size,
            pipe_capacity: config.pipe_capacity,
            copy_buffer_size: config.copy_buffer_size,
            spool_dir: config.spool_dir.clone(),
        }
    }
}

impl Default for UploadSettings {
    fn default() -> Self {
        Self::from(&UploadConfig::default())
    }
}

/// An inbound upload request
pub struct UploadRequest {
    /// `Content-Type` header of the request
    pub content_type: Option<String>,
    /// Client-supplied file name (direct route)
    pub file_name: Option<String>,
    pub body: BodyStream,
}

impl UploadRequest {
    pub fn new(body: BodyStream) -> Self {
        Self {
            content_type: None,
            file_name: None,
            body,
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn with_file_name(mut self, file_name: impl Into<String>) -> Self {
        self.file_name = Some(file_name.into());
        self
    }
}

fn log_progress(progress: UploadProgress) {
    tracing::debug!(
        bytes = progress.bytes_transferred,
        parts = progress.parts_completed,
        "Upload progress"
    );
}

fn extension_of(file_name: &str) -> &str {
    Path::new(file_name)
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
}

/// Routes uploads through the pipelines and into the store
#[derive(Clone)]
pub struct UploadService {
    store: Arc<dyn ObjectStore>,
    settings: UploadSettings,
    put: PutObjectUploader,
    multipart: MultipartUploader,
}

impl UploadService {
    pub fn new(store: Arc<dyn ObjectStore>, settings: UploadSettings) -> Self {
        Self {
            put: PutObjectUploader::new(store.clone())
                .with_spooling(settings.memory_threshold, settings.spool_dir.clone()),
            multipart: MultipartUploader::new(store.clone(), settings.part_size),
            store,
            settings,
        }
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    pub fn settings(&self) -> &UploadSettings {
        &self.settings
    }

    /// Run `request` through the pipeline for `route`.
    ///
    /// Any failure observed after `cancel` fired is reported as
    /// [`UploadError::Cancelled`].
    pub async fn handle(
        &self,
        route: UploadRoute,
        request: UploadRequest,
        cancel: &CancellationToken,
    ) -> Result<UploadDescriptor, UploadError> {
        let start_time = Instant::now();

        let outcome = match self.dispatch(route, request, cancel).await {
            Err(e) if cancel.is_cancelled() && !matches!(e, UploadError::Cancelled) => {
                tracing::debug!(error = %e, "Failure after cancellation");
                Err(UploadError::Cancelled)
            }
            other => other,
        };

        let duration = start_time.elapsed();
        metrics::record_upload_duration(route.as_str(), duration.as_secs_f64());

        match &outcome {
            Ok(descriptor) => {
                metrics::record_upload_success(route.as_str(), descriptor.size_bytes);
                info!(
                    route = %route,
                    object = %descriptor.stored_object_name,
                    original = %descriptor.original_file_name,
                    size = descriptor.size_bytes,
                    content_type = %descriptor.content_type,
                    duration_ms = duration.as_millis(),
                    "Upload completed"
                );
            }
            Err(e) => {
                metrics::record_error(e.kind());
                match e.class() {
                    ErrorClass::Client => {
                        metrics::record_upload_failure(route.as_str(), "rejected");
                        warn!(route = %route, error = %e, "Upload rejected");
                    }
                    ErrorClass::Cancelled => {
                        metrics::record_upload_failure(route.as_str(), "cancelled");
                        warn!(
                            route = %route,
                            duration_ms = duration.as_millis(),
                            "Upload cancelled"
                        );
                    }
                    ErrorClass::Server => {
                        metrics::record_upload_failure(route.as_str(), "failure");
                        error!(route = %route, error = ?e, "Upload failed");
                    }
                }
            }
        }

        outcome
    }

    async fn dispatch(
        &self,
        route: UploadRoute,
        request: UploadRequest,
        cancel: &CancellationToken,
    ) -> Result<UploadDescriptor, UploadError> {
        match route {
            UploadRoute::Buffered => {
                let file = self.read_form(request, cancel).await?;
                self.upload_buffered(file, cancel).await
            }
            UploadRoute::BufferedRamCompressed => {
                let file = self.read_form(request, cancel).await?;
                self.upload_buffered_compressed(file, cancel).await
            }
            UploadRoute::BufferedStreamCompressed => {
                let file = self.read_form(request, cancel).await?;
                self.upload_buffered_stream_compressed(file, cancel).await
            }
            UploadRoute::Direct => {
                let mut reader = StreamReader::new(request.body);
                self.upload_direct(request.file_name, request.content_type, &mut reader, cancel)
                    .await
            }
            UploadRoute::MultipartPassthrough => {
                self.upload_multipart(request.body, request.content_type.as_deref(), cancel)
                    .await
            }
        }
    }

    async fn read_form(
        &self,
        request: UploadRequest,
        cancel: &CancellationToken,
    ) -> Result<Option<FormFile>, UploadError> {
        let boundary = form::boundary(request.content_type.as_deref())?;
        let limits = FormLimits {
            max_file_size: self.settings.max_buffered_size,
            memory_threshold: self.settings.memory_threshold,
            spool_dir: self.settings.spool_dir.clone(),
        };
        form::read_form_file(request.body, boundary, &limits, cancel).await
    }

    /// Sniff, then store with a single put streamed from memory or disk.
    pub async fn upload_buffered(
        &self,
        file: Option<FormFile>,
        cancel: &CancellationToken,
    ) -> Result<UploadDescriptor, UploadError> {
        let PreparedUpload {
            mut stream,
            mime,
            object_name,
            original_file_name,
            size,
        } = prepare(file, self.settings.max_buffered_size).await?;

        let attributes = ObjectAttributes::new(mime.as_str());
        let result = self
            .put
            .upload_stream(&object_name, &mut stream, size, &attributes, cancel)
            .await?;

        Ok(self.descriptor(original_file_name, object_name, result.bytes_written, mime))
    }

    /// Sniff, gzip into memory, then store with a single put.
    pub async fn upload_buffered_compressed(
        &self,
        file: Option<FormFile>,
        cancel: &CancellationToken,
    ) -> Result<UploadDescriptor, UploadError> {
        let PreparedUpload {
            mut stream,
            mime,
            object_name,
            original_file_name,
            ..
        } = prepare(file, self.settings.max_buffered_size).await?;

        let payload =
            compress_to_memory(&mut stream, self.settings.copy_buffer_size, cancel).await?;
        drop(stream);

        let object_name = compressed_object_name(&object_name);
        let attributes = gzip_attributes(&mime, &original_file_name);
        self.put
            .upload(&object_name, payload.bytes.into(), &attributes, cancel)
            .await?;

        Ok(self.descriptor(original_file_name, object_name, payload.original_size, mime))
    }

    /// Sniff, then gzip and multipart-upload concurrently through a bounded pipe.
    pub async fn upload_buffered_stream_compressed(
        &self,
        file: Option<FormFile>,
        cancel: &CancellationToken,
    ) -> Result<UploadDescriptor, UploadError> {
        let PreparedUpload {
            stream,
            mime,
            object_name,
            original_file_name,
            ..
        } = prepare(file, self.settings.max_buffered_size).await?;

        let object_name = compressed_object_name(&object_name);
        let attributes = gzip_attributes(&mime, &original_file_name);
        let outcome = upload_compressed_stream(
            stream,
            self.multipart.clone(),
            object_name.clone(),
            attributes,
            self.settings.pipe_capacity,
            self.settings.copy_buffer_size,
            cancel,
        )
        .await?;

        Ok(self.descriptor(
            original_file_name,
            object_name,
            outcome.original_size,
            mime,
        ))
    }

    /// Stream a raw body straight to a multipart upload.
    ///
    /// Nothing is sniffed: the extension comes from `file_name` and the
    /// content type from `content_type`.
    pub async fn upload_direct<R>(
        &self,
        file_name: Option<String>,
        content_type: Option<String>,
        reader: &mut R,
        cancel: &CancellationToken,
    ) -> Result<UploadDescriptor, UploadError>
    where
        R: AsyncRead + Unpin + Send + ?Sized,
    {
        let file_name = file_name
            .filter(|name| !name.trim().is_empty())
            .ok_or(UploadError::MissingFileName)?;
        let content_type = content_type
            .filter(|ct| !ct.trim().is_empty())
            .unwrap_or_else(|| FALLBACK_MIME.to_string());

        let object_name = generate_object_name(extension_of(&file_name));
        let attributes = ObjectAttributes::new(content_type.as_str());
        let result = self
            .multipart
            .upload(&object_name, reader, &attributes, Some(&log_progress), cancel)
            .await?;

        Ok(self.descriptor(file_name, object_name, result.bytes_written, content_type))
    }

    /// Stream the first file section of a multipart body to a multipart upload.
    pub async fn upload_multipart(
        &self,
        body: BodyStream,
        content_type: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<UploadDescriptor, UploadError> {
        let boundary = form::boundary(content_type)?;
        let section = form::first_file_section(body, boundary, cancel)
            .await?
            .ok_or(UploadError::NoFile)?;

        let mime = section
            .content_type
            .unwrap_or_else(|| FALLBACK_MIME.to_string());
        let object_name = generate_object_name(extension_of(&section.file_name));
        let attributes = ObjectAttributes::new(mime.as_str());

        let mut reader = StreamReader::new(section.body);
        let result = self
            .multipart
            .upload(&object_name, &mut reader, &attributes, Some(&log_progress), cancel)
            .await
            .map_err(|e| match e {
                UploadError::SourceError(io) if io.kind() == io::ErrorKind::InvalidData => {
                    UploadError::MalformedMultipart(io.to_string())
                }
                other => other,
            })?;

        Ok(self.descriptor(section.file_name, object_name, result.bytes_written, mime))
    }

    fn descriptor(
        &self,
        original_file_name: String,
        stored_object_name: String,
        size_bytes: u64,
        content_type: String,
    ) -> UploadDescriptor {
        UploadDescriptor {
            storage_path: format!("{}/{}", self.store.bucket(), stored_object_name),
            original_file_name,
            stored_object_name,
            size_bytes,
            content_type,
            uploaded_at_utc: Utc::now(),
        }
    }
}
