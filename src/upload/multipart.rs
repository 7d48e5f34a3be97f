//! Multipart uploader
//!
//! Streams content of unknown length to the store in fixed-size parts.
//! Only one part is buffered at a time. Any failure or cancellation aborts
//! the multipart upload so no partial object is left behind.

use super::{UploadError, UploadResult};
use crate::metrics;
use crate::s3::{CompletedPart, ObjectAttributes, ObjectStore};
use bytes::{Bytes, BytesMut};
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::sync::CancellationToken;

/// Maximum parts allowed in one multipart upload
pub const MAX_PARTS: usize = 10000;

/// Progress reported after each uploaded part
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadProgress {
    pub bytes_transferred: u64,
    pub parts_completed: u32,
}

/// Callback receiving [`UploadProgress`]
pub type ProgressFn = dyn Fn(UploadProgress) + Send + Sync;

/// Multipart upload handler
#[derive(Clone)]
pub struct MultipartUploader {
    store: Arc<dyn ObjectStore>,
    part_size: usize,
}

impl MultipartUploader {
    pub fn new(store: Arc<dyn ObjectStore>, part_size: usize) -> Self {
        Self {
            store,
            part_size: part_size.max(1),
        }
    }

    pub fn part_size(&self) -> usize {
        self.part_size
    }

    /// Upload everything `reader` yields as `key`.
    ///
    /// The reader is left open. An empty reader produces an empty object.
    #[tracing::instrument(
        name = "upload.multipart",
        skip(self, reader, attributes, progress, cancel),
        fields(
            s3.bucket = %self.store.bucket(),
            s3.key = %key,
            s3.upload_id = tracing::field::Empty,
            upload.parts = tracing::field::Empty,
            upload.bytes_written = tracing::field::Empty
        )
    )]
    pub async fn upload<R>(
        &self,
        key: &str,
        reader: &mut R,
        attributes: &ObjectAttributes,
        progress: Option<&ProgressFn>,
        cancel: &CancellationToken,
    ) -> Result<UploadResult, UploadError>
    where
        R: AsyncRead + Unpin + Send + ?Sized,
    {
        let start_time = Instant::now();

        let upload_id = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(UploadError::Cancelled),
            created = self.store.create_multipart_upload(key, attributes) => created?,
        };
        tracing::Span::current().record("s3.upload_id", upload_id.as_str());

        match self
            .transfer(key, &upload_id, reader, progress, cancel)
            .await
        {
            Ok(result) => {
                metrics::record_multipart_upload_success(result.parts);

                let span = tracing::Span::current();
                span.record("upload.parts", result.parts);
                span.record("upload.bytes_written", result.bytes_written);

                tracing::info!(
                    upload_id = %upload_id,
                    parts = result.parts,
                    bytes_written = result.bytes_written,
                    duration_ms = start_time.elapsed().as_millis(),
                    "Completed multipart upload"
                );
                Ok(result)
            }
            Err(e) => {
                // Runs even when cancelled, so the store drops the parts
                if let Err(abort_err) = self.store.abort_multipart_upload(key, &upload_id).await {
                    tracing::warn!(
                        upload_id = %upload_id,
                        error = %abort_err,
                        "Failed to abort multipart upload"
                    );
                } else {
                    tracing::debug!(upload_id = %upload_id, "Aborted multipart upload");
                }

                if matches!(e, UploadError::Cancelled) {
                    metrics::record_multipart_upload_aborted();
                } else {
                    metrics::record_multipart_upload_failure();
                }
                Err(e)
            }
        }
    }

    async fn transfer<R>(
        &self,
        key: &str,
        upload_id: &str,
        reader: &mut R,
        progress: Option<&ProgressFn>,
        cancel: &CancellationToken,
    ) -> Result<UploadResult, UploadError>
    where
        R: AsyncRead + Unpin + Send + ?Sized,
    {
        let mut parts: Vec<CompletedPart> = Vec::new();
        let mut bytes_transferred = 0u64;

        loop {
            let body = self.fill_part(reader, cancel).await?;
            let len = body.len();
            // A part is only skipped at the end of a non-empty stream
            if len == 0 && !parts.is_empty() {
                break;
            }
            if parts.len() == MAX_PARTS {
                return Err(UploadError::TooLarge {
                    size: bytes_transferred + len as u64,
                    limit: (self.part_size * MAX_PARTS) as u64,
                });
            }

            let part_number = parts.len() as i32 + 1;
            let part = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(UploadError::Cancelled),
                part = self.store.upload_part(key, upload_id, part_number, body) => part?,
            };
            parts.push(part);
            bytes_transferred += len as u64;

            let update = UploadProgress {
                bytes_transferred,
                parts_completed: parts.len() as u32,
            };
            tracing::debug!(
                part_number,
                bytes_transferred,
                "Uploaded part"
            );
            if let Some(report) = progress {
                report(update);
            }

            if len < self.part_size {
                break;
            }
        }

        if cancel.is_cancelled() {
            return Err(UploadError::Cancelled);
        }

        let part_count = parts.len() as u32;
        let etag = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(UploadError::Cancelled),
            etag = self.store.complete_multipart_upload(key, upload_id, parts) => etag?,
        };

        Ok(UploadResult {
            etag,
            bytes_written: bytes_transferred,
            parts: part_count,
        })
    }

    /// Read until one part is full or the reader is exhausted
    async fn fill_part<R>(&self, reader: &mut R, cancel: &CancellationToken) -> Result<Bytes, UploadError>
    where
        R: AsyncRead + Unpin + Send + ?Sized,
    {
        let mut buf = BytesMut::zeroed(self.part_size);
        let mut filled = 0;

        while filled < self.part_size {
            let n = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(UploadError::Cancelled),
                read = reader.read(&mut buf[filled..]) => read?,
            };
            if n == 0 {
                break;
            }
            filled += n;
        }

        buf.truncate(filled);
        Ok(buf.freeze())
    }
}
