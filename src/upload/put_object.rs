//! Single-put uploader
//!
//! Sends content of known length to the store in one PutObject request.
//! Used by the buffered routes. Content small enough for the memory
//! threshold is sent from memory; anything larger goes out from a spool
//! file so the request body is never materialized.

use super::source::UploadStream;
use super::temp_file::{SpoolFile, SpoolReader};
use super::{UploadError, UploadResult};
use crate::s3::{ObjectAttributes, ObjectBody, ObjectStore};
use bytes::{Bytes, BytesMut};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::sync::CancellationToken;

/// Default size above which content is sent from disk
const DEFAULT_MEMORY_THRESHOLD: usize = 64 * 1024;

/// Uploads a whole object with one request
#[derive(Clone)]
pub struct PutObjectUploader {
    store: Arc<dyn ObjectStore>,
    memory_threshold: usize,
    spool_dir: Option<PathBuf>,
}

impl PutObjectUploader {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self {
            store,
            memory_threshold: DEFAULT_MEMORY_THRESHOLD,
            spool_dir: None,
        }
    }

    /// Send streams larger than `memory_threshold` from a spool file in `spool_dir`
    pub fn with_spooling(mut self, memory_threshold: usize, spool_dir: Option<PathBuf>) -> Self {
        self.memory_threshold = memory_threshold;
        self.spool_dir = spool_dir;
        self
    }

    /// Upload `body` as `key`.
    #[tracing::instrument(
        name = "upload.put_object",
        skip(self, body, attributes, cancel),
        fields(
            s3.bucket = %self.store.bucket(),
            s3.key = %key,
            http.content_type = %attributes.content_type,
            upload.bytes = body.len(),
            upload.from_disk = matches!(body, ObjectBody::File { .. }),
            s3.etag = tracing::field::Empty
        )
    )]
    pub async fn upload(
        &self,
        key: &str,
        body: ObjectBody,
        attributes: &ObjectAttributes,
        cancel: &CancellationToken,
    ) -> Result<UploadResult, UploadError> {
        let bytes_written = body.len();
        let start_time = Instant::now();

        let output = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(UploadError::Cancelled),
            output = self.store.put_object(key, body, attributes) => output?,
        };

        if let Some(etag) = &output.etag {
            tracing::Span::current().record("s3.etag", etag.as_str());
        }
        tracing::info!(
            bytes_written,
            duration_ms = start_time.elapsed().as_millis(),
            "PutObject upload completed"
        );

        Ok(UploadResult {
            etag: output.etag,
            bytes_written,
            parts: 1,
        })
    }

    /// Upload the rest of `stream`, `size` bytes, as `key`.
    ///
    /// A spooled stream is sent straight from its file. Other streams are
    /// read into memory when `size` fits the memory threshold and spooled
    /// to disk first otherwise. The stream is left open.
    pub async fn upload_stream(
        &self,
        key: &str,
        stream: &mut UploadStream,
        size: u64,
        attributes: &ObjectAttributes,
        cancel: &CancellationToken,
    ) -> Result<UploadResult, UploadError> {
        if let Some(spooled) = stream.spool() {
            let body = file_body(spooled, size)?;
            return self.upload(key, body, attributes, cancel).await;
        }

        if size <= self.memory_threshold as u64 {
            let body = read_to_bytes(stream, size, cancel).await?;
            return self.upload(key, body.into(), attributes, cancel).await;
        }

        let spooled = spool(stream, self.spool_dir.as_deref(), cancel).await?;
        tracing::debug!(
            path = %spooled.path().display(),
            size = spooled.size(),
            "Spooled upload stream before put"
        );
        let body = file_body(&spooled, spooled.size())?;
        self.upload(key, body, attributes, cancel).await
    }
}

fn file_body(spooled: &SpoolReader, size: u64) -> Result<ObjectBody, UploadError> {
    if spooled.size() != size {
        return Err(UploadError::Internal(format!(
            "spool file holds {} bytes, expected {}",
            spooled.size(),
            size
        )));
    }
    Ok(ObjectBody::File {
        path: spooled.path().to_path_buf(),
        length: size,
    })
}

async fn read_to_bytes<R>(
    reader: &mut R,
    size_hint: u64,
    cancel: &CancellationToken,
) -> Result<Bytes, UploadError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut buf = BytesMut::with_capacity(usize::try_from(size_hint).unwrap_or(0));
    loop {
        let n = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(UploadError::Cancelled),
            read = reader.read_buf(&mut buf) => read?,
        };
        if n == 0 {
            return Ok(buf.freeze());
        }
    }
}

async fn spool<R>(
    reader: &mut R,
    dir: Option<&Path>,
    cancel: &CancellationToken,
) -> Result<SpoolReader, UploadError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut file = SpoolFile::create(dir).await?;
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(UploadError::Cancelled),
            read = reader.read(&mut buf) => read?,
        };
        if n == 0 {
            return Ok(file.into_reader().await?);
        }
        file.write(&buf[..n]).await?;
    }
}
