//! Gzip compression stage
//!
//! Two ways of compressing an upload before it reaches the store:
//!
//! - [`compress_to_memory`] reads the whole source through the encoder and
//!   returns the compressed bytes, ready for a single put. Memory cost is the
//!   compressed size.
//! - [`upload_compressed_stream`] runs the encoder and the multipart uploader
//!   as two concurrent tasks joined by a bounded [`pipe`](super::pipe). Peak
//!   memory is the pipe capacity plus one part buffer, whatever the file size.
//!
//! Deflate runs on the blocking pool one buffer at a time, never on the
//! async worker.
//!
//! Compressed objects get a `.gz` suffix, `Content-Encoding: gzip` and the
//! original content type and file name as user metadata.

use super::multipart::MultipartUploader;
use super::pipe::{self, PipeError, PipeWriter};
use super::{UploadError, UploadResult};
use crate::metrics;
use crate::s3::ObjectAttributes;
use bytes::Bytes;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::Write;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, Instrument};

pub const GZIP_SUFFIX: &str = ".gz";
pub const GZIP_CONTENT_TYPE: &str = "application/gzip";
pub const GZIP_ENCODING: &str = "gzip";
pub const ORIGINAL_CONTENT_TYPE_KEY: &str = "original-content-type";
pub const ORIGINAL_NAME_KEY: &str = "original-name";

/// Object name of the compressed copy of `object_name`
pub fn compressed_object_name(object_name: &str) -> String {
    format!("{}{}", object_name, GZIP_SUFFIX)
}

/// Store attributes for a gzip object whose content was `original_mime`
pub fn gzip_attributes(original_mime: &str, original_name: &str) -> ObjectAttributes {
    ObjectAttributes::new(GZIP_CONTENT_TYPE)
        .with_encoding(GZIP_ENCODING)
        .with_metadata(ORIGINAL_CONTENT_TYPE_KEY, original_mime)
        .with_metadata(ORIGINAL_NAME_KEY, header_safe(original_name))
}

/// User metadata travels as HTTP headers: printable ASCII only.
fn header_safe(value: &str) -> String {
    value
        .chars()
        .map(|c| if c.is_ascii_graphic() || c == ' ' { c } else { '_' })
        .collect()
}

/// Fully materialized gzip output
#[derive(Debug, Clone)]
pub struct CompressedPayload {
    pub bytes: Bytes,
    /// Bytes read from the source
    pub original_size: u64,
}

/// Outcome of [`upload_compressed_stream`]
#[derive(Debug, Clone)]
pub struct CompressedUpload {
    pub result: UploadResult,
    /// Bytes read from the source
    pub original_size: u64,
}

type Encoder = GzEncoder<Vec<u8>>;

/// Deflate `buf[..len]` on the blocking pool, handing encoder and buffer back.
async fn deflate(
    mut encoder: Encoder,
    buf: Vec<u8>,
    len: usize,
) -> Result<(Encoder, Vec<u8>), UploadError> {
    let written = tokio::task::spawn_blocking(move || {
        encoder.write_all(&buf[..len])?;
        Ok::<_, std::io::Error>((encoder, buf))
    })
    .await
    .map_err(|e| UploadError::Internal(format!("compression task failed: {}", e)))?;
    Ok(written?)
}

async fn read_chunk<R>(
    reader: &mut R,
    buf: &mut [u8],
    cancel: &CancellationToken,
) -> Result<usize, UploadError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(UploadError::Cancelled),
        read = reader.read(buf) => Ok(read?),
    }
}

/// Compress everything `reader` yields into memory.
pub async fn compress_to_memory<R>(
    reader: &mut R,
    buffer_size: usize,
    cancel: &CancellationToken,
) -> Result<CompressedPayload, UploadError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut buf = vec![0u8; buffer_size.max(1)];
    let mut original_size = 0u64;

    loop {
        let n = read_chunk(reader, &mut buf, cancel).await?;
        if n == 0 {
            break;
        }
        (encoder, buf) = deflate(encoder, buf, n).await?;
        original_size += n as u64;
    }

    let bytes = Bytes::from(encoder.finish()?);
    metrics::record_compression(original_size, bytes.len() as u64);
    debug!(
        original_size,
        compressed_size = bytes.len(),
        "Compressed upload in memory"
    );

    Ok(CompressedPayload {
        bytes,
        original_size,
    })
}

/// Compress `source` into the write end of a pipe.
///
/// The writer is always completed exactly once: cleanly on success, with a
/// [`PipeError::Producer`] otherwise. Returns the number of source bytes read.
pub async fn compress_into_pipe<R>(
    source: &mut R,
    mut writer: PipeWriter,
    buffer_size: usize,
    cancel: &CancellationToken,
) -> Result<u64, UploadError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let outcome = pump(source, &mut writer, buffer_size, cancel).await;
    match &outcome {
        Ok(_) => writer.complete(Ok(())),
        Err(e) => writer.complete(Err(PipeError::Producer(e.to_string()))),
    }
    outcome
}

async fn pump<R>(
    source: &mut R,
    writer: &mut PipeWriter,
    buffer_size: usize,
    cancel: &CancellationToken,
) -> Result<u64, UploadError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut encoder = GzEncoder::new(Vec::with_capacity(buffer_size), Compression::default());
    let mut buf = vec![0u8; buffer_size.max(1)];
    let mut original_size = 0u64;
    let mut compressed_size = 0u64;

    loop {
        let n = read_chunk(source, &mut buf, cancel).await?;
        if n == 0 {
            break;
        }
        (encoder, buf) = deflate(encoder, buf, n).await?;
        original_size += n as u64;

        let out = std::mem::take(encoder.get_mut());
        if !out.is_empty() {
            compressed_size += out.len() as u64;
            send(writer, Bytes::from(out), cancel).await?;
        }
    }

    let tail = encoder.finish()?;
    compressed_size += tail.len() as u64;
    send(writer, Bytes::from(tail), cancel).await?;

    metrics::record_compression(original_size, compressed_size);
    Ok(original_size)
}

async fn send(
    writer: &mut PipeWriter,
    data: Bytes,
    cancel: &CancellationToken,
) -> Result<(), UploadError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(UploadError::Cancelled),
        sent = writer.write(data) => Ok(sent?),
    }
}

/// Compress `source` and upload it as `key` through a bounded pipe.
///
/// Spawns a producer (read + gzip) and a consumer (multipart upload). When
/// either fails the other is cancelled; both have terminated before this
/// returns. Cancelling `cancel` stops both and aborts the multipart upload.
pub async fn upload_compressed_stream<R>(
    source: R,
    uploader: MultipartUploader,
    key: String,
    attributes: ObjectAttributes,
    pipe_capacity: usize,
    buffer_size: usize,
    cancel: &CancellationToken,
) -> Result<CompressedUpload, UploadError>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let (writer, mut reader) = pipe::channel(pipe_capacity);
    let scope = cancel.child_token();
    // Stops both tasks if this future is dropped before they are joined
    let _guard = scope.clone().drop_guard();

    let producer_token = scope.clone();
    let producer = tokio::spawn(
        async move {
            let mut source = source;
            let outcome =
                compress_into_pipe(&mut source, writer, buffer_size, &producer_token).await;
            if outcome.is_err() {
                producer_token.cancel();
            }
            outcome
        }
        .instrument(tracing::debug_span!("upload.compress")),
    );

    let consumer_token = scope.clone();
    let consumer = tokio::spawn(
        async move {
            let progress = |p: super::multipart::UploadProgress| {
                debug!(
                    bytes = p.bytes_transferred,
                    parts = p.parts_completed,
                    "Compressed upload progress"
                );
            };
            let outcome = uploader
                .upload(&key, &mut reader, &attributes, Some(&progress), &consumer_token)
                .await;
            match &outcome {
                Ok(_) => reader.complete(Ok(())),
                Err(e) => {
                    reader.complete(Err(PipeError::Consumer(e.to_string())));
                    consumer_token.cancel();
                }
            }
            outcome
        }
        .instrument(tracing::debug_span!("upload.transfer")),
    );

    let (produced, consumed) = tokio::join!(producer, consumer);

    let produced =
        produced.map_err(|e| UploadError::Internal(format!("compression task failed: {}", e)))?;
    let consumed =
        consumed.map_err(|e| UploadError::Internal(format!("upload task failed: {}", e)))?;

    match (produced, consumed) {
        (Ok(original_size), Ok(result)) => Ok(CompressedUpload {
            result,
            original_size,
        }),
        _ if cancel.is_cancelled() => Err(UploadError::Cancelled),
        (produced, consumed) => Err(root_cause(produced.err(), consumed.err())),
    }
}

/// True for errors one task only sees because the other one failed first.
fn is_induced(error: &UploadError) -> bool {
    matches!(error, UploadError::Cancelled | UploadError::PipeError(_))
}

fn root_cause(producer: Option<UploadError>, consumer: Option<UploadError>) -> UploadError {
    match (producer, consumer) {
        (Some(p), _) if !is_induced(&p) => p,
        (_, Some(c)) if !is_induced(&c) => c,
        (Some(p), _) => p,
        (None, Some(c)) => c,
        (None, None) => UploadError::Internal("compressed upload failed without an error".into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;
    use std::io::Read;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn gunzip(data: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        GzDecoder::new(data).read_to_end(&mut out).unwrap();
        out
    }

    #[tokio::test]
    async fn test_compression_yields_to_other_tasks() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let ticker = {
            let ticks = ticks.clone();
            tokio::spawn(async move {
                loop {
                    ticks.fetch_add(1, Ordering::SeqCst);
                    tokio::task::yield_now().await;
                }
            })
        };

        // A slice reader never yields, so only deflate can let the ticker run
        let data = vec![42u8; 2 * 1024 * 1024];
        let mut reader = data.as_slice();
        let payload = compress_to_memory(&mut reader, 256 * 1024, &CancellationToken::new())
            .await
            .unwrap();
        let ticks_during = ticks.load(Ordering::SeqCst);
        ticker.abort();

        assert!(ticks_during > 0);
        assert_eq!(gunzip(&payload.bytes), data);
    }

    #[test]
    fn test_gzip_naming_and_attributes() {
        assert_eq!(compressed_object_name("abc.txt"), "abc.txt.gz");

        let attrs = gzip_attributes("text/plain", "notes.txt");
        assert_eq!(attrs.content_type, GZIP_CONTENT_TYPE);
        assert_eq!(attrs.content_encoding.as_deref(), Some("gzip"));
        assert_eq!(
            attrs.metadata.get(ORIGINAL_CONTENT_TYPE_KEY).map(String::as_str),
            Some("text/plain")
        );

        let attrs = gzip_attributes("text/plain", "résumé\n.txt");
        assert_eq!(
            attrs.metadata.get(ORIGINAL_NAME_KEY).map(String::as_str),
            Some("r_sum__.txt")
        );
    }

    #[tokio::test]
    async fn test_compress_to_memory_round_trip() {
        let data = "lorem ipsum ".repeat(1000);
        let mut reader = data.as_bytes();

        let payload = compress_to_memory(&mut reader, 128, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(payload.original_size, data.len() as u64);
        assert!(payload.bytes.len() < data.len());
        assert_eq!(gunzip(&payload.bytes), data.as_bytes());
    }

    #[tokio::test]
    async fn test_compress_to_memory_cancelled() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut reader = &b"data"[..];

        assert!(matches!(
            compress_to_memory(&mut reader, 16, &cancel).await,
            Err(UploadError::Cancelled)
        ));
    }

    #[tokio::test]
    async fn test_compress_into_pipe_round_trip() {
        let data = "streaming ".repeat(5000);
        let (writer, mut reader) = pipe::channel(256);
        let source = data.clone();

        let producer = tokio::spawn(async move {
            let mut source = source.as_bytes();
            compress_into_pipe(&mut source, writer, 64, &CancellationToken::new()).await
        });

        let mut compressed = Vec::new();
        reader.read_to_end(&mut compressed).await.unwrap();
        reader.complete(Ok(()));

        assert_eq!(producer.await.unwrap().unwrap(), data.len() as u64);
        assert_eq!(gunzip(&compressed), data.as_bytes());
    }

    #[test]
    fn test_root_cause_prefers_primary_error() {
        let err = root_cause(
            Some(UploadError::PipeError(PipeError::Consumer("x".into()))),
            Some(UploadError::Internal("store".into())),
        );
        assert!(matches!(err, UploadError::Internal(_)));

        let err = root_cause(
            Some(UploadError::Internal("source".into())),
            Some(UploadError::Cancelled),
        );
        assert!(matches!(err, UploadError::Internal(_)));
    }
}
