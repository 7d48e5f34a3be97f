//! Form body parsing
//!
//! Reads `multipart/form-data` bodies with `multer`. The buffered routes
//! collect the first file field into a [`FormFile`] (memory first, spooled to
//! disk past a threshold); the passthrough route instead streams the first
//! file field straight through.

use super::source::FormFile;
use super::temp_file::SpoolFile;
use super::UploadError;
use bytes::{Bytes, BytesMut};
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use std::io;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

/// Request body as a stream of chunks
pub type BodyStream = BoxStream<'static, io::Result<Bytes>>;

/// Limits applied while collecting a form file
#[derive(Debug, Clone)]
pub struct FormLimits {
    pub max_file_size: u64,
    /// Bytes kept in memory before spooling to disk
    pub memory_threshold: usize,
    pub spool_dir: Option<PathBuf>,
}

/// A file field being streamed out of a multipart body
pub struct FileSection {
    pub file_name: String,
    pub content_type: Option<String>,
    pub body: BodyStream,
}

/// Extract the multipart boundary from a `Content-Type` header value
pub fn boundary(content_type: Option<&str>) -> Result<String, UploadError> {
    let content_type = content_type.ok_or(UploadError::MissingBoundary)?;
    multer::parse_boundary(content_type).map_err(|_| UploadError::MissingBoundary)
}

/// Convert a multer failure, keeping the I/O error of a failed body read.
pub(crate) fn form_error(error: multer::Error) -> UploadError {
    match error {
        multer::Error::StreamReadFailed(inner) => match inner.downcast::<io::Error>() {
            Ok(io_error) => UploadError::from(*io_error),
            Err(other) => UploadError::SourceError(io::Error::other(other)),
        },
        other => UploadError::MalformedMultipart(other.to_string()),
    }
}

fn form_io_error(error: multer::Error) -> io::Error {
    match error {
        multer::Error::StreamReadFailed(inner) => match inner.downcast::<io::Error>() {
            Ok(io_error) => *io_error,
            Err(other) => io::Error::other(other),
        },
        other => io::Error::new(io::ErrorKind::InvalidData, other.to_string()),
    }
}

/// Collect the first file field of a form body.
///
/// Returns `Ok(None)` when the form has no file field. Fields without a
/// filename are skipped.
pub async fn read_form_file(
    body: BodyStream,
    boundary: String,
    limits: &FormLimits,
    cancel: &CancellationToken,
) -> Result<Option<FormFile>, UploadError> {
    let mut multipart = multer::Multipart::new(body, boundary);

    loop {
        let field = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(UploadError::Cancelled),
            field = multipart.next_field() => field.map_err(form_error)?,
        };
        let Some(mut field) = field else {
            return Ok(None);
        };

        let Some(file_name) = field.file_name().map(str::to_string) else {
            tracing::debug!(field = ?field.name(), "Skipping non-file form field");
            continue;
        };
        let content_type = field.content_type().map(|m| m.to_string());

        let mut memory = BytesMut::new();
        let mut spool: Option<SpoolFile> = None;
        let mut size = 0u64;

        loop {
            let chunk = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(UploadError::Cancelled),
                chunk = field.chunk() => chunk.map_err(form_error)?,
            };
            let Some(chunk) = chunk else {
                break;
            };

            size += chunk.len() as u64;
            if size > limits.max_file_size {
                return Err(UploadError::TooLarge {
                    size,
                    limit: limits.max_file_size,
                });
            }

            if spool.is_none() && memory.len() + chunk.len() > limits.memory_threshold {
                let mut file = SpoolFile::create(limits.spool_dir.as_deref()).await?;
                file.write(&memory).await?;
                tracing::debug!(
                    path = %file.path().display(),
                    file_name = %file_name,
                    "Spooling form file to disk"
                );
                memory = BytesMut::new();
                spool = Some(file);
            }

            match spool.as_mut() {
                Some(file) => file.write(&chunk).await?,
                None => memory.extend_from_slice(&chunk),
            }
        }

        let file = match spool {
            Some(spooled) => FormFile::from_spool(file_name, content_type, spooled),
            None => FormFile::from_bytes(file_name, content_type, memory.freeze()),
        };
        return Ok(Some(file));
    }
}

/// Find the first file field of a multipart body and hand back its content
/// as a stream, without buffering it.
///
/// Returns `Ok(None)` when the body has no file field.
pub async fn first_file_section(
    body: BodyStream,
    boundary: String,
    cancel: &CancellationToken,
) -> Result<Option<FileSection>, UploadError> {
    let mut multipart = multer::Multipart::new(body, boundary);

    loop {
        let field = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(UploadError::Cancelled),
            field = multipart.next_field() => field.map_err(form_error)?,
        };
        let Some(field) = field else {
            return Ok(None);
        };

        match field.file_name().map(str::to_string) {
            Some(file_name) => {
                let content_type = field.content_type().map(|m| m.to_string());
                return Ok(Some(FileSection {
                    file_name,
                    content_type,
                    body: field.map_err(form_io_error).boxed(),
                }));
            }
            None => {
                tracing::debug!(field = ?field.name(), "Skipping non-file section");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    const BOUNDARY: &str = "X-TEST-BOUNDARY";

    fn form_body(parts: &[(&str, Option<&str>, &[u8])]) -> BodyStream {
        let mut body = Vec::new();
        for (name, file_name, data) in parts {
            body.extend_from_slice(format!("--{}\r\n", BOUNDARY).as_bytes());
            match file_name {
                Some(file_name) => body.extend_from_slice(
                    format!(
                        "Content-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\n\
                         Content-Type: application/octet-stream\r\n\r\n",
                        name, file_name
                    )
                    .as_bytes(),
                ),
                None => body.extend_from_slice(
                    format!("Content-Disposition: form-data; name=\"{}\"\r\n\r\n", name)
                        .as_bytes(),
                ),
            }
            body.extend_from_slice(data);
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(format!("--{}--\r\n", BOUNDARY).as_bytes());

        // Split into small chunks to exercise reassembly
        let chunks: Vec<io::Result<Bytes>> = body
            .chunks(7)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        futures::stream::iter(chunks).boxed()
    }

    fn limits(memory_threshold: usize) -> FormLimits {
        FormLimits {
            max_file_size: 1024,
            memory_threshold,
            spool_dir: None,
        }
    }

    #[test]
    fn test_boundary_parsing() {
        assert_eq!(
            boundary(Some("multipart/form-data; boundary=abc")).unwrap(),
            "abc"
        );
        assert!(matches!(
            boundary(Some("application/json")),
            Err(UploadError::MissingBoundary)
        ));
        assert!(matches!(boundary(None), Err(UploadError::MissingBoundary)));
    }

    #[tokio::test]
    async fn test_reads_file_after_plain_field() {
        let body = form_body(&[
            ("note", None, b"ignore me"),
            ("file", Some("a.txt"), b"file content"),
        ]);

        let file = read_form_file(body, BOUNDARY.into(), &limits(1024), &CancellationToken::new())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(file.file_name(), "a.txt");
        assert_eq!(file.len(), 12);

        let mut out = Vec::new();
        file.open().await.unwrap().read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"file content");
    }

    #[tokio::test]
    async fn test_large_file_is_spooled_and_seekable() {
        let data = vec![b'z'; 500];
        let body = form_body(&[("file", Some("big.bin"), &data)]);

        let file = read_form_file(body, BOUNDARY.into(), &limits(64), &CancellationToken::new())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(file.len(), 500);

        let mut stream = file.open().await.unwrap();
        assert!(stream.can_seek());
        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, data);
    }

    #[tokio::test]
    async fn test_no_file_field() {
        let body = form_body(&[("note", None, b"just text")]);
        let file = read_form_file(body, BOUNDARY.into(), &limits(64), &CancellationToken::new())
            .await
            .unwrap();
        assert!(file.is_none());
    }

    #[tokio::test]
    async fn test_oversized_file_rejected() {
        let data = vec![0u8; 2000];
        let body = form_body(&[("file", Some("big.bin"), &data)]);
        let result =
            read_form_file(body, BOUNDARY.into(), &limits(64), &CancellationToken::new()).await;
        assert!(matches!(result, Err(UploadError::TooLarge { .. })));
    }

    #[tokio::test]
    async fn test_disconnect_is_cancellation() {
        let chunks: Vec<io::Result<Bytes>> = vec![
            Ok(Bytes::from(format!(
                "--{}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"a\"\r\n\r\nabc",
                BOUNDARY
            ))),
            Err(io::Error::new(io::ErrorKind::ConnectionAborted, "client gone")),
        ];
        let body = futures::stream::iter(chunks).boxed();

        let result =
            read_form_file(body, BOUNDARY.into(), &limits(64), &CancellationToken::new()).await;
        assert!(matches!(result, Err(UploadError::Cancelled)));
    }

    #[tokio::test]
    async fn test_first_file_section_streams_content() {
        let body = form_body(&[
            ("note", None, b"skip"),
            ("upload", Some("data.csv"), b"a,b\n1,2\n"),
        ]);

        let section = first_file_section(body, BOUNDARY.into(), &CancellationToken::new())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(section.file_name, "data.csv");

        let mut reader = tokio_util::io::StreamReader::new(section.body);
        let mut out = String::new();
        reader.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "a,b\n1,2\n");
    }
}
