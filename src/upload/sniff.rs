//! Content sniffing
//!
//! Detects a file's real type from its leading bytes. The client-declared
//! content type and file name are never consulted.

use super::source::UploadStream;
use super::UploadError;
use std::io::SeekFrom;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

/// Bytes inspected when sniffing
pub const SNIFF_WINDOW: usize = 8192;

pub const FALLBACK_EXTENSION: &str = "bin";
pub const FALLBACK_MIME: &str = "application/octet-stream";

/// Detected content type
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentKind {
    /// Extension without a leading dot
    pub extension: String,
    pub mime: String,
}

impl ContentKind {
    pub fn fallback() -> Self {
        Self {
            extension: FALLBACK_EXTENSION.to_string(),
            mime: FALLBACK_MIME.to_string(),
        }
    }
}

/// Classify a header window of bytes
pub fn sniff_bytes(header: &[u8]) -> ContentKind {
    match infer::get(header) {
        Some(kind) => ContentKind {
            extension: kind.extension().to_string(),
            mime: kind.mime_type().to_string(),
        },
        None => ContentKind::fallback(),
    }
}

/// Detect the content type of a seekable stream.
///
/// Reads up to [`SNIFF_WINDOW`] bytes from the start and leaves the stream
/// positioned at the start again. Sequential streams are rejected with
/// [`UploadError::NotSeekable`].
pub async fn sniff(stream: &mut UploadStream) -> Result<ContentKind, UploadError> {
    let source = stream.as_seekable().ok_or(UploadError::NotSeekable)?;

    source.seek(SeekFrom::Start(0)).await?;

    let mut header = vec![0u8; SNIFF_WINDOW];
    let mut filled = 0;
    while filled < header.len() {
        let n = source.read(&mut header[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }

    source.seek(SeekFrom::Start(0)).await?;

    let kind = sniff_bytes(&header[..filled]);
    tracing::debug!(
        extension = %kind.extension,
        mime = %kind.mime,
        inspected = filled,
        "Sniffed content type"
    );
    Ok(kind)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::io::Cursor;

    #[test]
    fn test_png_signature() {
        let png = [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0, 0, 0, 0x0D];
        let kind = sniff_bytes(&png);
        assert_eq!(kind.extension, "png");
        assert_eq!(kind.mime, "image/png");
    }

    #[test]
    fn test_unknown_bytes_fall_back() {
        assert_eq!(sniff_bytes(b"just some words"), ContentKind::fallback());
        assert_eq!(sniff_bytes(&[]), ContentKind::fallback());
    }

    #[tokio::test]
    async fn test_sniff_rewinds_stream() {
        let data = Bytes::from_static(b"%PDF-1.7\nrest of the document");
        let mut stream = UploadStream::seekable(Cursor::new(data.clone()));

        let kind = sniff(&mut stream).await.unwrap();
        assert_eq!(kind.mime, "application/pdf");
        assert_eq!(kind.extension, "pdf");

        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, data);
    }

    #[tokio::test]
    async fn test_sequential_stream_rejected() {
        let mut stream = UploadStream::sequential(&b"%PDF-"[..]);
        assert!(matches!(
            sniff(&mut stream).await,
            Err(UploadError::NotSeekable)
        ));
    }
}
