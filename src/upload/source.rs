//! Upload sources
//!
//! [`FormFile`] is a file received through a form upload; [`UploadStream`]
//! is the stream opened over it. Whether the stream can seek is decided at
//! runtime, because the buffered routes must rewind after sniffing while the
//! streaming routes never need to.

use super::temp_file::{SpoolFile, SpoolReader};
use bytes::Bytes;
use std::io::{self, Cursor};
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncSeek, ReadBuf};

/// A readable, seekable byte source
pub trait SeekableSource: AsyncRead + AsyncSeek + Unpin + Send {}

impl<T> SeekableSource for T where T: AsyncRead + AsyncSeek + Unpin + Send {}

/// An open upload stream
pub enum UploadStream {
    /// A form file spooled to disk
    Spooled(SpoolReader),
    Seekable(Box<dyn SeekableSource>),
    Sequential(Box<dyn AsyncRead + Unpin + Send>),
}

impl UploadStream {
    pub fn seekable<S: SeekableSource + 'static>(source: S) -> Self {
        UploadStream::Seekable(Box::new(source))
    }

    pub fn sequential<R: AsyncRead + Unpin + Send + 'static>(reader: R) -> Self {
        UploadStream::Sequential(Box::new(reader))
    }

    pub fn can_seek(&self) -> bool {
        !matches!(self, UploadStream::Sequential(_))
    }

    pub fn as_seekable(&mut self) -> Option<&mut (dyn SeekableSource + 'static)> {
        match self {
            UploadStream::Spooled(reader) => Some(reader),
            UploadStream::Seekable(source) => Some(source.as_mut()),
            UploadStream::Sequential(_) => None,
        }
    }

    /// The spool file behind this stream, if the content lives on disk
    pub fn spool(&self) -> Option<&SpoolReader> {
        match self {
            UploadStream::Spooled(reader) => Some(reader),
            _ => None,
        }
    }
}

impl std::fmt::Debug for UploadStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UploadStream::Spooled(reader) => f
                .debug_tuple("UploadStream::Spooled")
                .field(&reader.path())
                .finish(),
            UploadStream::Seekable(_) => f.write_str("UploadStream::Seekable"),
            UploadStream::Sequential(_) => f.write_str("UploadStream::Sequential"),
        }
    }
}

impl AsyncRead for UploadStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            UploadStream::Spooled(reader) => Pin::new(reader).poll_read(cx, buf),
            UploadStream::Seekable(source) => Pin::new(source).poll_read(cx, buf),
            UploadStream::Sequential(reader) => Pin::new(reader).poll_read(cx, buf),
        }
    }
}

enum FileBody {
    Memory(Bytes),
    Spooled(SpoolFile),
    Stream(UploadStream),
}

/// A file received as part of a form upload
pub struct FormFile {
    file_name: String,
    content_type: Option<String>,
    length: u64,
    body: FileBody,
}

impl FormFile {
    /// File held in memory
    pub fn from_bytes(
        file_name: impl Into<String>,
        content_type: Option<String>,
        data: impl Into<Bytes>,
    ) -> Self {
        let data = data.into();
        Self {
            file_name: file_name.into(),
            content_type,
            length: data.len() as u64,
            body: FileBody::Memory(data),
        }
    }

    /// File already spooled to disk
    pub fn from_spool(
        file_name: impl Into<String>,
        content_type: Option<String>,
        spool: SpoolFile,
    ) -> Self {
        Self {
            file_name: file_name.into(),
            content_type,
            length: spool.size(),
            body: FileBody::Spooled(spool),
        }
    }

    /// File backed by an arbitrary stream of the declared length
    pub fn from_stream(
        file_name: impl Into<String>,
        content_type: Option<String>,
        length: u64,
        stream: UploadStream,
    ) -> Self {
        Self {
            file_name: file_name.into(),
            content_type,
            length,
            body: FileBody::Stream(stream),
        }
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    /// Content type claimed by the client; never trusted for storage
    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    pub fn len(&self) -> u64 {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Open the file's content stream, transferring ownership to the caller
    pub async fn open(self) -> io::Result<UploadStream> {
        match self.body {
            FileBody::Memory(data) => Ok(UploadStream::seekable(Cursor::new(data))),
            FileBody::Spooled(spool) => Ok(UploadStream::Spooled(spool.into_reader().await?)),
            FileBody::Stream(stream) => Ok(stream),
        }
    }
}

impl std::fmt::Debug for FormFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FormFile")
            .field("file_name", &self.file_name)
            .field("content_type", &self.content_type)
            .field("length", &self.length)
            .finish_non_exhaustive()
    }
}
