//! Disk spooling for buffered form uploads
//!
//! Form files that outgrow the in-memory threshold are written to a
//! temporary file so the buffered routes can still seek over them (content
//! sniffing rewinds) without holding the whole file in memory.
//!
//! # Flow
//!
//! 1. Incoming chunks are appended with [`SpoolFile::write`]
//! 2. [`SpoolFile::into_reader`] reopens the file for reading and seeking
//! 3. The file is deleted when the last owner is dropped (RAII)

use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncSeek, AsyncWriteExt, ReadBuf};

/// Temporary file holding a spooled upload
///
/// Automatically removed when dropped.
pub struct SpoolFile {
    path: PathBuf,
    file: Option<File>,
    size: u64,
}

impl SpoolFile {
    /// Create an empty spool file in `dir` (or the system temp dir)
    pub async fn create(dir: Option<&Path>) -> io::Result<Self> {
        let dir = dir
            .map(Path::to_path_buf)
            .unwrap_or_else(std::env::temp_dir);
        let path = dir.join(format!("upload-gateway-{}.spool", uuid::Uuid::new_v4()));
        let file = File::create(&path).await?;

        Ok(Self {
            path,
            file: Some(file),
            size: 0,
        })
    }

    /// Get the path to the spool file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bytes written so far
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Append a chunk
    pub async fn write(&mut self, chunk: &[u8]) -> io::Result<()> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| io::Error::other("spool file is closed for writing"))?;
        file.write_all(chunk).await?;
        self.size += chunk.len() as u64;
        Ok(())
    }

    /// Flush and reopen the file for reading from the start
    pub async fn into_reader(mut self) -> io::Result<SpoolReader> {
        if let Some(mut file) = self.file.take() {
            file.flush().await?;
        }
        let file = File::open(&self.path).await?;
        Ok(SpoolReader { file, spool: self })
    }
}

impl Drop for SpoolFile {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != io::ErrorKind::NotFound {
                tracing::warn!(
                    path = %self.path.display(),
                    error = %e,
                    "Failed to clean up spool file"
                );
            }
        }
    }
}

/// Seekable reader over a spooled upload; keeps the file alive while open
pub struct SpoolReader {
    file: File,
    spool: SpoolFile,
}

impl SpoolReader {
    pub fn size(&self) -> u64 {
        self.spool.size()
    }

    pub fn path(&self) -> &Path {
        self.spool.path()
    }
}

impl AsyncRead for SpoolReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().file).poll_read(cx, buf)
    }
}

impl AsyncSeek for SpoolReader {
    fn start_seek(self: Pin<&mut Self>, position: SeekFrom) -> io::Result<()> {
        Pin::new(&mut self.get_mut().file).start_seek(position)
    }

    fn poll_complete(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<u64>> {
        Pin::new(&mut self.get_mut().file).poll_complete(cx)
    }
}
