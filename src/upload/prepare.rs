//! Stream preparation for the buffered routes
//!
//! Validates a received form file, opens it, sniffs its real type and
//! assigns the object name it will be stored under.

use super::sniff::sniff;
use super::source::{FormFile, UploadStream};
use super::{generate_object_name, UploadError};

/// A validated upload ready to be transferred
#[derive(Debug)]
pub struct PreparedUpload {
    /// Positioned at the start of the content
    pub stream: UploadStream,
    /// Sniffed content type
    pub mime: String,
    /// `<uuid>.<sniffed extension>`
    pub object_name: String,
    pub original_file_name: String,
    /// Declared length of the file
    pub size: u64,
}

/// Validate and prepare a form file.
pub async fn prepare(file: Option<FormFile>, max_size: u64) -> Result<PreparedUpload, UploadError> {
    let file = file.ok_or(UploadError::NoFile)?;

    if file.is_empty() {
        return Err(UploadError::EmptyFile);
    }
    if file.len() > max_size {
        return Err(UploadError::TooLarge {
            size: file.len(),
            limit: max_size,
        });
    }

    let original_file_name = file.file_name().to_string();
    let size = file.len();

    let mut stream = file.open().await?;
    let kind = sniff(&mut stream).await?;
    let object_name = generate_object_name(&kind.extension);

    tracing::debug!(
        original = %original_file_name,
        object = %object_name,
        mime = %kind.mime,
        size,
        "Prepared upload"
    );

    Ok(PreparedUpload {
        stream,
        mime: kind.mime,
        object_name,
        original_file_name,
        size,
    })
}
