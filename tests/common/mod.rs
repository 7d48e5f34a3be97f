//! Common test infrastructure
//!
//! - Upload service builders with small part and pipe sizes
//! - Object store wrappers that fail on demand
//! - Readers that fail or stall part-way through
//! - Multipart form body builders

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use rand::RngCore;
use std::io::{self, Read, SeekFrom};
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncSeek, ReadBuf};
use upload_gateway::s3::{
    CompletedPart, InMemoryStore, ObjectAttributes, ObjectBody, ObjectStore, PutObjectOutput,
    StoreError,
};
use upload_gateway::upload::service::BodyStream;
use upload_gateway::upload::{UploadService, UploadSettings};

pub const TEST_BUCKET: &str = "test-uploads";
pub const BOUNDARY: &str = "----upload-gateway-test-boundary";

/// Settings small enough that modest payloads span many parts
pub fn test_settings() -> UploadSettings {
    UploadSettings {
        max_buffered_size: 1024 * 1024,
        memory_threshold: 256,
        part_size: 64,
        pipe_capacity: 128,
        copy_buffer_size: 32,
        spool_dir: None,
    }
}

pub fn memory_store() -> Arc<InMemoryStore> {
    Arc::new(InMemoryStore::with_bucket(TEST_BUCKET))
}

pub fn service(store: Arc<dyn ObjectStore>) -> UploadService {
    UploadService::new(store, test_settings())
}

pub fn random_bytes(len: usize) -> Vec<u8> {
    let mut data = vec![0u8; len];
    rand::rng().fill_bytes(&mut data);
    data
}

pub fn gunzip(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    flate2::read::GzDecoder::new(data)
        .read_to_end(&mut out)
        .expect("stored object is not valid gzip");
    out
}

/// Body stream delivering `data` in `chunk_size` pieces
pub fn body_stream(data: Vec<u8>, chunk_size: usize) -> BodyStream {
    let chunks: Vec<io::Result<Bytes>> = data
        .chunks(chunk_size)
        .map(|c| Ok(Bytes::copy_from_slice(c)))
        .collect();
    futures::stream::iter(chunks).boxed()
}

/// One section of a multipart form
pub enum FormPart<'a> {
    Text { name: &'a str, value: &'a str },
    File { name: &'a str, file_name: &'a str, data: &'a [u8] },
}

/// Encode a multipart form body using [`BOUNDARY`]
pub fn form_bytes(parts: &[FormPart<'_>]) -> Vec<u8> {
    let mut body = Vec::new();
    for part in parts {
        body.extend_from_slice(format!("--{}\r\n", BOUNDARY).as_bytes());
        match part {
            FormPart::Text { name, value } => {
                body.extend_from_slice(
                    format!("Content-Disposition: form-data; name=\"{}\"\r\n\r\n", name)
                        .as_bytes(),
                );
                body.extend_from_slice(value.as_bytes());
            }
            FormPart::File {
                name,
                file_name,
                data,
            } => {
                body.extend_from_slice(
                    format!(
                        "Content-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\n\
                         Content-Type: application/octet-stream\r\n\r\n",
                        name, file_name
                    )
                    .as_bytes(),
                );
                body.extend_from_slice(data);
            }
        }
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{}--\r\n", BOUNDARY).as_bytes());
    body
}

pub fn form_content_type() -> String {
    format!("multipart/form-data; boundary={}", BOUNDARY)
}

/// Store whose `upload_part` fails from part `fail_from` onwards
pub struct FailingStore {
    pub inner: Arc<InMemoryStore>,
    pub fail_from: i32,
}

#[async_trait]
impl ObjectStore for FailingStore {
    fn bucket(&self) -> &str {
        self.inner.bucket()
    }

    async fn bucket_exists(&self) -> Result<bool, StoreError> {
        self.inner.bucket_exists().await
    }

    async fn create_bucket(&self) -> Result<(), StoreError> {
        self.inner.create_bucket().await
    }

    async fn put_object(
        &self,
        key: &str,
        body: ObjectBody,
        attributes: &ObjectAttributes,
    ) -> Result<PutObjectOutput, StoreError> {
        self.inner.put_object(key, body, attributes).await
    }

    async fn create_multipart_upload(
        &self,
        key: &str,
        attributes: &ObjectAttributes,
    ) -> Result<String, StoreError> {
        self.inner.create_multipart_upload(key, attributes).await
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        body: Bytes,
    ) -> Result<CompletedPart, StoreError> {
        if part_number >= self.fail_from {
            return Err(StoreError::RequestError(format!(
                "UploadPart: simulated outage at part {}",
                part_number
            )));
        }
        self.inner.upload_part(key, upload_id, part_number, body).await
    }

    async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: Vec<CompletedPart>,
    ) -> Result<Option<String>, StoreError> {
        self.inner
            .complete_multipart_upload(key, upload_id, parts)
            .await
    }

    async fn abort_multipart_upload(&self, key: &str, upload_id: &str) -> Result<(), StoreError> {
        self.inner.abort_multipart_upload(key, upload_id).await
    }
}

/// Store whose bucket checks fail a fixed number of times first
pub struct FlakyStore {
    pub inner: Arc<InMemoryStore>,
    pub failures_left: AtomicU32,
    pub checks: AtomicU32,
}

impl FlakyStore {
    pub fn new(inner: Arc<InMemoryStore>, failures: u32) -> Self {
        Self {
            inner,
            failures_left: AtomicU32::new(failures),
            checks: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl ObjectStore for FlakyStore {
    fn bucket(&self) -> &str {
        self.inner.bucket()
    }

    async fn bucket_exists(&self) -> Result<bool, StoreError> {
        self.checks.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(StoreError::RequestError("HeadBucket: connection refused".into()));
        }
        self.inner.bucket_exists().await
    }

    async fn create_bucket(&self) -> Result<(), StoreError> {
        self.inner.create_bucket().await
    }

    async fn put_object(
        &self,
        key: &str,
        body: ObjectBody,
        attributes: &ObjectAttributes,
    ) -> Result<PutObjectOutput, StoreError> {
        self.inner.put_object(key, body, attributes).await
    }

    async fn create_multipart_upload(
        &self,
        key: &str,
        attributes: &ObjectAttributes,
    ) -> Result<String, StoreError> {
        self.inner.create_multipart_upload(key, attributes).await
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        body: Bytes,
    ) -> Result<CompletedPart, StoreError> {
        self.inner.upload_part(key, upload_id, part_number, body).await
    }

    async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: Vec<CompletedPart>,
    ) -> Result<Option<String>, StoreError> {
        self.inner
            .complete_multipart_upload(key, upload_id, parts)
            .await
    }

    async fn abort_multipart_upload(&self, key: &str, upload_id: &str) -> Result<(), StoreError> {
        self.inner.abort_multipart_upload(key, upload_id).await
    }
}

/// Store that records how single puts hand over their bodies
pub struct RecordingStore {
    pub inner: Arc<InMemoryStore>,
    /// Largest body passed to `put_object` as bytes in memory
    pub largest_in_memory_put: AtomicU64,
    /// Number of puts sent from a file on disk
    pub file_puts: AtomicU32,
}

impl RecordingStore {
    pub fn new(inner: Arc<InMemoryStore>) -> Self {
        Self {
            inner,
            largest_in_memory_put: AtomicU64::new(0),
            file_puts: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl ObjectStore for RecordingStore {
    fn bucket(&self) -> &str {
        self.inner.bucket()
    }

    async fn bucket_exists(&self) -> Result<bool, StoreError> {
        self.inner.bucket_exists().await
    }

    async fn create_bucket(&self) -> Result<(), StoreError> {
        self.inner.create_bucket().await
    }

    async fn put_object(
        &self,
        key: &str,
        body: ObjectBody,
        attributes: &ObjectAttributes,
    ) -> Result<PutObjectOutput, StoreError> {
        match &body {
            ObjectBody::Bytes(bytes) => {
                self.largest_in_memory_put
                    .fetch_max(bytes.len() as u64, Ordering::SeqCst);
            }
            ObjectBody::File { .. } => {
                self.file_puts.fetch_add(1, Ordering::SeqCst);
            }
        }
        self.inner.put_object(key, body, attributes).await
    }

    async fn create_multipart_upload(
        &self,
        key: &str,
        attributes: &ObjectAttributes,
    ) -> Result<String, StoreError> {
        self.inner.create_multipart_upload(key, attributes).await
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        body: Bytes,
    ) -> Result<CompletedPart, StoreError> {
        self.inner.upload_part(key, upload_id, part_number, body).await
    }

    async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: Vec<CompletedPart>,
    ) -> Result<Option<String>, StoreError> {
        self.inner
            .complete_multipart_upload(key, upload_id, parts)
            .await
    }

    async fn abort_multipart_upload(&self, key: &str, upload_id: &str) -> Result<(), StoreError> {
        self.inner.abort_multipart_upload(key, upload_id).await
    }
}

/// Seekable reader over `data` that fails once a read reaches `fail_at`
pub struct FailingReader {
    data: Bytes,
    pos: usize,
    fail_at: usize,
}

impl FailingReader {
    pub fn new(data: Vec<u8>, fail_at: usize) -> Self {
        Self {
            data: Bytes::from(data),
            pos: 0,
            fail_at,
        }
    }
}

impl AsyncRead for FailingReader {
    fn poll_read(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.pos >= this.fail_at {
            return Poll::Ready(Err(io::Error::other("simulated disk read failure")));
        }
        let end = this.data.len().min(this.fail_at);
        let n = (end - this.pos).min(buf.remaining());
        buf.put_slice(&this.data[this.pos..this.pos + n]);
        this.pos += n;
        Poll::Ready(Ok(()))
    }
}

impl AsyncSeek for FailingReader {
    fn start_seek(self: Pin<&mut Self>, position: SeekFrom) -> io::Result<()> {
        let this = self.get_mut();
        this.pos = match position {
            SeekFrom::Start(n) => n as usize,
            SeekFrom::End(n) => (this.data.len() as i64 + n) as usize,
            SeekFrom::Current(n) => (this.pos as i64 + n) as usize,
        };
        Ok(())
    }

    fn poll_complete(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<u64>> {
        Poll::Ready(Ok(self.pos as u64))
    }
}

/// Seekable reader over `data` that never returns once it reaches `stall_at`
pub struct StallingReader {
    data: Bytes,
    pos: usize,
    stall_at: usize,
}

impl StallingReader {
    pub fn new(data: Vec<u8>, stall_at: usize) -> Self {
        Self {
            data: Bytes::from(data),
            pos: 0,
            stall_at,
        }
    }
}

impl AsyncRead for StallingReader {
    fn poll_read(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.pos >= this.stall_at {
            return Poll::Pending;
        }
        let end = this.data.len().min(this.stall_at);
        let n = (end - this.pos).min(buf.remaining());
        buf.put_slice(&this.data[this.pos..this.pos + n]);
        this.pos += n;
        Poll::Ready(Ok(()))
    }
}

impl AsyncSeek for StallingReader {
    fn start_seek(self: Pin<&mut Self>, position: SeekFrom) -> io::Result<()> {
        let this = self.get_mut();
        this.pos = match position {
            SeekFrom::Start(n) => n as usize,
            SeekFrom::End(n) => (this.data.len() as i64 + n) as usize,
            SeekFrom::Current(n) => (this.pos as i64 + n) as usize,
        };
        Ok(())
    }

    fn poll_complete(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<u64>> {
        Poll::Ready(Ok(self.pos as u64))
    }
}

/// Body stream that delivers `data` and then never ends
pub fn stalled_body(data: Vec<u8>, chunk_size: usize) -> BodyStream {
    body_stream(data, chunk_size)
        .chain(futures::stream::pending())
        .boxed()
}

/// Poll `condition` until it holds or `timeout` passes
pub async fn wait_for(timeout: std::time::Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
    condition()
}
