//! Object store module
//!
//! Defines the [`ObjectStore`] seam the upload pipeline talks to and the
//! S3-compatible implementation built on `aws-sdk-s3`.
//!
//! # Bucket scoping
//!
//! A store is bound to exactly one bucket at construction time. Every
//! operation targets that bucket; callers never pass a bucket name.
//!
//! # Tracing
//!
//! All S3 operations are instrumented with spans:
//!
//! | Operation | Span Name | Attributes |
//! |-----------|-----------|------------|
//! | HeadBucket | `s3.head_bucket` | bucket, exists |
//! | CreateBucket | `s3.create_bucket` | bucket |
//! | PutObject | `s3.put_object` | bucket, key, bytes, etag |
//! | CreateMultipartUpload | `s3.create_multipart_upload` | bucket, key, upload_id |
//! | UploadPart | `s3.upload_part` | bucket, upload_id, part_number, bytes, etag |
//! | CompleteMultipartUpload | `s3.complete_multipart_upload` | bucket, upload_id, parts_count, etag |
//! | AbortMultipartUpload | `s3.abort_multipart_upload` | bucket, upload_id |

pub mod init;
pub mod memory;

use crate::config::StorageConfig;
use async_trait::async_trait;
use aws_sdk_s3::error::{DisplayErrorContext, SdkError};
use aws_sdk_s3::primitives::{ByteStream, Length};
use aws_sdk_s3::types::{
    BucketLocationConstraint, CompletedMultipartUpload, CompletedPart as S3Part,
    CreateBucketConfiguration,
};
use bytes::Bytes;
use std::collections::BTreeMap;
use std::path::PathBuf;
use thiserror::Error;

pub use init::{BucketInitializer, BucketState};
pub use memory::InMemoryStore;

/// Object store errors
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Bucket does not exist: {0}")]
    NoSuchBucket(String),

    #[error("Bucket already exists: {0}")]
    BucketAlreadyExists(String),

    #[error("Unknown multipart upload: {0}")]
    NoSuchUpload(String),

    #[error("Request error: {0}")]
    RequestError(String),

    #[error("Response error: {0}")]
    ResponseError(String),
}

/// Attributes stored alongside an object.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectAttributes {
    pub content_type: String,
    pub content_encoding: Option<String>,
    pub metadata: BTreeMap<String, String>,
}

impl ObjectAttributes {
    pub fn new(content_type: impl Into<String>) -> Self {
        Self {
            content_type: content_type.into(),
            content_encoding: None,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_encoding(mut self, encoding: impl Into<String>) -> Self {
        self.content_encoding = Some(encoding.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Body of a single-request upload
#[derive(Debug, Clone)]
pub enum ObjectBody {
    /// Content held in memory
    Bytes(Bytes),
    /// Content of a local file, read by the store while it sends.
    /// The file must stay in place until the put returns.
    File { path: PathBuf, length: u64 },
}

impl ObjectBody {
    pub fn len(&self) -> u64 {
        match self {
            ObjectBody::Bytes(bytes) => bytes.len() as u64,
            ObjectBody::File { length, .. } => *length,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl From<Bytes> for ObjectBody {
    fn from(bytes: Bytes) -> Self {
        ObjectBody::Bytes(bytes)
    }
}

/// PutObject response
#[derive(Debug, Clone)]
pub struct PutObjectOutput {
    pub etag: Option<String>,
    pub size: u64,
}

/// Completed part info
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedPart {
    pub part_number: i32,
    pub etag: String,
}

/// Operations the upload pipeline needs from an S3-compatible store.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Bucket every operation targets
    fn bucket(&self) -> &str;

    async fn bucket_exists(&self) -> Result<bool, StoreError>;

    async fn create_bucket(&self) -> Result<(), StoreError>;

    /// Atomic single-request upload of a body of known length
    async fn put_object(
        &self,
        key: &str,
        body: ObjectBody,
        attributes: &ObjectAttributes,
    ) -> Result<PutObjectOutput, StoreError>;

    /// Start a multipart upload and return its upload id
    async fn create_multipart_upload(
        &self,
        key: &str,
        attributes: &ObjectAttributes,
    ) -> Result<String, StoreError>;

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        body: Bytes,
    ) -> Result<CompletedPart, StoreError>;

    async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: Vec<CompletedPart>,
    ) -> Result<Option<String>, StoreError>;

    async fn abort_multipart_upload(&self, key: &str, upload_id: &str) -> Result<(), StoreError>;
}

fn request_error<E, R>(operation: &str, err: SdkError<E, R>) -> StoreError
where
    E: std::error::Error + Send + Sync + 'static,
    R: std::fmt::Debug + Send + Sync + 'static,
{
    StoreError::RequestError(format!("{}: {}", operation, DisplayErrorContext(err)))
}

/// S3 Client
///
/// Talks to any S3-compatible endpoint (AWS, MinIO) using path-style
/// addressing and static credentials.
#[derive(Clone)]
pub struct S3Client {
    client: aws_sdk_s3::Client,
    bucket: String,
    region: String,
    endpoint: String,
}

impl std::fmt::Debug for S3Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Client")
            .field("bucket", &self.bucket)
            .field("region", &self.region)
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

impl S3Client {
    /// Create a new S3 client from the storage configuration
    pub fn new(config: &StorageConfig) -> Result<Self, StoreError> {
        if config.bucket.trim().is_empty() {
            return Err(StoreError::ConfigError("bucket name is empty".into()));
        }

        let endpoint = config.endpoint_url();
        let region = config.signing_region().to_string();

        let credentials = aws_credential_types::Credentials::new(
            config.access_key.clone(),
            config.secret_key.clone(),
            None,
            None,
            "upload-gateway-config",
        );

        let sdk_config = aws_sdk_s3::config::Builder::new()
            .behavior_version(aws_config::BehaviorVersion::latest())
            .region(aws_config::Region::new(region.clone()))
            .credentials_provider(credentials)
            .endpoint_url(endpoint.clone())
            .force_path_style(true)
            .build();

        Ok(Self {
            client: aws_sdk_s3::Client::from_conf(sdk_config),
            bucket: config.bucket.clone(),
            region,
            endpoint,
        })
    }

    /// Get the region used for signing
    pub fn region(&self) -> &str {
        &self.region
    }

    /// Get the endpoint URL
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl ObjectStore for S3Client {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    #[tracing::instrument(
        name = "s3.head_bucket",
        skip(self),
        fields(s3.bucket = %self.bucket, s3.exists = tracing::field::Empty),
        err
    )]
    async fn bucket_exists(&self) -> Result<bool, StoreError> {
        let exists = match self.client.head_bucket().bucket(&self.bucket).send().await {
            Ok(_) => true,
            Err(SdkError::ServiceError(ctx)) if ctx.err().is_not_found() => false,
            Err(e) => return Err(request_error("HeadBucket", e)),
        };

        tracing::Span::current().record("s3.exists", exists);
        Ok(exists)
    }

    #[tracing::instrument(name = "s3.create_bucket", skip(self), fields(s3.bucket = %self.bucket), err)]
    async fn create_bucket(&self) -> Result<(), StoreError> {
        let mut request = self.client.create_bucket().bucket(&self.bucket);

        // us-east-1 rejects an explicit location constraint
        if self.region != "us-east-1" {
            request = request.create_bucket_configuration(
                CreateBucketConfiguration::builder()
                    .location_constraint(BucketLocationConstraint::from(self.region.as_str()))
                    .build(),
            );
        }

        match request.send().await {
            Ok(_) => Ok(()),
            Err(SdkError::ServiceError(ctx))
                if ctx.err().is_bucket_already_owned_by_you()
                    || ctx.err().is_bucket_already_exists() =>
            {
                Err(StoreError::BucketAlreadyExists(self.bucket.clone()))
            }
            Err(e) => Err(request_error("CreateBucket", e)),
        }
    }

    #[tracing::instrument(
        name = "s3.put_object",
        skip(self, body, attributes),
        fields(
            s3.bucket = %self.bucket,
            s3.key = %key,
            http.method = "PUT",
            upload.bytes = body.len(),
            s3.etag = tracing::field::Empty
        ),
        err
    )]
    async fn put_object(
        &self,
        key: &str,
        body: ObjectBody,
        attributes: &ObjectAttributes,
    ) -> Result<PutObjectOutput, StoreError> {
        let size = body.len();
        let stream = match body {
            ObjectBody::Bytes(bytes) => ByteStream::from(bytes),
            ObjectBody::File { path, length } => ByteStream::read_from()
                .path(&path)
                .length(Length::Exact(length))
                .build()
                .await
                .map_err(|e| {
                    StoreError::RequestError(format!(
                        "PutObject: cannot open {}: {}",
                        path.display(),
                        e
                    ))
                })?,
        };
        let metadata = attributes
            .metadata
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        let output = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type(&attributes.content_type)
            .set_content_encoding(attributes.content_encoding.clone())
            .set_metadata(Some(metadata))
            .content_length(size as i64)
            .body(stream)
            .send()
            .await
            .map_err(|e| request_error("PutObject", e))?;

        let etag = output.e_tag().map(str::to_string);
        if let Some(etag) = &etag {
            tracing::Span::current().record("s3.etag", etag.as_str());
        }

        Ok(PutObjectOutput { etag, size })
    }

    #[tracing::instrument(
        name = "s3.create_multipart_upload",
        skip(self, attributes),
        fields(
            s3.bucket = %self.bucket,
            s3.key = %key,
            http.method = "POST",
            s3.upload_id = tracing::field::Empty
        ),
        err
    )]
    async fn create_multipart_upload(
        &self,
        key: &str,
        attributes: &ObjectAttributes,
    ) -> Result<String, StoreError> {
        let metadata = attributes
            .metadata
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        let output = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .content_type(&attributes.content_type)
            .set_content_encoding(attributes.content_encoding.clone())
            .set_metadata(Some(metadata))
            .send()
            .await
            .map_err(|e| request_error("CreateMultipartUpload", e))?;

        let upload_id = output
            .upload_id()
            .ok_or_else(|| StoreError::ResponseError("response carried no upload id".into()))?
            .to_string();

        tracing::Span::current().record("s3.upload_id", upload_id.as_str());
        Ok(upload_id)
    }

    #[tracing::instrument(
        name = "s3.upload_part",
        skip(self, body),
        fields(
            s3.bucket = %self.bucket,
            s3.upload_id = %upload_id,
            s3.part_number = part_number,
            http.method = "PUT",
            upload.bytes = body.len(),
            s3.etag = tracing::field::Empty
        ),
        err
    )]
    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        body: Bytes,
    ) -> Result<CompletedPart, StoreError> {
        let length = body.len() as i64;
        let output = self
            .client
            .upload_part()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .part_number(part_number)
            .content_length(length)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| request_error("UploadPart", e))?;

        let etag = output
            .e_tag()
            .ok_or_else(|| StoreError::ResponseError(format!("part {} has no ETag", part_number)))?
            .to_string();

        tracing::Span::current().record("s3.etag", etag.as_str());
        Ok(CompletedPart { part_number, etag })
    }

    #[tracing::instrument(
        name = "s3.complete_multipart_upload",
        skip(self, parts),
        fields(
            s3.bucket = %self.bucket,
            s3.upload_id = %upload_id,
            http.method = "POST",
            parts_count = parts.len(),
            s3.etag = tracing::field::Empty
        ),
        err
    )]
    async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: Vec<CompletedPart>,
    ) -> Result<Option<String>, StoreError> {
        let parts = parts
            .into_iter()
            .map(|p| {
                S3Part::builder()
                    .part_number(p.part_number)
                    .e_tag(p.etag)
                    .build()
            })
            .collect();

        let output = self
            .client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(parts))
                    .build(),
            )
            .send()
            .await
            .map_err(|e| request_error("CompleteMultipartUpload", e))?;

        let etag = output.e_tag().map(str::to_string);
        if let Some(etag) = &etag {
            tracing::Span::current().record("s3.etag", etag.as_str());
        }
        Ok(etag)
    }

    #[tracing::instrument(
        name = "s3.abort_multipart_upload",
        skip(self),
        fields(s3.bucket = %self.bucket, s3.upload_id = %upload_id),
        err
    )]
    async fn abort_multipart_upload(&self, key: &str, upload_id: &str) -> Result<(), StoreError> {
        self.client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await
            .map_err(|e| request_error("AbortMultipartUpload", e))?;
        Ok(())
    }
}
