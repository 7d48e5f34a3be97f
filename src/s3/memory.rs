//! In-memory object store
//!
//! Keeps objects and in-progress multipart uploads in process memory. Used by
//! the test suite and benchmarks in place of a live S3 endpoint; it follows
//! the same bucket and multipart rules the pipeline relies on.

use super::{
    CompletedPart, ObjectAttributes, ObjectBody, ObjectStore, PutObjectOutput, StoreError,
};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// An object as stored
#[derive(Debug, Clone)]
pub struct StoredObject {
    pub data: Bytes,
    pub attributes: ObjectAttributes,
    pub etag: String,
}

#[derive(Debug)]
struct PendingUpload {
    key: String,
    attributes: ObjectAttributes,
    parts: BTreeMap<i32, (String, Bytes)>,
}

#[derive(Debug, Default)]
struct State {
    bucket_created: bool,
    create_bucket_calls: usize,
    objects: HashMap<String, StoredObject>,
    uploads: HashMap<String, PendingUpload>,
}

/// Object store backed by process memory
#[derive(Debug, Clone)]
pub struct InMemoryStore {
    bucket: String,
    state: Arc<Mutex<State>>,
}

impl InMemoryStore {
    /// Create a store whose bucket does not exist yet
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            state: Arc::new(Mutex::new(State::default())),
        }
    }

    /// Create a store whose bucket already exists
    pub fn with_bucket(bucket: impl Into<String>) -> Self {
        let store = Self::new(bucket);
        store.state.lock().bucket_created = true;
        store
    }

    pub fn object(&self, key: &str) -> Option<StoredObject> {
        self.state.lock().objects.get(key).cloned()
    }

    pub fn object_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.state.lock().objects.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn object_count(&self) -> usize {
        self.state.lock().objects.len()
    }

    /// Number of multipart uploads started but neither completed nor aborted
    pub fn pending_uploads(&self) -> usize {
        self.state.lock().uploads.len()
    }

    /// Number of times a bucket was actually created
    pub fn create_bucket_calls(&self) -> usize {
        self.state.lock().create_bucket_calls
    }

    fn check_bucket(&self, state: &State) -> Result<(), StoreError> {
        if state.bucket_created {
            Ok(())
        } else {
            Err(StoreError::NoSuchBucket(self.bucket.clone()))
        }
    }
}

fn new_etag() -> String {
    format!("\"{}\"", uuid::Uuid::new_v4().simple())
}

#[async_trait]
impl ObjectStore for InMemoryStore {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn bucket_exists(&self) -> Result<bool, StoreError> {
        Ok(self.state.lock().bucket_created)
    }

    async fn create_bucket(&self) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        if state.bucket_created {
            return Err(StoreError::BucketAlreadyExists(self.bucket.clone()));
        }
        state.bucket_created = true;
        state.create_bucket_calls += 1;
        Ok(())
    }

    async fn put_object(
        &self,
        key: &str,
        body: ObjectBody,
        attributes: &ObjectAttributes,
    ) -> Result<PutObjectOutput, StoreError> {
        {
            let state = self.state.lock();
            self.check_bucket(&state)?;
        }

        let data = match body {
            ObjectBody::Bytes(bytes) => bytes,
            ObjectBody::File { path, length } => {
                let data = tokio::fs::read(&path).await.map_err(|e| {
                    StoreError::RequestError(format!(
                        "PutObject: cannot read {}: {}",
                        path.display(),
                        e
                    ))
                })?;
                if data.len() as u64 != length {
                    return Err(StoreError::RequestError(format!(
                        "PutObject: {} holds {} bytes, expected {}",
                        path.display(),
                        data.len(),
                        length
                    )));
                }
                Bytes::from(data)
            }
        };

        let mut state = self.state.lock();
        self.check_bucket(&state)?;

        let etag = new_etag();
        let size = data.len() as u64;
        state.objects.insert(
            key.to_string(),
            StoredObject {
                data,
                attributes: attributes.clone(),
                etag: etag.clone(),
            },
        );

        Ok(PutObjectOutput {
            etag: Some(etag),
            size,
        })
    }

    async fn create_multipart_upload(
        &self,
        key: &str,
        attributes: &ObjectAttributes,
    ) -> Result<String, StoreError> {
        let mut state = self.state.lock();
        self.check_bucket(&state)?;

        let upload_id = uuid::Uuid::new_v4().to_string();
        state.uploads.insert(
            upload_id.clone(),
            PendingUpload {
                key: key.to_string(),
                attributes: attributes.clone(),
                parts: BTreeMap::new(),
            },
        );
        Ok(upload_id)
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        body: Bytes,
    ) -> Result<CompletedPart, StoreError> {
        let mut state = self.state.lock();
        let upload = state
            .uploads
            .get_mut(upload_id)
            .filter(|u| u.key == key)
            .ok_or_else(|| StoreError::NoSuchUpload(upload_id.to_string()))?;

        let etag = new_etag();
        upload.parts.insert(part_number, (etag.clone(), body));
        Ok(CompletedPart { part_number, etag })
    }

    async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: Vec<CompletedPart>,
    ) -> Result<Option<String>, StoreError> {
        let mut state = self.state.lock();
        let upload = state
            .uploads
            .remove(upload_id)
            .filter(|u| u.key == key)
            .ok_or_else(|| StoreError::NoSuchUpload(upload_id.to_string()))?;

        if parts.is_empty() {
            return Err(StoreError::ResponseError("no parts to complete".into()));
        }

        let mut data = BytesMut::new();
        let mut previous = 0;
        for part in &parts {
            if part.part_number <= previous {
                return Err(StoreError::ResponseError(
                    "parts must be listed in ascending order".into(),
                ));
            }
            previous = part.part_number;

            match upload.parts.get(&part.part_number) {
                Some((etag, body)) if *etag == part.etag => data.extend_from_slice(body),
                _ => {
                    return Err(StoreError::ResponseError(format!(
                        "part {} does not match an uploaded part",
                        part.part_number
                    )))
                }
            }
        }

        let etag = format!("\"{}-{}\"", uuid::Uuid::new_v4().simple(), parts.len());
        state.objects.insert(
            key.to_string(),
            StoredObject {
                data: data.freeze(),
                attributes: upload.attributes,
                etag: etag.clone(),
            },
        );
        Ok(Some(etag))
    }

    async fn abort_multipart_upload(&self, key: &str, upload_id: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        let owned = state.uploads.get(upload_id).is_some_and(|u| u.key == key);
        if !owned {
            return Err(StoreError::NoSuchUpload(upload_id.to_string()));
        }
        state.uploads.remove(upload_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_requires_bucket() {
        let store = InMemoryStore::new("uploads");
        let result = store
            .put_object(
                "a",
                Bytes::from("x").into(),
                &ObjectAttributes::new("text/plain"),
            )
            .await;
        assert!(matches!(result, Err(StoreError::NoSuchBucket(_))));
    }

    #[tokio::test]
    async fn test_put_reads_file_body() {
        let store = InMemoryStore::with_bucket("uploads");
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), b"spooled content").unwrap();

        let output = store
            .put_object(
                "a",
                ObjectBody::File {
                    path: file.path().to_path_buf(),
                    length: 15,
                },
                &ObjectAttributes::new("text/plain"),
            )
            .await
            .unwrap();

        assert_eq!(output.size, 15);
        assert_eq!(store.object("a").unwrap().data, Bytes::from("spooled content"));
    }

    #[tokio::test]
    async fn test_put_rejects_file_of_wrong_length() {
        let store = InMemoryStore::with_bucket("uploads");
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), b"short").unwrap();

        let result = store
            .put_object(
                "a",
                ObjectBody::File {
                    path: file.path().to_path_buf(),
                    length: 50,
                },
                &ObjectAttributes::new("text/plain"),
            )
            .await;

        assert!(matches!(result, Err(StoreError::RequestError(_))));
        assert_eq!(store.object_count(), 0);
    }

    #[tokio::test]
    async fn test_create_bucket_twice_reports_existing() {
        let store = InMemoryStore::new("uploads");
        store.create_bucket().await.unwrap();
        assert!(matches!(
            store.create_bucket().await,
            Err(StoreError::BucketAlreadyExists(_))
        ));
        assert_eq!(store.create_bucket_calls(), 1);
    }

    #[tokio::test]
    async fn test_multipart_assembles_parts_in_order() {
        let store = InMemoryStore::with_bucket("uploads");
        let attrs = ObjectAttributes::new("application/octet-stream");
        let id = store.create_multipart_upload("obj", &attrs).await.unwrap();

        let p1 = store
            .upload_part("obj", &id, 1, Bytes::from("hello "))
            .await
            .unwrap();
        let p2 = store
            .upload_part("obj", &id, 2, Bytes::from("world"))
            .await
            .unwrap();

        store
            .complete_multipart_upload("obj", &id, vec![p1, p2])
            .await
            .unwrap();

        assert_eq!(store.object("obj").unwrap().data, Bytes::from("hello world"));
        assert_eq!(store.pending_uploads(), 0);
    }

    #[tokio::test]
    async fn test_abort_discards_upload() {
        let store = InMemoryStore::with_bucket("uploads");
        let attrs = ObjectAttributes::new("application/octet-stream");
        let id = store.create_multipart_upload("obj", &attrs).await.unwrap();
        store
            .upload_part("obj", &id, 1, Bytes::from("partial"))
            .await
            .unwrap();

        store.abort_multipart_upload("obj", &id).await.unwrap();

        assert!(store.object("obj").is_none());
        assert_eq!(store.pending_uploads(), 0);
    }
}
