//! Bucket initialization
//!
//! Makes sure the configured bucket exists before the gateway starts
//! accepting uploads. Safe to run any number of times.

use super::{ObjectStore, StoreError};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Outcome of [`BucketInitializer::ensure_bucket`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BucketState {
    Created,
    AlreadyExists,
}

/// Creates the bucket on startup, retrying with linear backoff
pub struct BucketInitializer {
    store: Arc<dyn ObjectStore>,
    max_attempts: u32,
    retry_delay: Duration,
}

impl BucketInitializer {
    pub fn new(store: Arc<dyn ObjectStore>, max_attempts: u32, retry_delay: Duration) -> Self {
        Self {
            store,
            max_attempts: max_attempts.max(1),
            retry_delay,
        }
    }

    /// Ensure the bucket exists, creating it if needed.
    ///
    /// Attempt `n` waits `retry_delay * n` before the next one. The error of the
    /// final attempt is returned.
    pub async fn ensure_bucket(&self) -> Result<BucketState, StoreError> {
        let bucket = self.store.bucket().to_string();
        let mut attempt = 1;

        loop {
            match self.try_ensure(attempt).await {
                Ok(state) => return Ok(state),
                Err(e) if attempt < self.max_attempts => {
                    warn!(
                        bucket = %bucket,
                        attempt,
                        max_attempts = self.max_attempts,
                        error = %e,
                        "Failed to initialize bucket, retrying"
                    );
                    tokio::time::sleep(self.retry_delay * attempt).await;
                    attempt += 1;
                }
                Err(e) => {
                    error!(
                        bucket = %bucket,
                        max_attempts = self.max_attempts,
                        error = %e,
                        "Failed to initialize bucket"
                    );
                    return Err(e);
                }
            }
        }
    }

    async fn try_ensure(&self, attempt: u32) -> Result<BucketState, StoreError> {
        let bucket = self.store.bucket();

        if self.store.bucket_exists().await? {
            info!(bucket = %bucket, "Bucket already exists");
            return Ok(BucketState::AlreadyExists);
        }

        info!(
            bucket = %bucket,
            attempt,
            max_attempts = self.max_attempts,
            "Creating bucket"
        );

        match self.store.create_bucket().await {
            Ok(()) => {
                info!(bucket = %bucket, "Bucket created");
                Ok(BucketState::Created)
            }
            // Another instance won the race
            Err(StoreError::BucketAlreadyExists(_)) => Ok(BucketState::AlreadyExists),
            Err(e) => Err(e),
        }
    }
}
