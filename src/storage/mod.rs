//! Object storage for raw messages and attachment blobs.

pub mod s3;

pub use s3::S3ObjectStore;

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ObjectStoreError {
    #[error("object {bucket}/{key} not found")]
    NotFound { bucket: String, key: String },
    #[error("object store request failed: {0}")]
    Request(String),
    #[error("failed to presign {key}: {reason}")]
    Presign { key: String, reason: String },
}

impl ObjectStoreError {
    pub fn not_found(bucket: &str, key: &str) -> Self {
        ObjectStoreError::NotFound {
            bucket: bucket.to_string(),
            key: key.to_string(),
        }
    }
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>, ObjectStoreError>;

    async fn put(
        &self,
        bucket: &str,
        key: &str,
        body: Vec<u8>,
        content_type: &str,
    ) -> Result<(), ObjectStoreError>;

    /// Time-bounded retrieval URL for an object.
    async fn presign_get(&self, bucket: &str, key: &str, ttl: Duration) -> Result<String, ObjectStoreError>;

    /// Remove an object. Removing a missing object succeeds.
    async fn delete(&self, bucket: &str, key: &str) -> Result<(), ObjectStoreError>;
}
