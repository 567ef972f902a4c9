use super::{ObjectStore, ObjectStoreError};
use async_trait::async_trait;
use aws_sdk_s3::Client;
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use std::time::Duration;

/// [`ObjectStore`] backed by S3.
#[derive(Clone)]
pub struct S3ObjectStore {
    client: Client,
}

impl S3ObjectStore {
    pub fn new(config: &aws_config::SdkConfig) -> Self {
        Self {
            client: Client::new(config),
        }
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>, ObjectStoreError> {
        let output = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|err| match err.as_service_error() {
                Some(service) if service.is_no_such_key() => ObjectStoreError::not_found(bucket, key),
                _ => ObjectStoreError::Request(DisplayErrorContext(&err).to_string()),
            })?;

        let body = output
            .body
            .collect()
            .await
            .map_err(|err| ObjectStoreError::Request(err.to_string()))?;

        Ok(body.into_bytes().to_vec())
    }

    async fn put(
        &self,
        bucket: &str,
        key: &str,
        body: Vec<u8>,
        content_type: &str,
    ) -> Result<(), ObjectStoreError> {
        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .content_type(content_type)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|err| ObjectStoreError::Request(DisplayErrorContext(&err).to_string()))?;
        Ok(())
    }

    async fn presign_get(&self, bucket: &str, key: &str, ttl: Duration) -> Result<String, ObjectStoreError> {
        let presign_error = |reason: String| ObjectStoreError::Presign {
            key: key.to_string(),
            reason,
        };

        let config = PresigningConfig::expires_in(ttl).map_err(|err| presign_error(err.to_string()))?;
        let request = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .presigned(config)
            .await
            .map_err(|err| presign_error(DisplayErrorContext(&err).to_string()))?;

        Ok(request.uri().to_string())
    }

    async fn delete(&self, bucket: &str, key: &str) -> Result<(), ObjectStoreError> {
        self.client
            .delete_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|err| ObjectStoreError::Request(DisplayErrorContext(&err).to_string()))?;
        Ok(())
    }
}
