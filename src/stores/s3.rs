//! `ObjectStore` backed by Amazon S3 (or an S3-compatible endpoint).

use crate::{
    models::{CompletedPart, StorageClass, UploadOptions, UploadReceipt},
    stores::{ObjectStore, StoreError, StoreResult, local::validate_bucket_name},
};
use async_trait::async_trait;
use aws_config::{BehaviorVersion, meta::region::RegionProviderChain};
use aws_sdk_s3::{
    Client,
    config::Region,
    error::DisplayErrorContext,
    primitives::{ByteStream, DateTime},
    types::{
        ChecksumAlgorithm, CompletedMultipartUpload, CompletedPart as S3CompletedPart,
        StorageClass as S3StorageClass,
    },
};
use bytes::Bytes;
use std::{
    error::Error,
    time::{Duration, Instant, SystemTime},
};

#[derive(Clone)]
pub struct S3Store {
    client: Client,
    bucket: String,
}

impl S3Store {
    /// Build a client from the default credential chain.
    ///
    /// `region` overrides the environment/profile region. `endpoint_url`
    /// points at an S3-compatible provider and switches to path-style
    /// addressing (e.g. "http://localhost:9000" for MinIO).
    pub async fn new(
        bucket: String,
        region: Option<String>,
        endpoint_url: Option<String>,
    ) -> StoreResult<Self> {
        validate_bucket_name(&bucket)?;

        let region_provider =
            RegionProviderChain::first_try(region.map(Region::new)).or_default_provider();
        let shared = aws_config::defaults(BehaviorVersion::latest())
            .region(region_provider)
            .load()
            .await;

        let mut builder = aws_sdk_s3::config::Builder::from(&shared);
        if let Some(endpoint) = endpoint_url {
            builder = builder.endpoint_url(endpoint).force_path_style(true);
        }

        Ok(Self::from_client(Client::from_conf(builder.build()), bucket))
    }

    pub fn from_client(client: Client, bucket: String) -> Self {
        Self { client, bucket }
    }
}

fn backend_error<E: Error>(err: E) -> StoreError {
    StoreError::Backend(DisplayErrorContext(err).to_string())
}

fn expires_at(ttl: Duration) -> StoreResult<DateTime> {
    SystemTime::now()
        .checked_add(ttl)
        .map(DateTime::from)
        .ok_or(StoreError::ExpiryOutOfRange { ttl })
}

fn storage_class(class: StorageClass) -> S3StorageClass {
    S3StorageClass::from(class.as_str())
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn create_multipart_upload(
        &self,
        key: &str,
        options: &UploadOptions,
    ) -> StoreResult<String> {
        let output = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .checksum_algorithm(ChecksumAlgorithm::Sha256)
            .set_storage_class(options.storage_class.map(storage_class))
            .set_expires(options.ttl.map(expires_at).transpose()?)
            .send()
            .await
            .map_err(|e| {
                tracing::error!(
                    error = %DisplayErrorContext(&e),
                    bucket = %self.bucket,
                    key = %key,
                    "S3 create multipart upload failed"
                );
                backend_error(e)
            })?;

        output
            .upload_id
            .ok_or_else(|| StoreError::Backend(format!("no upload id returned for `{key}`")))
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        body: Bytes,
    ) -> StoreResult<CompletedPart> {
        let size = body.len();
        let start = Instant::now();

        let output = self
            .client
            .upload_part()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .part_number(part_number)
            .checksum_algorithm(ChecksumAlgorithm::Sha256)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| {
                tracing::error!(
                    error = %DisplayErrorContext(&e),
                    bucket = %self.bucket,
                    key = %key,
                    part_number,
                    size_bytes = size,
                    "S3 upload part failed"
                );
                backend_error(e)
            })?;

        tracing::debug!(
            bucket = %self.bucket,
            key = %key,
            part_number,
            size_bytes = size,
            duration_ms = start.elapsed().as_secs_f64() * 1000.0,
            "S3 part uploaded"
        );

        let etag = output.e_tag.ok_or_else(|| {
            StoreError::Backend(format!("no etag returned for part {part_number} of `{key}`"))
        })?;

        Ok(CompletedPart {
            part_number,
            etag,
            checksum_sha256: output.checksum_sha256,
        })
    }

    async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: Vec<CompletedPart>,
    ) -> StoreResult<UploadReceipt> {
        let parts = parts
            .into_iter()
            .map(|part| {
                S3CompletedPart::builder()
                    .part_number(part.part_number)
                    .e_tag(part.etag)
                    .set_checksum_sha256(part.checksum_sha256)
                    .build()
            })
            .collect::<Vec<_>>();

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
            .map_err(|e| {
                tracing::error!(
                    error = %DisplayErrorContext(&e),
                    bucket = %self.bucket,
                    key = %key,
                    "S3 complete multipart upload failed"
                );
                backend_error(e)
            })?;

        Ok(UploadReceipt {
            etag: output.e_tag,
            checksum_sha256: output.checksum_sha256,
        })
    }

    async fn put_object(
        &self,
        key: &str,
        body: Bytes,
        options: &UploadOptions,
    ) -> StoreResult<UploadReceipt> {
        let size = body.len();
        let start = Instant::now();

        let output = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .checksum_algorithm(ChecksumAlgorithm::Sha256)
            .set_storage_class(options.storage_class.map(storage_class))
            .set_expires(options.ttl.map(expires_at).transpose()?)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| {
                tracing::error!(
                    error = %DisplayErrorContext(&e),
                    bucket = %self.bucket,
                    key = %key,
                    size_bytes = size,
                    "S3 put object failed"
                );
                backend_error(e)
            })?;

        tracing::info!(
            bucket = %self.bucket,
            key = %key,
            size_bytes = size,
            duration_ms = start.elapsed().as_secs_f64() * 1000.0,
            "S3 put object successful"
        );

        Ok(UploadReceipt {
            etag: output.e_tag,
            checksum_sha256: output.checksum_sha256,
        })
    }

    async fn object_exists(&self, key: &str) -> StoreResult<bool> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(err) => match err.as_service_error() {
                Some(service_err) if service_err.is_not_found() => Ok(false),
                _ => Err(backend_error(err)),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::job::ttl_from_days;

    #[test]
    fn expiry_is_ttl_after_now() {
        let before = SystemTime::now();
        let expires = expires_at(ttl_from_days(30)).unwrap();
        let expected = DateTime::from(before + ttl_from_days(30));
        assert!(expires.secs() - expected.secs() <= 1);
    }

    #[test]
    fn unrepresentable_expiry_is_an_error() {
        assert!(matches!(
            expires_at(ttl_from_days(u64::MAX)),
            Err(StoreError::ExpiryOutOfRange { .. })
        ));
    }
}
