//! Object storage backends.
//!
//! The pipeline only talks to `ObjectStore`. `S3Store` is the production
//! backend; `LocalStore` implements the same multipart protocol on local
//! disk with SQLite metadata.

pub mod local;
pub mod s3;

use crate::{
    config::{AppConfig, BackendKind},
    models::{CompletedPart, UploadOptions, UploadReceipt},
};
use async_trait::async_trait;
use bytes::Bytes;
use std::{io, sync::Arc};
use thiserror::Error;

pub use local::LocalStore;
pub use s3::S3Store;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("no bucket configured (set BACKUP_BUCKET or pass --bucket)")]
    MissingBucket,
    #[error("invalid object key `{0}`")]
    InvalidKey(String),
    #[error("bucket `{name}` invalid: {reason}")]
    InvalidBucketName { name: String, reason: String },
    #[error("upload `{upload_id}` for `{key}` not found")]
    UploadNotFound { key: String, upload_id: String },
    #[error("part {part_number} of upload `{upload_id}` is missing or has a different etag")]
    InvalidPart { upload_id: String, part_number: i32 },
    #[error("parts must be listed in strictly ascending order, starting at 1 or above")]
    InvalidPartOrder,
    #[error("expiry {ttl:?} from now is out of range")]
    ExpiryOutOfRange { ttl: std::time::Duration },
    #[error("object `{0}` not found")]
    ObjectNotFound(String),
    #[error("storage backend error: {0}")]
    Backend(String),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Client side of the object store's upload protocol.
///
/// Every call may fail with a transport error. None of them retry.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Open a multipart session for `key`, asking the store to track
    /// SHA-256 checksums. Returns the session (upload) id.
    async fn create_multipart_upload(
        &self,
        key: &str,
        options: &UploadOptions,
    ) -> StoreResult<String>;

    /// Upload one part of an open session.
    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        body: Bytes,
    ) -> StoreResult<CompletedPart>;

    /// Finalize a session. `parts` must be sorted by part number.
    async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: Vec<CompletedPart>,
    ) -> StoreResult<UploadReceipt>;

    /// Store `body` in a single request.
    async fn put_object(
        &self,
        key: &str,
        body: Bytes,
        options: &UploadOptions,
    ) -> StoreResult<UploadReceipt>;

    async fn object_exists(&self, key: &str) -> StoreResult<bool>;
}

/// Create the backend selected by configuration.
pub async fn create_store(config: &AppConfig) -> StoreResult<Arc<dyn ObjectStore>> {
    let bucket = config.bucket.as_deref().ok_or(StoreError::MissingBucket)?;
    match config.backend {
        BackendKind::S3 => {
            let store = S3Store::new(
                bucket.to_string(),
                config.region.clone(),
                config.endpoint_url.clone(),
            )
            .await?;
            Ok(Arc::new(store))
        }
        BackendKind::Local => {
            let store = LocalStore::open(&config.local_root, bucket).await?;
            Ok(Arc::new(store))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn local_config(root: &std::path::Path, bucket: Option<&str>) -> AppConfig {
        AppConfig {
            backend: BackendKind::Local,
            bucket: bucket.map(str::to_string),
            region: None,
            endpoint_url: None,
            local_root: root.to_path_buf(),
            part_size: 1024,
            part_concurrency: 4,
        }
    }

    #[tokio::test]
    async fn store_requires_a_bucket() {
        let dir = tempdir().unwrap();

        let missing = create_store(&local_config(dir.path(), None)).await;
        assert!(matches!(missing, Err(StoreError::MissingBucket)));

        let store = create_store(&local_config(dir.path(), Some("backups")))
            .await
            .unwrap();
        assert!(!store.object_exists("nothing.tgz").await.unwrap());
    }
}
