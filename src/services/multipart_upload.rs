//! Drives the chunked upload protocol for one object.
//!
//! The body is cut into `part_size` windows. A body that fits in one window
//! goes up in a single request, because the store reports a `-1` suffixed
//! checksum for one-part multipart objects. Anything larger runs
//! initiate → upload parts → complete, with up to `concurrency` parts in
//! flight at once.

use crate::{
    errors::{BackupError, BackupResult},
    models::{ByteStream, CompletedPart, UploadOptions},
    services::chunker::FixedWindows,
    stores::{ObjectStore, StoreError},
};
use bytes::Bytes;
use futures::{StreamExt, TryStreamExt, stream};
use std::{sync::Arc, time::Instant};
use tracing::{debug, info};

/// Smallest part the hosted service accepts (except for the last part).
pub const MIN_PART_SIZE: usize = 5 * 1024 * 1024;

/// Part size used unless configured otherwise.
pub const DEFAULT_PART_SIZE: usize = MIN_PART_SIZE;

/// Parts uploaded concurrently unless configured otherwise.
pub const DEFAULT_PART_CONCURRENCY: usize = 4;

/// Result of a finished upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadSummary {
    pub bytes_uploaded: u64,
    pub parts: usize,
    /// Whole-object checksum reported by the store.
    pub server_checksum: String,
}

#[derive(Clone)]
pub struct MultipartUploader {
    store: Arc<dyn ObjectStore>,
    part_size: usize,
    concurrency: usize,
}

impl MultipartUploader {
    pub fn new(store: Arc<dyn ObjectStore>, part_size: usize) -> BackupResult<Self> {
        if part_size == 0 {
            return Err(BackupError::InvalidPartSize);
        }
        Ok(Self {
            store,
            part_size,
            concurrency: DEFAULT_PART_CONCURRENCY,
        })
    }

    /// Cap on parts in flight. Zero is treated as one.
    #[must_use]
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn part_size(&self) -> usize {
        self.part_size
    }

    /// Upload `body` to `key` and return the store's checksum.
    ///
    /// Fails on any store error, on a stream error, and when the store does
    /// not report a checksum for the finished object. Nothing is retried and
    /// a failed session is left for the store's lifecycle rules to clean up.
    pub async fn upload(
        &self,
        key: &str,
        body: ByteStream,
        options: &UploadOptions,
    ) -> BackupResult<UploadSummary> {
        let start = Instant::now();
        let mut windows = FixedWindows::new(body, self.part_size);

        let first = windows.try_next().await.map_err(BackupError::stream)?;
        let second = match first {
            Some(_) => windows.try_next().await.map_err(BackupError::stream)?,
            None => None,
        };

        let summary = match (first, second) {
            (Some(first), Some(second)) => {
                let rest = stream::iter([Ok(first), Ok(second)]).chain(windows);
                self.put_multipart(key, rest, options).await?
            }
            (first, _) => {
                self.put_single(key, first.unwrap_or_default(), options)
                    .await?
            }
        };

        info!(
            key,
            parts = summary.parts,
            bytes = summary.bytes_uploaded,
            duration_ms = start.elapsed().as_secs_f64() * 1000.0,
            "upload finished"
        );
        Ok(summary)
    }

    async fn put_single(
        &self,
        key: &str,
        body: Bytes,
        options: &UploadOptions,
    ) -> BackupResult<UploadSummary> {
        let bytes_uploaded = body.len() as u64;
        let receipt = self.store.put_object(key, body, options).await?;
        let server_checksum = receipt
            .checksum_sha256
            .ok_or_else(|| BackupError::MissingServerChecksum { key: key.into() })?;

        Ok(UploadSummary {
            bytes_uploaded,
            parts: 1,
            server_checksum,
        })
    }

    async fn put_multipart<S>(
        &self,
        key: &str,
        windows: S,
        options: &UploadOptions,
    ) -> BackupResult<UploadSummary>
    where
        S: futures::Stream<Item = std::io::Result<Bytes>> + Send,
    {
        let upload_id = self.store.create_multipart_upload(key, options).await?;
        debug!(key, upload_id = %upload_id, "multipart upload initiated");

        let store = &self.store;
        let upload_id = upload_id.as_str();
        let mut uploaded: Vec<(CompletedPart, u64)> = windows
            .enumerate()
            .map(|(index, window)| async move {
                let window = window.map_err(BackupError::stream)?;
                let part_number =
                    i32::try_from(index + 1).map_err(|_| StoreError::InvalidPartOrder)?;
                let size = window.len() as u64;
                let part = store
                    .upload_part(key, upload_id, part_number, window)
                    .await?;
                debug!(key, part_number, size, "part uploaded");
                Ok::<_, BackupError>((part, size))
            })
            .buffer_unordered(self.concurrency)
            .try_collect()
            .await?;

        // Parts finish in any order; completion lists them by number.
        uploaded.sort_by_key(|(part, _)| part.part_number);
        let bytes_uploaded = uploaded.iter().map(|(_, size)| size).sum();
        let parts: Vec<CompletedPart> = uploaded.into_iter().map(|(part, _)| part).collect();
        let part_count = parts.len();

        let receipt = self
            .store
            .complete_multipart_upload(key, upload_id, parts)
            .await?;
        let server_checksum = receipt
            .checksum_sha256
            .ok_or_else(|| BackupError::MissingServerChecksum { key: key.into() })?;

        Ok(UploadSummary {
            bytes_uploaded,
            parts: part_count,
            server_checksum,
        })
    }
}
