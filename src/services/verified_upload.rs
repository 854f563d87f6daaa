//! Upload a folder archive, then prove the stored object matches a second,
//! independent read of the same folder.

use crate::{
    errors::BackupResult,
    models::{ArchiveJob, UploadOutcome},
    services::{
        archive::ArchiveProducer, checksum::composite_checksum,
        multipart_upload::MultipartUploader,
    },
};
use std::sync::Arc;
use tracing::{Instrument, error, info, info_span};

/// Archives always contain the job folder's contents rooted at `.`.
const ARCHIVE_ROOT: &str = ".";

#[derive(Clone)]
pub struct VerifiedUploader {
    producer: Arc<dyn ArchiveProducer>,
    uploader: MultipartUploader,
}

impl VerifiedUploader {
    pub fn new(producer: Arc<dyn ArchiveProducer>, uploader: MultipartUploader) -> Self {
        Self { producer, uploader }
    }

    /// Run one job to a terminal outcome. Never returns an error: failures
    /// are logged and folded into the outcome.
    pub async fn run(&self, job: &ArchiveJob) -> UploadOutcome {
        let span = info_span!(
            "verified_upload",
            key = %job.key,
            source = %job.source_path.display()
        );
        self.run_inner(job).instrument(span).await
    }

    async fn run_inner(&self, job: &ArchiveJob) -> UploadOutcome {
        let folders = [ARCHIVE_ROOT.to_string()];

        let body = self.producer.produce(&job.source_path, &folders);
        let summary = match self
            .uploader
            .upload(&job.key, body, &job.upload_options())
            .await
        {
            Ok(summary) => summary,
            Err(err) => {
                error!(error = %err, "upload failed");
                return UploadOutcome::UploadFailed;
            }
        };

        // Second pass only starts once the upload is settled.
        let local_checksum = match self.local_checksum(job, &folders).await {
            Ok(checksum) => checksum,
            Err(err) => {
                error!(error = %err, "re-reading archive for verification failed");
                return UploadOutcome::UploadFailed;
            }
        };

        info!(
            server_checksum = %summary.server_checksum,
            local_checksum = %local_checksum,
            parts = summary.parts,
            "checksums computed"
        );

        if summary.server_checksum == local_checksum {
            UploadOutcome::Success
        } else {
            error!(
                server_checksum = %summary.server_checksum,
                local_checksum = %local_checksum,
                "checksum mismatch"
            );
            UploadOutcome::ChecksumInvalid
        }
    }

    async fn local_checksum(&self, job: &ArchiveJob, folders: &[String]) -> BackupResult<String> {
        let stream = self.producer.produce(&job.source_path, folders);
        composite_checksum(stream, self.uploader.part_size()).await
    }
}
