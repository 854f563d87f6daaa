//! Error taxonomy for the archive-upload-verify pipeline.
//!
//! Storage backends report `StoreError`; everything above them speaks
//! `BackupError`. Per-job failures are folded into an `UploadOutcome` by the
//! verified upload and never escape a backup pass.

use crate::stores::StoreError;
use chrono::NaiveDate;
use std::{io, path::PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BackupError {
    /// The archive stream failed before reaching end-of-stream.
    #[error("archive stream failed: {0}")]
    StreamRead(#[source] io::Error),

    /// Any transport or protocol failure during the upload sequence.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The storage service finished the upload without reporting a checksum.
    #[error("upload of `{key}` completed without a SHA-256 checksum")]
    MissingServerChecksum { key: String },

    #[error("part size must be at least 1 byte")]
    InvalidPartSize,

    #[error("cannot go {days_ago} days back from {date}")]
    DateOutOfRange { date: NaiveDate, days_ago: u32 },

    #[error("failed to enumerate library folders under {}: {source}", path.display())]
    Enumerate {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl BackupError {
    /// Wrap a stream failure, keeping the original `io::Error`.
    pub fn stream(err: io::Error) -> Self {
        Self::StreamRead(err)
    }

    /// True when the failure came from reading the archive rather than the store.
    pub fn is_stream_read(&self) -> bool {
        matches!(self, Self::StreamRead(_))
    }
}

pub type BackupResult<T> = Result<T, BackupError>;
