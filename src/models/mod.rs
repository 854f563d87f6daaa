//! Core data models for the backup pipeline.
//!
//! Jobs and outcomes are plain values. The multipart and object records map
//! to local store tables via `sqlx::FromRow`.

pub mod job;
pub mod multipart;
pub mod object;
pub mod outcome;

use bytes::Bytes;
use futures::stream::BoxStream;
use std::io;

pub use job::{ArchiveJob, BackupPolicy, StorageClass, UploadOptions};
pub use multipart::{CompletedPart, UploadReceipt};
pub use outcome::{BackupRunResult, JobReport, UploadOutcome};

/// A finite, non-restartable sequence of byte chunks of arbitrary sizes.
pub type ByteStream = BoxStream<'static, io::Result<Bytes>>;
