//! Backup jobs, the policies that produce them, and upload hints.

use serde::{Deserialize, Serialize};
use std::{fmt, path::PathBuf, str::FromStr, time::Duration};

const DAY: Duration = Duration::from_secs(24 * 60 * 60);

/// Storage class names understood by the object store.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[value(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StorageClass {
    Standard,
    ReducedRedundancy,
    StandardIa,
    OnezoneIa,
    IntelligentTiering,
    Glacier,
    DeepArchive,
    GlacierIr,
}

impl StorageClass {
    /// Wire name, e.g. `DEEP_ARCHIVE`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Standard => "STANDARD",
            Self::ReducedRedundancy => "REDUCED_REDUNDANCY",
            Self::StandardIa => "STANDARD_IA",
            Self::OnezoneIa => "ONEZONE_IA",
            Self::IntelligentTiering => "INTELLIGENT_TIERING",
            Self::Glacier => "GLACIER",
            Self::DeepArchive => "DEEP_ARCHIVE",
            Self::GlacierIr => "GLACIER_IR",
        }
    }
}

impl fmt::Display for StorageClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StorageClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "STANDARD" => Ok(Self::Standard),
            "REDUCED_REDUNDANCY" => Ok(Self::ReducedRedundancy),
            "STANDARD_IA" => Ok(Self::StandardIa),
            "ONEZONE_IA" => Ok(Self::OnezoneIa),
            "INTELLIGENT_TIERING" => Ok(Self::IntelligentTiering),
            "GLACIER" => Ok(Self::Glacier),
            "DEEP_ARCHIVE" => Ok(Self::DeepArchive),
            "GLACIER_IR" => Ok(Self::GlacierIr),
            other => Err(format!("unknown storage class `{other}`")),
        }
    }
}

/// Hints forwarded to the object store when an upload is started.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UploadOptions {
    /// Object expires this long after the upload starts.
    pub ttl: Option<Duration>,
    pub storage_class: Option<StorageClass>,
}

/// One logical backup of one folder to one key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArchiveJob {
    /// Folder whose contents become the archive.
    pub source_path: PathBuf,

    /// Destination object key.
    pub key: String,

    pub ttl: Option<Duration>,

    pub storage_class: Option<StorageClass>,
}

impl ArchiveJob {
    pub fn new(source_path: impl Into<PathBuf>, key: impl Into<String>) -> Self {
        Self {
            source_path: source_path.into(),
            key: key.into(),
            ttl: None,
            storage_class: None,
        }
    }

    #[must_use]
    pub fn with_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.ttl = ttl;
        self
    }

    #[must_use]
    pub fn with_storage_class(mut self, storage_class: Option<StorageClass>) -> Self {
        self.storage_class = storage_class;
        self
    }

    pub fn upload_options(&self) -> UploadOptions {
        UploadOptions {
            ttl: self.ttl,
            storage_class: self.storage_class,
        }
    }
}

/// Describes one scheduled backup pass over the library.
///
/// `recent` and `archival` share the same job shape and differ only in the
/// date offset, key prefix and retention settings.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BackupPolicy {
    pub name: &'static str,

    /// How many days before the reference date the backed-up folder is.
    pub days_ago: u32,

    /// First segment of every destination key.
    pub key_prefix: String,

    pub ttl: Option<Duration>,

    pub storage_class: Option<StorageClass>,
}

impl BackupPolicy {
    /// Yesterday's folders, kept for thirty days.
    pub fn recent() -> Self {
        Self {
            name: "recent",
            days_ago: 1,
            key_prefix: "recent".into(),
            ttl: Some(DAY * 30),
            storage_class: Some(StorageClass::Standard),
        }
    }

    /// Folders from fifteen days ago, moved to long-term storage.
    pub fn archival() -> Self {
        Self {
            name: "archival",
            days_ago: 15,
            key_prefix: "old".into(),
            ttl: None,
            storage_class: Some(StorageClass::DeepArchive),
        }
    }
}

/// Convert a TTL given in whole days.
pub fn ttl_from_days(days: u64) -> Duration {
    Duration::from_secs(days.saturating_mul(DAY.as_secs()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_class_parses_wire_names() {
        assert_eq!(
            "DEEP_ARCHIVE".parse::<StorageClass>().unwrap(),
            StorageClass::DeepArchive
        );
        assert_eq!(
            "standard".parse::<StorageClass>().unwrap(),
            StorageClass::Standard
        );
        assert!("COLD".parse::<StorageClass>().is_err());
        assert_eq!(StorageClass::GlacierIr.to_string(), "GLACIER_IR");
    }

    #[test]
    fn policies_differ_only_in_schedule_and_retention() {
        let recent = BackupPolicy::recent();
        let archival = BackupPolicy::archival();

        assert_eq!(recent.days_ago, 1);
        assert_eq!(recent.ttl, Some(Duration::from_secs(30 * 24 * 60 * 60)));
        assert_eq!(recent.storage_class, Some(StorageClass::Standard));

        assert_eq!(archival.days_ago, 15);
        assert_eq!(archival.ttl, None);
        assert_eq!(archival.storage_class, Some(StorageClass::DeepArchive));
    }

    #[test]
    fn job_carries_upload_options() {
        let job = ArchiveJob::new("/srv/library/alice/2023/01/01", "recent/alice/2023/01/01.tgz")
            .with_ttl(Some(ttl_from_days(2)))
            .with_storage_class(Some(StorageClass::StandardIa));

        assert_eq!(
            job.upload_options(),
            UploadOptions {
                ttl: Some(Duration::from_secs(2 * 24 * 60 * 60)),
                storage_class: Some(StorageClass::StandardIa),
            }
        );
    }
}
