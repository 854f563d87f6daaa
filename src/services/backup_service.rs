//! Scheduled backups of the media library.
//!
//! The library is laid out as `{location}/library/{tenant}/{YYYY}/{MM}/{DD}`.
//! A pass picks the day `policy.days_ago` before the reference date, builds
//! one job per tenant that has a folder for that day and runs them all at
//! once.

use crate::{
    errors::{BackupError, BackupResult},
    models::{ArchiveJob, BackupPolicy, BackupRunResult, JobReport},
    services::verified_upload::VerifiedUploader,
};
use chrono::{Datelike, Days, NaiveDate};
use futures::future::join_all;
use std::{
    io,
    path::{Path, PathBuf},
};
use tokio::fs;
use tracing::{Instrument, debug, info, info_span, warn};

const LIBRARY_DIR: &str = "library";
const ARCHIVE_EXTENSION: &str = "tgz";

/// `YYYY/MM/DD` for `date`, used both on disk and in keys.
pub fn date_path(date: NaiveDate) -> String {
    format!("{:04}/{:02}/{:02}", date.year(), date.month(), date.day())
}

/// Day a policy backs up for a given reference date.
pub fn target_date(policy: &BackupPolicy, reference_date: NaiveDate) -> BackupResult<NaiveDate> {
    reference_date
        .checked_sub_days(Days::new(policy.days_ago.into()))
        .ok_or(BackupError::DateOutOfRange {
            date: reference_date,
            days_ago: policy.days_ago,
        })
}

/// Immediate non-hidden sub-directories of the library, sorted by name. A
/// missing library directory has no tenants.
pub async fn list_tenants(library: &Path) -> BackupResult<Vec<String>> {
    let enumerate = |source: io::Error| BackupError::Enumerate {
        path: library.to_path_buf(),
        source,
    };

    let mut entries = match fs::read_dir(library).await {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            debug!(path = %library.display(), "no library directory");
            return Ok(Vec::new());
        }
        Err(err) => return Err(enumerate(err)),
    };

    let mut tenants = Vec::new();
    while let Some(entry) = entries.next_entry().await.map_err(enumerate)? {
        if !entry.file_type().await.map_err(enumerate)?.is_dir() {
            continue;
        }
        match entry.file_name().into_string() {
            Ok(name) if name.starts_with('.') => {
                debug!(name = %name, "skipping hidden folder");
            }
            Ok(name) => tenants.push(name),
            Err(name) => warn!(name = ?name, "skipping tenant folder with a non UTF-8 name"),
        }
    }
    tenants.sort();
    Ok(tenants)
}

/// One job per tenant with a folder for the policy's day, in tenant order.
pub async fn jobs_for(
    policy: &BackupPolicy,
    upload_location: &Path,
    reference_date: NaiveDate,
) -> BackupResult<Vec<ArchiveJob>> {
    let date = date_path(target_date(policy, reference_date)?);
    let library = upload_location.join(LIBRARY_DIR);

    let mut jobs = Vec::new();
    for tenant in list_tenants(&library).await? {
        let source: PathBuf = library.join(&tenant).join(&date);
        match fs::metadata(&source).await {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => {
                debug!(tenant = %tenant, path = %source.display(), "date entry is not a folder, skipping");
                continue;
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                debug!(tenant = %tenant, path = %source.display(), "nothing for this date, skipping");
                continue;
            }
            Err(err) => {
                return Err(BackupError::Enumerate {
                    path: source,
                    source: err,
                });
            }
        }

        let key = format!("{}/{tenant}/{date}.{ARCHIVE_EXTENSION}", policy.key_prefix);
        jobs.push(
            ArchiveJob::new(source, key)
                .with_ttl(policy.ttl)
                .with_storage_class(policy.storage_class),
        );
    }
    Ok(jobs)
}

/// Runs backup passes through a shared `VerifiedUploader`.
#[derive(Clone)]
pub struct BackupService {
    uploader: VerifiedUploader,
}

impl BackupService {
    pub fn new(uploader: VerifiedUploader) -> Self {
        Self { uploader }
    }

    /// Run one pass. Jobs run concurrently and every job runs to completion
    /// regardless of its siblings. Only enumeration errors are returned as
    /// `Err`.
    pub async fn run(
        &self,
        upload_location: &Path,
        reference_date: NaiveDate,
        policy: &BackupPolicy,
    ) -> BackupResult<BackupRunResult> {
        let span = info_span!("backup_pass", policy = policy.name, date = %reference_date);
        async {
            let jobs = jobs_for(policy, upload_location, reference_date).await?;
            info!(jobs = jobs.len(), "starting backup pass");
            Ok::<_, BackupError>(self.run_jobs(&jobs).await)
        }
        .instrument(span)
        .await
    }

    /// Run `jobs` concurrently and aggregate their outcomes in job order.
    pub async fn run_jobs(&self, jobs: &[ArchiveJob]) -> BackupRunResult {
        let reports = join_all(jobs.iter().map(|job| async move {
            JobReport {
                key: job.key.clone(),
                outcome: self.uploader.run(job).await,
            }
        }))
        .await;

        let failed = reports.iter().filter(|r| !r.outcome.is_success()).count();
        info!(jobs = reports.len(), failed, "backup pass finished");
        BackupRunResult::from_reports(reports)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::StorageClass;
    use std::fs as std_fs;
    use tempfile::tempdir;

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn date_path_is_zero_padded() {
        assert_eq!(date_path(day(2024, 3, 7)), "2024/03/07");
        assert_eq!(date_path(day(987, 12, 31)), "0987/12/31");
    }

    #[test]
    fn target_date_crosses_month_and_year_boundaries() {
        assert_eq!(
            target_date(&BackupPolicy::recent(), day(2024, 3, 1)).unwrap(),
            day(2024, 2, 29)
        );
        assert_eq!(
            target_date(&BackupPolicy::archival(), day(2024, 1, 10)).unwrap(),
            day(2023, 12, 26)
        );
        assert!(target_date(&BackupPolicy::archival(), NaiveDate::MIN).is_err());
    }

    #[tokio::test]
    async fn missing_library_yields_no_jobs() {
        let dir = tempdir().unwrap();
        let jobs = jobs_for(&BackupPolicy::recent(), dir.path(), day(2024, 5, 2))
            .await
            .unwrap();
        assert!(jobs.is_empty());
    }

    #[tokio::test]
    async fn jobs_cover_tenants_with_a_folder_for_the_day() {
        let dir = tempdir().unwrap();
        let library = dir.path().join("library");
        std_fs::create_dir_all(library.join("zoe/2024/05/01")).unwrap();
        std_fs::create_dir_all(library.join("adam/2024/05/01")).unwrap();
        // No folder for the day: skipped.
        std_fs::create_dir_all(library.join("mia/2024/04/30")).unwrap();
        // Stray files next to tenants are ignored.
        std_fs::write(library.join("README"), b"not a tenant").unwrap();

        let jobs = jobs_for(&BackupPolicy::recent(), dir.path(), day(2024, 5, 2))
            .await
            .unwrap();

        let keys: Vec<&str> = jobs.iter().map(|j| j.key.as_str()).collect();
        assert_eq!(
            keys,
            vec!["recent/adam/2024/05/01.tgz", "recent/zoe/2024/05/01.tgz"]
        );
        assert_eq!(jobs[0].source_path, library.join("adam").join("2024/05/01"));
        assert_eq!(jobs[0].storage_class, Some(StorageClass::Standard));
        assert!(jobs[0].ttl.is_some());
    }

    #[tokio::test]
    async fn hidden_folders_are_not_tenants() {
        let dir = tempdir().unwrap();
        let library = dir.path().join("library");
        std_fs::create_dir_all(library.join(".thumbs/2024/05/01")).unwrap();
        std_fs::create_dir_all(library.join("adam/2024/05/01")).unwrap();

        assert_eq!(list_tenants(&library).await.unwrap(), vec!["adam".to_string()]);

        let jobs = jobs_for(&BackupPolicy::recent(), dir.path(), day(2024, 5, 2))
            .await
            .unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].key, "recent/adam/2024/05/01.tgz");
    }

    #[tokio::test]
    async fn archival_jobs_use_their_own_prefix_and_retention() {
        let dir = tempdir().unwrap();
        std_fs::create_dir_all(dir.path().join("library/adam/2024/04/17")).unwrap();

        let jobs = jobs_for(&BackupPolicy::archival(), dir.path(), day(2024, 5, 2))
            .await
            .unwrap();

        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].key, "old/adam/2024/04/17.tgz");
        assert_eq!(jobs[0].ttl, None);
        assert_eq!(jobs[0].storage_class, Some(StorageClass::DeepArchive));
    }

    #[tokio::test]
    async fn unreadable_library_is_an_enumeration_error() {
        let dir = tempdir().unwrap();
        // `library` exists but is a file.
        std_fs::write(dir.path().join("library"), b"").unwrap();

        let err = jobs_for(&BackupPolicy::recent(), dir.path(), day(2024, 5, 2))
            .await
            .unwrap_err();
        assert!(matches!(err, BackupError::Enumerate { .. }));
    }
}
