use async_trait::async_trait;
use bytes::Bytes;
use chrono::NaiveDate;
use flate2::read::GzDecoder;
use futures::{StreamExt, TryStreamExt, stream};
use library_backup::{
    models::{
        ArchiveJob, BackupPolicy, BackupRunResult, CompletedPart, JobReport, UploadOptions,
        UploadOutcome, UploadReceipt,
    },
    services::{
        archive::TarGzArchiver, backup_service::BackupService, checksum::composite_checksum,
        multipart_upload::MultipartUploader, verified_upload::VerifiedUploader,
    },
    stores::{LocalStore, ObjectStore, StoreError, StoreResult},
};
use std::{fs, path::Path, sync::Arc};
use tempfile::tempdir;

const MIB: usize = 1024 * 1024;

/// Bytes gzip cannot shrink, so archive size tracks input size.
fn noise(len: usize, seed: u64) -> Vec<u8> {
    let mut state = seed | 1;
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            state as u8
        })
        .collect()
}

fn verified(store: Arc<dyn ObjectStore>, part_size: usize) -> VerifiedUploader {
    let uploader = MultipartUploader::new(store, part_size).unwrap();
    VerifiedUploader::new(Arc::new(TarGzArchiver::new().with_level(1)), uploader)
}

/// Fails every call whose key contains `poison`, forwards the rest.
struct FaultyStore {
    inner: LocalStore,
    poison: &'static str,
}

impl FaultyStore {
    fn check(&self, key: &str) -> StoreResult<()> {
        if key.contains(self.poison) {
            Err(StoreError::Backend(format!("connection refused for `{key}`")))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl ObjectStore for FaultyStore {
    async fn create_multipart_upload(
        &self,
        key: &str,
        options: &UploadOptions,
    ) -> StoreResult<String> {
        self.check(key)?;
        self.inner.create_multipart_upload(key, options).await
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        body: Bytes,
    ) -> StoreResult<CompletedPart> {
        self.check(key)?;
        self.inner.upload_part(key, upload_id, part_number, body).await
    }

    async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: Vec<CompletedPart>,
    ) -> StoreResult<UploadReceipt> {
        self.check(key)?;
        self.inner
            .complete_multipart_upload(key, upload_id, parts)
            .await
    }

    async fn put_object(
        &self,
        key: &str,
        body: Bytes,
        options: &UploadOptions,
    ) -> StoreResult<UploadReceipt> {
        self.check(key)?;
        self.inner.put_object(key, body, options).await
    }

    async fn object_exists(&self, key: &str) -> StoreResult<bool> {
        self.inner.object_exists(key).await
    }
}

fn tenant_day(location: &Path, tenant: &str, date: &str, files: &[(&str, Vec<u8>)]) {
    let dir = location.join("library").join(tenant).join(date);
    fs::create_dir_all(&dir).unwrap();
    for (name, body) in files {
        fs::write(dir.join(name), body).unwrap();
    }
}

#[tokio::test]
async fn small_folder_uploads_as_one_unsuffixed_part() {
    let folder = tempdir().unwrap();
    fs::write(folder.path().join("photo.jpg"), noise(MIB, 1)).unwrap();
    let root = tempdir().unwrap();
    let store = Arc::new(LocalStore::in_memory(root.path(), "backups").await.unwrap());

    let job = ArchiveJob::new(folder.path(), "single.tgz");
    let outcome = verified(store.clone(), 5 * MIB).run(&job).await;

    assert_eq!(outcome, UploadOutcome::Success);
    let object = store.get_object_metadata("single.tgz").await.unwrap();
    assert!(!object.checksum_sha256.contains('-'), "{}", object.checksum_sha256);

    // The stored bytes are a readable archive with the same checksum.
    let stored: Vec<Bytes> = store
        .get_object_stream("single.tgz")
        .await
        .unwrap()
        .try_collect()
        .await
        .unwrap();
    let stored = stored.concat();
    let local = composite_checksum(
        stream::iter([Ok(Bytes::from(stored.clone()))]).boxed(),
        5 * MIB,
    )
    .await
    .unwrap();
    assert_eq!(local, object.checksum_sha256);

    let mut archive = tar::Archive::new(GzDecoder::new(&stored[..]));
    let names: Vec<String> = archive
        .entries()
        .unwrap()
        .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
        .collect();
    assert!(names.iter().any(|n| n.ends_with("photo.jpg")), "{names:?}");
}

#[tokio::test]
async fn large_folder_uploads_as_suffixed_multipart_object() {
    let folder = tempdir().unwrap();
    fs::write(folder.path().join("movie.mp4"), noise(10 * MIB, 2)).unwrap();
    let root = tempdir().unwrap();
    let store = Arc::new(LocalStore::in_memory(root.path(), "backups").await.unwrap());

    let job = ArchiveJob::new(folder.path(), "multi.tgz");
    let outcome = verified(store.clone(), 5 * MIB).run(&job).await;

    assert_eq!(outcome, UploadOutcome::Success);
    let object = store.get_object_metadata("multi.tgz").await.unwrap();
    let (_, parts) = object.checksum_sha256.rsplit_once('-').unwrap();
    assert!(parts.parse::<usize>().unwrap() >= 2);
}

#[tokio::test]
async fn failing_job_does_not_stop_its_sibling() {
    let location = tempdir().unwrap();
    tenant_day(location.path(), "alice", "2024/05/01", &[("a.jpg", noise(4096, 3))]);
    tenant_day(location.path(), "bob", "2024/05/01", &[("b.jpg", noise(4096, 4))]);

    let root = tempdir().unwrap();
    let store = Arc::new(FaultyStore {
        inner: LocalStore::in_memory(root.path(), "backups").await.unwrap(),
        poison: "bob",
    });
    let service = BackupService::new(verified(store.clone(), 1024));

    let result = service
        .run(
            location.path(),
            NaiveDate::from_ymd_opt(2024, 5, 2).unwrap(),
            &BackupPolicy::recent(),
        )
        .await
        .unwrap();

    assert_eq!(
        result,
        BackupRunResult::UploadFailed {
            details: vec![
                JobReport {
                    key: "recent/alice/2024/05/01.tgz".into(),
                    outcome: UploadOutcome::Success,
                },
                JobReport {
                    key: "recent/bob/2024/05/01.tgz".into(),
                    outcome: UploadOutcome::UploadFailed,
                },
            ]
        }
    );
    assert!(store.object_exists("recent/alice/2024/05/01.tgz").await.unwrap());
    assert!(!store.object_exists("recent/bob/2024/05/01.tgz").await.unwrap());
}

#[tokio::test]
async fn both_policies_back_up_their_own_day() {
    let location = tempdir().unwrap();
    tenant_day(location.path(), "alice", "2024/05/01", &[("new.jpg", noise(2048, 5))]);
    tenant_day(location.path(), "alice", "2024/04/17", &[("old.jpg", noise(2048, 6))]);
    // Only has content for an unrelated day.
    tenant_day(location.path(), "carol", "2024/03/03", &[("x.jpg", noise(16, 7))]);

    let root = tempdir().unwrap();
    let store = Arc::new(LocalStore::in_memory(root.path(), "backups").await.unwrap());
    let service = BackupService::new(verified(store.clone(), 1024));
    let date = NaiveDate::from_ymd_opt(2024, 5, 2).unwrap();

    for policy in [BackupPolicy::archival(), BackupPolicy::recent()] {
        let result = service.run(location.path(), date, &policy).await.unwrap();
        assert!(result.is_success(), "{}: {result:?}", policy.name);
    }

    assert_eq!(
        store.list_keys(None).await.unwrap(),
        vec![
            "old/alice/2024/04/17.tgz".to_string(),
            "recent/alice/2024/05/01.tgz".to_string(),
        ]
    );
    let archived = store.get_object_metadata("old/alice/2024/04/17.tgz").await.unwrap();
    assert_eq!(archived.storage_class, "DEEP_ARCHIVE");
    assert!(archived.expires_at.is_none());
    let recent = store.get_object_metadata("recent/alice/2024/05/01.tgz").await.unwrap();
    assert_eq!(recent.storage_class, "STANDARD");
    assert!(recent.expires_at.is_some());
}

#[tokio::test]
async fn empty_library_pass_succeeds() {
    let location = tempdir().unwrap();
    let root = tempdir().unwrap();
    let store = Arc::new(LocalStore::in_memory(root.path(), "backups").await.unwrap());
    let service = BackupService::new(verified(store, 1024));

    let result = service
        .run(
            location.path(),
            NaiveDate::from_ymd_opt(2024, 5, 2).unwrap(),
            &BackupPolicy::recent(),
        )
        .await
        .unwrap();
    assert_eq!(result, BackupRunResult::Success);
}
