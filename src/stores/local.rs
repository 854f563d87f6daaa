//! LocalStore: the object store's multipart protocol on local disk.
//!
//! Payloads live beneath `base_path/{bucket}/{shard}/{shard}/{key}`; parts of
//! open sessions beneath `base_path/{bucket}/.uploads/{upload_id}/{part}`.
//! Sessions, parts and object metadata are kept in SQLite. Checksums are
//! computed here from the bytes received, the same way the hosted service
//! does: SHA-256 per part, then a hash of the part digests suffixed with the
//! part count.

use crate::models::{
    ByteStream, CompletedPart, UploadOptions, UploadReceipt,
    multipart::{MultipartPart, MultipartUpload},
    object::Object,
};
use crate::stores::{ObjectStore, StoreError, StoreResult};
use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use sha2::{Digest, Sha256};
use sqlx::{
    QueryBuilder, SqlitePool,
    sqlite::{Sqlite, SqliteConnectOptions, SqlitePoolOptions},
};
use std::{
    collections::HashMap,
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tokio_util::io::ReaderStream;
use tracing::debug;
use uuid::Uuid;

const MIGRATION_SQL: &str = include_str!("../../migrations/0001_init.sql");
const MAX_OBJECT_KEY_LEN: usize = 1024;
const BUCKET_NAME_MIN_LEN: usize = 3;
const BUCKET_NAME_MAX_LEN: usize = 63;
const MAX_PART_NUMBER: i32 = 10_000;
const UPLOADS_DIR: &str = ".uploads";
const META_DIR: &str = ".meta";
const DEFAULT_STORAGE_CLASS: &str = "STANDARD";

/// Filesystem-backed object store.
#[derive(Clone)]
pub struct LocalStore {
    /// Shared SQLite connection pool used for metadata operations.
    pub db: Arc<SqlitePool>,

    /// Base directory on disk where object payloads are stored.
    pub base_path: PathBuf,

    bucket: String,
}

impl LocalStore {
    /// Open (or create) a store rooted at `base_path`, keeping metadata in
    /// `base_path/.meta/local-store.db`.
    pub async fn open(base_path: impl Into<PathBuf>, bucket: &str) -> StoreResult<Self> {
        let base_path = base_path.into();
        validate_bucket_name(bucket)?;

        let meta_dir = base_path.join(META_DIR);
        fs::create_dir_all(&meta_dir).await?;
        let options = SqliteConnectOptions::new()
            .filename(meta_dir.join("local-store.db"))
            .create_if_missing(true);
        let db = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        Self::with_pool(Arc::new(db), base_path, bucket).await
    }

    /// Store with metadata in a private in-memory database. Payloads still
    /// go to `base_path`; metadata is lost when the store is dropped.
    pub async fn in_memory(base_path: impl Into<PathBuf>, bucket: &str) -> StoreResult<Self> {
        let db = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;

        Self::with_pool(Arc::new(db), base_path, bucket).await
    }

    /// Wrap an existing pool and apply the schema.
    pub async fn with_pool(
        db: Arc<SqlitePool>,
        base_path: impl Into<PathBuf>,
        bucket: &str,
    ) -> StoreResult<Self> {
        validate_bucket_name(bucket)?;
        let store = Self {
            db,
            base_path: base_path.into(),
            bucket: bucket.to_string(),
        };
        fs::create_dir_all(store.bucket_root()).await?;
        store.run_migrations().await?;
        Ok(store)
    }

    async fn run_migrations(&self) -> StoreResult<()> {
        let statements = MIGRATION_SQL
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty());

        for stmt in statements {
            debug!("Executing migration SQL: {}", stmt);
            sqlx::query(stmt).execute(&*self.db).await?;
        }

        Ok(())
    }

    /// Basic key validation to avoid trivial path traversal vectors.
    fn ensure_key_safe(&self, key: &str) -> StoreResult<()> {
        let invalid = key.is_empty()
            || key.len() > MAX_OBJECT_KEY_LEN
            || key.starts_with('/')
            || key.contains("..")
            || key
                .bytes()
                .any(|b| b.is_ascii_control() || b == b'\\' || b == b'\0');

        if invalid {
            return Err(StoreError::InvalidKey(key.to_string()));
        }
        Ok(())
    }

    fn bucket_root(&self) -> PathBuf {
        self.base_path.join(&self.bucket)
    }

    /// Two-level shard identifiers: first two bytes of MD5(bucket/key) in hex.
    fn object_shards(&self, key: &str) -> (String, String) {
        let digest = md5::compute(format!("{}/{}", self.bucket, key));
        (format!("{:02x}", digest[0]), format!("{:02x}", digest[1]))
    }

    fn object_path(&self, key: &str) -> PathBuf {
        let (shard_a, shard_b) = self.object_shards(key);
        let mut path = self.bucket_root();
        path.push(shard_a);
        path.push(shard_b);
        path.push(key);
        path
    }

    fn upload_dir(&self, upload_id: &str) -> PathBuf {
        self.bucket_root().join(UPLOADS_DIR).join(upload_id)
    }

    fn part_path(&self, upload_id: &str, part_number: i32) -> PathBuf {
        self.upload_dir(upload_id).join(part_number.to_string())
    }

    async fn fetch_upload(&self, key: &str, upload_id: &str) -> StoreResult<MultipartUpload> {
        sqlx::query_as::<_, MultipartUpload>(
            "SELECT id, bucket, key, upload_id, storage_class, expires_at, initiated_at
             FROM multipart_uploads
             WHERE upload_id = ? AND bucket = ? AND key = ?",
        )
        .bind(upload_id)
        .bind(&self.bucket)
        .bind(key)
        .fetch_one(&*self.db)
        .await
        .map_err(|err| match err {
            sqlx::Error::RowNotFound => StoreError::UploadNotFound {
                key: key.to_string(),
                upload_id: upload_id.to_string(),
            },
            other => StoreError::Sqlx(other),
        })
    }

    /// Fetch object metadata. Returns ObjectNotFound if missing.
    pub async fn get_object_metadata(&self, key: &str) -> StoreResult<Object> {
        self.ensure_key_safe(key)?;
        sqlx::query_as::<_, Object>(
            "SELECT id, bucket, key, size_bytes, etag, checksum_sha256, storage_class,
                    last_modified, expires_at
             FROM objects
             WHERE bucket = ? AND key = ?",
        )
        .bind(&self.bucket)
        .bind(key)
        .fetch_one(&*self.db)
        .await
        .map_err(|err| match err {
            sqlx::Error::RowNotFound => StoreError::ObjectNotFound(key.to_string()),
            other => StoreError::Sqlx(other),
        })
    }

    /// Stream an object's payload back from disk.
    pub async fn get_object_stream(&self, key: &str) -> StoreResult<ByteStream> {
        self.get_object_metadata(key).await?;
        let file = File::open(self.object_path(key)).await.map_err(|err| {
            if err.kind() == ErrorKind::NotFound {
                StoreError::ObjectNotFound(key.to_string())
            } else {
                StoreError::Io(err)
            }
        })?;
        Ok(ReaderStream::new(file).boxed())
    }

    /// Keys in this bucket, in lexicographic order, optionally filtered by prefix.
    pub async fn list_keys(&self, prefix: Option<&str>) -> StoreResult<Vec<String>> {
        let mut builder =
            QueryBuilder::<Sqlite>::new("SELECT key FROM objects WHERE bucket = ");
        builder.push_bind(&self.bucket);

        if let Some(prefix) = prefix {
            builder.push(" AND substr(key, 1, length(");
            builder.push_bind(prefix);
            builder.push(")) = ");
            builder.push_bind(prefix);
        }
        builder.push(" ORDER BY key ASC");

        let keys = builder
            .build_query_scalar::<String>()
            .fetch_all(&*self.db)
            .await?;
        Ok(keys)
    }

    /// Create a temp file next to where `key` will be published.
    async fn stage(&self, key: &str) -> StoreResult<(PathBuf, PathBuf, File)> {
        let file_path = self.object_path(key);
        let parent = file_path.parent().map(Path::to_path_buf).ok_or_else(|| {
            StoreError::Io(io::Error::other("object path missing parent directory"))
        })?;
        fs::create_dir_all(&parent).await?;
        let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));
        let file = File::create(&tmp_path).await?;
        Ok((tmp_path, file_path, file))
    }

    /// Atomically move a fully written temp file into place.
    async fn publish(&self, tmp_path: &Path, file_path: &Path) -> StoreResult<()> {
        if let Err(err) = fs::rename(tmp_path, file_path).await {
            if err.kind() == ErrorKind::AlreadyExists {
                fs::remove_file(file_path).await?;
                fs::rename(tmp_path, file_path).await?;
            } else {
                let _ = fs::remove_file(tmp_path).await;
                return Err(StoreError::Io(err));
            }
        }
        Ok(())
    }

    /// Upsert object metadata (S3-like overwrite semantics).
    async fn upsert_object(
        &self,
        key: &str,
        size_bytes: i64,
        etag: &str,
        checksum_sha256: &str,
        storage_class: &str,
        expires_at: Option<DateTime<Utc>>,
    ) -> StoreResult<Object> {
        let object = sqlx::query_as::<_, Object>(
            r#"
            INSERT INTO objects (
                id, bucket, key, size_bytes, etag, checksum_sha256,
                storage_class, last_modified, expires_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(bucket, key) DO UPDATE SET
                size_bytes = excluded.size_bytes,
                etag = excluded.etag,
                checksum_sha256 = excluded.checksum_sha256,
                storage_class = excluded.storage_class,
                last_modified = excluded.last_modified,
                expires_at = excluded.expires_at
            RETURNING id, bucket, key, size_bytes, etag, checksum_sha256,
                      storage_class, last_modified, expires_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&self.bucket)
        .bind(key)
        .bind(size_bytes)
        .bind(etag)
        .bind(checksum_sha256)
        .bind(storage_class)
        .bind(Utc::now())
        .bind(expires_at)
        .fetch_one(&*self.db)
        .await?;

        Ok(object)
    }

    async fn discard_upload(&self, session: &MultipartUpload) {
        let parts = sqlx::query("DELETE FROM multipart_parts WHERE upload_id = ?")
            .bind(session.id)
            .execute(&*self.db)
            .await;
        let upload = sqlx::query("DELETE FROM multipart_uploads WHERE id = ?")
            .bind(session.id)
            .execute(&*self.db)
            .await;
        if let Err(err) = parts.and(upload) {
            debug!("failed to drop session {}: {}", session.upload_id, err);
        }

        let dir = self.upload_dir(&session.upload_id);
        if let Err(err) = fs::remove_dir_all(&dir).await {
            if err.kind() != ErrorKind::NotFound {
                debug!("failed to remove upload directory {}: {}", dir.display(), err);
            }
        }
    }
}

#[async_trait]
impl ObjectStore for LocalStore {
    async fn create_multipart_upload(
        &self,
        key: &str,
        options: &UploadOptions,
    ) -> StoreResult<String> {
        self.ensure_key_safe(key)?;

        let now = Utc::now();
        let session = MultipartUpload {
            id: Uuid::new_v4(),
            bucket: self.bucket.clone(),
            key: key.to_string(),
            upload_id: Uuid::new_v4().simple().to_string(),
            storage_class: storage_class_name(options),
            expires_at: options
                .ttl
                .map(|ttl| expiry(now, ttl))
                .transpose()?,
            initiated_at: now,
        };

        fs::create_dir_all(self.upload_dir(&session.upload_id)).await?;
        sqlx::query(
            "INSERT INTO multipart_uploads
                (id, bucket, key, upload_id, storage_class, expires_at, initiated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(session.id)
        .bind(&session.bucket)
        .bind(&session.key)
        .bind(&session.upload_id)
        .bind(&session.storage_class)
        .bind(session.expires_at)
        .bind(session.initiated_at)
        .execute(&*self.db)
        .await?;

        debug!(key, upload_id = %session.upload_id, "multipart upload initiated");
        Ok(session.upload_id)
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        body: Bytes,
    ) -> StoreResult<CompletedPart> {
        self.ensure_key_safe(key)?;
        if !(1..=MAX_PART_NUMBER).contains(&part_number) {
            return Err(StoreError::InvalidPart {
                upload_id: upload_id.to_string(),
                part_number,
            });
        }
        let session = self.fetch_upload(key, upload_id).await?;

        let etag = format!("{:x}", md5::compute(&body));
        let sha256 = Sha256::digest(&body);
        fs::write(self.part_path(upload_id, part_number), &body).await?;

        sqlx::query(
            r#"
            INSERT INTO multipart_parts
                (id, upload_id, part_number, size_bytes, etag, sha256, uploaded_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(upload_id, part_number) DO UPDATE SET
                size_bytes = excluded.size_bytes,
                etag = excluded.etag,
                sha256 = excluded.sha256,
                uploaded_at = excluded.uploaded_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(session.id)
        .bind(part_number)
        .bind(body.len() as i64)
        .bind(&etag)
        .bind(sha256.to_vec())
        .bind(Utc::now())
        .execute(&*self.db)
        .await?;

        Ok(CompletedPart {
            part_number,
            etag,
            checksum_sha256: Some(general_purpose::STANDARD.encode(sha256)),
        })
    }

    async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: Vec<CompletedPart>,
    ) -> StoreResult<UploadReceipt> {
        self.ensure_key_safe(key)?;
        let session = self.fetch_upload(key, upload_id).await?;

        let ascending = parts.first().is_some_and(|p| p.part_number >= 1)
            && parts.windows(2).all(|w| w[0].part_number < w[1].part_number);
        if !ascending {
            return Err(StoreError::InvalidPartOrder);
        }

        let stored = sqlx::query_as::<_, MultipartPart>(
            "SELECT id, upload_id, part_number, size_bytes, etag, sha256, uploaded_at
             FROM multipart_parts WHERE upload_id = ?",
        )
        .bind(session.id)
        .fetch_all(&*self.db)
        .await?;
        let stored: HashMap<i32, MultipartPart> = stored
            .into_iter()
            .map(|part| (part.part_number, part))
            .collect();

        let mut selected = Vec::with_capacity(parts.len());
        for part in &parts {
            let found = stored
                .get(&part.part_number)
                .filter(|s| s.etag == part.etag.trim_matches('"'))
                .ok_or_else(|| StoreError::InvalidPart {
                    upload_id: upload_id.to_string(),
                    part_number: part.part_number,
                })?;
            selected.push(found);
        }

        let (tmp_path, file_path, mut file) = self.stage(key).await?;
        let written: io::Result<i64> = async {
            let mut size_bytes = 0i64;
            for part in &selected {
                let mut src = File::open(self.part_path(upload_id, part.part_number)).await?;
                size_bytes += tokio::io::copy(&mut src, &mut file).await? as i64;
            }
            file.flush().await?;
            file.sync_all().await?;
            Ok(size_bytes)
        }
        .await;
        let size_bytes = match written {
            Ok(size) => size,
            Err(err) => {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(StoreError::Io(err));
            }
        };
        self.publish(&tmp_path, &file_path).await?;

        let mut checksum = Sha256::new();
        let mut etag = md5::Context::new();
        for part in &selected {
            checksum.update(&part.sha256);
            let raw = decode_md5_hex(&part.etag).ok_or_else(|| StoreError::InvalidPart {
                upload_id: upload_id.to_string(),
                part_number: part.part_number,
            })?;
            etag.consume(raw);
        }
        let checksum = format!(
            "{}-{}",
            general_purpose::STANDARD.encode(checksum.finalize()),
            selected.len()
        );
        let etag = format!("{:x}-{}", etag.compute(), selected.len());

        let object = self
            .upsert_object(
                key,
                size_bytes,
                &etag,
                &checksum,
                &session.storage_class,
                session.expires_at,
            )
            .await?;
        self.discard_upload(&session).await;

        debug!(key, parts = selected.len(), size_bytes, "multipart upload completed");
        Ok(UploadReceipt {
            etag: Some(object.etag),
            checksum_sha256: Some(object.checksum_sha256),
        })
    }

    async fn put_object(
        &self,
        key: &str,
        body: Bytes,
        options: &UploadOptions,
    ) -> StoreResult<UploadReceipt> {
        self.ensure_key_safe(key)?;
        let expires_at = options
            .ttl
            .map(|ttl| expiry(Utc::now(), ttl))
            .transpose()?;

        let (tmp_path, file_path, mut file) = self.stage(key).await?;
        let written: io::Result<()> = async {
            file.write_all(&body).await?;
            file.flush().await?;
            file.sync_all().await
        }
        .await;
        if let Err(err) = written {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(StoreError::Io(err));
        }
        self.publish(&tmp_path, &file_path).await?;

        let etag = format!("{:x}", md5::compute(&body));
        let checksum = general_purpose::STANDARD.encode(Sha256::digest(&body));
        let object = self
            .upsert_object(
                key,
                body.len() as i64,
                &etag,
                &checksum,
                &storage_class_name(options),
                expires_at,
            )
            .await?;

        Ok(UploadReceipt {
            etag: Some(object.etag),
            checksum_sha256: Some(object.checksum_sha256),
        })
    }

    async fn object_exists(&self, key: &str) -> StoreResult<bool> {
        match self.get_object_metadata(key).await {
            Ok(_) => Ok(true),
            Err(StoreError::ObjectNotFound(_)) => Ok(false),
            Err(err) => Err(err),
        }
    }
}

fn storage_class_name(options: &UploadOptions) -> String {
    options
        .storage_class
        .map_or(DEFAULT_STORAGE_CLASS, |class| class.as_str())
        .to_string()
}

fn expiry(now: DateTime<Utc>, ttl: Duration) -> StoreResult<DateTime<Utc>> {
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|delta| now.checked_add_signed(delta))
        .ok_or(StoreError::ExpiryOutOfRange { ttl })
}

fn decode_md5_hex(etag: &str) -> Option<[u8; 16]> {
    if etag.len() != 32 {
        return None;
    }
    let mut raw = [0u8; 16];
    for (slot, pair) in raw.iter_mut().zip(etag.as_bytes().chunks(2)) {
        let pair = std::str::from_utf8(pair).ok()?;
        *slot = u8::from_str_radix(pair, 16).ok()?;
    }
    Some(raw)
}

/// Validate bucket name format.
///
/// Enforces S3-like naming rules:
/// - 3–63 characters
/// - lowercase letters, digits, dots, hyphens only
/// - cannot start/end with dot or hyphen
/// - cannot contain consecutive dots or dot-hyphen patterns
/// - cannot look like an IPv4 address
pub fn validate_bucket_name(name: &str) -> StoreResult<()> {
    let invalid = |reason: &str| {
        Err(StoreError::InvalidBucketName {
            name: name.to_string(),
            reason: reason.into(),
        })
    };

    let len = name.len();
    if !(BUCKET_NAME_MIN_LEN..=BUCKET_NAME_MAX_LEN).contains(&len) {
        return invalid("must be between 3 and 63 characters");
    }

    if !name
        .chars()
        .all(|c| matches!(c, 'a'..='z' | '0'..='9' | '.' | '-'))
    {
        return invalid("allowed characters are lowercase letters, digits, dots, and hyphens");
    }

    if name.starts_with(['.', '-']) || name.ends_with(['.', '-']) {
        return invalid("must start and end with a lowercase letter or digit");
    }

    if name.contains("..") || name.contains("-.") || name.contains(".-") {
        return invalid("cannot contain consecutive dots or dot-hyphen combinations");
    }

    if is_ipv4_like(name) {
        return invalid("must not be formatted like an IP address");
    }

    Ok(())
}

/// Check if a string matches IPv4-like dotted decimal form.
fn is_ipv4_like(name: &str) -> bool {
    let parts: Vec<&str> = name.split('.').collect();
    parts.len() == 4
        && parts.iter().all(|segment| {
            !segment.is_empty()
                && segment.len() <= 3
                && segment.chars().all(|c| c.is_ascii_digit())
                && segment.parse::<u8>().is_ok()
        })
}
