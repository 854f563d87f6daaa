//! Represents an object (archive) stored by the local store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Metadata for one stored object. The payload lives on disk.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct Object {
    /// Internal UUID for DB indexing.
    pub id: Uuid,

    pub bucket: String,

    /// Object key (path-like identifier within the bucket).
    pub key: String,

    /// Size in bytes.
    pub size_bytes: i64,

    /// Hex MD5 for single uploads, `md5-of-md5s-N` for multipart ones.
    pub etag: String,

    /// Base64 SHA-256, suffixed with `-N` for multipart uploads.
    pub checksum_sha256: String,

    /// Storage class (e.g., STANDARD, DEEP_ARCHIVE).
    pub storage_class: String,

    /// Timestamp when object was last modified.
    pub last_modified: DateTime<Utc>,

    pub expires_at: Option<DateTime<Utc>>,
}
