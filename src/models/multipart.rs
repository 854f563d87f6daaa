//! Multipart upload sessions, parts, and what the store hands back.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// A part the store has accepted, as listed in the completion call.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct CompletedPart {
    /// Part number (1-based).
    pub part_number: i32,

    /// Opaque tag returned by the store for this part.
    pub etag: String,

    /// Base64 SHA-256 of the part, when the store reports one.
    pub checksum_sha256: Option<String>,
}

/// What the store reports once an object is finalized.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct UploadReceipt {
    pub etag: Option<String>,

    /// Whole-object checksum computed by the store.
    pub checksum_sha256: Option<String>,
}

/// A multipart upload session held by the local store.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct MultipartUpload {
    /// Internal UUID for DB indexing.
    pub id: Uuid,

    /// Bucket the object will land in.
    pub bucket: String,

    /// Object key being uploaded.
    pub key: String,

    /// Unique upload ID (returned to client).
    pub upload_id: String,

    pub storage_class: String,

    pub expires_at: Option<DateTime<Utc>>,

    /// Timestamp when upload was initiated.
    pub initiated_at: DateTime<Utc>,
}

/// A single uploaded part in a local multipart session.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct MultipartPart {
    /// Internal UUID for DB indexing.
    pub id: Uuid,

    /// Reference to parent upload session.
    pub upload_id: Uuid,

    /// Part number (1-based).
    pub part_number: i32,

    /// Size in bytes.
    pub size_bytes: i64,

    /// Hex MD5 of the part.
    pub etag: String,

    /// Raw SHA-256 digest of the part.
    pub sha256: Vec<u8>,

    /// Timestamp when this part was uploaded.
    pub uploaded_at: DateTime<Utc>,
}
