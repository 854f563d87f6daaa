//! Local recomputation of the store's multipart SHA-256 checksum.
//!
//! For a single-part object the store reports `base64(sha256(body))`. For N
//! parts it reports `base64(sha256(d1 || d2 || ... || dN))-N`, where `di` is
//! the raw SHA-256 of part `i`. Reproducing it needs the same part boundaries
//! the upload used, hence the `FixedWindows` pass.

use crate::{
    errors::{BackupError, BackupResult},
    models::ByteStream,
    services::chunker::FixedWindows,
};
use base64::{Engine as _, engine::general_purpose};
use bytes::Bytes;
use futures::TryStreamExt;
use sha2::{Digest, Sha256};
use std::io;

/// Raw SHA-256 digest of one part.
pub type PartDigest = [u8; 32];

/// SHA-256 of a single window.
pub fn digest_part(window: &[u8]) -> PartDigest {
    Sha256::digest(window).into()
}

/// Apply the composite rule to per-part digests, in part order.
///
/// No parts at all means an empty object, reported as the digest of nothing.
pub fn compose_checksum(digests: &[PartDigest]) -> String {
    match digests {
        [] => general_purpose::STANDARD.encode(digest_part(&[])),
        [single] => general_purpose::STANDARD.encode(single),
        many => {
            let mut hasher = Sha256::new();
            for digest in many {
                hasher.update(digest);
            }
            format!(
                "{}-{}",
                general_purpose::STANDARD.encode(hasher.finalize()),
                many.len()
            )
        }
    }
}

/// Consume `stream` to the end and return its composite checksum.
///
/// Every window is hashed on the blocking pool. Fails with
/// `BackupError::StreamRead` if the stream errors before completing.
pub async fn composite_checksum(stream: ByteStream, part_size: usize) -> BackupResult<String> {
    if part_size == 0 {
        return Err(BackupError::InvalidPartSize);
    }

    let mut windows = FixedWindows::new(stream, part_size);
    let mut digests = Vec::new();
    while let Some(window) = windows.try_next().await.map_err(BackupError::stream)? {
        digests.push(hash_window(window).await.map_err(BackupError::stream)?);
    }

    Ok(compose_checksum(&digests))
}

async fn hash_window(window: Bytes) -> io::Result<PartDigest> {
    tokio::task::spawn_blocking(move || digest_part(&window))
        .await
        .map_err(io::Error::other)
}
