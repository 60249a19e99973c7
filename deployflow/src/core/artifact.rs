//! Artifact records for objects copied into the local store.

use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::{DateTime, Utc};
use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};

/// An artifact copied into the local store.
///
/// Identified by its storage key. Records are created on copy and replaced
/// when the same key is copied again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRecord {
    /// The storage key (shared with the distributor's key namespace).
    pub key: String,
    /// Base64-encoded MD5 of the stored bytes.
    pub content_md5: String,
    /// Size of the stored bytes.
    pub size: usize,
    /// When the copy happened.
    pub copied_at: DateTime<Utc>,
}

impl ArtifactRecord {
    /// Creates a record describing `body` stored under `key`.
    #[must_use]
    pub fn new(key: impl Into<String>, body: &[u8]) -> Self {
        Self {
            key: key.into(),
            content_md5: content_md5(body),
            size: body.len(),
            copied_at: Utc::now(),
        }
    }
}

/// Computes the base64 MD5 digest of `body`, as object stores report it.
#[must_use]
pub fn content_md5(body: &[u8]) -> String {
    let digest = Md5::digest(body);
    STANDARD.encode(digest)
}
