//! Utility functions for identifiers, timestamps, and fingerprints.

pub mod timestamps;

pub use timestamps::{iso_timestamp, time_token, Timestamp};

use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Generates a random v4 UUID.
#[must_use]
pub fn generate_uuid() -> Uuid {
    Uuid::new_v4()
}

/// Generates a time-ordered v7 UUID, so run IDs sort by start time.
#[must_use]
pub fn generate_run_id() -> Uuid {
    Uuid::now_v7()
}

/// Hashes the given components into a short hex fingerprint.
///
/// Each component is length-prefixed, so `["ab", "c"]` and `["a", "bc"]`
/// differ.
#[must_use]
pub fn fingerprint<I, S>(components: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut hasher = Sha256::new();
    for component in components {
        let component = component.as_ref();
        hasher.update(component.len().to_le_bytes());
        hasher.update(component.as_bytes());
    }
    let result = hasher.finalize();
    hex::encode(&result[..16])
}
