//! Object stores artifacts are copied into.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::core::ArtifactRecord;
use crate::errors::{DeliveryFailure, DeployflowError};

/// A keyed object store.
///
/// Writing a key that already exists replaces it; that is what makes
/// duplicate deliveries harmless.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Returns the bucket name.
    fn bucket(&self) -> &str;

    /// Writes `body` under `key`.
    async fn put_object(&self, key: &str, body: Vec<u8>) -> Result<ArtifactRecord, DeliveryFailure>;

    /// Reads the object under `key`.
    async fn get_object(&self, key: &str) -> Option<Vec<u8>>;

    /// Lists every key.
    async fn list_keys(&self) -> Vec<String>;

    /// Deletes every object and returns how many were removed.
    async fn delete_all(&self) -> Result<usize, DeployflowError>;
}

/// An in-memory object store.
#[derive(Debug)]
pub struct InMemoryObjectStore {
    bucket: String,
    objects: DashMap<String, (Vec<u8>, ArtifactRecord)>,
    puts: AtomicUsize,
    retained: AtomicBool,
}

impl InMemoryObjectStore {
    /// Creates an empty store named `bucket`.
    #[must_use]
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            objects: DashMap::new(),
            puts: AtomicUsize::new(0),
            retained: AtomicBool::new(false),
        }
    }

    /// Returns the record for `key`.
    #[must_use]
    pub fn record(&self, key: &str) -> Option<ArtifactRecord> {
        self.objects.get(key).map(|entry| entry.value().1.clone())
    }

    /// Returns the number of stored objects.
    #[must_use]
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    /// Returns true if the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Places a retention lock on the bucket; `delete_all` fails from now on.
    pub fn retain(&self) {
        self.retained.store(true, Ordering::SeqCst);
    }

    /// Returns how many writes have been made, including overwrites.
    #[must_use]
    pub fn put_count(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ObjectStore for InMemoryObjectStore {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn put_object(
        &self,
        key: &str,
        body: Vec<u8>,
    ) -> Result<ArtifactRecord, DeliveryFailure> {
        let record = ArtifactRecord::new(key, &body);
        self.objects.insert(key.to_string(), (body, record.clone()));
        self.puts.fetch_add(1, Ordering::SeqCst);
        Ok(record)
    }

    async fn get_object(&self, key: &str) -> Option<Vec<u8>> {
        self.objects.get(key).map(|entry| entry.value().0.clone())
    }

    async fn list_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.objects.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }

    async fn delete_all(&self) -> Result<usize, DeployflowError> {
        if self.retained.load(Ordering::SeqCst) {
            return Err(DeployflowError::resource(
                self.bucket.as_str(),
                "bucket has a retention lock",
            ));
        }
        let count = self.objects.len();
        self.objects.clear();
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_same_key_overwrites() {
        let store = InMemoryObjectStore::new("local");
        store.put_object("a.zip", b"v1".to_vec()).await.unwrap();
        store.put_object("a.zip", b"v2".to_vec()).await.unwrap();

        assert_eq!(store.len(), 1);
        assert_eq!(store.put_count(), 2);
        assert_eq!(store.get_object("a.zip").await, Some(b"v2".to_vec()));
    }

    #[tokio::test]
    async fn test_delete_all() {
        let store = InMemoryObjectStore::new("local");
        store.put_object("b", Vec::new()).await.unwrap();
        store.put_object("a", Vec::new()).await.unwrap();
        assert_eq!(store.list_keys().await, vec!["a", "b"]);

        assert_eq!(store.delete_all().await.unwrap(), 2);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_retained_bucket_refuses_delete_all() {
        let store = InMemoryObjectStore::new("local");
        store.put_object("a", Vec::new()).await.unwrap();
        store.retain();

        assert!(store.delete_all().await.is_err());
        assert_eq!(store.len(), 1);
    }
}
