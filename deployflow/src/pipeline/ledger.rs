//! Where a pipeline remembers the definition it last ran.
//!
//! The ledger outlives any single [`DeliveryPipeline`](super::DeliveryPipeline)
//! instance, so a pipeline rebuilt from a changed definition can tell that it
//! mutated.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;

/// Remembers the definition fingerprint each pipeline last ran with.
#[async_trait]
pub trait DefinitionLedger: Send + Sync {
    /// Returns the fingerprint recorded for `pipeline`, if any.
    async fn last_fingerprint(&self, pipeline: &str) -> Option<String>;

    /// Records `fingerprint` as the current definition of `pipeline`.
    async fn record_fingerprint(&self, pipeline: &str, fingerprint: &str);
}

/// In-memory definition ledger.
#[derive(Debug, Default)]
pub struct InMemoryDefinitionLedger {
    fingerprints: Mutex<HashMap<String, String>>,
}

impl InMemoryDefinitionLedger {
    /// Creates an empty ledger.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DefinitionLedger for InMemoryDefinitionLedger {
    async fn last_fingerprint(&self, pipeline: &str) -> Option<String> {
        self.fingerprints.lock().get(pipeline).cloned()
    }

    async fn record_fingerprint(&self, pipeline: &str, fingerprint: &str) {
        self.fingerprints
            .lock()
            .insert(pipeline.to_string(), fingerprint.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fingerprints_are_per_pipeline() {
        let ledger = InMemoryDefinitionLedger::new();
        ledger.record_fingerprint("a", "1").await;
        ledger.record_fingerprint("a", "2").await;

        assert_eq!(ledger.last_fingerprint("a").await.as_deref(), Some("2"));
        assert_eq!(ledger.last_fingerprint("b").await, None);
    }
}
