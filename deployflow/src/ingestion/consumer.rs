//! The artifact copy worker.
//!
//! Consumes notifications from the ingestion queue and copies each announced
//! artifact into the local store under the same key. A message is only
//! acknowledged after its copy succeeded; failures stay on the queue and come
//! back after the visibility timeout until the redrive policy dead-letters
//! them.

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::{ArtifactFetcher, FetchError, ObjectStore, TemplateRewriter};
use crate::config::ConsumerSettings;
use crate::core::ArtifactRecord;
use crate::errors::{DeliveryFailure, DeployflowError};
use crate::events::{EventSink, NoOpEventSink};
use crate::pipeline::{with_retry_if, RetryConfig};
use crate::routing::{ArtifactNotification, DurableQueue, NotificationMessage};

/// Outcome of processing one batch of queue messages.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    /// Messages received.
    pub received: usize,
    /// Artifacts copied and acknowledged.
    pub copied: Vec<String>,
    /// Messages left on the queue for redelivery.
    pub failed: Vec<String>,
    /// Messages copied after their receipt expired; they will be delivered
    /// again and copied a second time.
    pub stale_receipts: Vec<String>,
}

/// Copies announced artifacts into the local store.
pub struct ArtifactConsumer {
    store: Arc<dyn ObjectStore>,
    fetcher: Arc<dyn ArtifactFetcher>,
    rewriter: TemplateRewriter,
    retry: RetryConfig,
    events: Arc<dyn EventSink>,
}

impl std::fmt::Debug for ArtifactConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArtifactConsumer")
            .field("bucket", &self.store.bucket())
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl ArtifactConsumer {
    /// Creates a consumer writing to `store` and rewriting templates away
    /// from `settings.distributor_bucket`.
    pub fn new(
        settings: &ConsumerSettings,
        store: Arc<dyn ObjectStore>,
        fetcher: Arc<dyn ArtifactFetcher>,
    ) -> Result<Self, DeployflowError> {
        let rewriter = TemplateRewriter::new(&settings.distributor_bucket, store.bucket())
            .map_err(|e| {
                DeployflowError::Configuration(format!("invalid distributor bucket: {e}"))
            })?;

        Ok(Self {
            store,
            fetcher,
            rewriter,
            retry: RetryConfig::default(),
            events: Arc::new(NoOpEventSink),
        })
    }

    /// Sets the in-attempt retry policy for downloads.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the event sink.
    #[must_use]
    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Handles one delivered notification.
    pub async fn on_notification(
        &self,
        message: &NotificationMessage,
    ) -> Result<ArtifactRecord, DeliveryFailure> {
        let artifact = message.artifact()?;
        self.copy_artifact(&artifact).await
    }

    /// Copies one artifact into the local store under its own key.
    ///
    /// Copying a key that was already copied overwrites it.
    pub async fn copy_artifact(
        &self,
        artifact: &ArtifactNotification,
    ) -> Result<ArtifactRecord, DeliveryFailure> {
        let key = artifact.artifact_key.as_str();
        debug!(key, source_bucket = ?artifact.bucket, "Copying artifact");

        let body = with_retry_if(
            &self.retry,
            key,
            || self.fetcher.fetch(&artifact.artifact_url),
            FetchError::is_transient,
        )
        .await
        .map_err(|e| match e {
            FetchError::Transient(reason) => DeliveryFailure::transient(key, reason),
            FetchError::Permanent(reason) => DeliveryFailure::permanent(key, reason),
        })?;

        let body = self.rewriter.apply(key, body);
        let record = self.store.put_object(key, body).await?;

        self.events.try_emit(
            "artifact.copied",
            Some(serde_json::json!({
                "key": record.key,
                "size": record.size,
                "content_md5": record.content_md5,
                "bucket": self.store.bucket(),
            })),
        );
        Ok(record)
    }

    /// Receives one batch from `queue` and processes it.
    pub async fn process_batch(&self, queue: &DurableQueue, max: usize) -> BatchReport {
        let batch = queue.receive(max);
        let mut report = BatchReport {
            received: batch.len(),
            ..BatchReport::default()
        };

        for received in batch {
            let message_id = received.message.message_id;
            match self.on_notification(&received.message).await {
                Ok(record) => {
                    if !queue.delete(received.receipt_handle) {
                        warn!(
                            message_id = %message_id,
                            key = %record.key,
                            queue = %queue.name(),
                            "Receipt expired before acknowledgement; message will be redelivered"
                        );
                        report.stale_receipts.push(message_id.to_string());
                    }
                    report.copied.push(record.key);
                }
                Err(failure) => {
                    warn!(
                        message_id = %message_id,
                        receive_count = received.receive_count,
                        retryable = failure.retryable,
                        error = %failure,
                        "Artifact copy failed; message left for redelivery"
                    );
                    self.events.try_emit(
                        "artifact.copy_failed",
                        Some(serde_json::json!({
                            "message_id": message_id.to_string(),
                            "key": failure.key,
                            "reason": failure.reason,
                            "receive_count": received.receive_count,
                        })),
                    );
                    report.failed.push(message_id.to_string());
                }
            }
        }

        report
    }

    /// Polls `queue` every `interval` until `shutdown` flips to true.
    pub async fn run(
        &self,
        queue: Arc<DurableQueue>,
        batch_size: usize,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(queue = %queue.name(), bucket = %self.store.bucket(), "Artifact consumer started");
        let mut ticker = tokio::time::interval(interval);

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    let report = self.process_batch(&queue, batch_size).await;
                    if report.received > 0 {
                        debug!(
                            copied = report.copied.len(),
                            failed = report.failed.len(),
                            "Batch processed"
                        );
                    }
                }
            }
        }

        info!(queue = %queue.name(), "Artifact consumer stopped");
    }
}
