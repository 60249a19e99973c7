//! Notification messages announcing newly distributed artifacts.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use super::filter::{ACCOUNT_ATTRIBUTE, REGION_ATTRIBUTE};
use crate::errors::DeliveryFailure;

/// A raw notification as published on a channel and delivered to queues.
///
/// Routing attributes travel beside the body so filtering never has to parse
/// the payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationMessage {
    /// Unique message ID assigned at publish time.
    pub message_id: Uuid,
    /// Routing attributes (`account`, `region`, ...).
    pub attributes: BTreeMap<String, String>,
    /// Raw JSON body.
    pub body: String,
}

impl NotificationMessage {
    /// Creates a message addressed to `account`/`region` with a raw body.
    #[must_use]
    pub fn new(
        account: impl Into<String>,
        region: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        let attributes = BTreeMap::from([
            (ACCOUNT_ATTRIBUTE.to_string(), account.into()),
            (REGION_ATTRIBUTE.to_string(), region.into()),
        ]);
        Self {
            message_id: Uuid::new_v4(),
            attributes,
            body: body.into(),
        }
    }

    /// Creates a message announcing `artifact`.
    pub fn for_artifact(
        account: impl Into<String>,
        region: impl Into<String>,
        artifact: &ArtifactNotification,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self::new(account, region, serde_json::to_string(artifact)?))
    }

    /// The addressed account, if present.
    #[must_use]
    pub fn account(&self) -> Option<&str> {
        self.attributes.get(ACCOUNT_ATTRIBUTE).map(String::as_str)
    }

    /// The addressed region, if present.
    #[must_use]
    pub fn region(&self) -> Option<&str> {
        self.attributes.get(REGION_ATTRIBUTE).map(String::as_str)
    }

    /// Parses the body as an artifact notification.
    ///
    /// A body that cannot be parsed will never succeed on redelivery, so the
    /// failure is permanent.
    pub fn artifact(&self) -> Result<ArtifactNotification, DeliveryFailure> {
        serde_json::from_str(&self.body).map_err(|e| {
            DeliveryFailure::permanent(self.message_id.to_string(), format!("invalid body: {e}"))
        })
    }
}

/// Payload identifying a distributed artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactNotification {
    /// Time-limited URL the artifact can be downloaded from.
    #[serde(rename = "ArtifactUrl")]
    pub artifact_url: String,
    /// Key the artifact is stored under, in both stores.
    #[serde(rename = "ArtifactKey")]
    pub artifact_key: String,
    /// Source bucket, when the producer includes it.
    #[serde(rename = "Bucket", default, skip_serializing_if = "Option::is_none")]
    pub bucket: Option<String>,
}

impl ArtifactNotification {
    /// Creates a notification for `key` downloadable from `url`.
    #[must_use]
    pub fn new(url: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            artifact_url: url.into(),
            artifact_key: key.into(),
            bucket: None,
        }
    }

    /// Sets the source bucket.
    #[must_use]
    pub fn with_bucket(mut self, bucket: impl Into<String>) -> Self {
        self.bucket = Some(bucket.into());
        self
    }
}
