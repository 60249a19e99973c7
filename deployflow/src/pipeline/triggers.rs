//! What starts a pipeline run.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::errors::{LookupFailure, LookupFailureKind};
use crate::parameters::ConfigurationSource;
use crate::utils::fingerprint;

/// The reason a run was started.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PipelineTrigger {
    /// New commit on the source branch.
    SourceChange {
        /// Revision that changed.
        revision: String,
    },
    /// One or more watched configuration values changed.
    ConfigurationChange {
        /// Paths whose values changed.
        paths: Vec<String>,
    },
    /// Started by hand.
    Manual,
}

impl PipelineTrigger {
    /// Short label for logs.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::SourceChange { .. } => "source_change",
            Self::ConfigurationChange { .. } => "configuration_change",
            Self::Manual => "manual",
        }
    }
}

/// Watches named configuration values and fires when any of them changes.
///
/// The first poll only records a baseline. A parameter that does not exist
/// is watched as absent, so creating it later counts as a change.
pub struct ConfigurationChangeTrigger {
    paths: Vec<String>,
    region: String,
    source: Arc<dyn ConfigurationSource>,
    last_seen: Mutex<Option<BTreeMap<String, String>>>,
}

impl std::fmt::Debug for ConfigurationChangeTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigurationChangeTrigger")
            .field("paths", &self.paths)
            .field("region", &self.region)
            .finish_non_exhaustive()
    }
}

impl ConfigurationChangeTrigger {
    /// Watches `paths` in `region`.
    #[must_use]
    pub fn new(
        paths: Vec<String>,
        region: impl Into<String>,
        source: Arc<dyn ConfigurationSource>,
    ) -> Self {
        Self {
            paths,
            region: region.into(),
            source,
            last_seen: Mutex::new(None),
        }
    }

    /// The watched paths.
    #[must_use]
    pub fn paths(&self) -> &[String] {
        &self.paths
    }

    async fn snapshot(&self) -> Result<BTreeMap<String, String>, LookupFailure> {
        let mut snapshot = BTreeMap::new();
        for path in &self.paths {
            let token = match self.source.get_parameter(path, &self.region).await {
                Ok(value) => fingerprint(["present", value.as_str()]),
                Err(e) if e.kind == LookupFailureKind::NotFound => fingerprint(["absent"]),
                Err(e) => return Err(e),
            };
            snapshot.insert(path.clone(), token);
        }
        Ok(snapshot)
    }

    /// Polls once; returns a trigger naming the changed paths, if any.
    pub async fn poll(&self) -> Result<Option<PipelineTrigger>, LookupFailure> {
        let current = self.snapshot().await?;
        let mut last_seen = self.last_seen.lock();

        let changed: Vec<String> = match last_seen.as_ref() {
            None => Vec::new(),
            Some(previous) => current
                .iter()
                .filter(|(path, token)| previous.get(*path) != Some(*token))
                .map(|(path, _)| path.clone())
                .collect(),
        };
        *last_seen = Some(current);

        if changed.is_empty() {
            Ok(None)
        } else {
            info!(paths = ?changed, "Watched configuration changed");
            Ok(Some(PipelineTrigger::ConfigurationChange { paths: changed }))
        }
    }

    /// Polls every `interval`, sending triggers to `tx` until `shutdown`
    /// flips to true or the receiver goes away.
    pub async fn run(
        &self,
        interval: Duration,
        tx: mpsc::Sender<PipelineTrigger>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    match self.poll().await {
                        Ok(Some(trigger)) => {
                            if tx.send(trigger).await.is_err() {
                                debug!("Trigger receiver closed");
                                break;
                            }
                        }
                        Ok(None) => {}
                        Err(e) => warn!(error = %e, "Configuration poll failed"),
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parameters::InMemoryParameterStore;

    const PATH: &str = "/cicd/domains/d/deploymentTargets/qa";

    #[tokio::test]
    async fn test_fires_once_per_change() {
        let store = Arc::new(InMemoryParameterStore::new().with_parameter(PATH, "eu-west-1", "[]"));
        let trigger =
            ConfigurationChangeTrigger::new(vec![PATH.into()], "eu-west-1", store.clone());

        assert_eq!(trigger.poll().await.unwrap(), None);
        assert_eq!(trigger.poll().await.unwrap(), None);

        store.set(PATH, "eu-west-1", r#"[{"account":"1","region":"eu-west-1"}]"#);
        assert_eq!(
            trigger.poll().await.unwrap(),
            Some(PipelineTrigger::ConfigurationChange { paths: vec![PATH.into()] })
        );
        assert_eq!(trigger.poll().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_parameter_creation_counts_as_change() {
        let store = Arc::new(InMemoryParameterStore::new());
        let trigger =
            ConfigurationChangeTrigger::new(vec![PATH.into()], "eu-west-1", store.clone());

        assert_eq!(trigger.poll().await.unwrap(), None);
        store.set(PATH, "eu-west-1", "[]");
        assert!(trigger.poll().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_access_denied_is_reported() {
        let store = Arc::new(InMemoryParameterStore::new());
        store.deny(PATH, "eu-west-1");
        let trigger = ConfigurationChangeTrigger::new(vec![PATH.into()], "eu-west-1", store);

        assert!(trigger.poll().await.is_err());
    }

    #[tokio::test]
    async fn test_run_feeds_channel() {
        let store = Arc::new(InMemoryParameterStore::new().with_parameter(PATH, "eu-west-1", "[]"));
        let trigger = Arc::new(ConfigurationChangeTrigger::new(
            vec![PATH.into()],
            "eu-west-1",
            store.clone(),
        ));
        let (tx, mut rx) = mpsc::channel(4);
        let (stop_tx, stop_rx) = watch::channel(false);

        let worker = {
            let trigger = trigger.clone();
            tokio::spawn(async move { trigger.run(Duration::from_millis(5), tx, stop_rx).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        store.set(PATH, "eu-west-1", "[{\"account\":\"1\",\"region\":\"us-east-1\"}]");

        let received = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap();
        assert_eq!(received.map(|t| t.label()), Some("configuration_change"));

        stop_tx.send(true).unwrap();
        worker.await.unwrap();
    }

    #[test]
    fn test_trigger_serialization_is_tagged() {
        let trigger = PipelineTrigger::SourceChange {
            revision: "abc".into(),
        };
        let json = serde_json::to_value(trigger).unwrap();
        assert_eq!(json["kind"], "source_change");
        assert_eq!(json["revision"], "abc");
    }
}
