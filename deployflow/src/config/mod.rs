//! Settings for the ingestion workers, queues, and delivery pipeline.
//!
//! Worker settings come from the environment the worker runs in
//! ([`ConsumerSettings::from_env`]); all settings can also be loaded from a
//! JSON file with serde defaults filling the gaps.

use anyhow::Context;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::errors::DeployflowError;
use crate::pipeline::GatePlacement;

/// Environment variable holding the local artifact bucket.
pub const ENV_ARTIFACTS_BUCKET: &str = "ARTIFACTS_BUCKET";
/// Environment variable holding the distributor's bucket.
pub const ENV_DISTRIBUTOR_BUCKET: &str = "DISTRIBUTOR_BUCKET";
/// Environment variable holding the backfill workflow identifier.
pub const ENV_INITIAL_DISTRIBUTION_MACHINE: &str = "INITIAL_DISTRIBUTION_MACHINE";
/// Environment variable holding the cross-account role to assume.
pub const ENV_INITIAL_DISTRIBUTION_ROLE: &str = "INITIAL_DISTRIBUTION_ROLE";
/// Environment variable holding the distributor's region.
pub const ENV_INITIAL_DISTRIBUTION_REGION: &str = "INITIAL_DISTRIBUTION_REGION";
/// Environment variable holding the consumer's account.
pub const ENV_CONSUMER_ACCOUNT_ID: &str = "CONSUMER_ACCOUNT_ID";
/// Environment variable holding the consumer's region.
pub const ENV_CONSUMER_REGION: &str = "CONSUMER_REGION";

/// Settings shared by the copy worker and the backfill trigger worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumerSettings {
    /// The local store artifacts are copied into.
    pub artifacts_bucket: String,
    /// The distributor's store, rewritten out of copied templates.
    pub distributor_bucket: String,
    /// Identifier of the external backfill workflow.
    #[serde(default)]
    pub initial_distribution_workflow: Option<String>,
    /// Cross-account role the backfill trigger assumes.
    #[serde(default)]
    pub initial_distribution_role: Option<String>,
    /// Region the backfill workflow runs in.
    #[serde(default)]
    pub initial_distribution_region: Option<String>,
    /// Account the consumer is deployed in.
    pub consumer_account: String,
    /// Region the consumer is deployed in.
    pub consumer_region: String,
}

impl ConsumerSettings {
    /// Creates settings for a consumer in `account`/`region`.
    #[must_use]
    pub fn new(
        artifacts_bucket: impl Into<String>,
        distributor_bucket: impl Into<String>,
        consumer_account: impl Into<String>,
        consumer_region: impl Into<String>,
    ) -> Self {
        Self {
            artifacts_bucket: artifacts_bucket.into(),
            distributor_bucket: distributor_bucket.into(),
            initial_distribution_workflow: None,
            initial_distribution_role: None,
            initial_distribution_region: None,
            consumer_account: consumer_account.into(),
            consumer_region: consumer_region.into(),
        }
    }

    /// Sets the backfill workflow, role, and region.
    #[must_use]
    pub fn with_initial_distribution(
        mut self,
        workflow: impl Into<String>,
        role: impl Into<String>,
        region: impl Into<String>,
    ) -> Self {
        self.initial_distribution_workflow = Some(workflow.into());
        self.initial_distribution_role = Some(role.into());
        self.initial_distribution_region = Some(region.into());
        self
    }

    /// Reads settings from the process environment.
    pub fn from_env() -> Result<Self, DeployflowError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Reads settings through `lookup`, which maps variable names to values.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, DeployflowError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |key: &str| {
            lookup(key)
                .filter(|v| !v.is_empty())
                .ok_or_else(|| DeployflowError::Configuration(format!("{key} must be configured")))
        };

        Ok(Self {
            artifacts_bucket: required(ENV_ARTIFACTS_BUCKET)?,
            distributor_bucket: required(ENV_DISTRIBUTOR_BUCKET)?,
            initial_distribution_workflow: lookup(ENV_INITIAL_DISTRIBUTION_MACHINE),
            initial_distribution_role: lookup(ENV_INITIAL_DISTRIBUTION_ROLE),
            initial_distribution_region: lookup(ENV_INITIAL_DISTRIBUTION_REGION),
            consumer_account: required(ENV_CONSUMER_ACCOUNT_ID)?,
            consumer_region: required(ENV_CONSUMER_REGION)?,
        })
    }

    /// Renders the settings as the environment a worker would be given.
    #[must_use]
    pub fn to_env(&self) -> Vec<(&'static str, String)> {
        let mut env = vec![
            (ENV_ARTIFACTS_BUCKET, self.artifacts_bucket.clone()),
            (ENV_DISTRIBUTOR_BUCKET, self.distributor_bucket.clone()),
            (ENV_CONSUMER_ACCOUNT_ID, self.consumer_account.clone()),
            (ENV_CONSUMER_REGION, self.consumer_region.clone()),
        ];
        if let Some(ref v) = self.initial_distribution_workflow {
            env.push((ENV_INITIAL_DISTRIBUTION_MACHINE, v.clone()));
        }
        if let Some(ref v) = self.initial_distribution_role {
            env.push((ENV_INITIAL_DISTRIBUTION_ROLE, v.clone()));
        }
        if let Some(ref v) = self.initial_distribution_region {
            env.push((ENV_INITIAL_DISTRIBUTION_REGION, v.clone()));
        }
        env
    }
}

/// Settings for a durable queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueSettings {
    /// Seconds a received message stays hidden.
    #[serde(default = "default_visibility_timeout")]
    pub visibility_timeout_seconds: u64,
    /// Receives before a message is dead-lettered.
    #[serde(default = "default_max_receive_count")]
    pub max_receive_count: u32,
    /// Maximum messages handed to the consumer per poll.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

fn default_visibility_timeout() -> u64 {
    300
}

fn default_max_receive_count() -> u32 {
    5
}

fn default_batch_size() -> usize {
    10
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            visibility_timeout_seconds: default_visibility_timeout(),
            max_receive_count: default_max_receive_count(),
            batch_size: default_batch_size(),
        }
    }
}

impl QueueSettings {
    /// Creates queue settings with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the visibility timeout.
    #[must_use]
    pub fn with_visibility_timeout_seconds(mut self, seconds: u64) -> Self {
        self.visibility_timeout_seconds = seconds;
        self
    }

    /// Sets the dead-letter threshold.
    #[must_use]
    pub fn with_max_receive_count(mut self, count: u32) -> Self {
        self.max_receive_count = count;
        self
    }

    /// Gets the visibility timeout as a Duration.
    #[must_use]
    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.visibility_timeout_seconds)
    }
}

/// Settings for a delivery pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineSettings {
    /// Pipeline name.
    pub name: String,
    /// Account the pipeline itself runs in.
    pub home_account: String,
    /// Region the pipeline itself runs in.
    pub home_region: String,
    /// Domain used in deployment-target parameter paths.
    #[serde(default = "default_domain")]
    pub domain: String,
    /// Seconds an approval gate waits before timing out.
    #[serde(default = "default_approval_timeout")]
    pub approval_timeout_seconds: f64,
    /// Where approval gates sit relative to their stage's deployment.
    #[serde(default)]
    pub gate_placement: GatePlacement,
    /// Seconds between configuration-change polls.
    #[serde(default = "default_poll_interval")]
    pub trigger_poll_interval_seconds: f64,
}

fn default_domain() -> String {
    "customer-platform".to_string()
}

fn default_approval_timeout() -> f64 {
    7.0 * 24.0 * 3600.0
}

fn default_poll_interval() -> f64 {
    60.0
}

impl PipelineSettings {
    /// Creates pipeline settings with defaults.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        home_account: impl Into<String>,
        home_region: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            home_account: home_account.into(),
            home_region: home_region.into(),
            domain: default_domain(),
            approval_timeout_seconds: default_approval_timeout(),
            gate_placement: GatePlacement::default(),
            trigger_poll_interval_seconds: default_poll_interval(),
        }
    }

    /// Sets the domain.
    #[must_use]
    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = domain.into();
        self
    }

    /// Sets the approval timeout.
    #[must_use]
    pub fn with_approval_timeout(mut self, timeout: Duration) -> Self {
        self.approval_timeout_seconds = timeout.as_secs_f64();
        self
    }

    /// Sets the gate placement.
    #[must_use]
    pub fn with_gate_placement(mut self, placement: GatePlacement) -> Self {
        self.gate_placement = placement;
        self
    }

    /// Gets the approval timeout as a Duration.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the value is negative, not finite,
    /// or too large to represent.
    pub fn approval_timeout(&self) -> Result<Duration, DeployflowError> {
        seconds_setting("approval_timeout_seconds", self.approval_timeout_seconds)
    }

    /// Gets the poll interval as a Duration.
    ///
    /// # Errors
    ///
    /// As for [`Self::approval_timeout`]; a zero interval is also rejected.
    pub fn trigger_poll_interval(&self) -> Result<Duration, DeployflowError> {
        let interval =
            seconds_setting("trigger_poll_interval_seconds", self.trigger_poll_interval_seconds)?;
        if interval.is_zero() {
            return Err(DeployflowError::Configuration(
                "trigger_poll_interval_seconds must be greater than zero".into(),
            ));
        }
        Ok(interval)
    }

    /// Checks every duration setting.
    ///
    /// # Errors
    ///
    /// Returns the first invalid setting as a configuration error.
    pub fn validate(&self) -> Result<(), DeployflowError> {
        self.approval_timeout()?;
        self.trigger_poll_interval()?;
        Ok(())
    }
}

fn seconds_setting(name: &str, seconds: f64) -> Result<Duration, DeployflowError> {
    if seconds < 0.0 {
        return Err(DeployflowError::Configuration(format!(
            "{name} must not be negative, got {seconds}"
        )));
    }
    Duration::try_from_secs_f64(seconds)
        .map_err(|e| DeployflowError::Configuration(format!("{name} = {seconds}: {e}")))
}

/// Loads any settings type from a JSON file.
pub fn from_json_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> anyhow::Result<T> {
    let path = path.as_ref();
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading settings file {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing settings file {}", path.display()))
}
