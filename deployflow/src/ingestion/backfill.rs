//! One-shot initial backfill.
//!
//! When an ingestion topology is first provisioned (or its trigger version
//! changes) the local store has missed every artifact distributed so far. The
//! backfill trigger assumes a cross-account role and starts the distributor's
//! long-running workflow, which re-sends the full history to the new consumer.
//!
//! The trigger is fire-and-forget: it returns the execution handle and never
//! waits for the workflow to finish.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, info};

use crate::config::ConsumerSettings;
use crate::errors::DeployflowError;
use crate::events::{EventSink, NoOpEventSink};
use crate::routing::DurableQueue;

/// Session name used for the cross-account role.
pub const SESSION_NAME: &str = "AssumeCrossAccountRole";

/// Lifetime of the assumed session.
pub const SESSION_DURATION: Duration = Duration::from_secs(900);

/// Property on a deployable unit carrying the trigger version.
pub const VERSION_PROPERTY: &str = "Version";

/// Opaque version value; a change re-runs the backfill once.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TriggerVersion(pub String);

impl TriggerVersion {
    /// Creates a version.
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Reads the `Version` property from a unit's properties.
    ///
    /// Non-string values are rendered as JSON so numeric versions work too.
    #[must_use]
    pub fn from_properties(properties: &serde_json::Value) -> Option<Self> {
        properties.get(VERSION_PROPERTY).map(|v| match v {
            serde_json::Value::String(s) => Self(s.clone()),
            other => Self(other.to_string()),
        })
    }

    /// Returns the raw value.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TriggerVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle request delivered to the one-shot action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OneShotRequest {
    /// The owning topology is being created.
    Create,
    /// The owning topology's properties changed.
    Update,
    /// The owning topology is being removed.
    Delete,
}

/// Temporary credentials for an assumed role.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    /// Access key ID.
    pub access_key_id: String,
    /// Secret access key.
    pub secret_access_key: String,
    /// Session token.
    pub session_token: String,
    /// When the session expires.
    pub expires_at: DateTime<Utc>,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .field("session_token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Obtains temporary credentials for a role.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RoleAssumer: Send + Sync {
    /// Assumes `role_arn` for `duration`.
    async fn assume_role(
        &self,
        role_arn: &str,
        session_name: &str,
        duration: Duration,
    ) -> Result<Credentials, DeployflowError>;
}

/// A role assumer allowed to assume exactly one role.
///
/// Any other role is refused before the inner assumer is consulted.
pub struct ScopedRoleAssumer {
    allowed_role: String,
    inner: Arc<dyn RoleAssumer>,
}

impl ScopedRoleAssumer {
    /// Scopes `inner` to `allowed_role`.
    #[must_use]
    pub fn new(allowed_role: impl Into<String>, inner: Arc<dyn RoleAssumer>) -> Self {
        Self {
            allowed_role: allowed_role.into(),
            inner,
        }
    }
}

#[async_trait]
impl RoleAssumer for ScopedRoleAssumer {
    async fn assume_role(
        &self,
        role_arn: &str,
        session_name: &str,
        duration: Duration,
    ) -> Result<Credentials, DeployflowError> {
        if role_arn != self.allowed_role {
            return Err(DeployflowError::permission_denied(
                role_arn,
                "sts:AssumeRole is only granted on the configured distribution role",
            ));
        }
        self.inner.assume_role(role_arn, session_name, duration).await
    }
}

/// Handle to a started workflow execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowExecution {
    /// Execution identifier.
    pub execution_id: String,
    /// Workflow that was started.
    pub workflow: String,
    /// When the start was accepted.
    pub started_at: DateTime<Utc>,
}

/// Starts external workflows.
#[async_trait]
pub trait WorkflowStarter: Send + Sync {
    /// Starts `workflow` in `region` with `input`, using `credentials`.
    async fn start_execution(
        &self,
        credentials: &Credentials,
        workflow: &str,
        region: &str,
        input: serde_json::Value,
    ) -> Result<WorkflowExecution, DeployflowError>;
}

/// Remembers the last version each one-shot trigger ran for.
#[async_trait]
pub trait TriggerLedger: Send + Sync {
    /// Returns the last version recorded for `trigger_id`.
    async fn last_version(&self, trigger_id: &str) -> Option<TriggerVersion>;

    /// Records that `trigger_id` ran for `version`.
    async fn record(&self, trigger_id: &str, version: TriggerVersion);

    /// Forgets `trigger_id`.
    async fn forget(&self, trigger_id: &str);
}

/// In-memory trigger ledger.
#[derive(Debug, Default)]
pub struct InMemoryTriggerLedger {
    entries: Mutex<HashMap<String, TriggerVersion>>,
}

impl InMemoryTriggerLedger {
    /// Creates an empty ledger.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of tracked triggers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Returns true if nothing is tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[async_trait]
impl TriggerLedger for InMemoryTriggerLedger {
    async fn last_version(&self, trigger_id: &str) -> Option<TriggerVersion> {
        self.entries.lock().get(trigger_id).cloned()
    }

    async fn record(&self, trigger_id: &str, version: TriggerVersion) {
        self.entries.lock().insert(trigger_id.to_string(), version);
    }

    async fn forget(&self, trigger_id: &str) {
        self.entries.lock().remove(trigger_id);
    }
}

/// What a backfill invocation did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackfillOutcome {
    /// The workflow was started.
    Started(WorkflowExecution),
    /// The version already ran; nothing was started.
    Unchanged(TriggerVersion),
    /// A delete request was acknowledged.
    Deleted,
}

/// The one-shot backfill action of an ingestion topology.
pub struct BackfillTrigger {
    trigger_id: String,
    workflow: String,
    role_arn: String,
    workflow_region: String,
    consumer_account: String,
    consumer_region: String,
    queue: Weak<DurableQueue>,
    assumer: Arc<dyn RoleAssumer>,
    starter: Arc<dyn WorkflowStarter>,
    ledger: Arc<dyn TriggerLedger>,
    events: Arc<dyn EventSink>,
    in_flight: tokio::sync::Mutex<()>,
}

impl fmt::Debug for BackfillTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackfillTrigger")
            .field("trigger_id", &self.trigger_id)
            .field("workflow", &self.workflow)
            .field("role_arn", &self.role_arn)
            .field("workflow_region", &self.workflow_region)
            .finish_non_exhaustive()
    }
}

impl BackfillTrigger {
    /// Binds a backfill trigger to an existing ingestion queue.
    ///
    /// Fails if the settings lack the workflow, role, or region.
    pub fn new(
        settings: &ConsumerSettings,
        queue: &Arc<DurableQueue>,
        assumer: Arc<dyn RoleAssumer>,
        starter: Arc<dyn WorkflowStarter>,
    ) -> Result<Self, DeployflowError> {
        let missing = |what: &str| {
            DeployflowError::Configuration(format!("initial distribution {what} is not configured"))
        };

        let workflow = settings
            .initial_distribution_workflow
            .clone()
            .ok_or_else(|| missing("workflow"))?;
        let role_arn = settings
            .initial_distribution_role
            .clone()
            .ok_or_else(|| missing("role"))?;
        let workflow_region = settings
            .initial_distribution_region
            .clone()
            .ok_or_else(|| missing("region"))?;

        Ok(Self {
            trigger_id: format!(
                "{}/{}/initial-backfill",
                settings.consumer_account, settings.consumer_region
            ),
            workflow,
            role_arn,
            workflow_region,
            consumer_account: settings.consumer_account.clone(),
            consumer_region: settings.consumer_region.clone(),
            queue: Arc::downgrade(queue),
            assumer,
            starter,
            ledger: Arc::new(InMemoryTriggerLedger::new()),
            events: Arc::new(NoOpEventSink),
            in_flight: tokio::sync::Mutex::new(()),
        })
    }

    /// Sets the ledger versions are recorded in.
    #[must_use]
    pub fn with_ledger(mut self, ledger: Arc<dyn TriggerLedger>) -> Self {
        self.ledger = ledger;
        self
    }

    /// Sets the event sink.
    #[must_use]
    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Returns the ledger key of this trigger.
    #[must_use]
    pub fn trigger_id(&self) -> &str {
        &self.trigger_id
    }

    /// The input handed to the workflow.
    #[must_use]
    pub fn workflow_input(&self) -> serde_json::Value {
        serde_json::json!({
            "AccountId": self.consumer_account,
            "Region": self.consumer_region,
        })
    }

    /// Handles one lifecycle request for `version`.
    ///
    /// `Delete` succeeds immediately and only clears the ledger entry, so a
    /// later re-provisioning backfills again. `Create` and `Update` start the
    /// workflow once per distinct version. The version is recorded only after
    /// the start was accepted.
    pub async fn trigger_initial_backfill(
        &self,
        request: OneShotRequest,
        version: &TriggerVersion,
    ) -> Result<BackfillOutcome, DeployflowError> {
        if request == OneShotRequest::Delete {
            debug!(trigger_id = %self.trigger_id, "Backfill delete acknowledged");
            self.ledger.forget(&self.trigger_id).await;
            return Ok(BackfillOutcome::Deleted);
        }

        if self.queue.upgrade().is_none() {
            return Err(DeployflowError::OrderingViolation(format!(
                "backfill {} requires its ingestion queue, which no longer exists",
                self.trigger_id
            )));
        }

        let _guard = self.in_flight.lock().await;

        if self.ledger.last_version(&self.trigger_id).await.as_ref() == Some(version) {
            debug!(trigger_id = %self.trigger_id, version = %version, "Backfill version unchanged");
            return Ok(BackfillOutcome::Unchanged(version.clone()));
        }

        let credentials = self
            .assumer
            .assume_role(&self.role_arn, SESSION_NAME, SESSION_DURATION)
            .await?;

        let execution = self
            .starter
            .start_execution(
                &credentials,
                &self.workflow,
                &self.workflow_region,
                self.workflow_input(),
            )
            .await?;

        self.ledger.record(&self.trigger_id, version.clone()).await;

        info!(
            trigger_id = %self.trigger_id,
            version = %version,
            request = ?request,
            execution_id = %execution.execution_id,
            "Initial backfill started"
        );
        self.events.try_emit(
            "backfill.started",
            Some(serde_json::json!({
                "trigger_id": self.trigger_id,
                "version": version.as_str(),
                "execution_id": execution.execution_id,
                "workflow": execution.workflow,
            })),
        );

        Ok(BackfillOutcome::Started(execution))
    }
}
