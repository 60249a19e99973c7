//! Recording and scripted doubles for the crate's trait seams.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::core::DeploymentTarget;
use crate::errors::DeployflowError;
use crate::ingestion::{
    ArtifactFetcher, Credentials, FetchError, RoleAssumer, WorkflowExecution, WorkflowStarter,
};
use crate::pipeline::{ApprovalDecision, ApprovalGate, DeployableUnit, Deployer};

/// A deployer that records every call and can be told to fail for targets.
#[derive(Debug, Default)]
pub struct RecordingDeployer {
    deployed: Mutex<Vec<DeployableUnit>>,
    destroyed: Mutex<Vec<DeploymentTarget>>,
    failing: HashSet<DeploymentTarget>,
}

impl RecordingDeployer {
    /// Creates a deployer that always succeeds.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes deploys to `target` fail.
    #[must_use]
    pub fn failing_for(mut self, target: DeploymentTarget) -> Self {
        self.failing.insert(target);
        self
    }

    /// Units successfully deployed, in call order.
    #[must_use]
    pub fn deployed(&self) -> Vec<DeployableUnit> {
        self.deployed.lock().clone()
    }

    /// Stage names of successful deploys, in call order.
    #[must_use]
    pub fn deployed_stages(&self) -> Vec<String> {
        self.deployed.lock().iter().map(|u| u.stage.clone()).collect()
    }

    /// Targets destroyed, in call order.
    #[must_use]
    pub fn destroyed(&self) -> Vec<DeploymentTarget> {
        self.destroyed.lock().clone()
    }
}

#[async_trait]
impl Deployer for RecordingDeployer {
    async fn deploy(&self, unit: &DeployableUnit) -> Result<(), DeployflowError> {
        if self.failing.contains(&unit.target) {
            return Err(DeployflowError::deployment(&unit.stage, &unit.target, "scripted failure"));
        }
        self.deployed.lock().push(unit.clone());
        Ok(())
    }

    async fn destroy(&self, unit: &DeployableUnit) -> Result<(), DeployflowError> {
        self.destroyed.lock().push(unit.target.clone());
        Ok(())
    }
}

/// Scripted outcome of an approval request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Script {
    Decide(ApprovalDecision),
    TimeOut,
}

/// An approval gate answering from a script instead of a human.
#[derive(Debug)]
pub struct ScriptedApprovals {
    default: Script,
    scripts: HashMap<String, Script>,
    requested: Mutex<Vec<String>>,
}

impl ScriptedApprovals {
    /// Approves every stage unless told otherwise.
    #[must_use]
    pub fn approve_all() -> Self {
        Self {
            default: Script::Decide(ApprovalDecision::Approved),
            scripts: HashMap::new(),
            requested: Mutex::new(Vec::new()),
        }
    }

    /// Rejects every stage unless told otherwise.
    #[must_use]
    pub fn reject_all() -> Self {
        Self {
            default: Script::Decide(ApprovalDecision::Rejected),
            ..Self::approve_all()
        }
    }

    /// Decides `stage` with `decision`.
    #[must_use]
    pub fn with_decision(mut self, stage: impl Into<String>, decision: ApprovalDecision) -> Self {
        self.scripts.insert(stage.into(), Script::Decide(decision));
        self
    }

    /// Lets the request for `stage` time out.
    #[must_use]
    pub fn with_timeout(mut self, stage: impl Into<String>) -> Self {
        self.scripts.insert(stage.into(), Script::TimeOut);
        self
    }

    /// Stages approval was requested for, in order.
    #[must_use]
    pub fn requested(&self) -> Vec<String> {
        self.requested.lock().clone()
    }
}

#[async_trait]
impl ApprovalGate for ScriptedApprovals {
    async fn request_approval(
        &self,
        stage: &str,
        _summary: &str,
        timeout: Duration,
    ) -> Result<(), DeployflowError> {
        self.requested.lock().push(stage.to_string());
        match self.scripts.get(stage).copied().unwrap_or(self.default) {
            Script::Decide(ApprovalDecision::Approved) => Ok(()),
            Script::Decide(ApprovalDecision::Rejected) => Err(DeployflowError::ApprovalDenied {
                stage: stage.to_string(),
            }),
            Script::TimeOut => Err(DeployflowError::ApprovalTimeout {
                stage: stage.to_string(),
                request_id: "scripted".to_string(),
                timeout_seconds: timeout.as_secs_f64(),
            }),
        }
    }
}

/// A fetcher serving fixed bodies by URL. Unknown URLs fail permanently.
#[derive(Debug, Default)]
pub struct StaticFetcher {
    bodies: HashMap<String, Vec<u8>>,
}

impl StaticFetcher {
    /// Creates a fetcher with no bodies.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Serves `body` at `url`.
    #[must_use]
    pub fn with_body(mut self, url: impl Into<String>, body: &[u8]) -> Self {
        self.bodies.insert(url.into(), body.to_vec());
        self
    }
}

#[async_trait]
impl ArtifactFetcher for StaticFetcher {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        self.bodies
            .get(url)
            .cloned()
            .ok_or_else(|| FetchError::Permanent(format!("HTTP 404 for {url}")))
    }
}

/// A fetcher that fails transiently a fixed number of times, then succeeds.
#[derive(Debug)]
pub struct FlakyFetcher {
    failures: usize,
    body: Vec<u8>,
    calls: AtomicUsize,
}

impl FlakyFetcher {
    /// Fails the first `failures` calls, then returns `body`.
    #[must_use]
    pub fn new(failures: usize, body: &[u8]) -> Self {
        Self {
            failures,
            body: body.to_vec(),
            calls: AtomicUsize::new(0),
        }
    }

    /// Number of fetch calls so far.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ArtifactFetcher for FlakyFetcher {
    async fn fetch(&self, _url: &str) -> Result<Vec<u8>, FetchError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            Err(FetchError::Transient(format!("connection reset (call {})", call + 1)))
        } else {
            Ok(self.body.clone())
        }
    }
}

/// A role assumer that hands out fixed credentials for any role.
#[derive(Debug)]
pub struct StaticRoleAssumer {
    credentials: Credentials,
    assumed: Mutex<Vec<String>>,
}

impl StaticRoleAssumer {
    /// Hands out `credentials`.
    #[must_use]
    pub fn new(credentials: Credentials) -> Self {
        Self {
            credentials,
            assumed: Mutex::new(Vec::new()),
        }
    }

    /// Roles assumed so far.
    #[must_use]
    pub fn assumed(&self) -> Vec<String> {
        self.assumed.lock().clone()
    }
}

#[async_trait]
impl RoleAssumer for StaticRoleAssumer {
    async fn assume_role(
        &self,
        role_arn: &str,
        _session_name: &str,
        _duration: Duration,
    ) -> Result<Credentials, DeployflowError> {
        self.assumed.lock().push(role_arn.to_string());
        Ok(self.credentials.clone())
    }
}

/// One recorded workflow start.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedStart {
    /// Workflow identifier.
    pub workflow: String,
    /// Region it was started in.
    pub region: String,
    /// Input document.
    pub input: serde_json::Value,
}

/// A workflow starter that records starts and can fail the first few.
#[derive(Debug, Default)]
pub struct RecordingWorkflowStarter {
    starts: Mutex<Vec<RecordedStart>>,
    fail_remaining: AtomicUsize,
}

impl RecordingWorkflowStarter {
    /// Creates a starter that always accepts.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Rejects the first `count` starts.
    #[must_use]
    pub fn failing_first(self, count: usize) -> Self {
        self.fail_remaining.store(count, Ordering::SeqCst);
        self
    }

    /// Accepted starts, in order.
    #[must_use]
    pub fn starts(&self) -> Vec<RecordedStart> {
        self.starts.lock().clone()
    }
}

#[async_trait]
impl WorkflowStarter for RecordingWorkflowStarter {
    async fn start_execution(
        &self,
        _credentials: &Credentials,
        workflow: &str,
        region: &str,
        input: serde_json::Value,
    ) -> Result<WorkflowExecution, DeployflowError> {
        let rejected = self
            .fail_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if rejected {
            return Err(DeployflowError::Workflow(format!("start of {workflow} rejected")));
        }

        let mut starts = self.starts.lock();
        starts.push(RecordedStart {
            workflow: workflow.to_string(),
            region: region.to_string(),
            input,
        });
        Ok(WorkflowExecution {
            execution_id: format!("execution-{}", starts.len()),
            workflow: workflow.to_string(),
            started_at: Utc::now(),
        })
    }
}
