//! Manual approval gates.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{info, warn};
use uuid::Uuid;

use crate::errors::DeployflowError;
use crate::utils::generate_uuid;

/// Where a stage's approval gate sits relative to its deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GatePlacement {
    /// Approve, then deploy.
    #[default]
    BeforeDeploy,
    /// Deploy, then approve promotion to the next stage.
    AfterDeploy,
}

/// A human decision on a pending approval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalDecision {
    /// Proceed.
    Approved,
    /// Halt the run.
    Rejected,
}

/// Blocks a stage until a human decides.
#[async_trait]
pub trait ApprovalGate: Send + Sync {
    /// Waits for a decision on `stage`.
    ///
    /// Returns `ApprovalDenied` on rejection and `ApprovalTimeout` when no
    /// decision arrives within `timeout`.
    async fn request_approval(
        &self,
        stage: &str,
        summary: &str,
        timeout: Duration,
    ) -> Result<(), DeployflowError>;
}

/// A request waiting for a decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PendingApproval {
    /// Request ID.
    pub id: Uuid,
    /// Gated stage.
    pub stage: String,
    /// What is being approved.
    pub summary: String,
    /// When the request was opened.
    pub requested_at: DateTime<Utc>,
}

struct ApprovalRequest {
    info: PendingApproval,
    response_tx: oneshot::Sender<ApprovalDecision>,
}

/// Approval gate driven by explicit `approve`/`reject` calls.
#[derive(Default)]
pub struct ApprovalService {
    requests: RwLock<HashMap<Uuid, ApprovalRequest>>,
}

impl ApprovalService {
    /// Creates a new approval service.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Decides a pending request. Returns false if it is no longer pending.
    pub fn decide(&self, request_id: Uuid, decision: ApprovalDecision) -> bool {
        match self.requests.write().remove(&request_id) {
            Some(request) => request.response_tx.send(decision).is_ok(),
            None => false,
        }
    }

    /// Approves a pending request.
    pub fn approve(&self, request_id: Uuid) -> bool {
        self.decide(request_id, ApprovalDecision::Approved)
    }

    /// Rejects a pending request.
    pub fn reject(&self, request_id: Uuid) -> bool {
        self.decide(request_id, ApprovalDecision::Rejected)
    }

    /// Decides the pending request for `stage`, if there is one.
    pub fn decide_stage(&self, stage: &str, decision: ApprovalDecision) -> bool {
        let id = self
            .requests
            .read()
            .values()
            .find(|r| r.info.stage == stage)
            .map(|r| r.info.id);
        id.is_some_and(|id| self.decide(id, decision))
    }

    /// Returns the number of pending requests.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.requests.read().len()
    }

    /// Lists pending requests, oldest first.
    #[must_use]
    pub fn pending_requests(&self) -> Vec<PendingApproval> {
        let mut pending: Vec<PendingApproval> = self
            .requests
            .read()
            .values()
            .map(|r| r.info.clone())
            .collect();
        pending.sort_by_key(|p| p.requested_at);
        pending
    }
}

impl std::fmt::Debug for ApprovalService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApprovalService")
            .field("pending_count", &self.pending_count())
            .finish()
    }
}

#[async_trait]
impl ApprovalGate for ApprovalService {
    async fn request_approval(
        &self,
        stage: &str,
        summary: &str,
        timeout: Duration,
    ) -> Result<(), DeployflowError> {
        let request_id = generate_uuid();
        let (tx, rx) = oneshot::channel();

        self.requests.write().insert(
            request_id,
            ApprovalRequest {
                info: PendingApproval {
                    id: request_id,
                    stage: stage.to_string(),
                    summary: summary.to_string(),
                    requested_at: Utc::now(),
                },
                response_tx: tx,
            },
        );
        info!(stage, request_id = %request_id, "Waiting for manual approval");

        let outcome = tokio::time::timeout(timeout, rx).await;
        self.requests.write().remove(&request_id);

        match outcome {
            Ok(Ok(ApprovalDecision::Approved)) => {
                info!(stage, request_id = %request_id, "Stage approved");
                Ok(())
            }
            // A dropped sender means nobody can approve any more.
            Ok(Ok(ApprovalDecision::Rejected) | Err(_)) => {
                warn!(stage, request_id = %request_id, "Stage rejected");
                Err(DeployflowError::ApprovalDenied {
                    stage: stage.to_string(),
                })
            }
            Err(_) => {
                warn!(stage, request_id = %request_id, "Approval timed out");
                Err(DeployflowError::ApprovalTimeout {
                    stage: stage.to_string(),
                    request_id: request_id.to_string(),
                    timeout_seconds: timeout.as_secs_f64(),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    async fn wait_for_pending(service: &ApprovalService) -> PendingApproval {
        loop {
            if let Some(p) = service.pending_requests().into_iter().next() {
                return p;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn test_approval_approved() {
        let service = Arc::new(ApprovalService::new());
        let waiter = service.clone();
        let handle = tokio::spawn(async move {
            waiter
                .request_approval("qa", "deploy qa", Duration::from_secs(5))
                .await
        });

        let pending = wait_for_pending(&service).await;
        assert_eq!(pending.stage, "qa");
        assert!(service.approve(pending.id));

        assert!(handle.await.unwrap().is_ok());
        assert_eq!(service.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_approval_rejected_by_stage() {
        let service = Arc::new(ApprovalService::new());
        let waiter = service.clone();
        let handle = tokio::spawn(async move {
            waiter
                .request_approval("prod", "deploy prod", Duration::from_secs(5))
                .await
        });

        wait_for_pending(&service).await;
        assert!(service.decide_stage("prod", ApprovalDecision::Rejected));

        let err = handle.await.unwrap().unwrap_err();
        assert!(matches!(err, DeployflowError::ApprovalDenied { ref stage } if stage == "prod"));
    }

    #[tokio::test]
    async fn test_approval_timeout() {
        let service = ApprovalService::new();
        let err = service
            .request_approval("qa", "deploy qa", Duration::from_millis(20))
            .await
            .unwrap_err();

        assert!(matches!(err, DeployflowError::ApprovalTimeout { .. }));
        assert_eq!(service.pending_count(), 0);
    }

    #[test]
    fn test_unknown_request_cannot_be_decided() {
        let service = ApprovalService::new();
        assert!(!service.approve(Uuid::new_v4()));
        assert!(!service.decide_stage("qa", ApprovalDecision::Approved));
    }

    #[test]
    fn test_gate_placement_defaults_before_deploy() {
        assert_eq!(GatePlacement::default(), GatePlacement::BeforeDeploy);
        let parsed: GatePlacement = serde_json::from_str("\"after_deploy\"").unwrap();
        assert_eq!(parsed, GatePlacement::AfterDeploy);
    }
}
