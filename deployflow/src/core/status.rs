//! Stage and run status enums.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The execution status of a deployment stage within one pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    /// Stage has not started.
    #[default]
    Pending,
    /// Stage is waiting on its manual approval gate.
    AwaitingApproval,
    /// Stage targets are being deployed.
    Deploying,
    /// All targets deployed (and the gate, if any, approved).
    Succeeded,
    /// A target failed to deploy.
    Failed,
    /// The approval gate was rejected or timed out.
    Rejected,
    /// Stage never ran because an earlier stage halted the run.
    Skipped,
}

impl StageStatus {
    /// Returns true once the stage can no longer change.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::Rejected | Self::Skipped
        )
    }
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::AwaitingApproval => write!(f, "awaiting_approval"),
            Self::Deploying => write!(f, "deploying"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
            Self::Rejected => write!(f, "rejected"),
            Self::Skipped => write!(f, "skipped"),
        }
    }
}

/// The overall outcome of a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Every stage succeeded.
    Succeeded,
    /// A stage failed to deploy.
    Failed,
    /// An approval gate halted the run.
    Halted,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
            Self::Halted => write!(f, "halted"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_status_default() {
        assert_eq!(StageStatus::default(), StageStatus::Pending);
    }

    #[test]
    fn test_stage_status_terminal() {
        assert!(!StageStatus::AwaitingApproval.is_terminal());
        assert!(!StageStatus::Deploying.is_terminal());
        assert!(StageStatus::Rejected.is_terminal());
        assert!(StageStatus::Skipped.is_terminal());
    }

    #[test]
    fn test_status_serialization() {
        let json = serde_json::to_string(&StageStatus::AwaitingApproval).unwrap();
        assert_eq!(json, "\"awaiting_approval\"");
        assert_eq!(RunStatus::Halted.to_string(), "halted");
    }
}
