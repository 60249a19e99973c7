//! Error types for the deployflow crate.
//!
//! Every fallible operation in the ingestion and delivery topologies returns
//! [`DeployflowError`]. Lookup failures are fatal for pipeline synthesis,
//! delivery failures leave the message on the queue, and approval errors halt
//! the pipeline without rolling back earlier stages.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// The main error type for deployflow operations.
#[derive(Debug, Error)]
pub enum DeployflowError {
    /// A pipeline definition failed validation.
    #[error("{0}")]
    Validation(#[from] PipelineValidationError),

    /// A named configuration value was missing or unreadable.
    #[error("{0}")]
    Lookup(#[from] LookupFailure),

    /// Copying an artifact into the local store failed.
    #[error("{0}")]
    Delivery(#[from] DeliveryFailure),

    /// A manual approval gate was rejected.
    #[error("Approval denied for stage: {stage}")]
    ApprovalDenied {
        /// The gated stage.
        stage: String,
    },

    /// A manual approval gate timed out.
    #[error("Approval timeout for stage: {stage} (request {request_id}, {timeout_seconds}s)")]
    ApprovalTimeout {
        /// The gated stage.
        stage: String,
        /// The approval request ID.
        request_id: String,
        /// The timeout in seconds.
        timeout_seconds: f64,
    },

    /// Assuming a cross-account role was refused.
    #[error("Permission denied assuming role {role_arn}: {reason}")]
    PermissionDenied {
        /// The role that could not be assumed.
        role_arn: String,
        /// Why it was refused.
        reason: String,
    },

    /// An operation ran before a resource it depends on existed.
    #[error("Ordering violation: {0}")]
    OrderingViolation(String),

    /// Deploying or destroying a unit failed.
    #[error("Deployment of stage '{stage}' to {target} failed: {reason}")]
    Deployment {
        /// The stage being deployed.
        stage: String,
        /// The target, rendered as `account/region`.
        target: String,
        /// The failure reason.
        reason: String,
    },

    /// Starting the external workflow failed.
    #[error("Workflow error: {0}")]
    Workflow(String),

    /// Invalid or incomplete settings.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Writing or removing a provisioned resource failed.
    #[error("Resource '{resource}' could not be changed: {reason}")]
    Resource {
        /// The parameter or bucket involved.
        resource: String,
        /// Why the change failed.
        reason: String,
    },

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for DeployflowError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl DeployflowError {
    /// Creates a deployment error.
    #[must_use]
    pub fn deployment(
        stage: impl Into<String>,
        target: impl std::fmt::Display,
        reason: impl Into<String>,
    ) -> Self {
        Self::Deployment {
            stage: stage.into(),
            target: target.to_string(),
            reason: reason.into(),
        }
    }

    /// Creates a permission denied error.
    #[must_use]
    pub fn permission_denied(role_arn: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::PermissionDenied {
            role_arn: role_arn.into(),
            reason: reason.into(),
        }
    }

    /// Creates a resource error.
    #[must_use]
    pub fn resource(resource: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Resource {
            resource: resource.into(),
            reason: reason.into(),
        }
    }

    /// Returns true if the pipeline should halt without retrying.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::Delivery(failure) if failure.retryable)
    }

    /// Returns a stable error code for the variant.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "DEPLOY-001-VALIDATION",
            Self::Lookup(_) => "DEPLOY-002-LOOKUP",
            Self::Delivery(_) => "DEPLOY-003-DELIVERY",
            Self::ApprovalDenied { .. } => "DEPLOY-004-APPROVAL_DENIED",
            Self::ApprovalTimeout { .. } => "DEPLOY-004-APPROVAL_TIMEOUT",
            Self::PermissionDenied { .. } => "DEPLOY-005-PERMISSION",
            Self::OrderingViolation(_) => "DEPLOY-006-ORDERING",
            Self::Deployment { .. } => "DEPLOY-007-DEPLOYMENT",
            Self::Workflow(_) => "DEPLOY-008-WORKFLOW",
            Self::Configuration(_) => "DEPLOY-009-CONFIG",
            Self::Serialization(_) => "DEPLOY-010-SERDE",
            Self::Io(_) => "DEPLOY-011-IO",
            Self::Resource { .. } => "DEPLOY-012-RESOURCE",
        }
    }
}

/// Metadata about an error for better diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ErrorInfo {
    /// Error code (e.g., "DEPLOY-001-DUPLICATE_STAGE").
    pub code: String,
    /// Short summary of the error.
    pub summary: String,
    /// Hint for fixing the error.
    pub fix_hint: Option<String>,
    /// Additional context key-value pairs.
    #[serde(default)]
    pub context: HashMap<String, String>,
}

impl ErrorInfo {
    /// Creates new error info.
    #[must_use]
    pub fn new(code: impl Into<String>, summary: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            summary: summary.into(),
            fix_hint: None,
            context: HashMap::new(),
        }
    }

    /// Sets the fix hint.
    #[must_use]
    pub fn with_fix_hint(mut self, hint: impl Into<String>) -> Self {
        self.fix_hint = Some(hint.into());
        self
    }

    /// Adds a single context entry.
    #[must_use]
    pub fn with_context_entry(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }
}

/// Error raised when a pipeline definition is invalid.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct PipelineValidationError {
    /// The error message.
    pub message: String,
    /// The stages involved in the error.
    pub stages: Vec<String>,
    /// Optional diagnostic info.
    pub error_info: Option<ErrorInfo>,
}

impl PipelineValidationError {
    /// Creates a new pipeline validation error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stages: Vec::new(),
            error_info: None,
        }
    }

    /// Sets the stages involved.
    #[must_use]
    pub fn with_stages(mut self, stages: Vec<String>) -> Self {
        self.stages = stages;
        self
    }

    /// Sets the diagnostic info.
    #[must_use]
    pub fn with_error_info(mut self, info: ErrorInfo) -> Self {
        self.error_info = Some(info);
        self
    }

    /// The pipeline has no stages.
    #[must_use]
    pub fn empty_pipeline() -> Self {
        Self::new("Pipeline must contain at least one deployment stage").with_error_info(
            ErrorInfo::new("DEPLOY-001-EMPTY", "No deployment stages defined")
                .with_fix_hint("Add at least one stage before building the pipeline."),
        )
    }

    /// Two stages share a name.
    #[must_use]
    pub fn duplicate_stage(name: &str) -> Self {
        Self::new(format!("Duplicate deployment stage name: '{name}'"))
            .with_stages(vec![name.to_string()])
            .with_error_info(
                ErrorInfo::new("DEPLOY-001-DUPLICATE_STAGE", "Stage names must be unique")
                    .with_context_entry("stage", name),
            )
    }
}

/// Why a lookup failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LookupFailureKind {
    /// The parameter does not exist in the region.
    NotFound,
    /// The caller may not read the parameter.
    AccessDenied,
    /// The value exists but could not be interpreted.
    Malformed,
}

impl std::fmt::Display for LookupFailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound => write!(f, "not found"),
            Self::AccessDenied => write!(f, "access denied"),
            Self::Malformed => write!(f, "malformed"),
        }
    }
}

/// A named configuration value could not be read.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error(
    "Lookup of '{name}' in {region} failed: {kind}{}",
    .detail.as_ref().map(|d| format!(" ({d})")).unwrap_or_default()
)]
pub struct LookupFailure {
    /// The parameter name.
    pub name: String,
    /// The region the read targeted.
    pub region: String,
    /// Failure category.
    pub kind: LookupFailureKind,
    /// Optional detail.
    pub detail: Option<String>,
}

impl LookupFailure {
    /// The parameter does not exist.
    #[must_use]
    pub fn not_found(name: impl Into<String>, region: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            region: region.into(),
            kind: LookupFailureKind::NotFound,
            detail: None,
        }
    }

    /// The caller lacks read permission.
    #[must_use]
    pub fn access_denied(name: impl Into<String>, region: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            region: region.into(),
            kind: LookupFailureKind::AccessDenied,
            detail: None,
        }
    }

    /// The value could not be parsed.
    #[must_use]
    pub fn malformed(
        name: impl Into<String>,
        region: impl Into<String>,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            region: region.into(),
            kind: LookupFailureKind::Malformed,
            detail: Some(detail.into()),
        }
    }
}

/// Copying an artifact failed.
#[derive(Debug, Clone, Error)]
#[error("Delivery of '{key}' failed: {reason}")]
pub struct DeliveryFailure {
    /// The artifact key.
    pub key: String,
    /// The failure reason.
    pub reason: String,
    /// Whether redelivery may succeed.
    pub retryable: bool,
}

impl DeliveryFailure {
    /// A transient failure; the message should be redelivered.
    #[must_use]
    pub fn transient(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            reason: reason.into(),
            retryable: true,
        }
    }

    /// A failure that redelivery cannot fix (e.g. an unparseable body).
    #[must_use]
    pub fn permanent(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            reason: reason.into(),
            retryable: false,
        }
    }
}

/// Result alias used throughout the crate.
pub type Result<T, E = DeployflowError> = std::result::Result<T, E>;
