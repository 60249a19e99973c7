//! Well-known parameter names read and published by the topologies.

/// Source-control connection identifier used by the pipeline's source step.
pub const CODESTAR_CONNECTION_ARN: &str = "/tts-cloud/cloud-cicd-github-codestar-connection/arn";

/// Per-region replication bucket published by the common support stacks.
pub const SUPPORT_BUCKET_NAME: &str = "/tts-cloud/cloud-cicd-common-support-stacks/bucket-name";

/// Per-region replication encryption key published by the common support stacks.
pub const SUPPORT_KEY_ARN: &str = "/tts-cloud/cloud-cicd-common-support-stacks/key-arn";

/// Where an ingestion topology publishes its local store's bucket name.
pub const ARTIFACT_CONSUMER_BUCKET_NAME: &str = "/tts-cloud/cloud-artifact-consumer/bucket-name";

/// Returns the parameter holding the deployment targets of `stage` in `domain`.
#[must_use]
pub fn deployment_targets_path(domain: &str, stage: &str) -> String {
    format!("/cicd/domains/{domain}/deploymentTargets/{stage}")
}
