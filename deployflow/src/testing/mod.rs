//! Test doubles and fixtures for pipelines and ingestion topologies.
//!
//! Every trait seam in the crate has a double here that records what it was
//! asked to do, so tests can assert on ordering and call counts.

mod assertions;
mod fixtures;
mod mocks;

pub use assertions::assert_stage_statuses;
pub use fixtures::{fixed_credentials, targets_json};
pub use mocks::{
    FlakyFetcher, RecordedStart, RecordingDeployer, RecordingWorkflowStarter, ScriptedApprovals,
    StaticFetcher, StaticRoleAssumer,
};
