//! The multi-stage, multi-region delivery pipeline.

mod approval;
mod builder;
mod deployer;
mod integration_tests;
mod ledger;
mod replication;
mod retry;
mod runner;
mod stage;
mod targets;
mod triggers;

pub use approval::{ApprovalDecision, ApprovalGate, ApprovalService, GatePlacement, PendingApproval};
pub use builder::{DeliveryPipelineBuilder, STANDARD_STAGES};
pub use deployer::Deployer;
pub use ledger::{DefinitionLedger, InMemoryDefinitionLedger};
pub use replication::{build_cross_region_replication_targets, ReplicationBucket, ReplicationMap};
pub use retry::{with_retry, with_retry_if, BackoffStrategy, JitterStrategy, RetryConfig};
pub use runner::{DeliveryPipeline, RunReport, StageReport, SynthesisResult};
pub use stage::{DeployableUnit, DeploymentStage, FnStackFactory, StackFactory, TargetsSource};
pub use targets::{parse_targets, resolve_stage_targets};
pub use triggers::{ConfigurationChangeTrigger, PipelineTrigger};
