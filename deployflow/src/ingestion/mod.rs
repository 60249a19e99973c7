//! The artifact ingestion topology: local store, copy worker, backfill
//! trigger, and their provisioning.

mod backfill;
mod consumer;
mod fetcher;
mod store;
mod template;
mod topology;

pub use backfill::{
    BackfillOutcome, BackfillTrigger, Credentials, InMemoryTriggerLedger, OneShotRequest,
    RoleAssumer, ScopedRoleAssumer, TriggerLedger, TriggerVersion, WorkflowExecution,
    WorkflowStarter, SESSION_DURATION, SESSION_NAME, VERSION_PROPERTY,
};
pub use consumer::{ArtifactConsumer, BatchReport};
#[cfg(feature = "http")]
pub use fetcher::HttpArtifactFetcher;
pub use fetcher::{ArtifactFetcher, FetchError};
pub use store::{InMemoryObjectStore, ObjectStore};
pub use template::TemplateRewriter;
pub use topology::{
    default_bucket_name, ingestion_stack_factory, IngestionDeployer, IngestionEnvironment,
    IngestionTopology, IngestionTopologySpec, STACK_NAME,
};
