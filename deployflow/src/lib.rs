//! # Deployflow
//!
//! Two cooperating delivery topologies for a cloud platform:
//!
//! - **Artifact ingestion**: a consumer subscribes to a shared notification
//!   channel with a filter for its own account and region (or `ALL`), copies
//!   each announced artifact into a local store, rewrites distributor bucket
//!   references in templates, and runs a versioned one-shot backfill on first
//!   provisioning.
//! - **Delivery pipeline**: an ordered dev/qa/prod sequence whose stages read
//!   their deployment targets from external configuration, deploy to every
//!   target in parallel, pause at manual approval gates, and clean up targets
//!   that disappeared from configuration.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use deployflow::prelude::*;
//!
//! let settings = PipelineSettings::new("app", "111111111111", "eu-west-1");
//! let pipeline = DeliveryPipelineBuilder::new(settings)
//!     .standard_stages(factory)?
//!     .with_configuration_source(parameters)
//!     .with_deployer(deployer)
//!     .with_approvals(approvals)
//!     .build()?;
//!
//! let report = pipeline.run(PipelineTrigger::Manual).await?;
//! ```

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, missing_docs, rust_2018_idioms)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod config;
pub mod core;
pub mod errors;
pub mod events;
pub mod ingestion;
pub mod observability;
pub mod parameters;
pub mod pipeline;
pub mod routing;
pub mod testing;
pub mod utils;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::{ConsumerSettings, PipelineSettings, QueueSettings};
    pub use crate::core::{ArtifactRecord, DeploymentTarget, RunStatus, StageStatus};
    pub use crate::errors::{DeployflowError, ErrorInfo, LookupFailure, PipelineValidationError};
    pub use crate::events::{EventSink, LoggingEventSink, NoOpEventSink};
    pub use crate::ingestion::{
        ArtifactConsumer, ArtifactFetcher, BackfillTrigger, IngestionEnvironment, IngestionTopology,
        IngestionTopologySpec, ObjectStore, TriggerVersion,
    };
    pub use crate::parameters::{
        ConfigurationSource, CrossRegionParameterReader, ParameterPublisher,
    };
    pub use crate::pipeline::{
        ApprovalGate, ApprovalService, DeliveryPipeline, DeliveryPipelineBuilder, DeployableUnit,
        Deployer, DeploymentStage, PipelineTrigger, RunReport, StackFactory, TargetsSource,
    };
    pub use crate::routing::{
        DurableQueue, NotificationChannel, NotificationFilterPolicy, NotificationMessage,
    };
    pub use crate::utils::{generate_run_id, generate_uuid, iso_timestamp, Timestamp};
}
