//! Core domain model types for deployflow.
//!
//! This module contains the fundamental types shared by both topologies:
//! - Deployment targets (account/region pairs)
//! - Artifact records for copied objects
//! - Stage and run status enums

mod artifact;
mod status;
mod target;

pub use artifact::{content_md5, ArtifactRecord};
pub use status::{RunStatus, StageStatus};
pub use target::DeploymentTarget;
