//! Stage target resolution.
//!
//! Targets are never memoized: every run reads the current configuration, so
//! adding a target to a parameter takes effect on the next run without
//! touching the pipeline definition.

use serde::Deserialize;
use std::collections::BTreeSet;
use tracing::debug;

use super::stage::{DeploymentStage, TargetsSource};
use crate::core::DeploymentTarget;
use crate::errors::LookupFailure;
use crate::parameters::ConfigurationSource;

#[derive(Deserialize)]
#[serde(untagged)]
enum TargetsDocument {
    List(Vec<DeploymentTarget>),
    Wrapped { targets: Vec<DeploymentTarget> },
}

/// Parses a target parameter value.
///
/// Accepts a JSON array of `{"account", "region"}` objects, or an object with
/// a `targets` array. A blank value means no targets.
pub fn parse_targets(
    name: &str,
    region: &str,
    value: &str,
) -> Result<BTreeSet<DeploymentTarget>, LookupFailure> {
    if value.trim().is_empty() {
        return Ok(BTreeSet::new());
    }

    let document: TargetsDocument = serde_json::from_str(value)
        .map_err(|e| LookupFailure::malformed(name, region, e.to_string()))?;

    let targets = match document {
        TargetsDocument::List(targets) | TargetsDocument::Wrapped { targets } => targets,
    };

    Ok(targets.into_iter().collect())
}

/// Resolves the targets of `stage`.
///
/// Parameter sources are read from `home_region`. Duplicates collapse, and the
/// set ordering makes the result identical for identical configuration.
pub async fn resolve_stage_targets(
    stage: &DeploymentStage,
    source: &dyn ConfigurationSource,
    home_region: &str,
) -> Result<BTreeSet<DeploymentTarget>, LookupFailure> {
    let targets = match &stage.targets {
        TargetsSource::Static(targets) => targets.iter().cloned().collect(),
        TargetsSource::Parameter(path) => {
            let value = source.get_parameter(path, home_region).await?;
            parse_targets(path, home_region, &value)?
        }
    };

    debug!(stage = %stage.name, count = targets.len(), "Resolved stage targets");
    Ok(targets)
}
