//! Deployment stages and the units they deploy.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::core::DeploymentTarget;
use crate::errors::DeployflowError;
use crate::parameters::names::deployment_targets_path;

/// Where a stage's targets come from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetsSource {
    /// A fixed list, embedded in the definition.
    Static(Vec<DeploymentTarget>),
    /// A configuration parameter, read from the home region on every run.
    Parameter(String),
}

impl TargetsSource {
    /// The conventional per-domain target parameter for `stage`.
    #[must_use]
    pub fn for_domain(domain: &str, stage: &str) -> Self {
        Self::Parameter(deployment_targets_path(domain, stage))
    }

    /// Returns the parameter path, if this source reads one.
    #[must_use]
    pub fn parameter_path(&self) -> Option<&str> {
        match self {
            Self::Parameter(path) => Some(path),
            Self::Static(_) => None,
        }
    }
}

impl fmt::Display for TargetsSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Static(targets) => {
                let rendered: Vec<String> = targets.iter().map(ToString::to_string).collect();
                write!(f, "static:[{}]", rendered.join(","))
            }
            Self::Parameter(path) => write!(f, "parameter:{path}"),
        }
    }
}

/// One deployable infrastructure unit, bound to a target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeployableUnit {
    /// Name of the stack.
    pub stack_name: String,
    /// Stage the unit belongs to.
    pub stage: String,
    /// Target the unit is deployed to.
    pub target: DeploymentTarget,
    /// Properties handed to the deployer.
    #[serde(default)]
    pub properties: serde_json::Value,
}

impl DeployableUnit {
    /// Creates a unit without properties.
    #[must_use]
    pub fn new(
        stack_name: impl Into<String>,
        stage: impl Into<String>,
        target: DeploymentTarget,
    ) -> Self {
        Self {
            stack_name: stack_name.into(),
            stage: stage.into(),
            target,
            properties: serde_json::Value::Null,
        }
    }

    /// Sets the properties.
    #[must_use]
    pub fn with_properties(mut self, properties: serde_json::Value) -> Self {
        self.properties = properties;
        self
    }
}

/// Produces the unit a stage deploys to one target.
pub trait StackFactory: Send + Sync {
    /// Creates the unit for `target` within `stage`.
    fn create(
        &self,
        stage: &str,
        target: &DeploymentTarget,
    ) -> Result<DeployableUnit, DeployflowError>;
}

/// Adapts a closure into a [`StackFactory`].
pub struct FnStackFactory<F> {
    f: F,
}

impl<F> FnStackFactory<F>
where
    F: Fn(&str, &DeploymentTarget) -> Result<DeployableUnit, DeployflowError> + Send + Sync,
{
    /// Wraps `f`.
    #[must_use]
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

impl<F> StackFactory for FnStackFactory<F>
where
    F: Fn(&str, &DeploymentTarget) -> Result<DeployableUnit, DeployflowError> + Send + Sync,
{
    fn create(
        &self,
        stage: &str,
        target: &DeploymentTarget,
    ) -> Result<DeployableUnit, DeployflowError> {
        (self.f)(stage, target)
    }
}

impl<F> fmt::Debug for FnStackFactory<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnStackFactory").finish_non_exhaustive()
    }
}

/// A named pipeline step deploying one unit per resolved target.
#[derive(Clone)]
pub struct DeploymentStage {
    /// Unique stage name.
    pub name: String,
    /// Where targets are resolved from.
    pub targets: TargetsSource,
    /// Whether a human must approve the stage.
    pub require_manual_approval: bool,
    /// Builds the per-target unit.
    pub stack_factory: Arc<dyn StackFactory>,
}

impl DeploymentStage {
    /// Creates a stage without an approval gate.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        targets: TargetsSource,
        stack_factory: Arc<dyn StackFactory>,
    ) -> Self {
        Self {
            name: name.into(),
            targets,
            require_manual_approval: false,
            stack_factory,
        }
    }

    /// Requires manual approval.
    #[must_use]
    pub fn with_manual_approval(mut self) -> Self {
        self.require_manual_approval = true;
        self
    }

    /// The parts of the stage that feed the pipeline's self fingerprint.
    #[must_use]
    pub fn fingerprint_components(&self) -> Vec<String> {
        vec![
            self.name.clone(),
            self.targets.to_string(),
            self.require_manual_approval.to_string(),
        ]
    }
}

impl fmt::Debug for DeploymentStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeploymentStage")
            .field("name", &self.name)
            .field("targets", &self.targets)
            .field("require_manual_approval", &self.require_manual_approval)
            .finish_non_exhaustive()
    }
}
