//! Delivery pipeline builder with validation.

use std::collections::HashSet;
use std::sync::Arc;

use super::approval::ApprovalGate;
use super::deployer::Deployer;
use super::ledger::{DefinitionLedger, InMemoryDefinitionLedger};
use super::runner::DeliveryPipeline;
use super::stage::{DeploymentStage, StackFactory, TargetsSource};
use crate::config::PipelineSettings;
use crate::errors::{DeployflowError, ErrorInfo, PipelineValidationError};
use crate::events::{EventSink, NoOpEventSink};
use crate::parameters::ConfigurationSource;

/// The conventional stage sequence: dev, then qa and prod behind approval.
pub const STANDARD_STAGES: [(&str, bool); 3] = [("dev", false), ("qa", true), ("prod", true)];

/// Builder for validated delivery pipelines.
pub struct DeliveryPipelineBuilder {
    settings: PipelineSettings,
    stages: Vec<DeploymentStage>,
    trigger_paths: Vec<String>,
    source: Option<Arc<dyn ConfigurationSource>>,
    deployer: Option<Arc<dyn Deployer>>,
    approvals: Option<Arc<dyn ApprovalGate>>,
    ledger: Option<Arc<dyn DefinitionLedger>>,
    events: Arc<dyn EventSink>,
}

impl std::fmt::Debug for DeliveryPipelineBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryPipelineBuilder")
            .field("settings", &self.settings)
            .field("stages", &self.stages)
            .field("trigger_paths", &self.trigger_paths)
            .finish_non_exhaustive()
    }
}

impl DeliveryPipelineBuilder {
    /// Creates a builder.
    #[must_use]
    pub fn new(settings: PipelineSettings) -> Self {
        Self {
            settings,
            stages: Vec::new(),
            trigger_paths: Vec::new(),
            source: None,
            deployer: None,
            approvals: None,
            ledger: None,
            events: Arc::new(NoOpEventSink),
        }
    }

    /// Appends a stage. Stages run in the order they are added.
    ///
    /// # Errors
    ///
    /// Returns an error if the name is blank or already taken.
    pub fn stage(mut self, stage: DeploymentStage) -> Result<Self, PipelineValidationError> {
        if stage.name.trim().is_empty() {
            return Err(PipelineValidationError::new("Stage name must not be empty").with_error_info(
                ErrorInfo::new("DEPLOY-001-EMPTY_NAME", "Blank stage name")
                    .with_fix_hint("Give every stage a unique, non-empty name."),
            ));
        }
        if self.stages.iter().any(|s| s.name == stage.name) {
            return Err(PipelineValidationError::duplicate_stage(&stage.name));
        }
        self.stages.push(stage);
        Ok(self)
    }

    /// Appends dev, qa, and prod, each reading its targets from the domain's
    /// target parameter, and re-triggers the pipeline when any of those
    /// parameters change.
    ///
    /// # Errors
    ///
    /// Returns an error if any of those names is already taken.
    pub fn standard_stages(
        mut self,
        factory: Arc<dyn StackFactory>,
    ) -> Result<Self, PipelineValidationError> {
        for (name, gated) in STANDARD_STAGES {
            let targets = TargetsSource::for_domain(&self.settings.domain, name);
            if let Some(path) = targets.parameter_path() {
                self.trigger_paths.push(path.to_string());
            }
            let mut stage = DeploymentStage::new(name, targets, factory.clone());
            if gated {
                stage = stage.with_manual_approval();
            }
            self = self.stage(stage)?;
        }
        Ok(self)
    }

    /// Re-triggers the pipeline when any of `paths` changes.
    #[must_use]
    pub fn trigger_on_configuration_change<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for path in paths {
            let path = path.into();
            if !self.trigger_paths.contains(&path) {
                self.trigger_paths.push(path);
            }
        }
        self
    }

    /// Sets where configuration is read from.
    #[must_use]
    pub fn with_configuration_source(mut self, source: Arc<dyn ConfigurationSource>) -> Self {
        self.source = Some(source);
        self
    }

    /// Sets the deployer.
    #[must_use]
    pub fn with_deployer(mut self, deployer: Arc<dyn Deployer>) -> Self {
        self.deployer = Some(deployer);
        self
    }

    /// Sets the approval gate.
    #[must_use]
    pub fn with_approvals(mut self, approvals: Arc<dyn ApprovalGate>) -> Self {
        self.approvals = Some(approvals);
        self
    }

    /// Sets where the definition fingerprint is remembered between builds.
    ///
    /// Without one, only runs of the same built pipeline are compared.
    #[must_use]
    pub fn with_definition_ledger(mut self, ledger: Arc<dyn DefinitionLedger>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    /// Sets the event sink.
    #[must_use]
    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Returns the stage names in order.
    #[must_use]
    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.name.as_str()).collect()
    }

    /// Builds the pipeline.
    ///
    /// # Errors
    ///
    /// Returns an error if there are no stages, if a gated stage exists
    /// without an approval gate, if the source or deployer is missing, or if
    /// a duration setting is out of range.
    pub fn build(self) -> Result<DeliveryPipeline, DeployflowError> {
        self.settings.validate()?;
        if self.stages.is_empty() {
            return Err(PipelineValidationError::empty_pipeline().into());
        }

        let mut seen = HashSet::new();
        for stage in &self.stages {
            if !seen.insert(stage.name.as_str()) {
                return Err(PipelineValidationError::duplicate_stage(&stage.name).into());
            }
        }

        let gated: Vec<String> = self
            .stages
            .iter()
            .filter(|s| s.require_manual_approval)
            .map(|s| s.name.clone())
            .collect();
        let approvals = match self.approvals {
            Some(approvals) => approvals,
            None if gated.is_empty() => Arc::new(super::approval::ApprovalService::new()),
            None => {
                return Err(PipelineValidationError::new("Gated stages need an approval gate")
                    .with_stages(gated)
                    .with_error_info(
                        ErrorInfo::new(
                            "DEPLOY-001-NO_GATE",
                            "Manual approval required but no gate configured",
                        )
                        .with_fix_hint(
                            "Call with_approvals() with the service humans approve through.",
                        ),
                    )
                    .into());
            }
        };

        let source = self.source.ok_or_else(|| {
            DeployflowError::Configuration("pipeline has no configuration source".into())
        })?;
        let deployer = self
            .deployer
            .ok_or_else(|| DeployflowError::Configuration("pipeline has no deployer".into()))?;

        Ok(DeliveryPipeline::assemble(
            self.settings,
            self.stages,
            self.trigger_paths,
            source,
            deployer,
            approvals,
            self.ledger.unwrap_or_else(|| Arc::new(InMemoryDefinitionLedger::new())),
            self.events,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::DeploymentTarget;
    use crate::parameters::InMemoryParameterStore;
    use crate::pipeline::{ApprovalService, DeployableUnit, FnStackFactory};
    use crate::testing::RecordingDeployer;

    fn factory() -> Arc<dyn StackFactory> {
        Arc::new(FnStackFactory::new(|stage: &str, target: &DeploymentTarget| {
            Ok(DeployableUnit::new("app", stage, target.clone()))
        }))
    }

    fn builder() -> DeliveryPipelineBuilder {
        DeliveryPipelineBuilder::new(PipelineSettings::new("p", "000000000000", "eu-west-1"))
            .with_configuration_source(Arc::new(InMemoryParameterStore::new()))
            .with_deployer(Arc::new(RecordingDeployer::new()))
    }

    #[test]
    fn test_standard_stages_order_and_gates() {
        let builder = builder().standard_stages(factory()).unwrap();
        assert_eq!(builder.stage_names(), vec!["dev", "qa", "prod"]);

        let pipeline = builder.with_approvals(Arc::new(ApprovalService::new())).build().unwrap();
        let gates: Vec<bool> = pipeline
            .stages()
            .iter()
            .map(|s| s.require_manual_approval)
            .collect();
        assert_eq!(gates, vec![false, true, true]);
        assert_eq!(
            pipeline.trigger_paths(),
            [
                "/cicd/domains/customer-platform/deploymentTargets/dev",
                "/cicd/domains/customer-platform/deploymentTargets/qa",
                "/cicd/domains/customer-platform/deploymentTargets/prod",
            ]
        );
    }

    #[test]
    fn test_duplicate_stage_rejected() {
        let stage = DeploymentStage::new("dev", TargetsSource::Static(vec![]), factory());
        let err = builder().stage(stage.clone()).unwrap().stage(stage).unwrap_err();
        assert_eq!(err.stages, vec!["dev".to_string()]);
    }

    #[test]
    fn test_empty_pipeline_rejected() {
        let err = builder().build().unwrap_err();
        assert!(matches!(err, DeployflowError::Validation(_)));
    }

    #[test]
    fn test_gated_stage_requires_gate() {
        let err = builder().standard_stages(factory()).unwrap().build().unwrap_err();
        match err {
            DeployflowError::Validation(e) => assert_eq!(e.stages, vec!["qa", "prod"]),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_missing_deployer_is_configuration_error() {
        let err = DeliveryPipelineBuilder::new(PipelineSettings::new("p", "0", "eu-west-1"))
            .with_configuration_source(Arc::new(InMemoryParameterStore::new()))
            .stage(DeploymentStage::new("dev", TargetsSource::Static(vec![]), factory()))
            .unwrap()
            .build()
            .unwrap_err();
        assert!(matches!(err, DeployflowError::Configuration(_)));
    }

    #[test]
    fn test_out_of_range_approval_timeout_rejected() {
        let mut settings = PipelineSettings::new("p", "0", "eu-west-1");
        settings.approval_timeout_seconds = 1e30;
        let err = DeliveryPipelineBuilder::new(settings)
            .with_configuration_source(Arc::new(InMemoryParameterStore::new()))
            .with_deployer(Arc::new(RecordingDeployer::new()))
            .stage(DeploymentStage::new("dev", TargetsSource::Static(vec![]), factory()))
            .unwrap()
            .build()
            .unwrap_err();
        assert!(matches!(err, DeployflowError::Configuration(_)));
    }

    #[test]
    fn test_trigger_paths_deduplicated() {
        let builder = builder().trigger_on_configuration_change(["/a", "/a", "/b"]);
        let pipeline = builder
            .stage(DeploymentStage::new("dev", TargetsSource::Static(vec![]), factory()))
            .unwrap()
            .build()
            .unwrap();
        assert_eq!(pipeline.trigger_paths(), ["/a", "/b"]);
    }
}
