//! Delivery pipeline execution.
//!
//! A run synthesizes first: it reads the source connection, resolves every
//! stage's targets from live configuration, and builds the replication map.
//! Any lookup failure there aborts the run before anything deploys. Stages
//! then run strictly in order. Within a stage all targets deploy concurrently
//! and the stage completes when the whole wave has.

use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn, Instrument};
use uuid::Uuid;

use super::approval::{ApprovalGate, GatePlacement};
use super::deployer::Deployer;
use super::ledger::DefinitionLedger;
use super::replication::{build_cross_region_replication_targets, ReplicationMap};
use super::stage::{DeployableUnit, DeploymentStage};
use super::targets::resolve_stage_targets;
use super::triggers::{ConfigurationChangeTrigger, PipelineTrigger};
use crate::config::PipelineSettings;
use crate::core::{DeploymentTarget, RunStatus, StageStatus};
use crate::errors::DeployflowError;
use crate::events::EventSink;
use crate::observability::{RunSpanAttributes, SpanTimer};
use crate::parameters::names::CODESTAR_CONNECTION_ARN;
use crate::parameters::{ConfigurationSource, CrossRegionParameterReader};
use crate::utils::{fingerprint, generate_run_id};

/// Everything a run resolves before deploying.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SynthesisResult {
    /// Source-control connection identifier.
    pub connection_arn: String,
    /// Fingerprint of the pipeline definition.
    pub fingerprint: String,
    /// Resolved targets per stage, in stage order.
    pub stage_targets: Vec<(String, BTreeSet<DeploymentTarget>)>,
    /// Replication destinations for foreign regions.
    pub replication: ReplicationMap,
}

/// Outcome of one stage within a run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageReport {
    /// Stage name.
    pub name: String,
    /// Final status.
    pub status: StageStatus,
    /// Targets the stage resolved.
    pub targets: Vec<DeploymentTarget>,
    /// Targets whose units were destroyed because they are no longer resolved.
    pub destroyed: Vec<DeploymentTarget>,
    /// Failure or rejection reason.
    pub error: Option<String>,
    /// Wall time spent in the stage.
    pub duration_ms: f64,
}

impl StageReport {
    fn new(name: &str, targets: &BTreeSet<DeploymentTarget>) -> Self {
        Self {
            name: name.to_string(),
            status: StageStatus::Pending,
            targets: targets.iter().cloned().collect(),
            destroyed: Vec::new(),
            error: None,
            duration_ms: 0.0,
        }
    }

    fn finish(mut self, status: StageStatus, error: Option<String>, timer: SpanTimer) -> Self {
        self.status = status;
        self.error = error;
        self.duration_ms = timer.finish();
        self
    }
}

/// Outcome of one pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunReport {
    /// Run identifier.
    pub run_id: Uuid,
    /// What started the run.
    pub trigger: PipelineTrigger,
    /// Overall status.
    pub status: RunStatus,
    /// Whether the pipeline definition changed since the previous run.
    pub self_mutated: bool,
    /// The synthesis the run deployed from.
    pub synthesis: SynthesisResult,
    /// Per-stage outcomes, in stage order.
    pub stages: Vec<StageReport>,
    /// When the run started.
    pub started_at: DateTime<Utc>,
    /// When the run finished.
    pub finished_at: DateTime<Utc>,
}

impl RunReport {
    /// Returns the report for `stage`.
    #[must_use]
    pub fn stage(&self, name: &str) -> Option<&StageReport> {
        self.stages.iter().find(|s| s.name == name)
    }
}

#[derive(Debug, Default)]
struct PipelineState {
    deployed: HashMap<String, BTreeMap<DeploymentTarget, DeployableUnit>>,
}

/// A validated multi-stage delivery pipeline.
pub struct DeliveryPipeline {
    settings: PipelineSettings,
    stages: Vec<DeploymentStage>,
    trigger_paths: Vec<String>,
    source: Arc<dyn ConfigurationSource>,
    reader: CrossRegionParameterReader,
    deployer: Arc<dyn Deployer>,
    approvals: Arc<dyn ApprovalGate>,
    ledger: Arc<dyn DefinitionLedger>,
    events: Arc<dyn EventSink>,
    state: Mutex<PipelineState>,
    run_lock: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for DeliveryPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryPipeline")
            .field("settings", &self.settings)
            .field("stages", &self.stages)
            .field("trigger_paths", &self.trigger_paths)
            .finish_non_exhaustive()
    }
}

impl DeliveryPipeline {
    pub(super) fn assemble(
        settings: PipelineSettings,
        stages: Vec<DeploymentStage>,
        trigger_paths: Vec<String>,
        source: Arc<dyn ConfigurationSource>,
        deployer: Arc<dyn Deployer>,
        approvals: Arc<dyn ApprovalGate>,
        ledger: Arc<dyn DefinitionLedger>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            settings,
            stages,
            trigger_paths,
            reader: CrossRegionParameterReader::new(source.clone()),
            source,
            deployer,
            approvals,
            ledger,
            events,
            state: Mutex::new(PipelineState::default()),
            run_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// The pipeline settings.
    #[must_use]
    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    /// The stages, in run order.
    #[must_use]
    pub fn stages(&self) -> &[DeploymentStage] {
        &self.stages
    }

    /// Parameter paths whose changes re-trigger the pipeline.
    #[must_use]
    pub fn trigger_paths(&self) -> &[String] {
        &self.trigger_paths
    }

    /// Targets `stage` currently has units deployed to.
    #[must_use]
    pub fn deployed_targets(&self, stage: &str) -> BTreeSet<DeploymentTarget> {
        self.state
            .lock()
            .deployed
            .get(stage)
            .map(|units| units.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// A watcher over the trigger paths, or `None` if there are none.
    #[must_use]
    pub fn configuration_trigger(&self) -> Option<ConfigurationChangeTrigger> {
        if self.trigger_paths.is_empty() {
            return None;
        }
        Some(ConfigurationChangeTrigger::new(
            self.trigger_paths.clone(),
            self.settings.home_region.clone(),
            self.source.clone(),
        ))
    }

    /// Fingerprint of the definition: name, home region, gate placement,
    /// stages in order, and trigger paths.
    #[must_use]
    pub fn definition_fingerprint(&self) -> String {
        let mut components = vec![
            self.settings.name.clone(),
            self.settings.home_region.clone(),
            format!("{:?}", self.settings.gate_placement),
        ];
        for stage in &self.stages {
            components.extend(stage.fingerprint_components());
        }
        components.extend(self.trigger_paths.iter().cloned());
        fingerprint(components)
    }

    /// Resolves everything a run needs, from live configuration.
    ///
    /// # Errors
    ///
    /// Any lookup failure is returned unchanged and is fatal for the run.
    pub async fn synthesize(&self) -> Result<SynthesisResult, DeployflowError> {
        let home_region = self.settings.home_region.as_str();
        let connection = self.reader.read(CODESTAR_CONNECTION_ARN, home_region).await?;

        let mut stage_targets = Vec::with_capacity(self.stages.len());
        for stage in &self.stages {
            let targets = resolve_stage_targets(stage, self.source.as_ref(), home_region).await?;
            stage_targets.push((stage.name.clone(), targets));
        }

        let replication = build_cross_region_replication_targets(
            stage_targets.iter().flat_map(|(_, targets)| targets.iter()),
            home_region,
            &self.reader,
        )
        .await?;

        Ok(SynthesisResult {
            connection_arn: connection.value,
            fingerprint: self.definition_fingerprint(),
            stage_targets,
            replication,
        })
    }

    /// Runs the pipeline once. Runs never overlap.
    ///
    /// # Errors
    ///
    /// Returns an error only when synthesis fails. Deployment failures and
    /// rejected gates are reported in the [`RunReport`].
    pub async fn run(&self, trigger: PipelineTrigger) -> Result<RunReport, DeployflowError> {
        let _serial = self.run_lock.lock().await;
        let run_id = generate_run_id();
        let attributes = RunSpanAttributes::new(&self.settings.name, run_id)
            .with_trigger(trigger.label())
            .with_home_region(&self.settings.home_region)
            .with_stage_count(self.stages.len());

        self.run_inner(run_id, trigger, &attributes)
            .instrument(attributes.span())
            .await
    }

    async fn run_inner(
        &self,
        run_id: Uuid,
        trigger: PipelineTrigger,
        attributes: &RunSpanAttributes,
    ) -> Result<RunReport, DeployflowError> {
        let started_at = Utc::now();
        info!(trigger = trigger.label(), "Pipeline run started");
        self.events
            .emit("pipeline.run.started", Some(serde_json::to_value(attributes.to_attributes())?))
            .await;

        let synthesis = match self.synthesize().await {
            Ok(synthesis) => synthesis,
            Err(e) => {
                warn!(error = %e, "Synthesis failed");
                self.events
                    .emit(
                        "pipeline.run.failed",
                        Some(serde_json::json!({
                            "run_id": run_id.to_string(),
                            "code": e.code(),
                            "error": e.to_string(),
                        })),
                    )
                    .await;
                return Err(e);
            }
        };

        // A first run has nothing to compare against and never counts.
        let self_mutated = self
            .ledger
            .last_fingerprint(&self.settings.name)
            .await
            .is_some_and(|previous| previous != synthesis.fingerprint);
        self.ledger
            .record_fingerprint(&self.settings.name, &synthesis.fingerprint)
            .await;

        if self_mutated {
            info!(
                fingerprint = %synthesis.fingerprint,
                "Pipeline definition changed; updated before running stages"
            );
            self.events
                .emit(
                    "pipeline.self_mutated",
                    Some(serde_json::json!({"fingerprint": synthesis.fingerprint})),
                )
                .await;
        }

        let mut status = RunStatus::Succeeded;
        let mut stages = Vec::with_capacity(self.stages.len());
        for (stage, (_, targets)) in self.stages.iter().zip(&synthesis.stage_targets) {
            if status != RunStatus::Succeeded {
                let timer = SpanTimer::start(&stage.name);
                let skipped = StageReport::new(&stage.name, targets);
                stages.push(skipped.finish(StageStatus::Skipped, None, timer));
                continue;
            }

            let report = self.run_stage(stage, targets).await;
            match report.status {
                StageStatus::Failed => status = RunStatus::Failed,
                StageStatus::Rejected => status = RunStatus::Halted,
                _ => {}
            }
            stages.push(report);
        }

        info!(status = %status, "Pipeline run finished");
        self.events
            .emit(
                "pipeline.run.completed",
                Some(serde_json::json!({"run_id": run_id.to_string(), "status": status})),
            )
            .await;

        Ok(RunReport {
            run_id,
            trigger,
            status,
            self_mutated,
            synthesis,
            stages,
            started_at,
            finished_at: Utc::now(),
        })
    }

    async fn run_stage(
        &self,
        stage: &DeploymentStage,
        targets: &BTreeSet<DeploymentTarget>,
    ) -> StageReport {
        let timer = SpanTimer::start(&stage.name);
        let mut report = StageReport::new(&stage.name, targets);
        let gated = stage.require_manual_approval;

        if gated && self.settings.gate_placement == GatePlacement::BeforeDeploy {
            if let Err(e) = self.await_gate(stage, targets).await {
                return report.finish(StageStatus::Rejected, Some(e.to_string()), timer);
            }
        }

        let units: Result<Vec<DeployableUnit>, DeployflowError> = targets
            .iter()
            .map(|target| stage.stack_factory.create(&stage.name, target))
            .collect();
        let units = match units {
            Ok(units) => units,
            Err(e) => return report.finish(StageStatus::Failed, Some(e.to_string()), timer),
        };

        self.events.try_emit(
            "stage.deploy.started",
            Some(serde_json::json!({"stage": stage.name, "targets": units.len()})),
        );
        let results = join_all(units.iter().map(|unit| self.deployer.deploy(unit))).await;

        let mut failures = Vec::new();
        {
            let mut state = self.state.lock();
            let deployed = state.deployed.entry(stage.name.clone()).or_default();
            for (unit, result) in units.iter().zip(results) {
                match result {
                    Ok(()) => {
                        deployed.insert(unit.target.clone(), unit.clone());
                    }
                    Err(e) => failures.push(format!("{}: {e}", unit.target)),
                }
            }
        }

        if !failures.is_empty() {
            warn!(stage = %stage.name, failures = ?failures, "Stage deployment failed");
            self.events.try_emit(
                "stage.deploy.failed",
                Some(serde_json::json!({"stage": stage.name, "failures": failures})),
            );
            return report.finish(StageStatus::Failed, Some(failures.join("; ")), timer);
        }

        report.destroyed = self.clean_up_removed_targets(stage, targets).await;

        if gated && self.settings.gate_placement == GatePlacement::AfterDeploy {
            if let Err(e) = self.await_gate(stage, targets).await {
                return report.finish(StageStatus::Rejected, Some(e.to_string()), timer);
            }
        }

        self.events.try_emit(
            "stage.deploy.completed",
            Some(serde_json::json!({"stage": stage.name, "targets": report.targets.len()})),
        );
        report.finish(StageStatus::Succeeded, None, timer)
    }

    async fn await_gate(
        &self,
        stage: &DeploymentStage,
        targets: &BTreeSet<DeploymentTarget>,
    ) -> Result<(), DeployflowError> {
        let timeout = self.settings.approval_timeout()?;
        let summary = format!("Deploy stage '{}' to {} target(s)", stage.name, targets.len());
        self.events.try_emit(
            "stage.approval.requested",
            Some(serde_json::json!({"stage": stage.name, "summary": summary})),
        );

        let outcome = self
            .approvals
            .request_approval(&stage.name, &summary, timeout)
            .await;

        let event = if outcome.is_ok() {
            "stage.approval.granted"
        } else {
            "stage.approval.rejected"
        };
        self.events.try_emit(event, Some(serde_json::json!({"stage": stage.name})));
        outcome
    }

    /// Destroys units of `stage` whose targets were not resolved this run.
    ///
    /// A failed destroy is kept and retried on the next run.
    async fn clean_up_removed_targets(
        &self,
        stage: &DeploymentStage,
        targets: &BTreeSet<DeploymentTarget>,
    ) -> Vec<DeploymentTarget> {
        let stale: Vec<DeployableUnit> = {
            let state = self.state.lock();
            state
                .deployed
                .get(&stage.name)
                .map(|units| {
                    units
                        .iter()
                        .filter(|(target, _)| !targets.contains(*target))
                        .map(|(_, unit)| unit.clone())
                        .collect()
                })
                .unwrap_or_default()
        };

        let mut destroyed = Vec::new();
        for unit in stale {
            match self.deployer.destroy(&unit).await {
                Ok(()) => {
                    debug!(
                        stage = %stage.name,
                        target = %unit.target,
                        "Destroyed unit for removed target"
                    );
                    if let Some(units) = self.state.lock().deployed.get_mut(&stage.name) {
                        units.remove(&unit.target);
                    }
                    self.events.try_emit(
                        "stage.cleanup.destroyed",
                        Some(serde_json::json!({"stage": stage.name, "target": unit.target})),
                    );
                    destroyed.push(unit.target);
                }
                Err(e) => {
                    warn!(stage = %stage.name, target = %unit.target, error = %e, "Cleanup failed");
                }
            }
        }
        destroyed
    }

    /// Runs the pipeline once per trigger received, until the channel closes.
    pub async fn serve(
        &self,
        mut triggers: mpsc::Receiver<PipelineTrigger>,
    ) -> Vec<Result<RunReport, DeployflowError>> {
        let mut outcomes = Vec::new();
        while let Some(trigger) = triggers.recv().await {
            let outcome = self.run(trigger).await;
            if let Err(ref e) = outcome {
                warn!(error = %e, "Triggered run failed");
            }
            outcomes.push(outcome);
        }
        outcomes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::CollectingEventSink;
    use crate::parameters::names::{deployment_targets_path, SUPPORT_BUCKET_NAME, SUPPORT_KEY_ARN};
    use crate::parameters::InMemoryParameterStore;
    use crate::pipeline::{
        ApprovalDecision, DeliveryPipelineBuilder, FnStackFactory, InMemoryDefinitionLedger,
        StackFactory, TargetsSource,
    };
    use crate::testing::{targets_json, RecordingDeployer, ScriptedApprovals};
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    const HOME: &str = "eu-west-1";
    const DOMAIN: &str = "customer-platform";

    fn factory() -> Arc<dyn StackFactory> {
        Arc::new(FnStackFactory::new(|stage: &str, target: &DeploymentTarget| {
            Ok(DeployableUnit::new(format!("{stage}-app"), stage, target.clone()))
        }))
    }

    fn store() -> Arc<InMemoryParameterStore> {
        let store = InMemoryParameterStore::new()
            .with_parameter(CODESTAR_CONNECTION_ARN, HOME, "arn:codestar:connection/abc")
            .with_parameter(
                &deployment_targets_path(DOMAIN, "dev"),
                HOME,
                &targets_json(&[("111", HOME)]),
            )
            .with_parameter(
                &deployment_targets_path(DOMAIN, "qa"),
                HOME,
                &targets_json(&[("222", HOME), ("222", "us-east-1")]),
            )
            .with_parameter(
                &deployment_targets_path(DOMAIN, "prod"),
                HOME,
                &targets_json(&[("333", "us-east-1"), ("333", "eu-central-1")]),
            );
        for region in ["us-east-1", "eu-central-1"] {
            store.set(SUPPORT_BUCKET_NAME, region, &format!("support-{region}"));
            store.set(SUPPORT_KEY_ARN, region, &format!("key-{region}"));
        }
        Arc::new(store)
    }

    fn pipeline(
        store: Arc<InMemoryParameterStore>,
        deployer: Arc<RecordingDeployer>,
        approvals: Arc<ScriptedApprovals>,
        placement: GatePlacement,
    ) -> DeliveryPipeline {
        let settings =
            PipelineSettings::new("platform", "000000000000", HOME).with_gate_placement(placement);
        DeliveryPipelineBuilder::new(settings)
            .standard_stages(factory())
            .unwrap()
            .with_configuration_source(store)
            .with_deployer(deployer)
            .with_approvals(approvals)
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_stages_run_in_order_with_gates() {
        let deployer = Arc::new(RecordingDeployer::new());
        let approvals = Arc::new(ScriptedApprovals::approve_all());
        let pipeline = pipeline(
            store(),
            deployer.clone(),
            approvals.clone(),
            GatePlacement::BeforeDeploy,
        );

        let report = pipeline.run(PipelineTrigger::Manual).await.unwrap();

        assert_eq!(report.status, RunStatus::Succeeded);
        let names: Vec<&str> = report.stages.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["dev", "qa", "prod"]);
        assert_eq!(approvals.requested(), vec!["qa", "prod"]);
        assert_eq!(deployer.deployed_stages(), vec!["dev", "qa", "qa", "prod", "prod"]);
        assert_eq!(report.synthesis.connection_arn, "arn:codestar:connection/abc");
        assert_eq!(
            report.synthesis.replication.keys().collect::<Vec<_>>(),
            vec!["eu-central-1", "us-east-1"]
        );
    }

    #[tokio::test]
    async fn test_rejection_halts_without_rollback() {
        let deployer = Arc::new(RecordingDeployer::new());
        let approvals = Arc::new(
            ScriptedApprovals::approve_all().with_decision("prod", ApprovalDecision::Rejected),
        );
        let pipeline = pipeline(store(), deployer.clone(), approvals, GatePlacement::BeforeDeploy);

        let report = pipeline.run(PipelineTrigger::Manual).await.unwrap();

        assert_eq!(report.status, RunStatus::Halted);
        assert_eq!(report.stage("prod").unwrap().status, StageStatus::Rejected);
        assert_eq!(report.stage("qa").unwrap().status, StageStatus::Succeeded);
        assert_eq!(deployer.deployed_stages(), vec!["dev", "qa", "qa"]);
        assert!(deployer.destroyed().is_empty());
    }

    #[tokio::test]
    async fn test_after_deploy_gate_blocks_following_stages() {
        let deployer = Arc::new(RecordingDeployer::new());
        let approvals = Arc::new(
            ScriptedApprovals::approve_all().with_decision("qa", ApprovalDecision::Rejected),
        );
        let pipeline = pipeline(store(), deployer.clone(), approvals, GatePlacement::AfterDeploy);

        let report = pipeline.run(PipelineTrigger::Manual).await.unwrap();

        assert_eq!(report.stage("qa").unwrap().status, StageStatus::Rejected);
        assert_eq!(report.stage("prod").unwrap().status, StageStatus::Skipped);
        assert_eq!(deployer.deployed_stages(), vec!["dev", "qa", "qa"]);
    }

    #[tokio::test]
    async fn test_failed_target_fails_run() {
        let deployer = Arc::new(
            RecordingDeployer::new().failing_for(DeploymentTarget::new("222", "us-east-1")),
        );
        let pipeline = pipeline(
            store(),
            deployer.clone(),
            Arc::new(ScriptedApprovals::approve_all()),
            GatePlacement::BeforeDeploy,
        );

        let report = pipeline.run(PipelineTrigger::Manual).await.unwrap();

        assert_eq!(report.status, RunStatus::Failed);
        let qa = report.stage("qa").unwrap();
        assert_eq!(qa.status, StageStatus::Failed);
        assert!(qa.error.as_deref().unwrap().contains("222/us-east-1"));
        assert_eq!(report.stage("prod").unwrap().status, StageStatus::Skipped);
    }

    #[tokio::test]
    async fn test_missing_connection_is_fatal() {
        let store = Arc::new(InMemoryParameterStore::new());
        let deployer = Arc::new(RecordingDeployer::new());
        let pipeline = pipeline(
            store,
            deployer.clone(),
            Arc::new(ScriptedApprovals::approve_all()),
            GatePlacement::BeforeDeploy,
        );

        let err = pipeline.run(PipelineTrigger::Manual).await.unwrap_err();
        assert!(matches!(err, DeployflowError::Lookup(_)));
        assert!(deployer.deployed_stages().is_empty());
    }

    #[tokio::test]
    async fn test_missing_replication_parameter_aborts_before_deploying() {
        let store = store();
        store.set(
            &deployment_targets_path(DOMAIN, "prod"),
            HOME,
            &targets_json(&[("333", "ap-southeast-2")]),
        );
        let deployer = Arc::new(RecordingDeployer::new());
        let pipeline = pipeline(
            store,
            deployer.clone(),
            Arc::new(ScriptedApprovals::approve_all()),
            GatePlacement::BeforeDeploy,
        );

        assert!(pipeline.run(PipelineTrigger::Manual).await.is_err());
        assert!(deployer.deployed_stages().is_empty());
    }

    #[tokio::test]
    async fn test_removed_targets_are_destroyed() {
        let store = store();
        let deployer = Arc::new(RecordingDeployer::new());
        let pipeline = pipeline(
            store.clone(),
            deployer.clone(),
            Arc::new(ScriptedApprovals::approve_all()),
            GatePlacement::BeforeDeploy,
        );
        pipeline.run(PipelineTrigger::Manual).await.unwrap();

        store.set(&deployment_targets_path(DOMAIN, "qa"), HOME, &targets_json(&[("222", HOME)]));
        let report = pipeline
            .run(PipelineTrigger::ConfigurationChange {
                paths: vec![deployment_targets_path(DOMAIN, "qa")],
            })
            .await
            .unwrap();

        assert_eq!(
            report.stage("qa").unwrap().destroyed,
            vec![DeploymentTarget::new("222", "us-east-1")]
        );
        assert_eq!(deployer.destroyed(), vec![DeploymentTarget::new("222", "us-east-1")]);
        assert_eq!(pipeline.deployed_targets("qa").len(), 1);
    }

    #[tokio::test]
    async fn test_self_mutation_detected_on_definition_change() {
        let store = store();
        let deployer = Arc::new(RecordingDeployer::new());
        let approvals = Arc::new(ScriptedApprovals::approve_all());
        let first = pipeline(
            store.clone(),
            deployer.clone(),
            approvals.clone(),
            GatePlacement::BeforeDeploy,
        );

        let report = first.run(PipelineTrigger::Manual).await.unwrap();
        assert!(!report.self_mutated);
        let report = first.run(PipelineTrigger::Manual).await.unwrap();
        assert!(!report.self_mutated);

        let before = first.definition_fingerprint();
        let moved = pipeline(store, deployer, approvals, GatePlacement::AfterDeploy);
        assert_ne!(before, moved.definition_fingerprint());
    }

    #[tokio::test]
    async fn test_rebuilt_pipeline_detects_changed_definition() {
        let ledger = Arc::new(InMemoryDefinitionLedger::new());
        let deployer = Arc::new(RecordingDeployer::new());
        let dev = DeploymentStage::new(
            "dev",
            TargetsSource::Static(vec![DeploymentTarget::new("1", HOME)]),
            factory(),
        );
        let build = |stages: Vec<DeploymentStage>| {
            let mut builder = DeliveryPipelineBuilder::new(PipelineSettings::new("p", "0", HOME))
                .with_configuration_source(store())
                .with_deployer(deployer.clone())
                .with_definition_ledger(ledger.clone());
            for stage in stages {
                builder = builder.stage(stage).unwrap();
            }
            builder.build().unwrap()
        };

        let v1 = build(vec![dev.clone()]);
        assert!(!v1.run(PipelineTrigger::Manual).await.unwrap().self_mutated);
        let again = build(vec![dev.clone()]);
        assert!(!again.run(PipelineTrigger::Manual).await.unwrap().self_mutated);

        let qa = DeploymentStage::new(
            "qa",
            TargetsSource::Static(vec![DeploymentTarget::new("2", HOME)]),
            factory(),
        );
        let v2 = build(vec![dev, qa]);
        let report = v2.run(PipelineTrigger::Manual).await.unwrap();

        assert!(report.self_mutated);
        assert_eq!(report.status, RunStatus::Succeeded);
        let names: Vec<&str> = report.stages.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["dev", "qa"]);
        assert_eq!(deployer.deployed_stages(), vec!["dev", "dev", "dev", "qa"]);
    }

    #[tokio::test]
    async fn test_approval_timeout_halts_run() {
        let deployer = Arc::new(RecordingDeployer::new());
        let approvals = Arc::new(ScriptedApprovals::approve_all().with_timeout("qa"));
        let events = Arc::new(CollectingEventSink::new());
        let pipeline = DeliveryPipelineBuilder::new(PipelineSettings::new("platform", "0", HOME))
            .standard_stages(factory())
            .unwrap()
            .with_configuration_source(store())
            .with_deployer(deployer.clone())
            .with_approvals(approvals)
            .with_event_sink(events.clone())
            .build()
            .unwrap();

        let report = pipeline.run(PipelineTrigger::Manual).await.unwrap();

        assert_eq!(report.status, RunStatus::Halted);
        let qa = report.stage("qa").unwrap();
        assert_eq!(qa.status, StageStatus::Rejected);
        assert!(qa.error.as_deref().unwrap().contains("Approval timeout"));
        assert_eq!(report.stage("prod").unwrap().status, StageStatus::Skipped);
        assert_eq!(deployer.deployed_stages(), vec!["dev"]);
        assert_eq!(events.events_of_type("stage.approval.rejected").len(), 1);
    }

    #[tokio::test]
    async fn test_serve_runs_each_trigger() {
        let events = Arc::new(CollectingEventSink::new());
        let deployer = Arc::new(RecordingDeployer::new());
        let pipeline = DeliveryPipelineBuilder::new(PipelineSettings::new("p", "0", HOME))
            .stage(DeploymentStage::new(
                "dev",
                TargetsSource::Static(vec![DeploymentTarget::new("1", HOME)]),
                factory(),
            ))
            .unwrap()
            .with_configuration_source(store())
            .with_deployer(deployer.clone())
            .with_event_sink(events.clone())
            .build()
            .unwrap();

        let (tx, rx) = mpsc::channel(4);
        tx.send(PipelineTrigger::SourceChange { revision: "a1".into() }).await.unwrap();
        tx.send(PipelineTrigger::Manual).await.unwrap();
        drop(tx);

        let outcomes = tokio::time::timeout(Duration::from_secs(5), pipeline.serve(rx))
            .await
            .unwrap();
        assert_eq!(outcomes.len(), 2);
        assert!(outcomes.iter().all(Result::is_ok));
        assert_eq!(deployer.deployed_stages(), vec!["dev", "dev"]);
        assert_eq!(events.events_of_type("pipeline.run.completed").len(), 2);
    }
}
