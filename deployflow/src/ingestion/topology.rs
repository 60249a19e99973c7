//! Provisioning and teardown of an ingestion topology in one target.
//!
//! A topology is the local store, a durable queue subscribed to the
//! distributor's channel with an account/region filter, the copy worker, and
//! the one-shot backfill trigger. Provisioning order matters: the backfill
//! re-sends history through the channel, so the queue must be subscribed
//! before the backfill starts.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::{
    ArtifactConsumer, ArtifactFetcher, BackfillOutcome, BackfillTrigger, BatchReport,
    InMemoryObjectStore, InMemoryTriggerLedger, ObjectStore, OneShotRequest, RoleAssumer,
    ScopedRoleAssumer, TriggerLedger, TriggerVersion, WorkflowStarter,
};
use crate::config::{ConsumerSettings, QueueSettings};
use crate::core::DeploymentTarget;
use crate::errors::DeployflowError;
use crate::events::{EventSink, NoOpEventSink};
use crate::parameters::names::ARTIFACT_CONSUMER_BUCKET_NAME;
use crate::parameters::ParameterPublisher;
use crate::pipeline::{DeployableUnit, Deployer, FnStackFactory, StackFactory};
use crate::routing::{DurableQueue, NotificationChannel, NotificationFilterPolicy, SubscriptionId};

/// Stack name of the unit an ingestion topology is deployed as.
pub const STACK_NAME: &str = "cloud-artifact-consumer";

/// Bucket name a topology creates when no existing bucket is given.
#[must_use]
pub fn default_bucket_name(target: &DeploymentTarget) -> String {
    format!("tts-cloud-artifacts-{}-{}", target.account, target.region)
}

/// Declarative description of an ingestion topology.
///
/// Serialized as the properties of its deployable unit; `Version` is the
/// backfill trigger version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestionTopologySpec {
    /// Backfill trigger version.
    #[serde(rename = "Version")]
    pub version: TriggerVersion,
    /// Existing bucket to import instead of creating one.
    #[serde(rename = "ExistingBucket", default, skip_serializing_if = "Option::is_none")]
    pub existing_bucket: Option<String>,
    /// Queue settings.
    #[serde(rename = "Queue", default)]
    pub queue: QueueSettings,
    /// Backfill workflow identifier.
    #[serde(
        rename = "InitialDistributionWorkflow",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub initial_distribution_workflow: Option<String>,
    /// Role the backfill assumes.
    #[serde(rename = "InitialDistributionRole", default, skip_serializing_if = "Option::is_none")]
    pub initial_distribution_role: Option<String>,
    /// Region the backfill workflow runs in.
    #[serde(rename = "InitialDistributionRegion", default, skip_serializing_if = "Option::is_none")]
    pub initial_distribution_region: Option<String>,
}

impl IngestionTopologySpec {
    /// Creates settings with a fresh bucket and default queue settings.
    #[must_use]
    pub fn new(version: TriggerVersion) -> Self {
        Self {
            version,
            existing_bucket: None,
            queue: QueueSettings::default(),
            initial_distribution_workflow: None,
            initial_distribution_role: None,
            initial_distribution_region: None,
        }
    }

    /// Imports an existing bucket.
    #[must_use]
    pub fn with_existing_bucket(mut self, bucket: impl Into<String>) -> Self {
        self.existing_bucket = Some(bucket.into());
        self
    }

    /// Sets the queue settings.
    #[must_use]
    pub fn with_queue(mut self, queue: QueueSettings) -> Self {
        self.queue = queue;
        self
    }

    /// Enables the backfill.
    #[must_use]
    pub fn with_initial_distribution(
        mut self,
        workflow: impl Into<String>,
        role: impl Into<String>,
        region: impl Into<String>,
    ) -> Self {
        self.initial_distribution_workflow = Some(workflow.into());
        self.initial_distribution_role = Some(role.into());
        self.initial_distribution_region = Some(region.into());
        self
    }

    /// Renders these settings as unit properties.
    pub fn to_properties(&self) -> Result<serde_json::Value, DeployflowError> {
        Ok(serde_json::to_value(self)?)
    }

    /// Reads the settings back from unit properties.
    pub fn from_properties(properties: &serde_json::Value) -> Result<Self, DeployflowError> {
        Ok(serde_json::from_value(properties.clone())?)
    }
}

/// A stack factory deploying an ingestion topology with `spec` to each target.
#[must_use]
pub fn ingestion_stack_factory(spec: IngestionTopologySpec) -> Arc<dyn StackFactory> {
    Arc::new(FnStackFactory::new(move |stage: &str, target: &DeploymentTarget| {
        let unit = DeployableUnit::new(STACK_NAME, stage, target.clone());
        Ok(unit.with_properties(spec.to_properties()?))
    }))
}

/// Shared services every topology is provisioned against.
///
/// Several stages may deploy to the same target. They share the default
/// bucket, the published bucket parameter, and the backfill ledger entry of
/// that target, so those are only removed when the last topology using them
/// is released.
pub struct IngestionEnvironment {
    channel: Arc<NotificationChannel>,
    parameters: Arc<dyn ParameterPublisher>,
    fetcher: Arc<dyn ArtifactFetcher>,
    assumer: Arc<dyn RoleAssumer>,
    starter: Arc<dyn WorkflowStarter>,
    ledger: Arc<dyn TriggerLedger>,
    distributor_bucket: String,
    events: Arc<dyn EventSink>,
    buckets: DashMap<String, Arc<dyn ObjectStore>>,
    bucket_leases: DashMap<String, usize>,
    target_leases: DashMap<DeploymentTarget, usize>,
}

impl std::fmt::Debug for IngestionEnvironment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IngestionEnvironment")
            .field("channel", &self.channel.name())
            .field("distributor_bucket", &self.distributor_bucket)
            .field("buckets", &self.buckets.len())
            .finish_non_exhaustive()
    }
}

impl IngestionEnvironment {
    /// Creates an environment around the distributor's `channel`.
    #[must_use]
    pub fn new(
        channel: Arc<NotificationChannel>,
        parameters: Arc<dyn ParameterPublisher>,
        fetcher: Arc<dyn ArtifactFetcher>,
        assumer: Arc<dyn RoleAssumer>,
        starter: Arc<dyn WorkflowStarter>,
        distributor_bucket: impl Into<String>,
    ) -> Self {
        Self {
            channel,
            parameters,
            fetcher,
            assumer,
            starter,
            ledger: Arc::new(InMemoryTriggerLedger::new()),
            distributor_bucket: distributor_bucket.into(),
            events: Arc::new(NoOpEventSink),
            buckets: DashMap::new(),
            bucket_leases: DashMap::new(),
            target_leases: DashMap::new(),
        }
    }

    /// Sets the backfill ledger.
    #[must_use]
    pub fn with_ledger(mut self, ledger: Arc<dyn TriggerLedger>) -> Self {
        self.ledger = ledger;
        self
    }

    /// Sets the event sink.
    #[must_use]
    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Makes an existing bucket importable by name.
    pub fn register_bucket(&self, store: Arc<dyn ObjectStore>) {
        self.buckets.insert(store.bucket().to_string(), store);
    }

    /// Looks up a bucket by name.
    #[must_use]
    pub fn bucket(&self, name: &str) -> Option<Arc<dyn ObjectStore>> {
        self.buckets.get(name).map(|entry| entry.value().clone())
    }

    /// How many provisioned topologies live in `target`.
    #[must_use]
    pub fn topologies_in(&self, target: &DeploymentTarget) -> usize {
        self.target_leases.get(target).map_or(0, |count| *count)
    }
}

fn acquire_lease<K: Eq + Hash>(leases: &DashMap<K, usize>, key: K) {
    *leases.entry(key).or_insert(0) += 1;
}

/// Drops one lease on `key`; true when it was the last one.
fn release_lease<K: Eq + Hash>(leases: &DashMap<K, usize>, key: &K) -> bool {
    let remaining = match leases.get_mut(key) {
        Some(mut count) => {
            *count = count.saturating_sub(1);
            *count
        }
        None => 0,
    };
    if remaining == 0 {
        leases.remove_if(key, |_, count| *count == 0);
    }
    remaining == 0
}

fn consumer_settings(
    env: &IngestionEnvironment,
    bucket: &str,
    target: &DeploymentTarget,
    spec: &IngestionTopologySpec,
) -> ConsumerSettings {
    let settings = ConsumerSettings::new(
        bucket,
        env.distributor_bucket.as_str(),
        target.account.as_str(),
        target.region.as_str(),
    );
    match (
        &spec.initial_distribution_workflow,
        &spec.initial_distribution_role,
        &spec.initial_distribution_region,
    ) {
        (Some(workflow), Some(role), Some(region)) => {
            settings.with_initial_distribution(workflow, role, region)
        }
        _ => settings,
    }
}

/// Builds the backfill trigger for `settings`, if it names a distribution.
///
/// The trigger may only assume the configured distribution role.
fn backfill_trigger(
    env: &IngestionEnvironment,
    settings: &ConsumerSettings,
    queue: &Arc<DurableQueue>,
) -> Result<Option<BackfillTrigger>, DeployflowError> {
    let Some(role) = settings.initial_distribution_role.as_deref() else {
        return Ok(None);
    };
    let assumer: Arc<dyn RoleAssumer> = Arc::new(ScopedRoleAssumer::new(role, env.assumer.clone()));
    let trigger = BackfillTrigger::new(settings, queue, assumer, env.starter.clone())?
        .with_ledger(env.ledger.clone())
        .with_event_sink(env.events.clone());
    Ok(Some(trigger))
}

fn queue_settings_changed(current: &QueueSettings, next: &QueueSettings) -> bool {
    current.visibility_timeout_seconds != next.visibility_timeout_seconds
        || current.max_receive_count != next.max_receive_count
}

fn distribution_changed(current: &IngestionTopologySpec, next: &IngestionTopologySpec) -> bool {
    current.initial_distribution_workflow != next.initial_distribution_workflow
        || current.initial_distribution_role != next.initial_distribution_role
        || current.initial_distribution_region != next.initial_distribution_region
}

/// A provisioned ingestion topology.
pub struct IngestionTopology {
    stage: String,
    target: DeploymentTarget,
    spec: IngestionTopologySpec,
    store: Arc<dyn ObjectStore>,
    bucket_owned: bool,
    queue: Arc<DurableQueue>,
    consumer: Arc<ArtifactConsumer>,
    subscription: SubscriptionId,
    backfill: Option<BackfillTrigger>,
    last_backfill: Option<BackfillOutcome>,
}

impl std::fmt::Debug for IngestionTopology {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IngestionTopology")
            .field("stage", &self.stage)
            .field("target", &self.target)
            .field("bucket", &self.store.bucket())
            .field("bucket_owned", &self.bucket_owned)
            .field("queue", &self.queue.name())
            .field("subscription", &self.subscription)
            .finish_non_exhaustive()
    }
}

impl IngestionTopology {
    /// Provisions the topology `stage` deploys to `target`.
    ///
    /// Store, queue, worker, and subscription come first; the bucket name is
    /// published next; the backfill runs last. A failure after subscribing
    /// rolls the rest back.
    pub async fn provision(
        env: &IngestionEnvironment,
        stage: &str,
        target: &DeploymentTarget,
        spec: IngestionTopologySpec,
    ) -> Result<Self, DeployflowError> {
        let (store, bucket_owned) = match &spec.existing_bucket {
            Some(name) => {
                let store = env.bucket(name).ok_or_else(|| {
                    DeployflowError::Configuration(format!("existing bucket '{name}' not found"))
                })?;
                (store, false)
            }
            None => {
                let name = default_bucket_name(target);
                let store = env
                    .buckets
                    .entry(name.clone())
                    .or_insert_with(|| {
                        Arc::new(InMemoryObjectStore::new(name)) as Arc<dyn ObjectStore>
                    })
                    .value()
                    .clone();
                (store, true)
            }
        };

        let settings = consumer_settings(env, store.bucket(), target, &spec);
        let queue = Arc::new(DurableQueue::from_settings(
            format!("artifact-consumer-{stage}-{}-{}", target.account, target.region),
            &spec.queue,
        ));
        let consumer = Arc::new(
            ArtifactConsumer::new(&settings, store.clone(), env.fetcher.clone())?
                .with_event_sink(env.events.clone()),
        );

        if bucket_owned {
            acquire_lease(&env.bucket_leases, store.bucket().to_string());
        }
        acquire_lease(&env.target_leases, target.clone());
        let subscription = env.channel.subscribe(
            queue.clone(),
            NotificationFilterPolicy::for_consumer(target.account.as_str(), target.region.as_str()),
        );

        let mut topology = Self {
            stage: stage.to_string(),
            target: target.clone(),
            spec,
            store,
            bucket_owned,
            queue,
            consumer,
            subscription,
            backfill: None,
            last_backfill: None,
        };

        if let Err(e) = topology.publish_and_backfill(env, &settings).await {
            warn!(
                stage = %topology.stage,
                target = %topology.target,
                error = %e,
                "Provisioning failed; rolling back topology"
            );
            let (stage, target) = (topology.stage.clone(), topology.target.clone());
            if let Err(rollback) = topology.release(env).await {
                warn!(stage = %stage, target = %target, error = %rollback, "Rollback incomplete");
            }
            return Err(e);
        }

        info!(
            stage = %topology.stage,
            target = %topology.target,
            bucket = %topology.store.bucket(),
            queue = %topology.queue.name(),
            "Ingestion topology provisioned"
        );
        Ok(topology)
    }

    async fn publish_and_backfill(
        &mut self,
        env: &IngestionEnvironment,
        settings: &ConsumerSettings,
    ) -> Result<(), DeployflowError> {
        env.parameters
            .put_parameter(ARTIFACT_CONSUMER_BUCKET_NAME, &self.target.region, self.store.bucket())
            .await?;

        self.backfill = backfill_trigger(env, settings, &self.queue)?;
        match &self.backfill {
            Some(trigger) => {
                let outcome = trigger
                    .trigger_initial_backfill(OneShotRequest::Create, &self.spec.version)
                    .await?;
                self.last_backfill = Some(outcome);
            }
            None => {
                debug!(target = %self.target, "No initial distribution; backfill skipped");
            }
        }
        Ok(())
    }

    /// Applies a changed spec in place.
    ///
    /// Changed queue settings replace the queue and its subscription, moving
    /// pending messages across. A distribution that appears gets its trigger
    /// built and run; one that disappears is dropped. A new version re-runs
    /// the backfill once. Switching buckets is refused.
    pub async fn update(
        &mut self,
        env: &IngestionEnvironment,
        spec: IngestionTopologySpec,
    ) -> Result<Option<BackfillOutcome>, DeployflowError> {
        if spec.existing_bucket != self.spec.existing_bucket {
            return Err(DeployflowError::Configuration(format!(
                "topology of stage '{}' in {} cannot switch buckets in place; destroy it first",
                self.stage, self.target
            )));
        }

        let queue_changed = queue_settings_changed(&self.spec.queue, &spec.queue);
        if queue_changed {
            self.replace_queue(env, &spec.queue);
        }

        let mut request = OneShotRequest::Update;
        if queue_changed || distribution_changed(&self.spec, &spec) {
            let settings = consumer_settings(env, self.store.bucket(), &self.target, &spec);
            let replacement = backfill_trigger(env, &settings, &self.queue)?;
            match (self.backfill.take(), &replacement) {
                (None, Some(_)) => request = OneShotRequest::Create,
                (Some(previous), None) if env.topologies_in(&self.target) <= 1 => {
                    previous
                        .trigger_initial_backfill(OneShotRequest::Delete, &self.spec.version)
                        .await?;
                }
                _ => {}
            }
            self.backfill = replacement;
        }
        self.spec = spec;

        let Some(trigger) = &self.backfill else {
            return Ok(None);
        };
        let outcome = trigger
            .trigger_initial_backfill(request, &self.spec.version)
            .await?;
        self.last_backfill = Some(outcome.clone());
        Ok(Some(outcome))
    }

    fn replace_queue(&mut self, env: &IngestionEnvironment, settings: &QueueSettings) {
        let queue = Arc::new(DurableQueue::from_settings(self.queue.name(), settings));
        let subscription = env.channel.subscribe(
            queue.clone(),
            NotificationFilterPolicy::for_consumer(
                self.target.account.as_str(),
                self.target.region.as_str(),
            ),
        );
        env.channel.unsubscribe(self.subscription);
        let moved = self.queue.transfer_to(&queue);
        info!(
            stage = %self.stage,
            target = %self.target,
            queue = %queue.name(),
            moved,
            "Ingestion queue replaced"
        );
        self.queue = queue;
        self.subscription = subscription;
    }

    /// Tears the topology down. Returns how many objects were removed from
    /// an owned bucket; imported buckets are left untouched.
    pub async fn teardown(self, env: &IngestionEnvironment) -> Result<usize, DeployflowError> {
        if let Some(trigger) = &self.backfill {
            if env.topologies_in(&self.target) <= 1 {
                trigger
                    .trigger_initial_backfill(OneShotRequest::Delete, &self.spec.version)
                    .await?;
            }
        }
        let (stage, target) = (self.stage.clone(), self.target.clone());
        let removed = self.release(env).await?;
        info!(stage = %stage, target = %target, removed, "Ingestion topology torn down");
        Ok(removed)
    }

    /// Releases everything the topology holds, attempting every step even
    /// when an earlier one fails. The first failure is returned.
    async fn release(self, env: &IngestionEnvironment) -> Result<usize, DeployflowError> {
        env.channel.unsubscribe(self.subscription);
        let parameter = if release_lease(&env.target_leases, &self.target) {
            env.parameters
                .delete_parameter(ARTIFACT_CONSUMER_BUCKET_NAME, &self.target.region)
                .await
        } else {
            Ok(())
        };

        let bucket = self.store.bucket().to_string();
        let removed = if self.bucket_owned && release_lease(&env.bucket_leases, &bucket) {
            let removed = self.store.delete_all().await;
            if removed.is_ok() {
                env.buckets.remove(&bucket);
            }
            removed
        } else {
            Ok(0)
        };

        parameter?;
        removed
    }

    /// Processes one batch from the queue.
    pub async fn pump(&self) -> BatchReport {
        self.consumer.process_batch(&self.queue, self.spec.queue.batch_size).await
    }

    /// The stage that deployed this topology.
    #[must_use]
    pub fn stage(&self) -> &str {
        &self.stage
    }

    /// The target.
    #[must_use]
    pub fn target(&self) -> &DeploymentTarget {
        &self.target
    }

    /// The local store.
    #[must_use]
    pub fn store(&self) -> Arc<dyn ObjectStore> {
        self.store.clone()
    }

    /// The ingestion queue.
    #[must_use]
    pub fn queue(&self) -> Arc<DurableQueue> {
        self.queue.clone()
    }

    /// The copy worker.
    #[must_use]
    pub fn consumer(&self) -> Arc<ArtifactConsumer> {
        self.consumer.clone()
    }

    /// Whether the topology created its bucket.
    #[must_use]
    pub fn owns_bucket(&self) -> bool {
        self.bucket_owned
    }

    /// Whether a backfill trigger is configured.
    #[must_use]
    pub fn has_backfill(&self) -> bool {
        self.backfill.is_some()
    }

    /// The outcome of the most recent backfill request.
    #[must_use]
    pub fn last_backfill(&self) -> Option<&BackfillOutcome> {
        self.last_backfill.as_ref()
    }
}

type TopologyKey = (String, DeploymentTarget);

/// Deploys ingestion topologies as pipeline units.
///
/// Topologies are keyed by stage and target, so two stages deploying to the
/// same target each get their own queue and subscription.
#[derive(Debug)]
pub struct IngestionDeployer {
    env: Arc<IngestionEnvironment>,
    topologies: tokio::sync::Mutex<HashMap<TopologyKey, IngestionTopology>>,
}

impl IngestionDeployer {
    /// Creates a deployer over `env`.
    #[must_use]
    pub fn new(env: Arc<IngestionEnvironment>) -> Self {
        Self {
            env,
            topologies: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Stage and target of every provisioned topology, sorted.
    pub async fn deployed(&self) -> Vec<(String, DeploymentTarget)> {
        let mut keys: Vec<TopologyKey> = self.topologies.lock().await.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// The queue of the topology `stage` deployed to `target`.
    pub async fn queue(&self, stage: &str, target: &DeploymentTarget) -> Option<Arc<DurableQueue>> {
        self.topologies
            .lock()
            .await
            .get(&(stage.to_string(), target.clone()))
            .map(IngestionTopology::queue)
    }

    /// The store of the topology `stage` deployed to `target`.
    pub async fn store(
        &self,
        stage: &str,
        target: &DeploymentTarget,
    ) -> Option<Arc<dyn ObjectStore>> {
        self.topologies
            .lock()
            .await
            .get(&(stage.to_string(), target.clone()))
            .map(IngestionTopology::store)
    }

    /// The last backfill outcome of the topology `stage` deployed to `target`.
    pub async fn last_backfill(
        &self,
        stage: &str,
        target: &DeploymentTarget,
    ) -> Option<BackfillOutcome> {
        self.topologies
            .lock()
            .await
            .get(&(stage.to_string(), target.clone()))
            .and_then(|t| t.last_backfill().cloned())
    }

    /// Processes one batch in the topology `stage` deployed to `target`.
    pub async fn pump(&self, stage: &str, target: &DeploymentTarget) -> Option<BatchReport> {
        let topologies = self.topologies.lock().await;
        match topologies.get(&(stage.to_string(), target.clone())) {
            Some(topology) => Some(topology.pump().await),
            None => None,
        }
    }
}

#[async_trait]
impl Deployer for IngestionDeployer {
    async fn deploy(&self, unit: &DeployableUnit) -> Result<(), DeployflowError> {
        let spec = IngestionTopologySpec::from_properties(&unit.properties)?;
        let key = (unit.stage.clone(), unit.target.clone());
        let mut topologies = self.topologies.lock().await;

        if let Some(topology) = topologies.get_mut(&key) {
            topology.update(&self.env, spec).await?;
            return Ok(());
        }

        let topology = IngestionTopology::provision(&self.env, &unit.stage, &unit.target, spec)
            .await
            .map_err(|e| DeployflowError::deployment(&unit.stage, &unit.target, e.to_string()))?;
        topologies.insert(key, topology);
        Ok(())
    }

    async fn destroy(&self, unit: &DeployableUnit) -> Result<(), DeployflowError> {
        let key = (unit.stage.clone(), unit.target.clone());
        let topology = self.topologies.lock().await.remove(&key);
        match topology {
            Some(topology) => topology.teardown(&self.env).await.map(|_| ()),
            None => Ok(()),
        }
    }
}
