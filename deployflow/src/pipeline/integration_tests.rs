//! End-to-end tests: a delivery pipeline provisioning ingestion topologies.

#[cfg(test)]
mod tests {
    use crate::config::PipelineSettings;
    use crate::core::{DeploymentTarget, RunStatus, StageStatus};
    use crate::events::CollectingEventSink;
    use crate::ingestion::{
        ingestion_stack_factory, BackfillOutcome, IngestionDeployer, IngestionEnvironment,
        IngestionTopologySpec, TriggerVersion,
    };
    use crate::parameters::names::{
        deployment_targets_path, ARTIFACT_CONSUMER_BUCKET_NAME, CODESTAR_CONNECTION_ARN,
        SUPPORT_BUCKET_NAME, SUPPORT_KEY_ARN,
    };
    use crate::parameters::InMemoryParameterStore;
    use crate::pipeline::{DeliveryPipeline, DeliveryPipelineBuilder, PipelineTrigger};
    use crate::routing::{ArtifactNotification, NotificationChannel, NotificationMessage, ALL};
    use crate::testing::{
        assert_stage_statuses, fixed_credentials, targets_json, RecordingWorkflowStarter,
        ScriptedApprovals, StaticFetcher, StaticRoleAssumer,
    };
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    const HOME: &str = "eu-west-1";
    const DOMAIN: &str = "customer-platform";
    const ARTIFACT_URL: &str = "https://distributor.example.com/templates/main.yaml?sig=1";
    const TEMPLATE: &[u8] = b"AWSTemplateFormatVersion: '2010-09-09'\nBucket: distributor-bucket\n";

    struct World {
        channel: Arc<NotificationChannel>,
        parameters: Arc<InMemoryParameterStore>,
        starter: Arc<RecordingWorkflowStarter>,
        deployer: Arc<IngestionDeployer>,
        approvals: Arc<ScriptedApprovals>,
        events: Arc<CollectingEventSink>,
    }

    fn world() -> World {
        let channel = Arc::new(NotificationChannel::new("artifact-distribution"));
        let parameters = Arc::new(
            InMemoryParameterStore::new()
                .with_parameter(CODESTAR_CONNECTION_ARN, HOME, "arn:codestar:connection/main")
                .with_parameter(
                    &deployment_targets_path(DOMAIN, "dev"),
                    HOME,
                    &targets_json(&[("111111111111", HOME)]),
                )
                .with_parameter(
                    &deployment_targets_path(DOMAIN, "qa"),
                    HOME,
                    &targets_json(&[("222222222222", HOME), ("222222222222", "us-east-1")]),
                )
                .with_parameter(
                    &deployment_targets_path(DOMAIN, "prod"),
                    HOME,
                    &targets_json(&[("333333333333", "us-east-1")]),
                ),
        );
        parameters.set(SUPPORT_BUCKET_NAME, "us-east-1", "support-us-east-1");
        parameters.set(SUPPORT_KEY_ARN, "us-east-1", "arn:kms:us-east-1:key/1");

        let starter = Arc::new(RecordingWorkflowStarter::new());
        let fetcher = StaticFetcher::new().with_body(ARTIFACT_URL, TEMPLATE);
        let env = IngestionEnvironment::new(
            channel.clone(),
            parameters.clone(),
            Arc::new(fetcher),
            Arc::new(StaticRoleAssumer::new(fixed_credentials())),
            starter.clone(),
            "distributor-bucket",
        );

        World {
            channel,
            parameters,
            starter,
            deployer: Arc::new(IngestionDeployer::new(Arc::new(env))),
            approvals: Arc::new(ScriptedApprovals::approve_all()),
            events: Arc::new(CollectingEventSink::new()),
        }
    }

    fn pipeline(world: &World, version: &str) -> DeliveryPipeline {
        let spec = IngestionTopologySpec::new(TriggerVersion::new(version))
            .with_initial_distribution(
                "arn:aws:states:eu-west-1:529985782713:stateMachine:initial-distribution",
                "arn:aws:iam::529985782713:role/initial-distribution",
                HOME,
            );
        let settings = PipelineSettings::new("artifact-consumer", "000000000000", HOME);
        DeliveryPipelineBuilder::new(settings)
            .standard_stages(ingestion_stack_factory(spec))
            .unwrap()
            .with_configuration_source(world.parameters.clone())
            .with_deployer(world.deployer.clone())
            .with_approvals(world.approvals.clone())
            .with_event_sink(world.events.clone())
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_pipeline_provisions_consumers_in_stage_order() {
        let world = world();
        let report = pipeline(&world, "1").run(PipelineTrigger::Manual).await.unwrap();

        assert_eq!(report.status, RunStatus::Succeeded);
        assert_stage_statuses(
            &report,
            &[
                ("dev", StageStatus::Succeeded),
                ("qa", StageStatus::Succeeded),
                ("prod", StageStatus::Succeeded),
            ],
        );
        assert_eq!(world.approvals.requested(), vec!["qa", "prod"]);
        assert_eq!(world.deployer.deployed().await.len(), 4);
        assert_eq!(world.channel.subscription_count(), 4);
        assert_eq!(world.starter.starts().len(), 4);
        assert_eq!(
            world.parameters.peek(ARTIFACT_CONSUMER_BUCKET_NAME, "us-east-1"),
            Some("tts-cloud-artifacts-333333333333-us-east-1".to_string())
        );
    }

    #[tokio::test]
    async fn test_replication_targets_are_deduplicated_per_region() {
        let world = world();
        let report = pipeline(&world, "1").run(PipelineTrigger::Manual).await.unwrap();

        // qa and prod both reach us-east-1; the home region never replicates.
        let regions: Vec<&String> = report.synthesis.replication.keys().collect();
        assert_eq!(regions, vec!["us-east-1"]);
        assert_eq!(report.synthesis.replication["us-east-1"].bucket_name, "support-us-east-1");
    }

    #[tokio::test]
    async fn test_backfill_runs_once_per_version() {
        let world = world();
        pipeline(&world, "1").run(PipelineTrigger::Manual).await.unwrap();
        pipeline(&world, "1").run(PipelineTrigger::Manual).await.unwrap();
        assert_eq!(world.starter.starts().len(), 4);

        let dev = DeploymentTarget::new("111111111111", HOME);
        assert!(matches!(
            world.deployer.last_backfill("dev", &dev).await,
            Some(BackfillOutcome::Unchanged(_))
        ));

        pipeline(&world, "2").run(PipelineTrigger::Manual).await.unwrap();
        assert_eq!(world.starter.starts().len(), 8);
    }

    #[tokio::test]
    async fn test_broadcast_artifact_reaches_every_consumer() {
        let world = world();
        pipeline(&world, "1").run(PipelineTrigger::Manual).await.unwrap();

        let artifact = ArtifactNotification::new(ARTIFACT_URL, "templates/main.yaml");
        let message = NotificationMessage::for_artifact(ALL, ALL, &artifact).unwrap();
        assert_eq!(world.channel.publish(&message), 4);

        for (stage, target) in world.deployer.deployed().await {
            let batch = world.deployer.pump(&stage, &target).await.unwrap();
            assert_eq!(batch.copied, vec!["templates/main.yaml".to_string()]);

            let store = world.deployer.store(&stage, &target).await.unwrap();
            let body = store.get_object("templates/main.yaml").await.unwrap();
            let expected = format!(
                "AWSTemplateFormatVersion: '2010-09-09'\nBucket: {}\n",
                store.bucket()
            );
            assert_eq!(String::from_utf8(body).unwrap(), expected);
        }
    }

    #[tokio::test]
    async fn test_dropped_target_is_torn_down() {
        let world = world();
        let pipeline = pipeline(&world, "1");
        pipeline.run(PipelineTrigger::Manual).await.unwrap();

        let qa_path = deployment_targets_path(DOMAIN, "qa");
        world.parameters.set(&qa_path, HOME, &targets_json(&[("222222222222", HOME)]));
        let report = pipeline
            .run(PipelineTrigger::ConfigurationChange { paths: vec![qa_path] })
            .await
            .unwrap();

        assert_eq!(
            report.stage("qa").unwrap().destroyed,
            vec![DeploymentTarget::new("222222222222", "us-east-1")]
        );
        assert_eq!(world.channel.subscription_count(), 3);
        assert_eq!(world.deployer.deployed().await.len(), 3);
    }
}
