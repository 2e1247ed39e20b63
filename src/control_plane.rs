//! Assembles the control plane from its collaborators and configuration.

use std::sync::Arc;

use sea_orm::DatabaseConnection;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::cloud::CloudClientFactory;
use crate::cluster::{ClusterDirectory, LabelUpdater, ResourceInfoSource};
use crate::config::AppConfig;
use crate::crypto::CredentialCipher;
use crate::elastic::ElasticGroupOrchestrator;
use crate::events::ScaleEventConsumer;
use crate::guard::PreProcessGuard;
use crate::jobs::JobRunner;
use crate::lock::{KeyValueStore, LeaderElector, ScaleLock};
use crate::nodes::NodeLifecycleDriver;
use crate::repositories::OperationRecordRepository;
use crate::scheduler::{ControlLoopScheduler, LoopIntervals, SchedulerHandle};

/// External services the control plane talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub jobs: Arc<dyn JobRunner>,
    pub clusters: Arc<dyn ClusterDirectory>,
    pub resources: Arc<dyn ResourceInfoSource>,
    pub labels: Arc<dyn LabelUpdater>,
    pub cloud: Arc<dyn CloudClientFactory>,
    pub cipher: Arc<dyn CredentialCipher>,
    pub elector: Arc<dyn LeaderElector>,
    pub store: Arc<dyn KeyValueStore>,
}

pub struct ControlPlane {
    pub nodes: Arc<NodeLifecycleDriver>,
    pub lock: ScaleLock,
    pub orchestrator: Arc<ElasticGroupOrchestrator>,
    pub consumer: Arc<ScaleEventConsumer>,
    pub scheduler: Arc<ControlLoopScheduler>,
}

impl ControlPlane {
    pub fn new(db: DatabaseConnection, collaborators: Collaborators, config: &AppConfig) -> Self {
        let duplicate_window = i64::try_from(config.consumer.duplicate_window_hours)
            .ok()
            .and_then(chrono::Duration::try_hours)
            .unwrap_or(chrono::Duration::MAX);

        let nodes = Arc::new(NodeLifecycleDriver::new(
            OperationRecordRepository::new(db),
            collaborators.jobs,
            collaborators.clusters.clone(),
            collaborators.labels,
            duplicate_window,
        ));
        let lock = ScaleLock::from_config(collaborators.store, &config.scale_lock);

        let orchestrator = Arc::new(ElasticGroupOrchestrator::new(
            collaborators.clusters.clone(),
            collaborators.resources,
            collaborators.cloud.clone(),
            collaborators.cipher.clone(),
            nodes.clone(),
            lock.clone(),
            config.scaling_template.clone(),
        ));

        let consumer = Arc::new(ScaleEventConsumer::new(
            collaborators.clusters,
            collaborators.cloud,
            collaborators.cipher,
            nodes.clone(),
            PreProcessGuard::new(nodes.clone(), lock.clone()),
            config.consumer.clone(),
            config.control_loop.record_sync_every_ticks,
        ));

        let scheduler = Arc::new(ControlLoopScheduler::new(
            collaborators.elector,
            orchestrator.clone(),
            consumer.clone(),
            LoopIntervals::from(&config.control_loop),
        ));

        Self {
            nodes,
            lock,
            orchestrator,
            consumer,
            scheduler,
        }
    }

    /// Start both control loops; they run until `shutdown` fires.
    pub fn start(&self, shutdown: CancellationToken) -> SchedulerHandle {
        info!("Starting autoscaler control loops");
        self.scheduler.clone().spawn(shutdown)
    }
}
