//! # Scale event consumer
//!
//! Turns confirmed scale-out notifications into node joins. Messages that
//! carry actionable instances are only deleted after the join job has been
//! submitted and recorded, so a crash in between replays them and the
//! node driver's duplicate check absorbs the replay.

pub mod queue;

use std::sync::Arc;

use metrics::counter;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::cloud::{CloudClientFactory, CloudClients, queue_name, scaling_group_name};
use crate::cluster::{ClusterContext, ClusterDirectory, ScaleMode};
use crate::config::ConsumerConfig;
use crate::crypto::CredentialCipher;
use crate::error::ScaleError;
use crate::guard::{GuardOutcome, PreProcessGuard};
use crate::models::RecordType;
use crate::nodes::{AUTOSCALE_USER_ID, AddNodesRequest, NodeLifecycleDriver, NodeSource};
use crate::repositories::RecordFilter;

pub use queue::{ActivityMessage, QueueSession, ScaleInfo, decode_activity};

/// Labels every autoscaled node joins with; `org-<name>` is appended.
pub const JOIN_LABELS: [&str; 5] = [
    "workspace-prod",
    "bigdata-job",
    "stateless-service",
    "job",
    "autoscale",
];

const SSH_PORT: u16 = 22;
const SSH_USER: &str = "root";

/// What one consume cycle did for a cluster.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsumeReport {
    pub settled_records: usize,
    pub guard: Option<GuardOutcome>,
    pub add_record_id: Option<i64>,
    pub joined_instances: usize,
    pub acknowledged: usize,
    /// Scale-out messages left queued with unresolved instances
    pub deferred: usize,
}

/// Totals of one consumption tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsumeTickReport {
    pub clusters: usize,
    pub consumed: usize,
    pub failed: usize,
    pub cron_runs_imported: usize,
    pub cancelled: bool,
}

pub struct ScaleEventConsumer {
    clusters: Arc<dyn ClusterDirectory>,
    cloud: Arc<dyn CloudClientFactory>,
    cipher: Arc<dyn CredentialCipher>,
    nodes: Arc<NodeLifecycleDriver>,
    guard: PreProcessGuard,
    config: ConsumerConfig,
    record_sync_every_ticks: u64,
}

impl ScaleEventConsumer {
    pub fn new(
        clusters: Arc<dyn ClusterDirectory>,
        cloud: Arc<dyn CloudClientFactory>,
        cipher: Arc<dyn CredentialCipher>,
        nodes: Arc<NodeLifecycleDriver>,
        guard: PreProcessGuard,
        config: ConsumerConfig,
        record_sync_every_ticks: u64,
    ) -> Self {
        Self {
            clusters,
            cloud,
            cipher,
            nodes,
            guard,
            config,
            record_sync_every_ticks: record_sync_every_ticks.max(1),
        }
    }

    /// Clusters with a scale mode other than `none` whose credentials
    /// decrypt to usable values. Anything else is logged and skipped.
    pub async fn fetch_valid_clusters(&self) -> Result<Vec<ClusterContext>, ScaleError> {
        let clusters = self.clusters.list_clusters().await?;
        let mut valid = Vec::with_capacity(clusters.len());

        for cluster in clusters {
            let Some(ops) = cluster.ops_config.as_ref() else {
                debug!(cluster = %cluster.name, "Cluster has no ops config");
                continue;
            };
            if ops.scale_mode == ScaleMode::None {
                continue;
            }
            match ClusterContext::decrypt(&cluster, self.cipher.as_ref()) {
                Ok(ctx) => valid.push(ctx),
                Err(err) => {
                    warn!(cluster = %cluster.name, error = %err, "Skipping cluster with unusable ops config");
                }
            }
        }

        Ok(valid)
    }

    fn session(&self, ctx: &ClusterContext, clients: &CloudClients) -> QueueSession {
        QueueSession::new(
            &ctx.name,
            queue_name(&ctx.name),
            clients.queue.clone(),
            clients.instances.clone(),
            self.config.batch_size,
            self.config.receive_wait(),
        )
    }

    /// Fill in the scaling group id when the ops config does not carry it,
    /// so the guard can compensate a failed join.
    async fn with_group_id(&self, ctx: &ClusterContext, clients: &CloudClients) -> ClusterContext {
        let mut ctx = ctx.clone();
        if ctx.scaling_group_id.is_some() {
            return ctx;
        }
        match clients
            .scaling
            .describe_scaling_groups(&scaling_group_name(&ctx.name))
            .await
        {
            Ok(groups) if groups.len() == 1 => {
                ctx.scaling_group_id = groups.into_iter().next().map(|group| group.id);
            }
            Ok(groups) => {
                debug!(cluster = %ctx.name, found = groups.len(), "Scaling group not uniquely resolved");
            }
            Err(err) => {
                warn!(cluster = %ctx.name, error = %err, "Failed to look up scaling group");
            }
        }
        ctx
    }

    /// One full consume cycle for a cluster.
    #[instrument(skip_all, fields(cluster = %ctx.name))]
    pub async fn consume(&self, ctx: &ClusterContext) -> Result<ConsumeReport, ScaleError> {
        let clients = self.cloud.connect(&ctx.credentials)?;
        let mut report = ConsumeReport::default();

        let recent = RecordFilter::for_cluster(ctx.name.clone())
            .with_types([RecordType::AddEssNodes, RecordType::DeleteEssNodes]);
        report.settled_records = self.nodes.sync(&recent).await?;

        let ctx = self.with_group_id(ctx, &clients).await;
        report.guard = Some(self.guard.pre_process(&ctx).await?);

        let session = self.session(&ctx, &clients);
        let Some(info) = session.scale_out_info().await? else {
            return Ok(report);
        };

        let org_name = self.clusters.org_name(ctx.org_id).await?;
        let mut labels: Vec<String> = JOIN_LABELS.iter().map(|label| label.to_string()).collect();
        labels.push(format!("org-{org_name}"));

        let (instance_ids, hosts): (Vec<String>, Vec<String>) = info.instances.into_iter().unzip();
        report.joined_instances = instance_ids.len();
        report.deferred = info.deferred;

        let request = AddNodesRequest {
            cluster_name: ctx.name.clone(),
            org_id: ctx.org_id,
            hosts,
            labels,
            port: SSH_PORT,
            user: SSH_USER.to_string(),
            password: ctx.ecs_password.clone(),
            source: NodeSource::Ess,
            instance_ids,
        };

        let record_id = self.nodes.add_nodes(request, AUTOSCALE_USER_ID).await?;
        report.add_record_id = Some(record_id);

        report.acknowledged = session.acknowledge(&info.receipt_handles).await;
        counter!("autoscaler_scale_out_instances_total").increment(report.joined_instances as u64);
        info!(
            record_id,
            instances = report.joined_instances,
            acknowledged = report.acknowledged,
            deferred = report.deferred,
            "Scale-out instances submitted for join"
        );

        Ok(report)
    }

    /// Body of the consumption loop. Clusters are handled one after another;
    /// a failing cluster is logged and the next one proceeds. `cancel` is
    /// checked between clusters.
    #[instrument(skip_all, fields(tick = tick))]
    pub async fn process_tick(&self, tick: u64, cancel: &CancellationToken) -> ConsumeTickReport {
        let mut report = ConsumeTickReport::default();

        let clusters = match self.fetch_valid_clusters().await {
            Ok(clusters) => clusters,
            Err(err) => {
                error!(error = %err, "Failed to list clusters for consumption");
                return report;
            }
        };
        report.clusters = clusters.len();

        for (index, ctx) in clusters.iter().enumerate() {
            if cancel.is_cancelled() {
                warn!("Consumption tick cancelled");
                report.cancelled = true;
                break;
            }

            if (index as u64 + tick) % self.record_sync_every_ticks == 0 {
                match self.nodes.sync_cron_runs(&ctx.name, AUTOSCALE_USER_ID).await {
                    Ok(imported) => report.cron_runs_imported += imported,
                    Err(err) => {
                        error!(cluster = %ctx.name, error = %err, "Failed to import scheduled deletion runs");
                    }
                }
            }

            match self.consume(ctx).await {
                Ok(_) => report.consumed += 1,
                Err(err) => {
                    report.failed += 1;
                    error!(cluster = %ctx.name, error = %err, "Scale event consumption failed");
                }
            }
        }

        report
    }
}
