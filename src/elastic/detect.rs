//! Resource detection and scale decisions.

use std::time::Instant;

use metrics::{counter, histogram};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::cloud::{CloudClients, auto_rule_name, scaling_group_name};
use crate::cluster::{
    ClusterContext, ClusterInfo, NodeResource, ScaleMode, UpdateLabelsRequest, compare_hosts,
};
use crate::config::ScalingTemplate;
use crate::error::ScaleError;
use crate::nodes::{AUTOSCALE_USER_ID, DeleteNodesRequest, RmNodesRequest};

use super::ElasticGroupOrchestrator;

/// Usage percentage above which a cluster scales out.
pub const MAX_LIMIT: f64 = 80.0;
/// Usage percentage both dimensions must stay under to scale in.
pub const MIN_LIMIT: f64 = 70.0;

const STATELESS_LABEL: &str = "stateless-service";
const PROD_LABEL: &str = "workspace-prod";
const BIGDATA_LABEL: &str = "bigdata-job";
const AUTOSCALE_LABEL: &str = "autoscale";
const LOCKED_LABEL: &str = "locked";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleDecision {
    ScaleOut,
    ScaleIn,
    Hold,
}

/// Either dimension above [`MAX_LIMIT`] scales out; both under
/// [`MIN_LIMIT`] scale in.
pub fn decide(cpu_usage: f64, mem_usage: f64) -> ScaleDecision {
    if cpu_usage > MAX_LIMIT || mem_usage > MAX_LIMIT {
        ScaleDecision::ScaleOut
    } else if cpu_usage < MIN_LIMIT && mem_usage < MIN_LIMIT {
        ScaleDecision::ScaleIn
    } else {
        ScaleDecision::Hold
    }
}

/// Summed capacity of the nodes that count towards scaling.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Usage {
    pub cpu_allocatable: f64,
    pub cpu_requested: f64,
    pub mem_allocatable: i64,
    pub mem_requested: i64,
}

impl Usage {
    pub fn cpu_percent(&self) -> f64 {
        self.cpu_requested / self.cpu_allocatable * 100.0
    }

    pub fn mem_percent(&self) -> f64 {
        self.mem_requested as f64 / self.mem_allocatable as f64 * 100.0
    }

    fn is_empty(&self) -> bool {
        self.cpu_allocatable <= 0.0 || self.mem_allocatable <= 0
    }
}

fn counts_towards_capacity(node: &NodeResource, template: &ScalingTemplate) -> bool {
    let has = |name: &str| node.has_label(&template.label(name));
    (has(STATELESS_LABEL) && has(PROD_LABEL)) || has(BIGDATA_LABEL)
}

/// Sum allocatable and requested resources over production stateless and
/// big-data nodes.
pub fn capacity_usage(nodes: &[NodeResource], template: &ScalingTemplate) -> Usage {
    nodes
        .iter()
        .filter(|node| counts_towards_capacity(node, template))
        .fold(Usage::default(), |mut usage, node| {
            usage.cpu_allocatable += node.cpu_allocatable;
            usage.cpu_requested += node.cpu_requested;
            usage.mem_allocatable += node.mem_allocatable;
            usage.mem_requested += node.mem_requested;
            usage
        })
}

/// Scale-in step taken for a cluster in one detection pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrainAction {
    /// A node locked in an earlier pass was submitted for deletion
    Removed { host: String, record_id: i64 },
    /// A node was labelled locked; it is removed in a later pass
    Locked { host: String, record_id: i64 },
    /// The locked node's removal from an earlier pass is still running
    RemovalInFlight { host: String, record_id: i64 },
    /// No autoscaled node to drain
    Idle,
}

/// What detection did for one cluster.
#[derive(Debug, Clone, PartialEq)]
pub enum ClusterDetection {
    /// Scale lock present; nothing evaluated
    SkippedLocked,
    /// No node counts towards capacity
    SkippedEmpty,
    ScaledOut { rule_ari: String, usage: Usage },
    Drained { action: DrainAction, usage: Usage },
    Held { usage: Usage },
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DetectReport {
    pub evaluated: Vec<(String, ClusterDetection)>,
    pub failed: Vec<String>,
    pub cancelled: bool,
}

impl DetectReport {
    pub fn outcome(&self, cluster_name: &str) -> Option<&ClusterDetection> {
        self.evaluated
            .iter()
            .find(|(name, _)| name == cluster_name)
            .map(|(_, outcome)| outcome)
    }
}

impl ElasticGroupOrchestrator {
    /// One detection pass over every `auto` cluster. Per-cluster failures
    /// are logged and recorded in the report; `cancel` is checked between
    /// clusters.
    #[instrument(skip_all)]
    pub async fn detect_resource(&self, cancel: &CancellationToken) -> DetectReport {
        let started = Instant::now();
        let mut report = DetectReport::default();

        let clusters = match self.clusters.list_clusters().await {
            Ok(clusters) => clusters,
            Err(err) => {
                error!(error = %err, "Failed to list clusters for detection");
                return report;
            }
        };

        let auto_clusters = clusters.into_iter().filter(|cluster| {
            cluster
                .ops_config
                .as_ref()
                .is_some_and(|ops| ops.scale_mode == ScaleMode::Auto)
        });

        for cluster in auto_clusters {
            if cancel.is_cancelled() {
                warn!("Detection pass cancelled");
                report.cancelled = true;
                break;
            }

            match self.detect_cluster(&cluster).await {
                Ok(outcome) => {
                    debug!(cluster = %cluster.name, outcome = ?outcome, "Cluster evaluated");
                    report.evaluated.push((cluster.name.clone(), outcome));
                }
                Err(err) => {
                    error!(cluster = %cluster.name, error = %err, "Resource detection failed");
                    report.failed.push(cluster.name.clone());
                }
            }
        }

        histogram!("autoscaler_detect_pass_duration_ms")
            .record(started.elapsed().as_secs_f64() * 1_000.0);
        report
    }

    #[instrument(skip_all, fields(cluster = %cluster.name))]
    async fn detect_cluster(&self, cluster: &ClusterInfo) -> Result<ClusterDetection, ScaleError> {
        let ctx = ClusterContext::decrypt(cluster, self.cipher.as_ref())?;

        match self.lock.is_cluster_locked(&ctx.name).await {
            Ok(true) => {
                info!("Cluster is scale-locked, skipping");
                return Ok(ClusterDetection::SkippedLocked);
            }
            Ok(false) => {}
            Err(err) => {
                warn!(error = %err, "Scale lock unreadable, evaluating cluster anyway");
            }
        }

        let resources = self.resources.resource_info(&ctx.name).await?;
        let usage = capacity_usage(&resources.nodes, &self.template);
        if usage.is_empty() {
            debug!("No capacity nodes, skipping");
            return Ok(ClusterDetection::SkippedEmpty);
        }

        let (cpu, mem) = (usage.cpu_percent(), usage.mem_percent());
        let decision = decide(cpu, mem);
        info!(cpu_usage = cpu, mem_usage = mem, decision = ?decision, "Cluster usage computed");

        match decision {
            ScaleDecision::ScaleOut => {
                let clients = self.cloud.connect(&ctx.credentials)?;
                let rule_ari = self.resolve_rule_ari(&ctx, &clients).await?;
                clients.scaling.execute_scaling_rule(&rule_ari).await?;
                counter!("autoscaler_scale_decisions_total", "decision" => "out").increment(1);
                info!(rule_ari = %rule_ari, "Scale-out rule executed");
                Ok(ClusterDetection::ScaledOut { rule_ari, usage })
            }
            ScaleDecision::ScaleIn => {
                let action = self.drain_step(&ctx, &resources.nodes).await?;
                if matches!(action, DrainAction::Removed { .. } | DrainAction::Locked { .. }) {
                    counter!("autoscaler_scale_decisions_total", "decision" => "in").increment(1);
                }
                Ok(ClusterDetection::Drained { action, usage })
            }
            ScaleDecision::Hold => Ok(ClusterDetection::Held { usage }),
        }
    }

    /// Rule ARI from the ops config, else the cache, else looked up by the
    /// auto rule's name.
    async fn resolve_rule_ari(
        &self,
        ctx: &ClusterContext,
        clients: &CloudClients,
    ) -> Result<String, ScaleError> {
        if let Some(ari) = &ctx.scaling_rule_ari {
            return Ok(ari.clone());
        }
        if let Some(ari) = self.cached_state(&ctx.name).and_then(|state| state.rule_ari) {
            return Ok(ari);
        }

        let group_name = scaling_group_name(&ctx.name);
        let groups = clients.scaling.describe_scaling_groups(&group_name).await?;
        let group = match groups.as_slice() {
            [group] => group.clone(),
            [] => return Err(ScaleError::ScalingGroupMissing(group_name)),
            _ => {
                return Err(ScaleError::AmbiguousScalingGroup {
                    name: group_name,
                    count: groups.len(),
                });
            }
        };

        let rule_name = auto_rule_name(&ctx.name);
        let rule = clients
            .scaling
            .describe_scaling_rules(&group.id, &rule_name)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| ScaleError::ScalingRuleMissing(rule_name.clone()))?;

        self.update_state(&ctx.name, |state| {
            if state.group_id != group.id {
                *state = Default::default();
                state.group_id = group.id.clone();
                state.configuration_id = group.active_configuration_id.clone();
                state.existed = true;
            }
            state.rule_id = Some(rule.id.clone());
            state.rule_ari = Some(rule.ari.clone());
        });
        Ok(rule.ari)
    }

    /// Two-phase drain, one node per pass, lowest IP first: a node locked in
    /// an earlier pass is removed, otherwise an autoscaled node is locked.
    async fn drain_step(
        &self,
        ctx: &ClusterContext,
        nodes: &[NodeResource],
    ) -> Result<DrainAction, ScaleError> {
        let autoscale = self.template.label(AUTOSCALE_LABEL);
        let locked = self.template.label(LOCKED_LABEL);

        let mut candidates: Vec<&NodeResource> =
            nodes.iter().filter(|node| node.has_label(&autoscale)).collect();
        candidates.sort_by(|a, b| compare_hosts(&a.host, &b.host));

        if let Some(node) = candidates.iter().find(|node| node.has_label(&locked)) {
            if let Some(record) = self.nodes.in_flight_removal(&ctx.name, &node.host).await? {
                debug!(host = %node.host, record_id = record.id, "Removal already in flight");
                return Ok(DrainAction::RemovalInFlight {
                    host: node.host.clone(),
                    record_id: record.id,
                });
            }
            let record_id = self.remove_locked_node(ctx, &node.host).await?;
            return Ok(DrainAction::Removed {
                host: node.host.clone(),
                record_id,
            });
        }

        let Some(node) = candidates.first() else {
            return Ok(DrainAction::Idle);
        };

        let record_id = self
            .nodes
            .set_labels(
                UpdateLabelsRequest {
                    cluster_name: ctx.name.clone(),
                    org_id: ctx.org_id,
                    hosts: vec![node.host.clone()],
                    labels: vec![LOCKED_LABEL.to_string()],
                },
                AUTOSCALE_USER_ID,
            )
            .await?;
        info!(host = %node.host, "Node locked for removal in a later pass");

        Ok(DrainAction::Locked {
            host: node.host.clone(),
            record_id,
        })
    }

    async fn remove_locked_node(&self, ctx: &ClusterContext, host: &str) -> Result<i64, ScaleError> {
        let clients = self.cloud.connect(&ctx.credentials)?;
        let instance_ids = clients
            .instances
            .instance_ids_by_private_ip(&[host.to_string()])
            .await?;
        if instance_ids.is_empty() {
            return Err(ScaleError::InvalidRequest(format!(
                "no instance owns private ip {host}"
            )));
        }

        let scaling_group_id = match ctx.scaling_group_id.clone() {
            Some(id) => id,
            None => self.lookup_group_id(ctx, &clients).await?,
        };

        let request = DeleteNodesRequest {
            rm: RmNodesRequest {
                cluster_name: ctx.name.clone(),
                org_id: ctx.org_id,
                hosts: vec![host.to_string()],
                password: ctx.ecs_password.clone(),
                force: true,
            },
            credentials: ctx.credentials.clone(),
            scaling_group_id,
            instance_ids,
            force_delete: false,
        };

        let record_id = self.nodes.delete_ess_nodes(request, AUTOSCALE_USER_ID).await?;
        info!(host, record_id, "Locked node submitted for removal");
        Ok(record_id)
    }

    async fn lookup_group_id(
        &self,
        ctx: &ClusterContext,
        clients: &CloudClients,
    ) -> Result<String, ScaleError> {
        if let Some(state) = self.cached_state(&ctx.name).filter(|s| !s.group_id.is_empty()) {
            return Ok(state.group_id);
        }
        let name = scaling_group_name(&ctx.name);
        let mut groups = clients.scaling.describe_scaling_groups(&name).await?;
        match groups.len() {
            1 => Ok(groups.remove(0).id),
            0 => Err(ScaleError::ScalingGroupMissing(name)),
            count => Err(ScaleError::AmbiguousScalingGroup { name, count }),
        }
    }
}
