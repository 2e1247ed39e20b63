//! # Pre-process guard
//!
//! Runs before new scale-out events are consumed for a cluster. When the
//! latest autoscaler node operation failed, the cluster is scale-locked so
//! detection leaves it alone, and a failed join is compensated by force
//! deleting the instances it tried to add.

use std::sync::Arc;

use tracing::{error, info, instrument, warn};

use crate::cluster::ClusterContext;
use crate::error::ScaleError;
use crate::lock::ScaleLock;
use crate::models::{RecordStatus, RecordType};
use crate::nodes::{AUTOSCALE_USER_ID, DeleteNodesRequest, NodeLifecycleDriver, RmNodesRequest};
use crate::repositories::RecordFilter;

/// What the guard did for a cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardOutcome {
    /// Latest operation did not fail
    Clear,
    /// Latest operation failed; the cluster was locked
    Locked,
    /// Latest join failed; the cluster was locked and its instances
    /// submitted for deletion
    Compensated { delete_record_id: i64 },
}

pub struct PreProcessGuard {
    nodes: Arc<NodeLifecycleDriver>,
    lock: ScaleLock,
}

impl PreProcessGuard {
    pub fn new(nodes: Arc<NodeLifecycleDriver>, lock: ScaleLock) -> Self {
        Self { nodes, lock }
    }

    #[instrument(skip_all, fields(cluster = %ctx.name))]
    pub async fn pre_process(&self, ctx: &ClusterContext) -> Result<GuardOutcome, ScaleError> {
        let filter = RecordFilter::for_cluster(ctx.name.clone())
            .with_types([RecordType::AddEssNodes, RecordType::DeleteEssNodes])
            .with_user(AUTOSCALE_USER_ID);

        let Some(record) = self.nodes.latest(&filter).await? else {
            return Ok(GuardOutcome::Clear);
        };
        if record.status != RecordStatus::Failed {
            return Ok(GuardOutcome::Clear);
        }

        warn!(
            record_id = record.id,
            record_type = %record.record_type,
            "Latest autoscale operation failed, locking cluster"
        );
        // Best effort: an unavailable lock store must not stop compensation.
        if let Err(err) = self.lock.lock_cluster(&ctx.name).await {
            error!(error = %err, "Failed to lock cluster after failed operation");
        }

        if record.record_type != RecordType::AddEssNodes {
            return Ok(GuardOutcome::Locked);
        }

        let detail = record.nodes_detail()?;
        if detail.instance_ids.is_empty() {
            warn!(record_id = record.id, "Failed join recorded no instances to delete");
            return Ok(GuardOutcome::Locked);
        }
        let scaling_group_id = ctx
            .scaling_group_id
            .clone()
            .ok_or_else(|| ScaleError::ScalingGroupMissing(ctx.name.clone()))?;

        let request = DeleteNodesRequest {
            rm: RmNodesRequest {
                cluster_name: ctx.name.clone(),
                org_id: ctx.org_id,
                hosts: detail.hosts.clone(),
                password: ctx.ecs_password.clone(),
                force: true,
            },
            credentials: ctx.credentials.clone(),
            scaling_group_id,
            instance_ids: detail.instance_ids,
            force_delete: true,
        };

        let delete_record_id = self.nodes.delete_ess_nodes(request, AUTOSCALE_USER_ID).await?;
        info!(
            failed_record_id = record.id,
            delete_record_id, "Instances of failed join submitted for deletion"
        );
        Ok(GuardOutcome::Compensated { delete_record_id })
    }
}
