//! # Node lifecycle
//!
//! Turns node add/remove intents into job submissions and keeps the
//! operation log in step with the job runner. Every submission that reaches
//! the runner gets exactly one record; a submission the runner rejects gets
//! none.

pub mod cron;
pub mod jobspec;
pub mod reconcile;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use metrics::counter;
use serde::{Deserialize, Serialize};
use tracing::{error, info, instrument, warn};

use crate::cloud::CloudCredentials;
use crate::cluster::{ClusterDirectory, LabelUpdater, UpdateLabelsRequest};
use crate::crypto::Secret;
use crate::error::ScaleError;
use crate::jobs::JobRunner;
use crate::models::operation_record::{CronRecordDetail, NodesRecordDetail};
use crate::models::{RecordStatus, RecordType};
use crate::repositories::{NewRecord, OperationRecordRepository, RecordFilter};

pub use cron::RecurrenceType;
pub use reconcile::{JobOutcome, evaluate_job};

/// User id recorded for actions the autoscaler takes on its own.
pub const AUTOSCALE_USER_ID: &str = "1110";

/// Where an add-nodes request comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeSource {
    /// An operator asked for it
    Manual,
    /// The scaling group launched the instances
    Ess,
}

impl NodeSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeSource::Manual => "manual",
            NodeSource::Ess => "ess-autoscale",
        }
    }

    fn record_type(&self) -> RecordType {
        match self {
            NodeSource::Manual => RecordType::AddNodes,
            NodeSource::Ess => RecordType::AddEssNodes,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AddNodesRequest {
    pub cluster_name: String,
    pub org_id: i64,
    pub hosts: Vec<String>,
    /// Labels to apply on join, without the cluster service prefix
    pub labels: Vec<String>,
    pub port: u16,
    pub user: String,
    pub password: Secret,
    pub source: NodeSource,
    /// Cloud instances behind `hosts`, when known
    pub instance_ids: Vec<String>,
}

impl AddNodesRequest {
    fn detail(&self) -> NodesRecordDetail {
        NodesRecordDetail {
            hosts: self.hosts.clone(),
            instance_ids: self.instance_ids.clone(),
            error: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RmNodesRequest {
    pub cluster_name: String,
    pub org_id: i64,
    pub hosts: Vec<String>,
    pub password: Secret,
    pub force: bool,
}

#[derive(Debug, Clone)]
pub struct DeleteNodesRequest {
    pub rm: RmNodesRequest,
    pub credentials: CloudCredentials,
    pub scaling_group_id: String,
    pub instance_ids: Vec<String>,
    /// Skip removing the hosts from the cluster and only terminate instances
    pub force_delete: bool,
}

#[derive(Debug, Clone)]
pub struct DeleteNodesCronRequest {
    pub delete: DeleteNodesRequest,
    pub launch_time: DateTime<Utc>,
    pub recurrence_type: RecurrenceType,
    pub recurrence_value: String,
}

/// Result of registering a recurring deletion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledDeletion {
    pub record_id: i64,
    pub cron_id: i64,
    pub cron_expr: String,
}

pub struct NodeLifecycleDriver {
    records: OperationRecordRepository,
    jobs: Arc<dyn JobRunner>,
    clusters: Arc<dyn ClusterDirectory>,
    labels: Arc<dyn LabelUpdater>,
    duplicate_window: chrono::Duration,
}

impl NodeLifecycleDriver {
    pub fn new(
        records: OperationRecordRepository,
        jobs: Arc<dyn JobRunner>,
        clusters: Arc<dyn ClusterDirectory>,
        labels: Arc<dyn LabelUpdater>,
        duplicate_window: chrono::Duration,
    ) -> Self {
        Self {
            records,
            jobs,
            clusters,
            labels,
            duplicate_window,
        }
    }

    pub fn records(&self) -> &OperationRecordRepository {
        &self.records
    }

    async fn ensure_node_ops(&self, cluster_name: &str) -> Result<(), ScaleError> {
        let cluster = self.clusters.get_cluster(cluster_name).await?;
        if cluster.cluster_type.supports_node_ops() {
            Ok(())
        } else {
            Err(ScaleError::UnsupportedCluster(cluster.cluster_type.to_string()))
        }
    }

    /// Submit a join job and record it. Autoscaler-originated requests for
    /// an instance set already being added (or added) inside the duplicate
    /// window return the existing record instead.
    #[instrument(skip_all, fields(cluster = %req.cluster_name, source = req.source.as_str()))]
    pub async fn add_nodes(&self, req: AddNodesRequest, actor: &str) -> Result<i64, ScaleError> {
        if req.hosts.is_empty() {
            return Err(ScaleError::InvalidRequest("no hosts to add".to_string()));
        }
        self.ensure_node_ops(&req.cluster_name).await?;

        let detail = req.detail();
        if req.source == NodeSource::Ess {
            if let Some(existing) = self
                .records
                .find_duplicate_ess_add(&req.cluster_name, &detail, self.duplicate_window)
                .await?
            {
                info!(
                    record_id = existing.id,
                    pipeline_id = existing.pipeline_id,
                    "Instances already submitted for join, reusing record"
                );
                counter!("autoscaler_duplicate_adds_total").increment(1);
                return Ok(existing.id);
            }
        }

        let spec = jobspec::add_nodes(&req, actor);
        let pipeline_id = self.jobs.submit(spec).await.map_err(|err| {
            error!(error = %err, "Add-nodes job submission failed");
            err
        })?;

        let record = self
            .records
            .create(NewRecord {
                record_type: req.source.record_type(),
                user_id: actor.to_string(),
                org_id: req.org_id,
                cluster_name: req.cluster_name.clone(),
                status: RecordStatus::Processing,
                detail: serde_json::to_string(&detail)?,
                pipeline_id,
            })
            .await?;

        counter!("autoscaler_node_jobs_submitted_total", "kind" => "add").increment(1);
        Ok(record.id)
    }

    #[instrument(skip_all, fields(cluster = %req.cluster_name))]
    pub async fn remove_nodes(&self, req: RmNodesRequest, actor: &str) -> Result<i64, ScaleError> {
        if req.hosts.is_empty() {
            return Err(ScaleError::InvalidRequest("no hosts to remove".to_string()));
        }
        self.ensure_node_ops(&req.cluster_name).await?;

        let pipeline_id = self.jobs.submit(jobspec::rm_nodes(&req, actor)).await?;
        let detail = NodesRecordDetail {
            hosts: req.hosts.clone(),
            ..NodesRecordDetail::default()
        };

        let record = self
            .records
            .create(NewRecord {
                record_type: RecordType::RmNodes,
                user_id: actor.to_string(),
                org_id: req.org_id,
                cluster_name: req.cluster_name.clone(),
                status: RecordStatus::Processing,
                detail: serde_json::to_string(&detail)?,
                pipeline_id,
            })
            .await?;

        counter!("autoscaler_node_jobs_submitted_total", "kind" => "remove").increment(1);
        Ok(record.id)
    }

    /// Remove hosts and terminate their instances. With `force_delete` only
    /// the instances are terminated.
    #[instrument(skip_all, fields(cluster = %req.rm.cluster_name, force = req.force_delete))]
    pub async fn delete_ess_nodes(
        &self,
        req: DeleteNodesRequest,
        actor: &str,
    ) -> Result<i64, ScaleError> {
        if req.instance_ids.is_empty() {
            return Err(ScaleError::InvalidRequest(
                "no instances to delete".to_string(),
            ));
        }
        if !req.force_delete {
            self.ensure_node_ops(&req.rm.cluster_name).await?;
        }

        let pipeline_id = self
            .jobs
            .submit(jobspec::delete_ess_nodes(&req, actor))
            .await?;
        let detail = NodesRecordDetail {
            hosts: req.rm.hosts.clone(),
            instance_ids: req.instance_ids.clone(),
            error: None,
        };

        let record = self
            .records
            .create(NewRecord {
                record_type: RecordType::DeleteEssNodes,
                user_id: actor.to_string(),
                org_id: req.rm.org_id,
                cluster_name: req.rm.cluster_name.clone(),
                status: RecordStatus::Processing,
                detail: serde_json::to_string(&detail)?,
                pipeline_id,
            })
            .await?;

        counter!("autoscaler_node_jobs_submitted_total", "kind" => "delete").increment(1);
        Ok(record.id)
    }

    /// Register a recurring deletion of whatever the scaling group holds when
    /// the job fires.
    #[instrument(skip_all, fields(cluster = %req.delete.rm.cluster_name))]
    pub async fn delete_ess_nodes_cron(
        &self,
        req: DeleteNodesCronRequest,
        actor: &str,
    ) -> Result<ScheduledDeletion, ScaleError> {
        let cron_expr =
            cron::cron_expression(req.launch_time, req.recurrence_type, &req.recurrence_value)?;

        let spec = jobspec::delete_ess_nodes_cron(&req, actor);
        let cron_id = self.jobs.submit_cron(spec, &cron_expr).await?;

        let detail = CronRecordDetail {
            cron_id,
            cron_expr: cron_expr.clone(),
            launch_time: cron::format_launch_time(req.launch_time),
            scaling_group_id: req.delete.scaling_group_id.clone(),
        };
        let record = self
            .records
            .create(NewRecord {
                record_type: RecordType::DeleteEssNodesCron,
                user_id: actor.to_string(),
                org_id: req.delete.rm.org_id,
                cluster_name: req.delete.rm.cluster_name.clone(),
                status: RecordStatus::Success,
                detail: serde_json::to_string(&detail)?,
                pipeline_id: 0,
            })
            .await?;

        info!(cron_id, cron_expr = %cron_expr, "Scheduled node deletion registered");
        Ok(ScheduledDeletion {
            record_id: record.id,
            cron_id,
            cron_expr,
        })
    }

    /// Apply labels to hosts and record the outcome. A failed update is
    /// recorded as such before the error is returned.
    #[instrument(skip_all, fields(cluster = %req.cluster_name))]
    pub async fn set_labels(
        &self,
        req: UpdateLabelsRequest,
        actor: &str,
    ) -> Result<i64, ScaleError> {
        let outcome = self.labels.update_labels(&req).await;

        let (status, detail) = match &outcome {
            Ok(()) => (
                RecordStatus::Success,
                serde_json::json!({ "hosts": req.hosts, "labels": req.labels }).to_string(),
            ),
            Err(err) => (RecordStatus::Failed, err.to_string()),
        };

        let record = self
            .records
            .create(NewRecord {
                record_type: RecordType::SetLabels,
                user_id: actor.to_string(),
                org_id: req.org_id,
                cluster_name: req.cluster_name.clone(),
                status,
                detail,
                pipeline_id: 0,
            })
            .await?;

        outcome?;
        Ok(record.id)
    }

    /// Import runs of the cluster's latest scheduled deletion as
    /// `DeleteEssNodes` records so reconciliation and the pre-process guard
    /// see them. Returns the number of runs imported.
    #[instrument(skip_all, fields(cluster = %cluster_name))]
    pub async fn sync_cron_runs(&self, cluster_name: &str, actor: &str) -> Result<usize, ScaleError> {
        let filter = RecordFilter::for_cluster(cluster_name)
            .with_types([RecordType::DeleteEssNodesCron])
            .with_statuses([RecordStatus::Success, RecordStatus::Successed]);
        let Some(schedule) = self.records.latest(&filter).await? else {
            return Ok(0);
        };

        let detail: CronRecordDetail = match serde_json::from_str(&schedule.detail) {
            Ok(detail) => detail,
            Err(err) => {
                warn!(record_id = schedule.id, error = %err, "Unreadable scheduled deletion detail");
                return Ok(0);
            }
        };

        let runs = self.jobs.list_cron_runs(detail.cron_id).await?;
        let known = self
            .records
            .pipeline_ids(cluster_name, RecordType::DeleteEssNodes)
            .await?;

        let mut imported = 0;
        for run in runs.into_iter().filter(|run| !known.contains(&run.pipeline_id)) {
            self.records
                .create(NewRecord {
                    record_type: RecordType::DeleteEssNodes,
                    user_id: actor.to_string(),
                    org_id: schedule.org_id,
                    cluster_name: cluster_name.to_string(),
                    status: RecordStatus::Processing,
                    detail: serde_json::to_string(&NodesRecordDetail::default())?,
                    pipeline_id: run.pipeline_id,
                })
                .await?;
            imported += 1;
        }

        if imported > 0 {
            info!(cron_id = detail.cron_id, imported, "Scheduled deletion runs imported");
        }
        Ok(imported)
    }
}
