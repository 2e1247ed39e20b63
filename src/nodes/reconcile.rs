//! Reconciliation of `processing` records against the job runner.

use metrics::counter;
use tracing::{debug, info, instrument, warn};

use crate::error::{JobRunnerError, ScaleError};
use crate::jobs::{JobDetail, TaskDetail};
use crate::models::{RecordStatus, RecordType};
use crate::models::operation_record::{Model, detail_with_error};
use crate::repositories::{RecordFilter, RecordPage};

use super::NodeLifecycleDriver;

/// Page size used when reconciling; whatever does not fit is picked up by
/// the next pass.
const SYNC_PAGE_SIZE: u64 = 500;

/// What a job's task topology says about its record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Pending,
    Succeeded,
    Failed(String),
}

fn failure_message(task: &TaskDetail) -> String {
    match task.error_message.as_deref() {
        Some(message) if !message.trim().is_empty() => message.to_string(),
        _ => format!("task {} ended with status {:?}", task.name, task.status),
    }
}

/// Judge a job from its stages.
///
/// A single-stage job is judged by its first task. A multi-stage job is read
/// completely: the first failing task decides a failure, and success needs
/// every task of every stage to have succeeded. A job without stages or with
/// an empty stage is failed.
pub fn evaluate_job(job: &JobDetail) -> JobOutcome {
    if job.stages.is_empty() {
        return JobOutcome::Failed(format!("job {} has no stages", job.id));
    }
    if let Some(index) = job.stages.iter().position(|stage| stage.tasks.is_empty()) {
        return JobOutcome::Failed(format!("job {} stage {} has no tasks", job.id, index));
    }

    if job.stages.len() == 1 {
        let task = &job.stages[0].tasks[0];
        return if task.status.is_success() {
            JobOutcome::Succeeded
        } else if task.status.is_failed() {
            JobOutcome::Failed(failure_message(task))
        } else {
            JobOutcome::Pending
        };
    }

    let mut first_failure = None;
    let mut all_success = true;
    for task in job.stages.iter().flat_map(|stage| stage.tasks.iter()) {
        if task.status.is_failed() && first_failure.is_none() {
            first_failure = Some(failure_message(task));
        }
        if !task.status.is_success() {
            all_success = false;
        }
    }

    match first_failure {
        Some(message) => JobOutcome::Failed(message),
        None if all_success => JobOutcome::Succeeded,
        None => JobOutcome::Pending,
    }
}

impl NodeLifecycleDriver {
    /// Bring `processing` records with a job up to date. Records whose job
    /// cannot be read this pass are returned unchanged.
    pub async fn merge(&self, records: Vec<Model>) -> Result<Vec<Model>, ScaleError> {
        let mut merged = Vec::with_capacity(records.len());
        for record in records {
            merged.push(self.merge_one(record).await?);
        }
        Ok(merged)
    }

    async fn merge_one(&self, record: Model) -> Result<Model, ScaleError> {
        if record.status != RecordStatus::Processing || record.pipeline_id == 0 {
            return Ok(record);
        }

        let (status, detail) = match self.jobs.get_job(record.pipeline_id).await {
            Ok(job) => match evaluate_job(&job) {
                JobOutcome::Pending => return Ok(record),
                JobOutcome::Succeeded => (RecordStatus::Success, None),
                JobOutcome::Failed(message) => (
                    RecordStatus::Failed,
                    Some(detail_with_error(&record.detail, &message)),
                ),
            },
            Err(JobRunnerError::NotFound { .. }) => {
                warn!(
                    record_id = record.id,
                    pipeline_id = record.pipeline_id,
                    "Job no longer known to the runner"
                );
                (RecordStatus::Unknown, None)
            }
            Err(err) => {
                warn!(
                    record_id = record.id,
                    pipeline_id = record.pipeline_id,
                    error = %err,
                    "Job status unavailable, keeping record in processing"
                );
                return Ok(record);
            }
        };

        match self.records.update_status(record.id, status, detail).await {
            Ok(updated) => {
                counter!("autoscaler_records_reconciled_total", "status" => status.as_str())
                    .increment(1);
                info!(
                    record_id = updated.id,
                    pipeline_id = updated.pipeline_id,
                    status = %updated.status,
                    "Operation record reconciled"
                );
                Ok(updated)
            }
            Err(ScaleError::InvalidTransition { .. }) => {
                // Someone else settled it first.
                debug!(record_id = record.id, "Record already terminal");
                self.records
                    .find(record.id)
                    .await
                    .map(|found| found.unwrap_or(record))
            }
            Err(err) => Err(err),
        }
    }

    /// One page of records with in-flight ones reconciled.
    pub async fn query(&self, filter: &RecordFilter) -> Result<RecordPage, ScaleError> {
        let page = self.records.query(filter).await?;
        let records = self.merge(page.records).await?;
        Ok(RecordPage {
            total: page.total,
            records,
        })
    }

    /// Newest record matching `filter`, reconciled.
    pub async fn latest(&self, filter: &RecordFilter) -> Result<Option<Model>, ScaleError> {
        match self.records.latest(filter).await? {
            Some(record) => self.merge_one(record).await.map(Some),
            None => Ok(None),
        }
    }

    /// Reconcile the `processing` records matching `filter`. Returns how many
    /// left `processing`.
    #[instrument(skip_all)]
    pub async fn sync(&self, filter: &RecordFilter) -> Result<usize, ScaleError> {
        let filter = filter
            .clone()
            .with_statuses([RecordStatus::Processing])
            .with_page(1, SYNC_PAGE_SIZE);

        let pending = self.records.query(&filter).await?.records;
        let merged = self.merge(pending).await?;
        let settled = merged
            .iter()
            .filter(|record| record.status.is_terminal())
            .count();

        if settled > 0 {
            debug!(settled, "Reconciliation pass settled records");
        }
        Ok(settled)
    }

    /// A `DeleteEssNodes` record for `host` that is still running after
    /// reconciliation.
    pub async fn in_flight_removal(
        &self,
        cluster_name: &str,
        host: &str,
    ) -> Result<Option<Model>, ScaleError> {
        let filter = RecordFilter::for_cluster(cluster_name)
            .with_types([RecordType::DeleteEssNodes])
            .with_statuses([RecordStatus::Processing])
            .with_page(1, SYNC_PAGE_SIZE);

        let pending = self.records.query(&filter).await?.records;
        let merged = self.merge(pending).await?;
        Ok(merged.into_iter().find(|record| {
            record.status == RecordStatus::Processing
                && record
                    .nodes_detail()
                    .map(|detail| detail.hosts.iter().any(|h| h == host))
                    .unwrap_or(false)
        }))
    }
}
