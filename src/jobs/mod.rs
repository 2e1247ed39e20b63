//! # Job runner contract
//!
//! Node joins and removals are executed by an external pipeline runner. The
//! control plane submits declarative job specs, polls their task topology
//! during reconciliation and registers recurring (cron) jobs. Not-found is a
//! typed error kind, never a matched string.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::crypto::Secret;
use crate::error::JobRunnerError;

/// Source tag attached to every job the control plane submits.
pub const JOB_SOURCE: &str = "ops";

/// One step of a job, executed by the runner's action of type `kind`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobAction {
    pub kind: String,
    pub alias: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

/// Actions in a stage run in parallel; stages run in order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStage {
    pub actions: Vec<JobAction>,
}

/// Declarative job description handed to the runner. Secrets travel
/// separately from params and are redacted from `Debug`.
#[derive(Debug, Clone, PartialEq)]
pub struct JobSpec {
    pub name: String,
    pub cluster_name: String,
    pub org_id: i64,
    pub user_id: String,
    pub stages: Vec<JobStage>,
    pub secrets: BTreeMap<String, Secret>,
    pub labels: BTreeMap<String, String>,
}

impl JobSpec {
    pub fn new(name: impl Into<String>, cluster_name: &str, org_id: i64, user_id: &str) -> Self {
        let mut labels = BTreeMap::new();
        labels.insert("source".to_string(), JOB_SOURCE.to_string());
        labels.insert("cluster".to_string(), cluster_name.to_string());
        Self {
            name: name.into(),
            cluster_name: cluster_name.to_string(),
            org_id,
            user_id: user_id.to_string(),
            stages: Vec::new(),
            secrets: BTreeMap::new(),
            labels,
        }
    }

    pub fn stage(mut self, actions: Vec<JobAction>) -> Self {
        self.stages.push(JobStage { actions });
        self
    }

    pub fn secret(mut self, key: &str, value: Secret) -> Self {
        self.secrets.insert(key.to_string(), value);
        self
    }

    pub fn action_count(&self) -> usize {
        self.stages.iter().map(|s| s.actions.len()).sum()
    }
}

/// Runner-reported task status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum TaskStatus {
    Analyzed,
    Born,
    Queue,
    Running,
    Success,
    Failed,
    Timeout,
    StopByUser,
    NoNeedBySystem,
    Error,
}

impl TaskStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, TaskStatus::Success | TaskStatus::NoNeedBySystem)
    }

    pub fn is_failed(&self) -> bool {
        matches!(
            self,
            TaskStatus::Failed | TaskStatus::Timeout | TaskStatus::StopByUser | TaskStatus::Error
        )
    }

    pub fn is_end(&self) -> bool {
        self.is_success() || self.is_failed()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDetail {
    pub name: String,
    pub status: TaskStatus,
    #[serde(default)]
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageDetail {
    pub tasks: Vec<TaskDetail>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobDetail {
    pub id: i64,
    pub stages: Vec<StageDetail>,
}

/// One firing of a recurring job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CronRun {
    pub pipeline_id: i64,
    pub started_at: DateTime<Utc>,
}

#[async_trait]
pub trait JobRunner: Send + Sync {
    /// Submit a job for immediate execution, returning its id.
    async fn submit(&self, spec: JobSpec) -> Result<i64, JobRunnerError>;

    /// Current topology and status of a job.
    async fn get_job(&self, job_id: i64) -> Result<JobDetail, JobRunnerError>;

    /// Register `spec` to run on `cron_expr`, returning the cron id.
    async fn submit_cron(&self, spec: JobSpec, cron_expr: &str) -> Result<i64, JobRunnerError>;

    /// Runs started by a cron registration, oldest first.
    async fn list_cron_runs(&self, cron_id: i64) -> Result<Vec<CronRun>, JobRunnerError>;
}
