//! Test utilities: in-memory database and recording fakes for every
//! collaborator the control plane talks to.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use autoscaler::cloud::{
    CloudClientFactory, CloudClients, CloudCredentials, CreateScalingConfiguration,
    CreateScalingGroup, CreateScalingRule, IdentityApi, InstanceDirectory, MessageQueue,
    NotificationConfiguration, QueueMessage, QueueSettings, ScalingGroupApi, ScalingGroupSummary,
    ScalingRuleSummary, ScheduledTaskSpec, ScheduledTaskSummary,
};
use autoscaler::cluster::{
    ClusterContext, ClusterDirectory, ClusterInfo, ClusterType, LabelUpdater, NodeResource,
    OpsConfig, ResourceInfo, ResourceInfoSource, ScaleMode, UpdateLabelsRequest,
};
use autoscaler::config::AppConfig;
use autoscaler::control_plane::{Collaborators, ControlPlane};
use autoscaler::crypto::{AesGcmCredentialCipher, CredentialCipher, Secret};
use autoscaler::error::{ClusterError, CloudError, JobRunnerError};
use autoscaler::jobs::{CronRun, JobDetail, JobRunner, JobSpec, StageDetail, TaskDetail, TaskStatus};
use autoscaler::lock::{LocalLeaderElector, MemoryKeyValueStore};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use migration::{Migrator, MigratorTrait};
use sea_orm::{ConnectionTrait, Database, DatabaseConnection, Statement};

pub const ORG_ID: i64 = 2;
pub const ORG_NAME: &str = "terminus";
pub const REGION: &str = "cn-hangzhou";
pub const ACCOUNT_ID: &str = "1234567890";

/// Sets up an in-memory SQLite database with all migrations applied.
pub async fn setup_test_db() -> Result<DatabaseConnection> {
    let db = Database::connect("sqlite::memory:").await?;

    Migrator::up(&db, None).await?;

    db.execute(Statement::from_string(
        db.get_database_backend(),
        "PRAGMA foreign_keys = OFF".to_string(),
    ))
    .await?;

    Ok(db)
}

pub fn test_cipher() -> Arc<AesGcmCredentialCipher> {
    Arc::new(AesGcmCredentialCipher::from_key_bytes(&[7u8; 32]).expect("valid test key"))
}

/// A kubernetes cluster whose ops config holds real ciphertexts.
pub fn cluster(name: &str, mode: ScaleMode, cipher: &dyn CredentialCipher) -> ClusterInfo {
    let enc = |value: &str| {
        cipher
            .encrypt(name, &Secret::new(value))
            .expect("encrypt fixture credential")
    };
    ClusterInfo {
        name: name.to_string(),
        org_id: ORG_ID,
        cluster_type: ClusterType::Kubernetes,
        ops_config: Some(OpsConfig {
            scale_mode: mode,
            region: REGION.to_string(),
            access_key: enc("AKID-test"),
            secret_key: enc("SECRET-test"),
            ecs_password: enc("root-password"),
            scaling_group_id: None,
            scaling_rule_ari: None,
        }),
    }
}

/// A node carrying `dice/`-prefixed labels.
pub fn node(host: &str, labels: &[&str], cpu: (f64, f64), mem: (i64, i64)) -> NodeResource {
    NodeResource {
        host: host.to_string(),
        cpu_allocatable: cpu.0,
        cpu_requested: cpu.1,
        mem_allocatable: mem.0,
        mem_requested: mem.1,
        labels: labels.iter().map(|label| format!("dice/{label}")).collect(),
    }
}

pub fn task(status: TaskStatus) -> TaskDetail {
    TaskDetail {
        name: format!("{status:?}").to_lowercase(),
        status,
        error_message: None,
    }
}

/// Job topology from per-stage task statuses.
pub fn job_detail(id: i64, stages: Vec<Vec<TaskStatus>>) -> JobDetail {
    JobDetail {
        id,
        stages: stages
            .into_iter()
            .map(|tasks| StageDetail {
                tasks: tasks.into_iter().map(task).collect(),
            })
            .collect(),
    }
}

// ---------------------------------------------------------------------------
// Job runner
// ---------------------------------------------------------------------------

pub struct FakeJobRunner {
    next_id: AtomicI64,
    reject: AtomicBool,
    pub submitted: Mutex<Vec<(i64, JobSpec)>>,
    pub crons: Mutex<Vec<(i64, JobSpec, String)>>,
    jobs: Mutex<HashMap<i64, JobDetail>>,
    unreachable: Mutex<Vec<i64>>,
    cron_runs: Mutex<HashMap<i64, Vec<CronRun>>>,
}

impl Default for FakeJobRunner {
    fn default() -> Self {
        Self {
            next_id: AtomicI64::new(100),
            reject: AtomicBool::new(false),
            submitted: Mutex::new(Vec::new()),
            crons: Mutex::new(Vec::new()),
            jobs: Mutex::new(HashMap::new()),
            unreachable: Mutex::new(Vec::new()),
            cron_runs: Mutex::new(HashMap::new()),
        }
    }
}

impl FakeJobRunner {
    pub fn reject_submissions(&self, reject: bool) {
        self.reject.store(reject, Ordering::SeqCst);
    }

    pub fn set_job(&self, id: i64, stages: Vec<Vec<TaskStatus>>) {
        self.jobs.lock().unwrap().insert(id, job_detail(id, stages));
    }

    pub fn set_job_detail(&self, detail: JobDetail) {
        self.jobs.lock().unwrap().insert(detail.id, detail);
    }

    /// `get_job` for `id` fails with a transport error.
    pub fn make_unreachable(&self, id: i64) {
        self.unreachable.lock().unwrap().push(id);
    }

    pub fn set_cron_runs(&self, cron_id: i64, pipeline_ids: &[i64]) {
        let runs = pipeline_ids
            .iter()
            .map(|&pipeline_id| CronRun {
                pipeline_id,
                started_at: chrono::Utc::now(),
            })
            .collect();
        self.cron_runs.lock().unwrap().insert(cron_id, runs);
    }

    pub fn submitted_specs(&self) -> Vec<JobSpec> {
        self.submitted
            .lock()
            .unwrap()
            .iter()
            .map(|(_, spec)| spec.clone())
            .collect()
    }

    pub fn submission_count(&self) -> usize {
        self.submitted.lock().unwrap().len()
    }

    pub fn last_submission(&self) -> Option<(i64, JobSpec)> {
        self.submitted.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl JobRunner for FakeJobRunner {
    async fn submit(&self, spec: JobSpec) -> Result<i64, JobRunnerError> {
        if self.reject.load(Ordering::SeqCst) {
            return Err(JobRunnerError::Rejected("runner refused job".to_string()));
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.submitted.lock().unwrap().push((id, spec));
        Ok(id)
    }

    async fn get_job(&self, job_id: i64) -> Result<JobDetail, JobRunnerError> {
        if self.unreachable.lock().unwrap().contains(&job_id) {
            return Err(JobRunnerError::Transport("connection refused".to_string()));
        }
        self.jobs
            .lock()
            .unwrap()
            .get(&job_id)
            .cloned()
            .ok_or(JobRunnerError::NotFound { job_id })
    }

    async fn submit_cron(&self, spec: JobSpec, cron_expr: &str) -> Result<i64, JobRunnerError> {
        if self.reject.load(Ordering::SeqCst) {
            return Err(JobRunnerError::Rejected("runner refused cron".to_string()));
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.crons
            .lock()
            .unwrap()
            .push((id, spec, cron_expr.to_string()));
        Ok(id)
    }

    async fn list_cron_runs(&self, cron_id: i64) -> Result<Vec<CronRun>, JobRunnerError> {
        Ok(self
            .cron_runs
            .lock()
            .unwrap()
            .get(&cron_id)
            .cloned()
            .unwrap_or_default())
    }
}

// ---------------------------------------------------------------------------
// Elastic scaling service
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct ScalingState {
    pub groups: Vec<ScalingGroupSummary>,
    /// (group id, rule)
    pub rules: Vec<(String, ScalingRuleSummary)>,
    pub tasks: Vec<(ScheduledTaskSummary, ScheduledTaskSpec)>,
    pub configurations: Vec<CreateScalingConfiguration>,
    pub notifications: Vec<NotificationConfiguration>,
    pub enabled: Vec<String>,
    pub executed: Vec<String>,
    pub calls: Vec<&'static str>,
    seq: u32,
}

impl ScalingState {
    fn next(&mut self, prefix: &str) -> String {
        self.seq += 1;
        format!("{prefix}-{}", self.seq)
    }

    pub fn count(&self, call: &str) -> usize {
        self.calls.iter().filter(|c| **c == call).count()
    }
}

#[derive(Default)]
pub struct FakeScalingApi {
    pub state: Mutex<ScalingState>,
}

impl FakeScalingApi {
    pub fn add_group(&self, name: &str) -> String {
        let mut state = self.state.lock().unwrap();
        let id = state.next("asg");
        state.groups.push(ScalingGroupSummary {
            id: id.clone(),
            name: name.to_string(),
            active_configuration_id: None,
        });
        id
    }

    pub fn add_rule(&self, group_id: &str, name: &str) -> ScalingRuleSummary {
        let mut state = self.state.lock().unwrap();
        let id = state.next("rule");
        let rule = ScalingRuleSummary {
            ari: format!("ari:acs:ess:{REGION}:{ACCOUNT_ID}:scalingrule/{id}"),
            id,
            name: name.to_string(),
        };
        state.rules.push((group_id.to_string(), rule.clone()));
        rule
    }

    pub fn executed(&self) -> Vec<String> {
        self.state.lock().unwrap().executed.clone()
    }

    pub fn count(&self, call: &str) -> usize {
        self.state.lock().unwrap().count(call)
    }
}

#[async_trait]
impl ScalingGroupApi for FakeScalingApi {
    async fn describe_scaling_groups(
        &self,
        name: &str,
    ) -> Result<Vec<ScalingGroupSummary>, CloudError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push("describe_scaling_groups");
        Ok(state
            .groups
            .iter()
            .filter(|group| group.name == name)
            .cloned()
            .collect())
    }

    async fn create_scaling_group(
        &self,
        request: CreateScalingGroup,
    ) -> Result<String, CloudError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push("create_scaling_group");
        let id = state.next("asg");
        state.groups.push(ScalingGroupSummary {
            id: id.clone(),
            name: request.name,
            active_configuration_id: None,
        });
        Ok(id)
    }

    async fn create_scaling_configuration(
        &self,
        request: CreateScalingConfiguration,
    ) -> Result<String, CloudError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push("create_scaling_configuration");
        let id = state.next("asc");
        let group_id = request.scaling_group_id.clone();
        state.configurations.push(request);
        if let Some(group) = state.groups.iter_mut().find(|g| g.id == group_id) {
            group.active_configuration_id = Some(id.clone());
        }
        Ok(id)
    }

    async fn enable_scaling_group(
        &self,
        scaling_group_id: &str,
        _configuration_id: Option<&str>,
    ) -> Result<(), CloudError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push("enable_scaling_group");
        state.enabled.push(scaling_group_id.to_string());
        Ok(())
    }

    async fn create_notification_configuration(
        &self,
        request: NotificationConfiguration,
    ) -> Result<(), CloudError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push("create_notification_configuration");
        state.notifications.push(request);
        Ok(())
    }

    async fn describe_scaling_rules(
        &self,
        scaling_group_id: &str,
        name: &str,
    ) -> Result<Vec<ScalingRuleSummary>, CloudError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push("describe_scaling_rules");
        Ok(state
            .rules
            .iter()
            .filter(|(group, rule)| group == scaling_group_id && rule.name == name)
            .map(|(_, rule)| rule.clone())
            .collect())
    }

    async fn create_scaling_rule(
        &self,
        request: CreateScalingRule,
    ) -> Result<ScalingRuleSummary, CloudError> {
        self.state.lock().unwrap().calls.push("create_scaling_rule");
        Ok(self.add_rule(&request.scaling_group_id, &request.name))
    }

    async fn delete_scaling_rule(&self, rule_id: &str) -> Result<(), CloudError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push("delete_scaling_rule");
        state.rules.retain(|(_, rule)| rule.id != rule_id);
        Ok(())
    }

    async fn describe_scheduled_tasks(
        &self,
        name: &str,
    ) -> Result<Vec<ScheduledTaskSummary>, CloudError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push("describe_scheduled_tasks");
        Ok(state
            .tasks
            .iter()
            .filter(|(task, _)| task.name == name)
            .map(|(task, _)| task.clone())
            .collect())
    }

    async fn create_scheduled_task(&self, spec: ScheduledTaskSpec) -> Result<String, CloudError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push("create_scheduled_task");
        let id = state.next("task");
        state.tasks.push((
            ScheduledTaskSummary {
                id: id.clone(),
                name: spec.name.clone(),
            },
            spec,
        ));
        Ok(id)
    }

    async fn delete_scheduled_task(&self, task_id: &str) -> Result<(), CloudError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push("delete_scheduled_task");
        state.tasks.retain(|(task, _)| task.id != task_id);
        Ok(())
    }

    async fn execute_scaling_rule(&self, rule_ari: &str) -> Result<(), CloudError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push("execute_scaling_rule");
        state.executed.push(rule_ari.to_string());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Message queue
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct QueueState {
    pub created: Vec<QueueSettings>,
    pub pending: Vec<QueueMessage>,
    pub batch_deleted: Vec<String>,
    pub deleted: Vec<String>,
    pub receives: usize,
    pub already_exists: bool,
    seq: u32,
}

#[derive(Default)]
pub struct FakeQueue {
    pub state: Mutex<QueueState>,
}

impl FakeQueue {
    /// Enqueue an encoded scaling activity; returns its receipt handle.
    pub fn push_activity(&self, event: &str, instance_ids: &[&str]) -> String {
        let body = serde_json::json!({
            "event": event,
            "content": { "instanceIds": instance_ids },
        })
        .to_string();
        self.push_raw(&STANDARD.encode(body))
    }

    pub fn push_raw(&self, body: &str) -> String {
        let mut state = self.state.lock().unwrap();
        state.seq += 1;
        let handle = format!("rh-{}", state.seq);
        state.pending.push(QueueMessage {
            receipt_handle: handle.clone(),
            body: body.to_string(),
        });
        handle
    }

    pub fn deleted(&self) -> Vec<String> {
        self.state.lock().unwrap().deleted.clone()
    }

    pub fn batch_deleted(&self) -> Vec<String> {
        self.state.lock().unwrap().batch_deleted.clone()
    }
}

#[async_trait]
impl MessageQueue for FakeQueue {
    async fn create_queue(&self, settings: &QueueSettings) -> Result<(), CloudError> {
        let mut state = self.state.lock().unwrap();
        if state.already_exists {
            return Err(CloudError::AlreadyExists(settings.name.clone()));
        }
        state.created.push(settings.clone());
        Ok(())
    }

    async fn batch_receive(
        &self,
        _queue: &str,
        max: u32,
        _wait: Duration,
    ) -> Result<Vec<QueueMessage>, CloudError> {
        let mut state = self.state.lock().unwrap();
        state.receives += 1;
        if state.pending.is_empty() {
            return Err(CloudError::NoMessage);
        }
        let take = state.pending.len().min(max as usize);
        Ok(state.pending.drain(..take).collect())
    }

    async fn batch_delete(
        &self,
        _queue: &str,
        receipt_handles: &[String],
    ) -> Result<(), CloudError> {
        self.state
            .lock()
            .unwrap()
            .batch_deleted
            .extend(receipt_handles.iter().cloned());
        Ok(())
    }

    async fn delete(&self, _queue: &str, receipt_handle: &str) -> Result<(), CloudError> {
        self.state
            .lock()
            .unwrap()
            .deleted
            .push(receipt_handle.to_string());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Instance directory and identity
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct FakeInstances {
    pub ips: Mutex<BTreeMap<String, String>>,
    pub ip_lookups: Mutex<Vec<Vec<String>>>,
}

impl FakeInstances {
    pub fn insert(&self, instance_id: &str, ip: &str) {
        self.ips
            .lock()
            .unwrap()
            .insert(instance_id.to_string(), ip.to_string());
    }

    pub fn lookups(&self) -> Vec<Vec<String>> {
        self.ip_lookups.lock().unwrap().clone()
    }
}

#[async_trait]
impl InstanceDirectory for FakeInstances {
    async fn private_ips(
        &self,
        instance_ids: &[String],
    ) -> Result<BTreeMap<String, String>, CloudError> {
        self.ip_lookups.lock().unwrap().push(instance_ids.to_vec());
        let ips = self.ips.lock().unwrap();
        Ok(instance_ids
            .iter()
            .filter_map(|id| ips.get(id).map(|ip| (id.clone(), ip.clone())))
            .collect())
    }

    async fn instance_ids_by_private_ip(
        &self,
        private_ips: &[String],
    ) -> Result<Vec<String>, CloudError> {
        let ips = self.ips.lock().unwrap();
        Ok(ips
            .iter()
            .filter(|(_, ip)| private_ips.contains(ip))
            .map(|(id, _)| id.clone())
            .collect())
    }
}

pub struct FakeIdentity;

#[async_trait]
impl IdentityApi for FakeIdentity {
    async fn account_id(&self) -> Result<String, CloudError> {
        Ok(ACCOUNT_ID.to_string())
    }
}

/// Hands out the same fakes for every cluster's credentials.
pub struct FakeCloud {
    pub scaling: Arc<FakeScalingApi>,
    pub queue: Arc<FakeQueue>,
    pub instances: Arc<FakeInstances>,
    pub connects: AtomicUsize,
    pub last_region: Mutex<Option<String>>,
}

impl Default for FakeCloud {
    fn default() -> Self {
        Self {
            scaling: Arc::new(FakeScalingApi::default()),
            queue: Arc::new(FakeQueue::default()),
            instances: Arc::new(FakeInstances::default()),
            connects: AtomicUsize::new(0),
            last_region: Mutex::new(None),
        }
    }
}

impl CloudClientFactory for FakeCloud {
    fn connect(&self, credentials: &CloudCredentials) -> Result<CloudClients, CloudError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        *self.last_region.lock().unwrap() = Some(credentials.region.clone());
        Ok(CloudClients {
            scaling: self.scaling.clone(),
            queue: self.queue.clone(),
            instances: self.instances.clone(),
            identity: Arc::new(FakeIdentity),
        })
    }
}

// ---------------------------------------------------------------------------
// Cluster service
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct FakeClusterDirectory {
    pub clusters: Mutex<Vec<ClusterInfo>>,
}

impl FakeClusterDirectory {
    pub fn add(&self, cluster: ClusterInfo) {
        self.clusters.lock().unwrap().push(cluster);
    }

    pub fn update(&self, name: &str, change: impl FnOnce(&mut ClusterInfo)) {
        let mut clusters = self.clusters.lock().unwrap();
        if let Some(cluster) = clusters.iter_mut().find(|c| c.name == name) {
            change(cluster);
        }
    }
}

#[async_trait]
impl ClusterDirectory for FakeClusterDirectory {
    async fn list_clusters(&self) -> Result<Vec<ClusterInfo>, ClusterError> {
        Ok(self.clusters.lock().unwrap().clone())
    }

    async fn get_cluster(&self, name: &str) -> Result<ClusterInfo, ClusterError> {
        self.clusters
            .lock()
            .unwrap()
            .iter()
            .find(|cluster| cluster.name == name)
            .cloned()
            .ok_or_else(|| ClusterError::NotFound(name.to_string()))
    }

    async fn org_name(&self, org_id: i64) -> Result<String, ClusterError> {
        if org_id == ORG_ID {
            Ok(ORG_NAME.to_string())
        } else {
            Err(ClusterError::OrgNotFound(org_id))
        }
    }
}

#[derive(Default)]
pub struct FakeResources {
    pub nodes: Mutex<HashMap<String, Vec<NodeResource>>>,
}

impl FakeResources {
    pub fn set(&self, cluster_name: &str, nodes: Vec<NodeResource>) {
        self.nodes
            .lock()
            .unwrap()
            .insert(cluster_name.to_string(), nodes);
    }

    /// Add `label` (unprefixed) to the node at `host`.
    pub fn label_host(&self, cluster_name: &str, host: &str, label: &str) {
        let mut nodes = self.nodes.lock().unwrap();
        if let Some(node) = nodes
            .get_mut(cluster_name)
            .and_then(|nodes| nodes.iter_mut().find(|node| node.host == host))
        {
            node.labels.push(format!("dice/{label}"));
        }
    }
}

#[async_trait]
impl ResourceInfoSource for FakeResources {
    async fn resource_info(&self, cluster_name: &str) -> Result<ResourceInfo, ClusterError> {
        Ok(ResourceInfo {
            nodes: self
                .nodes
                .lock()
                .unwrap()
                .get(cluster_name)
                .cloned()
                .unwrap_or_default(),
        })
    }
}

#[derive(Default)]
pub struct FakeLabels {
    pub fail: AtomicBool,
    pub requests: Mutex<Vec<UpdateLabelsRequest>>,
}

impl FakeLabels {
    pub fn requests(&self) -> Vec<UpdateLabelsRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl LabelUpdater for FakeLabels {
    async fn update_labels(&self, request: &UpdateLabelsRequest) -> Result<(), ClusterError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(ClusterError::Api("label service unavailable".to_string()));
        }
        self.requests.lock().unwrap().push(request.clone());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

/// A fully wired control plane over fakes and an in-memory database.
pub struct Harness {
    pub db: DatabaseConnection,
    pub jobs: Arc<FakeJobRunner>,
    pub cloud: Arc<FakeCloud>,
    pub clusters: Arc<FakeClusterDirectory>,
    pub resources: Arc<FakeResources>,
    pub labels: Arc<FakeLabels>,
    pub store: Arc<MemoryKeyValueStore>,
    pub elector: Arc<LocalLeaderElector>,
    pub cipher: Arc<AesGcmCredentialCipher>,
    pub plane: ControlPlane,
}

pub fn test_config() -> AppConfig {
    let mut config = AppConfig {
        crypto_key: Some(vec![7u8; 32]),
        ..AppConfig::default()
    };
    config.scale_lock.backoff_ms = 0;
    config.consumer.receive_wait_seconds = 1;
    config
}

impl Harness {
    pub async fn new() -> Result<Self> {
        Self::with_config(test_config()).await
    }

    pub async fn with_config(config: AppConfig) -> Result<Self> {
        let db = setup_test_db().await?;
        let jobs = Arc::new(FakeJobRunner::default());
        let cloud = Arc::new(FakeCloud::default());
        let clusters = Arc::new(FakeClusterDirectory::default());
        let resources = Arc::new(FakeResources::default());
        let labels = Arc::new(FakeLabels::default());
        let store = Arc::new(MemoryKeyValueStore::new());
        let elector = LocalLeaderElector::new();
        let cipher = test_cipher();

        let plane = ControlPlane::new(
            db.clone(),
            Collaborators {
                jobs: jobs.clone(),
                clusters: clusters.clone(),
                resources: resources.clone(),
                labels: labels.clone(),
                cloud: cloud.clone(),
                cipher: cipher.clone(),
                elector: elector.clone(),
                store: store.clone(),
            },
            &config,
        );

        Ok(Self {
            db,
            jobs,
            cloud,
            clusters,
            resources,
            labels,
            store,
            elector,
            cipher,
            plane,
        })
    }

    /// Register a cluster and return its decrypted context.
    pub fn add_cluster(&self, name: &str, mode: ScaleMode) -> ClusterContext {
        let info = cluster(name, mode, self.cipher.as_ref());
        self.clusters.add(info.clone());
        ClusterContext::decrypt(&info, self.cipher.as_ref()).expect("fixture decrypts")
    }

    pub fn scaling(&self) -> &FakeScalingApi {
        &self.cloud.scaling
    }

    pub fn queue(&self) -> &FakeQueue {
        &self.cloud.queue
    }

    pub fn instances(&self) -> &FakeInstances {
        &self.cloud.instances
    }
}
