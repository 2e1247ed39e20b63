//! # Cloud collaborators
//!
//! Operations the control plane performs against the cloud provider: the
//! elastic scaling service, the message queue its notifications land in, the
//! instance directory and the identity service. Only the contracts live
//! here; clients are built per cluster through a [`CloudClientFactory`] so
//! one cluster's credentials never leak into another's calls.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::crypto::Secret;
use crate::error::CloudError;

/// Notification types wired from a scaling group to its queue.
pub const SCALING_NOTIFICATION_TYPES: [&str; 8] = [
    "AUTOSCALING:SCALE_OUT_SUCCESS",
    "AUTOSCALING:SCALE_IN_SUCCESS",
    "AUTOSCALING:SCALE_OUT_ERROR",
    "AUTOSCALING:SCALE_IN_ERROR",
    "AUTOSCALING:SCALE_REJECT",
    "AUTOSCALING:SCALE_OUT_START",
    "AUTOSCALING:SCALE_IN_START",
    "AUTOSCALING:SCHEDULE_TASK_EXPIRING",
];

/// The only activity that leads to a node join.
pub const SCALE_OUT_SUCCESS: &str = "AUTOSCALING:SCALE_OUT_SUCCESS";

const QUEUE_PREFIX: &str = "asg-mns";
const GROUP_SUFFIX: &str = "ess-group";
const AUTO_RULE_SUFFIX: &str = "auto-rule";
const SCHEDULER_RULE_SUFFIX: &str = "scheduler-rule";
const SCHEDULER_TASK_SUFFIX: &str = "scheduler-task";

/// Region-scoped cloud credentials for one cluster, already decrypted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloudCredentials {
    pub region: String,
    pub access_key_id: Secret,
    pub access_key_secret: Secret,
}

/// Queue name used for a cluster's scaling notifications.
pub fn queue_name(cluster_name: &str) -> String {
    format!("{QUEUE_PREFIX}-{cluster_name}")
}

pub fn scaling_group_name(cluster_name: &str) -> String {
    format!("{cluster_name}-{GROUP_SUFFIX}")
}

pub fn auto_rule_name(cluster_name: &str) -> String {
    format!("{cluster_name}-{AUTO_RULE_SUFFIX}")
}

pub fn scheduler_rule_name(cluster_name: &str) -> String {
    format!("{cluster_name}-{SCHEDULER_RULE_SUFFIX}")
}

pub fn scheduler_task_name(cluster_name: &str) -> String {
    format!("{cluster_name}-{SCHEDULER_TASK_SUFFIX}")
}

/// Notification target of a queue, as the scaling service expects it.
pub fn queue_arn(region: &str, account_id: &str, queue_name: &str) -> String {
    format!("acs:ess:{region}:{account_id}:queue/{queue_name}")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScalingGroupSummary {
    pub id: String,
    pub name: String,
    pub active_configuration_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateScalingGroup {
    pub name: String,
    pub vswitch_id: String,
    pub min_size: u32,
    pub max_size: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataDisk {
    pub category: String,
    pub size: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateScalingConfiguration {
    pub scaling_group_id: String,
    pub image_name: String,
    pub instance_types: Vec<String>,
    pub cpu: u32,
    pub memory: u32,
    pub system_disk_category: String,
    pub system_disk_size: u32,
    pub data_disks: Vec<DataDisk>,
    pub security_group_id: String,
    pub password: Secret,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScalingRuleSummary {
    pub id: String,
    pub name: String,
    pub ari: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateScalingRule {
    pub scaling_group_id: String,
    pub name: String,
    pub adjustment_type: String,
    pub adjustment_value: i32,
    pub rule_type: String,
}

impl CreateScalingRule {
    /// A simple rule adding `adjustment` instances per execution.
    pub fn simple(scaling_group_id: &str, name: &str, adjustment: i32) -> Self {
        Self {
            scaling_group_id: scaling_group_id.to_string(),
            name: name.to_string(),
            adjustment_type: "QuantityChangeInCapacity".to_string(),
            adjustment_value: adjustment,
            rule_type: "SimpleScalingRule".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledTaskSummary {
    pub id: String,
    pub name: String,
}

/// Payload a scheduled task is created with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledTaskSpec {
    pub name: String,
    /// ARI of the rule the task executes
    pub scheduled_action: String,
    pub launch_time: String,
    pub recurrence_type: String,
    pub recurrence_value: String,
    pub recurrence_end_time: String,
    pub enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationConfiguration {
    pub scaling_group_id: String,
    pub notification_arn: String,
    pub notification_types: Vec<String>,
}

/// Elastic scaling service. Describe calls filter by exact name but may
/// return several matches; uniqueness is the caller's concern.
#[async_trait]
pub trait ScalingGroupApi: Send + Sync {
    async fn describe_scaling_groups(
        &self,
        name: &str,
    ) -> Result<Vec<ScalingGroupSummary>, CloudError>;

    async fn create_scaling_group(&self, request: CreateScalingGroup)
    -> Result<String, CloudError>;

    async fn create_scaling_configuration(
        &self,
        request: CreateScalingConfiguration,
    ) -> Result<String, CloudError>;

    async fn enable_scaling_group(
        &self,
        scaling_group_id: &str,
        configuration_id: Option<&str>,
    ) -> Result<(), CloudError>;

    async fn create_notification_configuration(
        &self,
        request: NotificationConfiguration,
    ) -> Result<(), CloudError>;

    async fn describe_scaling_rules(
        &self,
        scaling_group_id: &str,
        name: &str,
    ) -> Result<Vec<ScalingRuleSummary>, CloudError>;

    async fn create_scaling_rule(
        &self,
        request: CreateScalingRule,
    ) -> Result<ScalingRuleSummary, CloudError>;

    async fn delete_scaling_rule(&self, rule_id: &str) -> Result<(), CloudError>;

    async fn describe_scheduled_tasks(
        &self,
        name: &str,
    ) -> Result<Vec<ScheduledTaskSummary>, CloudError>;

    async fn create_scheduled_task(&self, spec: ScheduledTaskSpec) -> Result<String, CloudError>;

    async fn delete_scheduled_task(&self, task_id: &str) -> Result<(), CloudError>;

    async fn execute_scaling_rule(&self, rule_ari: &str) -> Result<(), CloudError>;
}

/// Attributes a notification queue is created with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSettings {
    pub name: String,
    pub delay_seconds: u32,
    pub max_message_size: u32,
    pub message_retention_seconds: u32,
    pub visibility_timeout_seconds: u32,
    pub polling_wait_seconds: u32,
}

impl QueueSettings {
    /// Settings for a cluster's notification queue: messages live 12 hours
    /// and stay invisible for 30 seconds after delivery.
    pub fn for_cluster(cluster_name: &str) -> Self {
        Self {
            name: queue_name(cluster_name),
            delay_seconds: 0,
            max_message_size: 65_536,
            message_retention_seconds: 43_200,
            visibility_timeout_seconds: 30,
            polling_wait_seconds: 0,
        }
    }
}

/// A delivered queue message. `body` is the raw (base64) payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueMessage {
    pub receipt_handle: String,
    pub body: String,
}

#[async_trait]
pub trait MessageQueue: Send + Sync {
    /// Create the queue. An existing queue with the same attributes may be
    /// reported as `CloudError::AlreadyExists`.
    async fn create_queue(&self, settings: &QueueSettings) -> Result<(), CloudError>;

    /// Receive up to `max` messages, waiting at most `wait`. An empty queue
    /// is reported as `CloudError::NoMessage`.
    async fn batch_receive(
        &self,
        queue: &str,
        max: u32,
        wait: Duration,
    ) -> Result<Vec<QueueMessage>, CloudError>;

    async fn batch_delete(&self, queue: &str, receipt_handles: &[String])
    -> Result<(), CloudError>;

    async fn delete(&self, queue: &str, receipt_handle: &str) -> Result<(), CloudError>;
}

/// Compute instance lookups.
#[async_trait]
pub trait InstanceDirectory: Send + Sync {
    /// Private IPs for the given instance ids (instance id -> IP). Unknown
    /// ids are omitted.
    async fn private_ips(
        &self,
        instance_ids: &[String],
    ) -> Result<BTreeMap<String, String>, CloudError>;

    /// Instance ids owning the given private IPs.
    async fn instance_ids_by_private_ip(
        &self,
        private_ips: &[String],
    ) -> Result<Vec<String>, CloudError>;
}

#[async_trait]
pub trait IdentityApi: Send + Sync {
    /// Account id of the calling credentials.
    async fn account_id(&self) -> Result<String, CloudError>;
}

/// Clients bound to one set of credentials.
#[derive(Clone)]
pub struct CloudClients {
    pub scaling: Arc<dyn ScalingGroupApi>,
    pub queue: Arc<dyn MessageQueue>,
    pub instances: Arc<dyn InstanceDirectory>,
    pub identity: Arc<dyn IdentityApi>,
}

/// Builds [`CloudClients`] for a cluster's credentials.
pub trait CloudClientFactory: Send + Sync {
    fn connect(&self, credentials: &CloudCredentials) -> Result<CloudClients, CloudError>;
}
