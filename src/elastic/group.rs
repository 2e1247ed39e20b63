//! Scaling group, rule and schedule flows.

use chrono::{DateTime, Duration, Utc};
use tracing::{error, info, instrument, warn};

use crate::cloud::{
    CloudClients, CreateScalingConfiguration, CreateScalingGroup, CreateScalingRule, DataDisk,
    NotificationConfiguration, QueueSettings, SCALING_NOTIFICATION_TYPES, ScalingRuleSummary,
    ScheduledTaskSpec, auto_rule_name, queue_arn, scaling_group_name, scheduler_rule_name,
    scheduler_task_name,
};
use crate::cluster::ClusterContext;
use crate::crypto::Secret;
use crate::error::{CloudError, ScaleError};
use crate::nodes::cron::{format_launch_time, parse_launch_time};
use crate::nodes::{
    AUTOSCALE_USER_ID, DeleteNodesCronRequest, DeleteNodesRequest, RecurrenceType,
    RmNodesRequest, ScheduledDeletion,
};

use super::{ElasticGroupOrchestrator, ScalingGroupState};

/// How long a scheduled scaling task keeps recurring.
const SCHEDULE_LIFETIME_DAYS: i64 = 300;

/// Network and login settings for a newly created scaling group.
#[derive(Debug, Clone)]
pub struct GroupSetup {
    pub vswitch_id: String,
    pub security_group_id: String,
    pub password: Secret,
}

#[derive(Debug, Clone)]
pub struct SchedulerScaleRequest {
    pub cluster: ClusterContext,
    pub setup: GroupSetup,
    /// Instances added each time the schedule fires
    pub num: i32,
    /// UTC, `%Y-%m-%dT%H:%MZ`
    pub launch_time: String,
    pub recurrence_type: RecurrenceType,
    pub recurrence_value: String,
    /// Hours after launch at which the added nodes are deleted again
    pub scale_duration: u32,
}

/// Outcome of [`ElasticGroupOrchestrator::create_scheduler_flow`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerFlow {
    pub state: ScalingGroupState,
    pub scheduled_task_id: String,
    pub deletion: ScheduledDeletion,
}

impl ElasticGroupOrchestrator {
    fn connect(&self, ctx: &ClusterContext) -> Result<CloudClients, ScaleError> {
        Ok(self.cloud.connect(&ctx.credentials)?)
    }

    /// Make sure the cluster has a scaling group wired to its notification
    /// queue. An existing group is reused without any write; more than one
    /// group with the cluster's name is refused.
    #[instrument(skip_all, fields(cluster = %ctx.name))]
    pub async fn ensure_group_flow(
        &self,
        ctx: &ClusterContext,
        setup: &GroupSetup,
    ) -> Result<ScalingGroupState, ScaleError> {
        let clients = self.connect(ctx)?;
        self.ensure_group(ctx, &clients, setup).await
    }

    async fn ensure_group(
        &self,
        ctx: &ClusterContext,
        clients: &CloudClients,
        setup: &GroupSetup,
    ) -> Result<ScalingGroupState, ScaleError> {
        let name = scaling_group_name(&ctx.name);
        let mut found = clients.scaling.describe_scaling_groups(&name).await?;

        match found.len() {
            0 => {}
            1 => {
                let group = found.remove(0);
                info!(group_id = %group.id, "Reusing existing scaling group");
                return Ok(self.store_group(
                    &ctx.name,
                    ScalingGroupState {
                        group_id: group.id,
                        configuration_id: group.active_configuration_id,
                        existed: true,
                        ..ScalingGroupState::default()
                    },
                ));
            }
            count => {
                error!(group = %name, count, "Scaling group name is not unique");
                self.forget(&ctx.name);
                return Err(ScaleError::AmbiguousScalingGroup { name, count });
            }
        }

        let group_id = clients
            .scaling
            .create_scaling_group(CreateScalingGroup {
                name: name.clone(),
                vswitch_id: setup.vswitch_id.clone(),
                min_size: 0,
                max_size: self.template.group_max_size,
            })
            .await?;
        info!(group_id = %group_id, "Scaling group created");

        let configuration_id = clients
            .scaling
            .create_scaling_configuration(CreateScalingConfiguration {
                scaling_group_id: group_id.clone(),
                image_name: self.template.image_name.clone(),
                instance_types: self.template.instance_types.clone(),
                cpu: self.template.cpu,
                memory: self.template.memory,
                system_disk_category: self.template.disk_category.clone(),
                system_disk_size: self.template.system_disk_size,
                data_disks: vec![DataDisk {
                    category: self.template.disk_category.clone(),
                    size: self.template.data_disk_size,
                }],
                security_group_id: setup.security_group_id.clone(),
                password: setup.password.clone(),
            })
            .await?;

        let queue = QueueSettings::for_cluster(&ctx.name);
        match clients.queue.create_queue(&queue).await {
            Ok(()) | Err(CloudError::AlreadyExists(_)) => {}
            Err(err) => return Err(err.into()),
        }

        let account_id = clients.identity.account_id().await?;
        clients
            .scaling
            .create_notification_configuration(NotificationConfiguration {
                scaling_group_id: group_id.clone(),
                notification_arn: queue_arn(&ctx.credentials.region, &account_id, &queue.name),
                notification_types: SCALING_NOTIFICATION_TYPES
                    .iter()
                    .map(|kind| kind.to_string())
                    .collect(),
            })
            .await?;

        clients
            .scaling
            .enable_scaling_group(&group_id, Some(&configuration_id))
            .await?;
        info!(group_id = %group_id, queue = %queue.name, "Scaling group enabled");

        Ok(self.store_group(
            &ctx.name,
            ScalingGroupState {
                group_id,
                configuration_id: Some(configuration_id),
                existed: false,
                ..ScalingGroupState::default()
            },
        ))
    }

    /// Delete every rule named `name` in the group, then create it anew.
    async fn replace_rule(
        &self,
        clients: &CloudClients,
        group_id: &str,
        name: &str,
        adjustment: i32,
    ) -> Result<ScalingRuleSummary, ScaleError> {
        for rule in clients.scaling.describe_scaling_rules(group_id, name).await? {
            clients.scaling.delete_scaling_rule(&rule.id).await?;
            info!(rule_id = %rule.id, rule = %name, "Scaling rule deleted");
        }

        let rule = clients
            .scaling
            .create_scaling_rule(CreateScalingRule::simple(group_id, name, adjustment))
            .await?;
        info!(rule_id = %rule.id, rule = %name, adjustment, "Scaling rule created");
        Ok(rule)
    }

    /// Ensure the group and (re)create the auto-scaling rule executed on
    /// scale-out decisions.
    #[instrument(skip_all, fields(cluster = %ctx.name))]
    pub async fn create_auto_rule(
        &self,
        ctx: &ClusterContext,
        setup: &GroupSetup,
    ) -> Result<ScalingRuleSummary, ScaleError> {
        let clients = self.connect(ctx)?;
        let state = self.ensure_group(ctx, &clients, setup).await?;

        let rule = self
            .replace_rule(
                &clients,
                &state.group_id,
                &auto_rule_name(&ctx.name),
                self.template.auto_rule_adjustment,
            )
            .await?;

        self.update_state(&ctx.name, |cached| {
            cached.rule_id = Some(rule.id.clone());
            cached.rule_ari = Some(rule.ari.clone());
        });
        Ok(rule)
    }

    /// Schedule mode: a rule adding `num` instances, a recurring task
    /// executing it, and a recurring deletion `scale_duration` hours after
    /// each launch. When the deletion cannot be registered the task is
    /// deleted again.
    #[instrument(skip_all, fields(cluster = %req.cluster.name))]
    pub async fn create_scheduler_flow(
        &self,
        req: SchedulerScaleRequest,
    ) -> Result<SchedulerFlow, ScaleError> {
        let ctx = &req.cluster;
        let launch = parse_launch_time(&req.launch_time)?;
        if req.num <= 0 {
            return Err(ScaleError::InvalidRequest(format!(
                "scheduled scale-out must add instances, got {}",
                req.num
            )));
        }

        let clients = self.connect(ctx)?;
        let state = self.ensure_group(ctx, &clients, &req.setup).await?;

        let rule = self
            .replace_rule(
                &clients,
                &state.group_id,
                &scheduler_rule_name(&ctx.name),
                req.num,
            )
            .await?;

        let task_name = scheduler_task_name(&ctx.name);
        let spec = ScheduledTaskSpec {
            name: task_name.clone(),
            scheduled_action: rule.ari.clone(),
            launch_time: format_launch_time(launch),
            recurrence_type: req.recurrence_type.as_str().to_string(),
            recurrence_value: req.recurrence_value.clone(),
            recurrence_end_time: format_launch_time(launch + Duration::days(SCHEDULE_LIFETIME_DAYS)),
            enabled: true,
        };

        for task in clients.scaling.describe_scheduled_tasks(&task_name).await? {
            clients.scaling.delete_scheduled_task(&task.id).await?;
            info!(task_id = %task.id, "Scheduled task deleted");
        }
        let task_id = clients.scaling.create_scheduled_task(spec).await?;
        info!(task_id = %task_id, "Scheduled task created");

        let deletion = match self
            .schedule_deletion(ctx, &state.group_id, launch, &req)
            .await
        {
            Ok(deletion) => deletion,
            Err(err) => {
                warn!(task_id = %task_id, error = %err, "Scheduled deletion failed, removing scheduled task");
                if let Err(cleanup) = clients.scaling.delete_scheduled_task(&task_id).await {
                    error!(task_id = %task_id, error = %cleanup, "Failed to remove scheduled task");
                }
                return Err(err);
            }
        };

        self.update_state(&ctx.name, |cached| {
            cached.rule_id = Some(rule.id.clone());
            cached.rule_ari = Some(rule.ari.clone());
            cached.scheduled_task_id = Some(task_id.clone());
        });

        Ok(SchedulerFlow {
            state: self.cached_state(&ctx.name).unwrap_or(state),
            scheduled_task_id: task_id,
            deletion,
        })
    }

    async fn schedule_deletion(
        &self,
        ctx: &ClusterContext,
        group_id: &str,
        launch: DateTime<Utc>,
        req: &SchedulerScaleRequest,
    ) -> Result<ScheduledDeletion, ScaleError> {
        let request = DeleteNodesCronRequest {
            delete: DeleteNodesRequest {
                rm: RmNodesRequest {
                    cluster_name: ctx.name.clone(),
                    org_id: ctx.org_id,
                    hosts: Vec::new(),
                    password: ctx.ecs_password.clone(),
                    force: false,
                },
                credentials: ctx.credentials.clone(),
                scaling_group_id: group_id.to_string(),
                instance_ids: Vec::new(),
                force_delete: false,
            },
            launch_time: launch + Duration::hours(i64::from(req.scale_duration)),
            recurrence_type: req.recurrence_type,
            recurrence_value: req.recurrence_value.clone(),
        };

        self.nodes
            .delete_ess_nodes_cron(request, AUTOSCALE_USER_ID)
            .await
    }
}
