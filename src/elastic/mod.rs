//! # Elastic group orchestration
//!
//! Owns each cluster's scaling group wiring (group, configuration, queue,
//! notification, rules, scheduled task) and the periodic resource detection
//! that executes scale-out rules and drains idle autoscaled nodes.
//!
//! Discovered cloud ids are cached per cluster name. The cache is only a
//! shortcut: every flow re-derives the group from a describe call before
//! writing anything.

pub mod detect;
pub mod group;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::warn;

use crate::cloud::CloudClientFactory;
use crate::cluster::{ClusterDirectory, ResourceInfoSource};
use crate::config::ScalingTemplate;
use crate::crypto::CredentialCipher;
use crate::lock::ScaleLock;
use crate::nodes::NodeLifecycleDriver;

pub use detect::{
    ClusterDetection, DetectReport, DrainAction, MAX_LIMIT, MIN_LIMIT, ScaleDecision, Usage,
    capacity_usage, decide,
};
pub use group::{GroupSetup, SchedulerFlow, SchedulerScaleRequest};

/// Cloud ids known for one cluster's scaling group.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScalingGroupState {
    pub group_id: String,
    pub configuration_id: Option<String>,
    pub rule_id: Option<String>,
    pub rule_ari: Option<String>,
    pub scheduled_task_id: Option<String>,
    /// The group was found rather than created by this flow
    pub existed: bool,
}

pub struct ElasticGroupOrchestrator {
    clusters: Arc<dyn ClusterDirectory>,
    resources: Arc<dyn ResourceInfoSource>,
    cloud: Arc<dyn CloudClientFactory>,
    cipher: Arc<dyn CredentialCipher>,
    nodes: Arc<NodeLifecycleDriver>,
    lock: ScaleLock,
    template: ScalingTemplate,
    groups: Mutex<HashMap<String, ScalingGroupState>>,
}

impl ElasticGroupOrchestrator {
    pub fn new(
        clusters: Arc<dyn ClusterDirectory>,
        resources: Arc<dyn ResourceInfoSource>,
        cloud: Arc<dyn CloudClientFactory>,
        cipher: Arc<dyn CredentialCipher>,
        nodes: Arc<NodeLifecycleDriver>,
        lock: ScaleLock,
        template: ScalingTemplate,
    ) -> Self {
        Self {
            clusters,
            resources,
            cloud,
            cipher,
            nodes,
            lock,
            template,
            groups: Mutex::new(HashMap::new()),
        }
    }

    /// Cached state for a cluster, if any flow has run for it.
    pub fn cached_state(&self, cluster_name: &str) -> Option<ScalingGroupState> {
        match self.groups.lock() {
            Ok(groups) => groups.get(cluster_name).cloned(),
            Err(_) => {
                warn!(cluster = %cluster_name, "Scaling group cache poisoned");
                None
            }
        }
    }

    fn update_state(&self, cluster_name: &str, update: impl FnOnce(&mut ScalingGroupState)) {
        match self.groups.lock() {
            Ok(mut groups) => update(groups.entry(cluster_name.to_string()).or_default()),
            Err(_) => warn!(cluster = %cluster_name, "Scaling group cache poisoned"),
        }
    }

    /// Replace the cached state, keeping rule and task ids when the group
    /// id is unchanged.
    fn store_group(&self, cluster_name: &str, fresh: ScalingGroupState) -> ScalingGroupState {
        let mut stored = fresh.clone();
        self.update_state(cluster_name, |state| {
            if state.group_id == fresh.group_id {
                stored.rule_id = fresh.rule_id.clone().or_else(|| state.rule_id.clone());
                stored.rule_ari = fresh.rule_ari.clone().or_else(|| state.rule_ari.clone());
                stored.scheduled_task_id = fresh
                    .scheduled_task_id
                    .clone()
                    .or_else(|| state.scheduled_task_id.clone());
            }
            *state = stored.clone();
        });
        stored
    }

    fn forget(&self, cluster_name: &str) {
        if let Ok(mut groups) = self.groups.lock() {
            groups.remove(cluster_name);
        }
    }
}
