//! # Cluster collaborators
//!
//! Read access to cluster metadata (ops config, organization names), per-node
//! resource usage, and node label updates.

use std::cmp::Ordering;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::cloud::CloudCredentials;
use crate::crypto::{CredentialCipher, Secret};
use crate::error::{ClusterError, ScaleError};

/// How a cluster is scaled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScaleMode {
    Auto,
    Schedule,
    None,
}

impl FromStr for ScaleMode {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "auto" => Ok(ScaleMode::Auto),
            "schedule" => Ok(ScaleMode::Schedule),
            "none" | "" => Ok(ScaleMode::None),
            other => Err(format!("unknown scale mode '{other}'")),
        }
    }
}

/// Cluster orchestration flavour.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClusterType {
    Kubernetes,
    Dcos,
    Edas,
    #[serde(untagged)]
    Other(String),
}

impl ClusterType {
    /// Whether node add/remove jobs can run against this cluster type.
    pub fn supports_node_ops(&self) -> bool {
        matches!(self, ClusterType::Kubernetes | ClusterType::Dcos)
    }
}

impl fmt::Display for ClusterType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClusterType::Kubernetes => f.write_str("kubernetes"),
            ClusterType::Dcos => f.write_str("dcos"),
            ClusterType::Edas => f.write_str("edas"),
            ClusterType::Other(name) => f.write_str(name),
        }
    }
}

/// Per-cluster scaling settings. Credential fields hold ciphertext.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpsConfig {
    pub scale_mode: ScaleMode,
    pub region: String,
    pub access_key: String,
    pub secret_key: String,
    pub ecs_password: String,
    #[serde(default)]
    pub scaling_group_id: Option<String>,
    #[serde(default)]
    pub scaling_rule_ari: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterInfo {
    pub name: String,
    pub org_id: i64,
    pub cluster_type: ClusterType,
    #[serde(default)]
    pub ops_config: Option<OpsConfig>,
}

fn is_blank(value: &str) -> bool {
    value.chars().all(|c| c == ' ')
}

fn non_blank(value: &Option<String>) -> Option<String> {
    value.as_ref().filter(|v| !is_blank(v)).cloned()
}

impl OpsConfig {
    /// Fields every scaling path needs. The ECS password is only required
    /// where nodes are joined, see [`ClusterContext::decrypt`].
    pub fn validate(&self, cluster: &str) -> Result<(), ScaleError> {
        let missing: Vec<&str> = [
            ("access_key", &self.access_key),
            ("secret_key", &self.secret_key),
            ("region", &self.region),
        ]
        .into_iter()
        .filter(|(_, value)| is_blank(value))
        .map(|(name, _)| name)
        .collect();

        if missing.is_empty() {
            Ok(())
        } else {
            Err(ScaleError::InvalidOpsConfig {
                cluster: cluster.to_string(),
                reason: format!("missing {}", missing.join(", ")),
            })
        }
    }
}

/// A cluster with decrypted credentials, ready for scaling operations.
#[derive(Debug, Clone)]
pub struct ClusterContext {
    pub name: String,
    pub org_id: i64,
    pub cluster_type: ClusterType,
    pub scale_mode: ScaleMode,
    pub credentials: CloudCredentials,
    pub ecs_password: Secret,
    pub scaling_group_id: Option<String>,
    pub scaling_rule_ari: Option<String>,
}

impl ClusterContext {
    /// Validate the ops config and decrypt its credentials. Every
    /// credential, the ECS password included, must be present and decrypt
    /// to a non-blank value.
    pub fn decrypt(
        cluster: &ClusterInfo,
        cipher: &dyn CredentialCipher,
    ) -> Result<Self, ScaleError> {
        let ops = cluster
            .ops_config
            .as_ref()
            .ok_or_else(|| ScaleError::InvalidOpsConfig {
                cluster: cluster.name.clone(),
                reason: "empty ops config".to_string(),
            })?;
        ops.validate(&cluster.name)?;
        if is_blank(&ops.ecs_password) {
            return Err(ScaleError::InvalidOpsConfig {
                cluster: cluster.name.clone(),
                reason: "missing ecs_password".to_string(),
            });
        }

        let access_key_id = cipher.decrypt(&cluster.name, &ops.access_key)?;
        let access_key_secret = cipher.decrypt(&cluster.name, &ops.secret_key)?;
        let ecs_password = cipher.decrypt(&cluster.name, &ops.ecs_password)?;

        if access_key_id.is_blank() || access_key_secret.is_blank() || ecs_password.is_blank() {
            return Err(ScaleError::InvalidOpsConfig {
                cluster: cluster.name.clone(),
                reason: "credentials decrypt to empty values".to_string(),
            });
        }

        Ok(Self {
            name: cluster.name.clone(),
            org_id: cluster.org_id,
            cluster_type: cluster.cluster_type.clone(),
            scale_mode: ops.scale_mode,
            credentials: CloudCredentials {
                region: ops.region.trim().to_string(),
                access_key_id,
                access_key_secret,
            },
            ecs_password,
            scaling_group_id: non_blank(&ops.scaling_group_id),
            scaling_rule_ari: non_blank(&ops.scaling_rule_ari),
        })
    }
}

/// Capacity and usage of one node. Memory is in bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeResource {
    /// Node private IP
    pub host: String,
    pub cpu_allocatable: f64,
    pub cpu_requested: f64,
    pub mem_allocatable: i64,
    pub mem_requested: i64,
    pub labels: Vec<String>,
}

impl NodeResource {
    pub fn has_label(&self, label: &str) -> bool {
        self.labels.iter().any(|l| l == label)
    }
}

/// Order hosts by parsed IP when possible so `10.0.0.9` sorts before
/// `10.0.0.10`; unparsable hosts sort after all IPs, by text.
pub fn compare_hosts(a: &str, b: &str) -> Ordering {
    match (a.parse::<IpAddr>(), b.parse::<IpAddr>()) {
        (Ok(x), Ok(y)) => x.cmp(&y),
        (Ok(_), Err(_)) => Ordering::Less,
        (Err(_), Ok(_)) => Ordering::Greater,
        (Err(_), Err(_)) => a.cmp(b),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceInfo {
    pub nodes: Vec<NodeResource>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateLabelsRequest {
    pub cluster_name: String,
    pub org_id: i64,
    pub hosts: Vec<String>,
    /// Label names without the cluster service prefix
    pub labels: Vec<String>,
}

#[async_trait]
pub trait ClusterDirectory: Send + Sync {
    async fn list_clusters(&self) -> Result<Vec<ClusterInfo>, ClusterError>;

    async fn get_cluster(&self, name: &str) -> Result<ClusterInfo, ClusterError>;

    async fn org_name(&self, org_id: i64) -> Result<String, ClusterError>;
}

#[async_trait]
pub trait ResourceInfoSource: Send + Sync {
    async fn resource_info(&self, cluster_name: &str) -> Result<ResourceInfo, ClusterError>;
}

#[async_trait]
pub trait LabelUpdater: Send + Sync {
    /// Add `labels` to every host in the request.
    async fn update_labels(&self, request: &UpdateLabelsRequest) -> Result<(), ClusterError>;
}
