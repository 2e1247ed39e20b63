//! Job descriptions submitted for node operations.

use serde_json::json;

use crate::jobs::{JobAction, JobSpec};

use super::{AddNodesRequest, DeleteNodesCronRequest, DeleteNodesRequest, RmNodesRequest};

pub const ADD_NODES_ACTION: &str = "add-nodes";
pub const RM_NODES_ACTION: &str = "rm-nodes";
pub const DELETE_INSTANCES_ACTION: &str = "delete-ess-instances";
pub const QUERY_INSTANCES_ACTION: &str = "query-ess-instances";

fn action(kind: &str, params: serde_json::Value) -> JobAction {
    JobAction {
        kind: kind.to_string(),
        alias: kind.to_string(),
        params,
    }
}

pub fn add_nodes(req: &AddNodesRequest, actor: &str) -> JobSpec {
    JobSpec::new(
        format!("{}-{}", ADD_NODES_ACTION, req.cluster_name),
        &req.cluster_name,
        req.org_id,
        actor,
    )
    .stage(vec![action(
        ADD_NODES_ACTION,
        json!({
            "hosts": req.hosts,
            "labels": req.labels,
            "port": req.port,
            "user": req.user,
            "source": req.source.as_str(),
            "instance_ids": req.instance_ids,
        }),
    )])
    .secret("password", req.password.clone())
}

fn rm_nodes_action(req: &RmNodesRequest) -> JobAction {
    action(
        RM_NODES_ACTION,
        json!({
            "hosts": req.hosts,
            "force": req.force,
        }),
    )
}

pub fn rm_nodes(req: &RmNodesRequest, actor: &str) -> JobSpec {
    JobSpec::new(
        format!("{}-{}", RM_NODES_ACTION, req.cluster_name),
        &req.cluster_name,
        req.org_id,
        actor,
    )
    .stage(vec![rm_nodes_action(req)])
    .secret("password", req.password.clone())
}

fn delete_instances_action(req: &DeleteNodesRequest) -> JobAction {
    action(
        DELETE_INSTANCES_ACTION,
        json!({
            "region": req.credentials.region,
            "scaling_group_id": req.scaling_group_id,
            "instance_ids": req.instance_ids,
        }),
    )
}

fn with_cloud_secrets(spec: JobSpec, req: &DeleteNodesRequest) -> JobSpec {
    spec.secret("access_key", req.credentials.access_key_id.clone())
        .secret("secret_key", req.credentials.access_key_secret.clone())
        .secret("password", req.rm.password.clone())
}

/// Forced deletion only terminates the cloud instances; the default shape
/// removes the hosts from the cluster first.
pub fn delete_ess_nodes(req: &DeleteNodesRequest, actor: &str) -> JobSpec {
    let spec = JobSpec::new(
        format!("delete-ess-nodes-{}", req.rm.cluster_name),
        &req.rm.cluster_name,
        req.rm.org_id,
        actor,
    );

    let spec = if req.force_delete {
        spec.stage(vec![delete_instances_action(req)])
    } else {
        spec.stage(vec![rm_nodes_action(&req.rm)])
            .stage(vec![delete_instances_action(req)])
    };

    with_cloud_secrets(spec, req)
}

/// Recurring deletion: hosts and instances are looked up from the scaling
/// group each time the job fires.
pub fn delete_ess_nodes_cron(req: &DeleteNodesCronRequest, actor: &str) -> JobSpec {
    let delete = &req.delete;
    let group = json!({
        "region": delete.credentials.region,
        "scaling_group_id": delete.scaling_group_id,
    });

    let spec = JobSpec::new(
        format!("delete-ess-nodes-cron-{}", delete.rm.cluster_name),
        &delete.rm.cluster_name,
        delete.rm.org_id,
        actor,
    )
    .stage(vec![action(QUERY_INSTANCES_ACTION, group)])
    .stage(vec![action(
        RM_NODES_ACTION,
        json!({
            "hosts_from": QUERY_INSTANCES_ACTION,
            "force": delete.rm.force,
        }),
    )])
    .stage(vec![action(
        DELETE_INSTANCES_ACTION,
        json!({
            "region": delete.credentials.region,
            "scaling_group_id": delete.scaling_group_id,
            "instance_ids_from": QUERY_INSTANCES_ACTION,
        }),
    )]);

    with_cloud_secrets(spec, delete)
}
