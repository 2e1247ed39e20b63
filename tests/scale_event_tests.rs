//! Scale event consumption: queue draining, joins, the pre-process guard
//! and the consumption tick.

use anyhow::Result;
use autoscaler::cloud::{SCALE_OUT_SUCCESS, scaling_group_name};
use autoscaler::cluster::ScaleMode;
use autoscaler::events::JOIN_LABELS;
use autoscaler::guard::GuardOutcome;
use autoscaler::jobs::TaskStatus;
use autoscaler::models::{RecordStatus, RecordType};
use autoscaler::nodes::jobspec::DELETE_INSTANCES_ACTION;
use autoscaler::nodes::{
    AUTOSCALE_USER_ID, DeleteNodesCronRequest, DeleteNodesRequest, RecurrenceType, RmNodesRequest,
};
use chrono::{TimeZone, Utc};
use tokio_util::sync::CancellationToken;

#[path = "test_utils/mod.rs"]
mod test_utils;
use test_utils::{Harness, ORG_NAME};

const SCALE_IN_SUCCESS: &str = "AUTOSCALING:SCALE_IN_SUCCESS";

fn seed_instances(h: &Harness) {
    h.instances().insert("i-1", "10.0.0.1");
    h.instances().insert("i-2", "10.0.0.2");
    h.instances().insert("i-3", "10.0.0.3");
}

#[tokio::test]
async fn overlapping_notifications_join_once() -> Result<()> {
    let h = Harness::new().await?;
    let ctx = h.add_cluster("edge-1", ScaleMode::Auto);
    seed_instances(&h);

    let first = h.queue().push_activity(SCALE_OUT_SUCCESS, &["i-1", "i-2"]);
    let second = h.queue().push_activity(SCALE_OUT_SUCCESS, &["i-2", "i-3"]);
    let scale_in = h.queue().push_activity(SCALE_IN_SUCCESS, &["i-9"]);
    let malformed = h.queue().push_raw("%%% not base64");

    let report = h.plane.consumer.consume(&ctx).await?;
    assert_eq!(report.guard, Some(GuardOutcome::Clear));
    assert_eq!(report.joined_instances, 3);
    assert_eq!(report.acknowledged, 2);

    // One lookup for the deduplicated instance set.
    assert_eq!(h.instances().lookups(), vec![vec!["i-1", "i-2", "i-3"]]);

    let (pipeline_id, spec) = h.jobs.last_submission().expect("join job");
    assert_eq!(h.jobs.submission_count(), 1);
    let params = &spec.stages[0].actions[0].params;
    assert_eq!(
        params["hosts"],
        serde_json::json!(["10.0.0.1", "10.0.0.2", "10.0.0.3"])
    );
    let labels: Vec<&str> = params["labels"]
        .as_array()
        .expect("labels")
        .iter()
        .filter_map(|label| label.as_str())
        .collect();
    for label in JOIN_LABELS {
        assert!(labels.contains(&label), "missing {label}");
    }
    assert!(labels.contains(&format!("org-{ORG_NAME}").as_str()));

    let record = h
        .plane
        .nodes
        .records()
        .find(report.add_record_id.expect("add record"))
        .await?
        .expect("stored record");
    assert_eq!(record.record_type, RecordType::AddEssNodes);
    assert_eq!(record.status, RecordStatus::Processing);
    assert_eq!(record.pipeline_id, pipeline_id);
    assert_eq!(record.user_id, AUTOSCALE_USER_ID);

    // Joins are acknowledged one by one; other activities in one batch.
    assert_eq!(h.queue().deleted(), vec![first, second]);
    assert_eq!(h.queue().batch_deleted(), vec![scale_in]);
    assert!(!h.queue().deleted().contains(&malformed));
    assert!(!h.queue().batch_deleted().contains(&malformed));
    Ok(())
}

#[tokio::test]
async fn replayed_notification_reuses_record() -> Result<()> {
    let h = Harness::new().await?;
    let ctx = h.add_cluster("edge-1", ScaleMode::Auto);
    seed_instances(&h);

    h.queue().push_activity(SCALE_OUT_SUCCESS, &["i-1", "i-2"]);
    let first = h.plane.consumer.consume(&ctx).await?;
    let (pipeline_id, _) = h.jobs.last_submission().expect("join job");
    h.jobs.set_job(pipeline_id, vec![vec![TaskStatus::Running]]);

    let replay = h.queue().push_activity(SCALE_OUT_SUCCESS, &["i-2", "i-1"]);
    let second = h.plane.consumer.consume(&ctx).await?;

    assert_eq!(h.jobs.submission_count(), 1);
    assert_eq!(second.add_record_id, first.add_record_id);
    assert!(h.queue().deleted().contains(&replay));
    Ok(())
}

#[tokio::test]
async fn empty_queue_joins_nothing() -> Result<()> {
    let h = Harness::new().await?;
    let ctx = h.add_cluster("edge-1", ScaleMode::Auto);

    let report = h.plane.consumer.consume(&ctx).await?;
    assert_eq!(report.guard, Some(GuardOutcome::Clear));
    assert_eq!(report.add_record_id, None);
    assert_eq!(h.jobs.submission_count(), 0);
    assert_eq!(h.queue().state.lock().unwrap().receives, 1);
    Ok(())
}

#[tokio::test]
async fn unresolved_instances_are_not_acknowledged() -> Result<()> {
    let h = Harness::new().await?;
    let ctx = h.add_cluster("edge-1", ScaleMode::Auto);

    h.queue().push_activity(SCALE_OUT_SUCCESS, &["i-unknown"]);
    let report = h.plane.consumer.consume(&ctx).await?;

    assert_eq!(report.add_record_id, None);
    assert!(h.queue().deleted().is_empty());
    assert_eq!(h.jobs.submission_count(), 0);
    Ok(())
}

#[tokio::test]
async fn partially_resolved_message_stays_queued() -> Result<()> {
    let h = Harness::new().await?;
    let ctx = h.add_cluster("edge-1", ScaleMode::Auto);
    h.instances().insert("i-1", "10.0.0.1");
    h.instances().insert("i-3", "10.0.0.3");

    let resolved = h.queue().push_activity(SCALE_OUT_SUCCESS, &["i-1"]);
    let partial = h.queue().push_activity(SCALE_OUT_SUCCESS, &["i-2", "i-3"]);

    let report = h.plane.consumer.consume(&ctx).await?;
    assert_eq!(report.joined_instances, 1);
    assert_eq!(report.acknowledged, 1);
    assert_eq!(report.deferred, 1);
    assert_eq!(h.queue().deleted(), vec![resolved.clone()]);
    assert!(!h.queue().deleted().contains(&partial));

    let (pipeline_id, spec) = h.jobs.last_submission().expect("join job");
    assert_eq!(
        spec.stages[0].actions[0].params["hosts"],
        serde_json::json!(["10.0.0.1"])
    );
    h.jobs.set_job(pipeline_id, vec![vec![TaskStatus::Running]]);

    // Redelivered once the missing instance is visible.
    h.instances().insert("i-2", "10.0.0.2");
    let redelivered = h.queue().push_activity(SCALE_OUT_SUCCESS, &["i-2", "i-3"]);
    let report = h.plane.consumer.consume(&ctx).await?;
    assert_eq!(report.joined_instances, 2);
    assert_eq!(report.deferred, 0);
    assert_eq!(h.queue().deleted(), vec![resolved, redelivered]);
    Ok(())
}

#[tokio::test]
async fn failed_join_is_compensated() -> Result<()> {
    let h = Harness::new().await?;
    let ctx = h.add_cluster("edge-1", ScaleMode::Auto);
    let group_id = h.scaling().add_group(&scaling_group_name("edge-1"));
    seed_instances(&h);

    h.queue().push_activity(SCALE_OUT_SUCCESS, &["i-1"]);
    let joined = h.plane.consumer.consume(&ctx).await?;
    let (pipeline_id, _) = h.jobs.last_submission().expect("join job");
    h.jobs
        .set_job(pipeline_id, vec![vec![TaskStatus::Success], vec![TaskStatus::Failed]]);

    let report = h.plane.consumer.consume(&ctx).await?;
    assert_eq!(report.settled_records, 1);
    let delete_record_id = match report.guard {
        Some(GuardOutcome::Compensated { delete_record_id }) => delete_record_id,
        other => panic!("unexpected guard outcome {other:?}"),
    };

    assert!(h.plane.lock.is_cluster_locked("edge-1").await?);

    let failed = h
        .plane
        .nodes
        .records()
        .find(joined.add_record_id.expect("add record"))
        .await?
        .expect("join record");
    assert_eq!(failed.status, RecordStatus::Failed);

    let (_, spec) = h.jobs.last_submission().expect("delete job");
    assert_eq!(spec.stages.len(), 1);
    let action = &spec.stages[0].actions[0];
    assert_eq!(action.kind, DELETE_INSTANCES_ACTION);
    assert_eq!(action.params["scaling_group_id"], group_id);
    assert_eq!(action.params["instance_ids"], serde_json::json!(["i-1"]));

    let delete = h
        .plane
        .nodes
        .records()
        .find(delete_record_id)
        .await?
        .expect("delete record");
    assert_eq!(delete.record_type, RecordType::DeleteEssNodes);
    Ok(())
}

#[tokio::test]
async fn failed_deletion_only_locks() -> Result<()> {
    let h = Harness::new().await?;
    let ctx = h.add_cluster("edge-1", ScaleMode::Auto);
    let id = h
        .plane
        .nodes
        .delete_ess_nodes(
            DeleteNodesRequest {
                rm: RmNodesRequest {
                    cluster_name: ctx.name.clone(),
                    org_id: ctx.org_id,
                    hosts: vec!["10.0.0.5".to_string()],
                    password: ctx.ecs_password.clone(),
                    force: true,
                },
                credentials: ctx.credentials.clone(),
                scaling_group_id: "asg-1".to_string(),
                instance_ids: vec!["i-5".to_string()],
                force_delete: false,
            },
            AUTOSCALE_USER_ID,
        )
        .await?;
    let pipeline_id = h
        .plane
        .nodes
        .records()
        .find(id)
        .await?
        .expect("delete record")
        .pipeline_id;
    h.jobs.set_job(pipeline_id, vec![vec![TaskStatus::Failed]]);

    let report = h.plane.consumer.consume(&ctx).await?;
    assert_eq!(report.guard, Some(GuardOutcome::Locked));
    assert!(h.plane.lock.is_cluster_locked("edge-1").await?);
    assert_eq!(h.jobs.submission_count(), 1);
    Ok(())
}

#[tokio::test]
async fn tick_skips_unmanaged_clusters() -> Result<()> {
    let h = Harness::new().await?;
    h.add_cluster("edge-1", ScaleMode::Auto);
    h.add_cluster("edge-2", ScaleMode::None);
    h.add_cluster("edge-3", ScaleMode::Schedule);
    h.clusters.update("edge-3", |cluster| {
        if let Some(ops) = cluster.ops_config.as_mut() {
            ops.ecs_password = "not-a-ciphertext".to_string();
        }
    });

    let report = h
        .plane
        .consumer
        .process_tick(1, &CancellationToken::new())
        .await;
    assert_eq!(report.clusters, 1);
    assert_eq!(report.consumed, 1);
    assert_eq!(report.failed, 0);
    assert_eq!(h.queue().state.lock().unwrap().receives, 1);
    Ok(())
}

#[tokio::test]
async fn tick_imports_cron_runs_on_schedule() -> Result<()> {
    let h = Harness::new().await?;
    let ctx = h.add_cluster("edge-1", ScaleMode::Schedule);
    let deletion = h
        .plane
        .nodes
        .delete_ess_nodes_cron(
            DeleteNodesCronRequest {
                delete: DeleteNodesRequest {
                    rm: RmNodesRequest {
                        cluster_name: ctx.name.clone(),
                        org_id: ctx.org_id,
                        hosts: Vec::new(),
                        password: ctx.ecs_password.clone(),
                        force: false,
                    },
                    credentials: ctx.credentials.clone(),
                    scaling_group_id: "asg-1".to_string(),
                    instance_ids: Vec::new(),
                    force_delete: false,
                },
                launch_time: Utc.with_ymd_and_hms(2026, 3, 1, 12, 30, 0).unwrap(),
                recurrence_type: RecurrenceType::Daily,
                recurrence_value: "1".to_string(),
            },
            AUTOSCALE_USER_ID,
        )
        .await?;
    h.jobs.set_cron_runs(deletion.cron_id, &[500, 501]);

    let cancel = CancellationToken::new();
    // Runs are imported every fifth tick.
    let off = h.plane.consumer.process_tick(1, &cancel).await;
    assert_eq!(off.cron_runs_imported, 0);

    let on = h.plane.consumer.process_tick(5, &cancel).await;
    assert_eq!(on.cron_runs_imported, 2);

    let again = h.plane.consumer.process_tick(10, &cancel).await;
    assert_eq!(again.cron_runs_imported, 0);
    Ok(())
}

#[tokio::test]
async fn cancelled_tick_consumes_nothing() -> Result<()> {
    let h = Harness::new().await?;
    h.add_cluster("edge-1", ScaleMode::Auto);

    let cancel = CancellationToken::new();
    cancel.cancel();
    let report = h.plane.consumer.process_tick(1, &cancel).await;
    assert!(report.cancelled);
    assert_eq!(report.consumed, 0);
    assert_eq!(h.queue().state.lock().unwrap().receives, 0);
    Ok(())
}
