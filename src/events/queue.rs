//! Draining a cluster's scaling notification queue.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use metrics::counter;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::cloud::{InstanceDirectory, MessageQueue, QueueMessage, SCALE_OUT_SUCCESS};
use crate::error::CloudError;

/// Scaling activity notification as published by the scaling group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityMessage {
    pub event: String,
    #[serde(default)]
    pub content: ActivityContent,
    #[serde(skip)]
    pub receipt_handle: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityContent {
    #[serde(default)]
    pub instance_ids: Vec<String>,
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("message body is not base64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("message body is not an activity: {0}")]
    Json(#[from] serde_json::Error),
}

/// Decode a base64 JSON message body.
pub fn decode_activity(message: &QueueMessage) -> Result<ActivityMessage, DecodeError> {
    let raw = STANDARD.decode(message.body.trim())?;
    let mut activity: ActivityMessage = serde_json::from_slice(&raw)?;
    activity.receipt_handle = message.receipt_handle.clone();
    Ok(activity)
}

/// Instances confirmed by scale-out notifications and the messages that
/// carried them. Only messages whose instances all resolved are included;
/// the rest stay queued for a later tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScaleInfo {
    pub receipt_handles: Vec<String>,
    /// instance id -> private IP
    pub instances: BTreeMap<String, String>,
    /// Scale-out messages left in the queue because an instance did not resolve
    pub deferred: usize,
}

/// Queue access for one cluster, bound to that cluster's credentials.
pub struct QueueSession {
    cluster: String,
    queue: String,
    messages: Arc<dyn MessageQueue>,
    instances: Arc<dyn InstanceDirectory>,
    batch_size: u32,
    wait: Duration,
}

impl QueueSession {
    pub fn new(
        cluster: &str,
        queue: String,
        messages: Arc<dyn MessageQueue>,
        instances: Arc<dyn InstanceDirectory>,
        batch_size: u32,
        wait: Duration,
    ) -> Self {
        Self {
            cluster: cluster.to_string(),
            queue,
            messages,
            instances,
            batch_size,
            wait,
        }
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// One bounded receive. An empty queue is an empty batch.
    pub async fn receive_batch(&self) -> Result<Vec<QueueMessage>, CloudError> {
        match self
            .messages
            .batch_receive(&self.queue, self.batch_size, self.wait)
            .await
        {
            Ok(batch) => {
                counter!("autoscaler_queue_messages_received_total").increment(batch.len() as u64);
                Ok(batch)
            }
            Err(CloudError::NoMessage) => Ok(Vec::new()),
            Err(err) => Err(err),
        }
    }

    /// Receive a batch and keep what scale-out successes announce.
    ///
    /// Other activities are deleted right away; malformed messages are left
    /// alone. Instance ids are deduplicated across the batch and resolved in
    /// one lookup. `None` means nothing in the batch is actionable.
    pub async fn scale_out_info(&self) -> Result<Option<ScaleInfo>, CloudError> {
        let batch = self.receive_batch().await?;

        let mut ignored = Vec::new();
        let mut scale_outs = Vec::new();
        let mut instance_ids = BTreeSet::new();

        for message in &batch {
            let activity = match decode_activity(message) {
                Ok(activity) => activity,
                Err(err) => {
                    error!(cluster = %self.cluster, error = %err, "Skipping malformed queue message");
                    counter!("autoscaler_queue_messages_malformed_total").increment(1);
                    continue;
                }
            };

            if activity.event != SCALE_OUT_SUCCESS {
                info!(cluster = %self.cluster, event = %activity.event, "Ignoring scaling activity");
                ignored.push(activity.receipt_handle);
                continue;
            }

            debug!(
                cluster = %self.cluster,
                instances = activity.content.instance_ids.len(),
                "Scale-out activity received"
            );
            instance_ids.extend(activity.content.instance_ids.iter().cloned());
            scale_outs.push(activity);
        }

        if !ignored.is_empty() {
            if let Err(err) = self.messages.batch_delete(&self.queue, &ignored).await {
                error!(cluster = %self.cluster, error = %err, "Failed to delete ignored messages");
            }
        }

        if instance_ids.is_empty() {
            return Ok(None);
        }

        let ids: Vec<String> = instance_ids.into_iter().collect();
        let resolved = self.instances.private_ips(&ids).await?;

        let mut info = ScaleInfo::default();
        for activity in scale_outs {
            let ids = &activity.content.instance_ids;
            if !ids.iter().all(|id| resolved.contains_key(id)) {
                warn!(
                    cluster = %self.cluster,
                    unresolved = ids.iter().filter(|id| !resolved.contains_key(*id)).count(),
                    "Scale-out message kept until all its instances resolve"
                );
                info.deferred += 1;
                continue;
            }
            for id in ids {
                if let Some(ip) = resolved.get(id) {
                    info.instances.insert(id.clone(), ip.clone());
                }
            }
            info.receipt_handles.push(activity.receipt_handle);
        }

        if info.instances.is_empty() {
            warn!(cluster = %self.cluster, requested = ids.len(), resolved = resolved.len(), "No scale-out message fully resolved");
            return Ok(None);
        }

        Ok(Some(info))
    }

    /// Delete messages one by one, logging failures.
    pub async fn acknowledge(&self, receipt_handles: &[String]) -> usize {
        let mut deleted = 0;
        for handle in receipt_handles {
            match self.messages.delete(&self.queue, handle).await {
                Ok(()) => deleted += 1,
                Err(err) => {
                    error!(cluster = %self.cluster, error = %err, "Failed to delete consumed message");
                }
            }
        }
        deleted
    }
}
