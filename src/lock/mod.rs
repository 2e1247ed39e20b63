//! # Locks
//!
//! Two different locks live here:
//!
//! - leader election ([`lease`]), which decides which replica runs a control
//!   loop at all;
//! - the cluster scale lock ([`ScaleLock`]), which gates scale actions for a
//!   single cluster after a failed node operation.

pub mod lease;
pub mod store;

use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{info, warn};

use crate::config::ScaleLockConfig;
use crate::error::LockError;

pub use lease::{DbLeaderElector, Lease, LeaderElector, LocalLeaderElector};
pub use store::{DbKeyValueStore, KeyValueStore, MemoryKeyValueStore};

/// Lease key of the resource detection loop.
pub const DETECT_LOCK_KEY: &str = "/autoscale/auto";
/// Lease key of the scale event consumption loop.
pub const CONSUME_LOCK_KEY: &str = "/autoscale/mns";

const SCALE_LOCK_PREFIX: &str = "/autoscale/lock";

pub fn scale_lock_key(cluster_name: &str) -> String {
    format!("{SCALE_LOCK_PREFIX}/{cluster_name}")
}

/// Per-cluster scale lock with bounded, fixed-backoff retries.
#[derive(Clone)]
pub struct ScaleLock {
    store: Arc<dyn KeyValueStore>,
    attempts: u32,
    backoff: Duration,
}

enum LockOp {
    Lock,
    Unlock,
}

impl ScaleLock {
    pub fn new(store: Arc<dyn KeyValueStore>, attempts: u32, backoff: Duration) -> Self {
        Self {
            store,
            attempts: attempts.max(1),
            backoff,
        }
    }

    pub fn from_config(store: Arc<dyn KeyValueStore>, config: &ScaleLockConfig) -> Self {
        Self::new(store, config.attempts, config.backoff())
    }

    pub async fn lock_cluster(&self, cluster_name: &str) -> Result<(), LockError> {
        self.write(cluster_name, LockOp::Lock).await?;
        info!(cluster = %cluster_name, "Cluster scale lock set");
        Ok(())
    }

    pub async fn unlock_cluster(&self, cluster_name: &str) -> Result<(), LockError> {
        self.write(cluster_name, LockOp::Unlock).await?;
        info!(cluster = %cluster_name, "Cluster scale lock cleared");
        Ok(())
    }

    pub async fn is_cluster_locked(&self, cluster_name: &str) -> Result<bool, LockError> {
        let key = scale_lock_key(cluster_name);
        let mut last_error = String::new();

        for attempt in 1..=self.attempts {
            match self.store.exists(&key).await {
                Ok(locked) => return Ok(locked),
                Err(err) => {
                    warn!(key = %key, attempt, error = %err, "Scale lock read failed");
                    last_error = err.to_string();
                }
            }
            if attempt < self.attempts {
                sleep(self.backoff).await;
            }
        }

        Err(LockError::RetriesExhausted {
            key,
            attempts: self.attempts,
            last_error,
        })
    }

    async fn write(&self, cluster_name: &str, op: LockOp) -> Result<(), LockError> {
        let key = scale_lock_key(cluster_name);
        let mut last_error = String::new();

        for attempt in 1..=self.attempts {
            let result = match op {
                LockOp::Lock => self.store.put(&key, None).await,
                LockOp::Unlock => self.store.remove(&key).await,
            };
            match result {
                Ok(()) => return Ok(()),
                Err(err) => {
                    warn!(key = %key, attempt, error = %err, "Scale lock write failed");
                    last_error = err.to_string();
                }
            }
            if attempt < self.attempts {
                sleep(self.backoff).await;
            }
        }

        Err(LockError::RetriesExhausted {
            key,
            attempts: self.attempts,
            last_error,
        })
    }
}
