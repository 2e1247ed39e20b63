//! Leader election for the control loops.
//!
//! A [`Lease`] carries a cancellation token that fires when the lease is
//! lost (failed renewal, revocation) or released. Loop bodies hold on to the
//! token and check it between clusters.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, Set,
};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{LockError, is_unique_violation, map_lease_db_err};
use crate::models::control_lease::{ActiveModel, Column, Entity};

/// A held leadership lease.
pub struct Lease {
    key: String,
    owner: String,
    token: CancellationToken,
    heartbeat: Option<JoinHandle<()>>,
}

impl Lease {
    fn new(key: &str, owner: &str, token: CancellationToken) -> Self {
        Self {
            key: key.to_string(),
            owner: owner.to_string(),
            token,
            heartbeat: None,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Token cancelled once the lease stops being valid.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_lost(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.token.cancel();
        if let Some(handle) = self.heartbeat.take() {
            handle.abort();
        }
    }
}

#[async_trait]
pub trait LeaderElector: Send + Sync {
    /// Try once to become leader for `key`. `Ok(None)` means another
    /// replica holds it. The lease token is a child of `parent`.
    async fn try_acquire(
        &self,
        key: &str,
        parent: &CancellationToken,
    ) -> Result<Option<Lease>, LockError>;

    /// Give the lease up so another replica can take over immediately.
    async fn release(&self, lease: Lease) -> Result<(), LockError>;
}

/// Leases stored in the `control_leases` table. A row is owned while its
/// `expires_at` lies in the future; a background heartbeat renews it every
/// third of the ttl and cancels the lease token as soon as a renewal fails.
pub struct DbLeaderElector {
    db: DatabaseConnection,
    owner: String,
    ttl: Duration,
}

impl DbLeaderElector {
    pub fn new(db: DatabaseConnection, ttl: Duration) -> Self {
        Self {
            db,
            owner: Uuid::new_v4().to_string(),
            ttl,
        }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    fn expiry(&self) -> chrono::DateTime<chrono::FixedOffset> {
        let ttl = chrono::Duration::from_std(self.ttl).unwrap_or(chrono::Duration::seconds(30));
        (Utc::now() + ttl).fixed_offset()
    }

    async fn claim(&self, key: &str) -> Result<bool, LockError> {
        let now = Utc::now().fixed_offset();
        let existing = Entity::find_by_id(key.to_string())
            .one(&self.db)
            .await
            .map_err(|err| map_lease_db_err("failed to read control lease", err))?;

        let Some(row) = existing else {
            let active = ActiveModel {
                lease_key: Set(key.to_string()),
                owner: Set(self.owner.clone()),
                expires_at: Set(self.expiry()),
                updated_at: Set(now),
            };
            return match active.insert(&self.db).await {
                Ok(_) => Ok(true),
                Err(err) if is_unique_violation(&err) => Ok(false),
                Err(err) => Err(map_lease_db_err("failed to insert control lease", err)),
            };
        };

        if row.owner != self.owner && row.expires_at > now {
            return Ok(false);
        }

        // Conditional takeover: only succeeds while the row still shows the
        // owner and expiry observed above.
        let mut takeover = Entity::update_many()
            .col_expr(Column::Owner, Expr::value(self.owner.clone()))
            .col_expr(Column::ExpiresAt, Expr::value(self.expiry()))
            .col_expr(Column::UpdatedAt, Expr::value(now))
            .filter(Column::LeaseKey.eq(key))
            .filter(Column::Owner.eq(row.owner.clone()));
        if row.owner != self.owner {
            takeover = takeover.filter(Column::ExpiresAt.lte(now));
        }

        let result = takeover
            .exec(&self.db)
            .await
            .map_err(|err| map_lease_db_err("failed to take over control lease", err))?;

        Ok(result.rows_affected == 1)
    }

    fn spawn_heartbeat(&self, key: &str, token: CancellationToken) -> JoinHandle<()> {
        let db = self.db.clone();
        let owner = self.owner.clone();
        let key = key.to_string();
        let ttl = self.ttl;
        let period = self.ttl / 3;

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = sleep(period) => {
                        let ttl = chrono::Duration::from_std(ttl)
                            .unwrap_or(chrono::Duration::seconds(30));
                        let now = Utc::now();
                        let renewed = Entity::update_many()
                            .col_expr(Column::ExpiresAt, Expr::value((now + ttl).fixed_offset()))
                            .col_expr(Column::UpdatedAt, Expr::value(now.fixed_offset()))
                            .filter(Column::LeaseKey.eq(key.as_str()))
                            .filter(Column::Owner.eq(owner.as_str()))
                            .exec(&db)
                            .await;

                        match renewed {
                            Ok(result) if result.rows_affected == 1 => {
                                debug!(lease = %key, "Control lease renewed");
                            }
                            Ok(_) => {
                                warn!(lease = %key, "Control lease taken over by another replica");
                                token.cancel();
                                break;
                            }
                            Err(err) => {
                                warn!(lease = %key, error = %err, "Control lease renewal failed");
                                token.cancel();
                                break;
                            }
                        }
                    }
                }
            }
        })
    }
}

#[async_trait]
impl LeaderElector for DbLeaderElector {
    async fn try_acquire(
        &self,
        key: &str,
        parent: &CancellationToken,
    ) -> Result<Option<Lease>, LockError> {
        if !self.claim(key).await? {
            return Ok(None);
        }

        let token = parent.child_token();
        let mut lease = Lease::new(key, &self.owner, token.clone());
        lease.heartbeat = Some(self.spawn_heartbeat(key, token));

        info!(lease = %key, owner = %self.owner, "Control lease acquired");
        Ok(Some(lease))
    }

    async fn release(&self, mut lease: Lease) -> Result<(), LockError> {
        lease.token.cancel();
        if let Some(handle) = lease.heartbeat.take() {
            handle.abort();
        }

        Entity::delete_many()
            .filter(Column::LeaseKey.eq(lease.key.as_str()))
            .filter(Column::Owner.eq(self.owner.as_str()))
            .exec(&self.db)
            .await
            .map_err(|err| map_lease_db_err("failed to release control lease", err))?;

        info!(lease = %lease.key, "Control lease released");
        Ok(())
    }
}

/// In-process elector for single-replica runs and tests. [`Self::revoke`]
/// simulates losing a lease.
#[derive(Default)]
pub struct LocalLeaderElector {
    /// key -> (owner, lease token)
    held: Mutex<HashMap<String, (String, CancellationToken)>>,
}

impl LocalLeaderElector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Cancel and drop the lease on `key`, if held. Returns whether a lease
    /// was revoked.
    pub fn revoke(&self, key: &str) -> bool {
        let removed = self
            .held
            .lock()
            .map(|mut held| held.remove(key))
            .unwrap_or(None);
        match removed {
            Some((_, token)) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_held(&self, key: &str) -> bool {
        self.held
            .lock()
            .map(|held| held.get(key).is_some_and(|(_, token)| !token.is_cancelled()))
            .unwrap_or(false)
    }
}

#[async_trait]
impl LeaderElector for LocalLeaderElector {
    async fn try_acquire(
        &self,
        key: &str,
        parent: &CancellationToken,
    ) -> Result<Option<Lease>, LockError> {
        let mut held = self
            .held
            .lock()
            .map_err(|_| LockError::Store("local elector mutex poisoned".to_string()))?;

        if held.get(key).is_some_and(|(_, token)| !token.is_cancelled()) {
            return Ok(None);
        }

        let owner = Uuid::new_v4().to_string();
        let token = parent.child_token();
        held.insert(key.to_string(), (owner.clone(), token.clone()));
        Ok(Some(Lease::new(key, &owner, token)))
    }

    async fn release(&self, lease: Lease) -> Result<(), LockError> {
        lease.token.cancel();
        let mut held = self
            .held
            .lock()
            .map_err(|_| LockError::Store("local elector mutex poisoned".to_string()))?;
        // A revoked lease may have been re-acquired by someone else.
        if held.get(&lease.key).is_some_and(|(owner, _)| *owner == lease.owner) {
            held.remove(&lease.key);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn local_elector_is_exclusive_until_release() {
        let elector = LocalLeaderElector::new();
        let root = CancellationToken::new();

        let lease = elector.try_acquire("/autoscale/auto", &root).await.unwrap();
        let lease = lease.expect("first acquisition succeeds");
        assert!(elector.try_acquire("/autoscale/auto", &root).await.unwrap().is_none());
        assert!(elector.try_acquire("/autoscale/mns", &root).await.unwrap().is_some());

        elector.release(lease).await.unwrap();
        assert!(elector.try_acquire("/autoscale/auto", &root).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn revoke_cancels_lease_token() {
        let elector = LocalLeaderElector::new();
        let root = CancellationToken::new();
        let lease = elector
            .try_acquire("/autoscale/mns", &root)
            .await
            .unwrap()
            .unwrap();

        assert!(elector.revoke("/autoscale/mns"));
        assert!(lease.is_lost());
        assert!(!elector.revoke("/autoscale/mns"));
    }

    #[tokio::test]
    async fn parent_cancellation_reaches_lease() {
        let elector = LocalLeaderElector::new();
        let root = CancellationToken::new();
        let lease = elector
            .try_acquire("/autoscale/auto", &root)
            .await
            .unwrap()
            .unwrap();
        root.cancel();
        assert!(lease.is_lost());
    }
}
