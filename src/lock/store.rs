//! Key-value stores backing the cluster scale lock.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use sea_orm::{ActiveModelTrait, DatabaseConnection, EntityTrait, Set};

use crate::error::{LockError, is_unique_violation};
use crate::models::scale_lock::{ActiveModel, Entity};

/// Minimal key-value contract: presence of a key is what matters.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Create or overwrite `key`.
    async fn put(&self, key: &str, value: Option<String>) -> Result<(), LockError>;

    /// Remove `key`; removing a missing key succeeds.
    async fn remove(&self, key: &str) -> Result<(), LockError>;

    async fn exists(&self, key: &str) -> Result<bool, LockError>;
}

/// Store over the `scale_locks` table.
pub struct DbKeyValueStore {
    db: DatabaseConnection,
}

impl DbKeyValueStore {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }
}

fn store_err(context: &str, err: sea_orm::DbErr) -> LockError {
    LockError::Store(format!("{context}: {err}"))
}

#[async_trait]
impl KeyValueStore for DbKeyValueStore {
    async fn put(&self, key: &str, value: Option<String>) -> Result<(), LockError> {
        let existing = Entity::find_by_id(key.to_string())
            .one(&self.db)
            .await
            .map_err(|err| store_err("failed to read lock key", err))?;

        match existing {
            Some(row) => {
                let mut active: ActiveModel = row.into();
                active.value = Set(value);
                active
                    .update(&self.db)
                    .await
                    .map_err(|err| store_err("failed to update lock key", err))?;
            }
            None => {
                let active = ActiveModel {
                    lock_key: Set(key.to_string()),
                    value: Set(value),
                    created_at: Set(Utc::now().fixed_offset()),
                };
                match active.insert(&self.db).await {
                    Ok(_) => {}
                    // Another writer created it first; the key is present either way.
                    Err(err) if is_unique_violation(&err) => {}
                    Err(err) => return Err(store_err("failed to insert lock key", err)),
                }
            }
        }
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), LockError> {
        Entity::delete_by_id(key.to_string())
            .exec(&self.db)
            .await
            .map_err(|err| store_err("failed to delete lock key", err))?;
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, LockError> {
        Entity::find_by_id(key.to_string())
            .one(&self.db)
            .await
            .map(|row| row.is_some())
            .map_err(|err| store_err("failed to read lock key", err))
    }
}

/// In-process store for single-replica runs and tests.
#[derive(Default)]
pub struct MemoryKeyValueStore {
    values: Mutex<HashMap<String, Option<String>>>,
}

impl MemoryKeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_values<T>(
        &self,
        f: impl FnOnce(&mut HashMap<String, Option<String>>) -> T,
    ) -> Result<T, LockError> {
        let mut guard = self
            .values
            .lock()
            .map_err(|_| LockError::Store("memory store mutex poisoned".to_string()))?;
        Ok(f(&mut guard))
    }
}

#[async_trait]
impl KeyValueStore for MemoryKeyValueStore {
    async fn put(&self, key: &str, value: Option<String>) -> Result<(), LockError> {
        self.with_values(|values| {
            values.insert(key.to_string(), value);
        })
    }

    async fn remove(&self, key: &str) -> Result<(), LockError> {
        self.with_values(|values| {
            values.remove(key);
        })
    }

    async fn exists(&self, key: &str) -> Result<bool, LockError> {
        self.with_values(|values| values.contains_key(key))
    }
}
