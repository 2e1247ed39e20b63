//! Database connection and pool management.
//!
//! Postgres in production; the same code path runs against SQLite in tests.

use std::time::Duration;

use sea_orm::{ConnectOptions, ConnectionTrait, Database, DatabaseConnection, DbErr, Statement};
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::config::AppConfig;

#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("database URL is empty")]
    MissingUrl,
    #[error("failed to connect to database after {attempts} attempts: {source}")]
    ConnectionFailed {
        attempts: u32,
        #[source]
        source: DbErr,
    },
    #[error("database health check failed: {0}")]
    HealthCheck(#[source] DbErr),
}

fn connect_options(cfg: &AppConfig) -> ConnectOptions {
    let mut opt = ConnectOptions::new(&cfg.database_url);
    opt.max_connections(cfg.db_max_connections)
        .acquire_timeout(Duration::from_millis(cfg.db_acquire_timeout_ms))
        .idle_timeout(Duration::from_secs(600))
        .max_lifetime(Duration::from_secs(1800))
        .sqlx_logging(true)
        .sqlx_logging_level(log::LevelFilter::Debug);
    opt
}

/// Open the pool, retrying `db_connect_attempts` times with the configured
/// backoff. Replicas started together with their database wait for it
/// instead of exiting.
pub async fn init_pool(cfg: &AppConfig) -> Result<DatabaseConnection, DatabaseError> {
    if cfg.database_url.trim().is_empty() {
        return Err(DatabaseError::MissingUrl);
    }

    let opt = connect_options(cfg);
    let attempts = cfg.db_connect_attempts.max(1);
    let mut attempt = 1;

    loop {
        match Database::connect(opt.clone()).await {
            Ok(conn) => {
                info!(attempt, max_connections = cfg.db_max_connections, "Connected to database");
                return Ok(conn);
            }
            Err(err) if attempt >= attempts => {
                error!(attempts, error = %err, "Giving up connecting to database");
                return Err(DatabaseError::ConnectionFailed {
                    attempts,
                    source: err,
                });
            }
            Err(err) => {
                let delay = cfg.db_connect_backoff(attempt);
                warn!(attempt, attempts, error = %err, retry_in = ?delay, "Database connect failed");
                sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

/// `SELECT 1` against the pool.
pub async fn health_check(db: &DatabaseConnection) -> Result<(), DatabaseError> {
    let stmt = Statement::from_string(db.get_database_backend(), "SELECT 1".to_string());
    db.query_one(stmt)
        .await
        .map_err(DatabaseError::HealthCheck)?;
    Ok(())
}
