//! # Error Handling
//!
//! Typed errors for the control plane. Collaborator failures keep their own
//! enums so callers can match on the kinds that drive control flow
//! (`CloudError::NoMessage`, `JobRunnerError::NotFound`), and everything
//! converges into [`ScaleError`] at the operation boundary.

use sea_orm::DbErr;
use thiserror::Error;
use tracing::error;

use crate::crypto::CryptoError;
use crate::models::RecordStatus;

/// Errors surfaced by the cloud collaborators (scaling group, queue,
/// instance directory, identity).
#[derive(Debug, Error)]
pub enum CloudError {
    /// The queue had nothing to deliver within the receive wait
    #[error("no message available")]
    NoMessage,
    #[error("cloud resource not found: {0}")]
    NotFound(String),
    #[error("cloud resource already exists: {0}")]
    AlreadyExists(String),
    #[error("cloud api call {operation} failed: {message}")]
    Api {
        operation: &'static str,
        message: String,
    },
}

impl CloudError {
    pub fn api(operation: &'static str, message: impl Into<String>) -> Self {
        CloudError::Api {
            operation,
            message: message.into(),
        }
    }
}

/// Errors surfaced by the asynchronous job runner.
#[derive(Debug, Error)]
pub enum JobRunnerError {
    #[error("job {job_id} not found")]
    NotFound { job_id: i64 },
    #[error("job submission rejected: {0}")]
    Rejected(String),
    #[error("job runner unreachable: {0}")]
    Transport(String),
}

/// Errors surfaced by the cluster directory, resource info and label
/// collaborators.
#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("cluster {0} not found")]
    NotFound(String),
    #[error("organization {0} not found")]
    OrgNotFound(i64),
    #[error("cluster service call failed: {0}")]
    Api(String),
}

/// Errors from the key-value store, the scale lock and leader election.
#[derive(Debug, Error)]
pub enum LockError {
    #[error("key-value store error: {0}")]
    Store(String),
    #[error("gave up on {key} after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        key: String,
        attempts: u32,
        last_error: String,
    },
    #[error("lease {0} is held by another replica")]
    LeaseHeld(String),
    #[error("database error while handling lease: {context}")]
    Database {
        context: &'static str,
        #[source]
        source: DbErr,
    },
}

/// Crate-level error returned by control-plane operations.
#[derive(Debug, Error)]
pub enum ScaleError {
    #[error("database operation failed: {context}")]
    Database {
        context: &'static str,
        #[source]
        source: DbErr,
    },
    #[error("invalid ops config for cluster {cluster}: {reason}")]
    InvalidOpsConfig { cluster: String, reason: String },
    #[error("found {count} scaling groups named {name}; expected at most one")]
    AmbiguousScalingGroup { name: String, count: usize },
    #[error("scaling group {0} does not exist")]
    ScalingGroupMissing(String),
    #[error("scaling rule {0} does not exist")]
    ScalingRuleMissing(String),
    #[error("cluster type '{0}' does not support node operations")]
    UnsupportedCluster(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("operation record {0} not found")]
    RecordNotFound(i64),
    #[error("operation record {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: i64,
        from: RecordStatus,
        to: RecordStatus,
    },
    #[error(transparent)]
    Cloud(#[from] CloudError),
    #[error(transparent)]
    JobRunner(#[from] JobRunnerError),
    #[error(transparent)]
    Cluster(#[from] ClusterError),
    #[error(transparent)]
    Lock(#[from] LockError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error("failed to encode record detail: {0}")]
    Detail(#[from] serde_json::Error),
}

/// Log a database failure with its context and wrap it.
pub(crate) fn map_db_err(context: &'static str, err: DbErr) -> ScaleError {
    error!(error = ?err, context, "Database operation failed");
    ScaleError::Database {
        context,
        source: err,
    }
}

/// Lease flavour of [`map_db_err`].
pub(crate) fn map_lease_db_err(context: &'static str, err: DbErr) -> LockError {
    error!(error = ?err, context, "Database operation failed");
    LockError::Database {
        context,
        source: err,
    }
}

/// Whether a database error is a primary-key or unique-index violation.
pub(crate) fn is_unique_violation(error: &DbErr) -> bool {
    use sea_orm::RuntimeErr;

    const PG_UNIQUE: &str = "23505";
    const SQLITE_DUPLICATE_CODES: &[&str] = &["1555", "2067"];

    let runtime_err = match error {
        DbErr::Query(RuntimeErr::SqlxError(sqlx_err))
        | DbErr::Exec(RuntimeErr::SqlxError(sqlx_err)) => sqlx_err,
        _ => return false,
    };

    let Some(db_error) = runtime_err.as_database_error() else {
        return false;
    };

    if db_error.is_unique_violation() {
        return true;
    }

    match db_error.code() {
        Some(code) => {
            let code: &str = &code;
            code == PG_UNIQUE || SQLITE_DUPLICATE_CODES.contains(&code)
        }
        None => false,
    }
}
