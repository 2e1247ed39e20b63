//! # Autoscaler admin CLI
//!
//! Schema migration, operation log inspection and cluster scale lock
//! management against the control plane database.

use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use autoscaler::{
    config::ConfigLoader,
    db,
    lock::{DbKeyValueStore, ScaleLock},
    migration::{Migrator, MigratorTrait},
    models::{RecordStatus, RecordType},
    repositories::{OperationRecordRepository, RecordFilter},
    telemetry::init_tracing,
};
use clap::{Parser, Subcommand};
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "autoscaler", version, about = "Elastic scaling control plane admin")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Apply pending schema migrations
    Migrate,
    /// List operation records, newest first
    Records {
        #[arg(long)]
        cluster: Option<String>,
        /// Record type, repeatable (e.g. addEssNodes)
        #[arg(long = "type")]
        record_types: Vec<String>,
        /// Record status, repeatable (e.g. failed)
        #[arg(long = "status")]
        statuses: Vec<String>,
        #[arg(long)]
        user: Option<String>,
        #[arg(long)]
        org: Option<i64>,
        #[arg(long, default_value_t = 1)]
        page: u64,
        #[arg(long, default_value_t = 20)]
        page_size: u64,
    },
    /// Move a terminal record back to processing
    ResetRecord { id: i64 },
    /// Show whether a cluster's scale lock is set
    LockStatus { cluster: String },
    /// Set a cluster's scale lock
    Lock { cluster: String },
    /// Clear a cluster's scale lock
    Unlock { cluster: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = ConfigLoader::new()
        .load()
        .context("loading configuration")?;
    init_tracing(&config).context("initializing tracing")?;
    info!(profile = %config.profile, "Loaded configuration");

    let db = db::init_pool(&config)
        .await
        .context("initializing database connection pool")?;

    match cli.command {
        Command::Migrate => {
            Migrator::up(&db, None).await.context("applying migrations")?;
            println!("Migrations applied.");
        }
        Command::Records {
            cluster,
            record_types,
            statuses,
            user,
            org,
            page,
            page_size,
        } => {
            let mut filter = RecordFilter {
                org_id: org,
                ..RecordFilter::default()
            }
            .with_page(page, page_size);
            if let Some(cluster) = cluster {
                filter.cluster_names = vec![cluster];
            }
            if let Some(user) = user {
                filter = filter.with_user(user);
            }
            filter.record_types = record_types
                .iter()
                .map(|value| value.parse::<RecordType>().map_err(|err| anyhow!(err)))
                .collect::<Result<_>>()?;
            filter.statuses = statuses
                .iter()
                .map(|value| value.parse::<RecordStatus>().map_err(|err| anyhow!(err)))
                .collect::<Result<_>>()?;

            let page = OperationRecordRepository::new(db)
                .query(&filter)
                .await
                .context("querying operation records")?;
            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({
                    "total": page.total,
                    "list": page.records,
                }))?
            );
        }
        Command::ResetRecord { id } => {
            let record = OperationRecordRepository::new(db)
                .reset(id)
                .await
                .with_context(|| format!("resetting record {id}"))?;
            println!(
                "Record {} ({}) reset to {}.",
                record.id, record.record_type, record.status
            );
        }
        Command::LockStatus { cluster } => {
            let locked = scale_lock(db, &config)
                .is_cluster_locked(&cluster)
                .await
                .with_context(|| format!("reading scale lock of {cluster}"))?;
            println!("{cluster}: {}", if locked { "locked" } else { "unlocked" });
        }
        Command::Lock { cluster } => {
            scale_lock(db, &config)
                .lock_cluster(&cluster)
                .await
                .with_context(|| format!("locking {cluster}"))?;
            println!("{cluster}: locked");
        }
        Command::Unlock { cluster } => {
            scale_lock(db, &config)
                .unlock_cluster(&cluster)
                .await
                .with_context(|| format!("unlocking {cluster}"))?;
            println!("{cluster}: unlocked");
        }
    }

    Ok(())
}

fn scale_lock(db: sea_orm::DatabaseConnection, config: &autoscaler::config::AppConfig) -> ScaleLock {
    ScaleLock::from_config(Arc::new(DbKeyValueStore::new(db)), &config.scale_lock)
}
