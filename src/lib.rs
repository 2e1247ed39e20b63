//! # Autoscaler
//!
//! Elastic scaling control plane for container clusters: keeps each
//! cluster's cloud scaling group wired up, turns scale-out notifications into
//! node joins, drains idle autoscaled nodes, and reconciles the operation log
//! against the job runner.

pub mod cloud;
pub mod cluster;
pub mod config;
pub mod control_plane;
pub mod crypto;
pub mod db;
pub mod elastic;
pub mod error;
pub mod events;
pub mod guard;
pub mod jobs;
pub mod lock;
pub mod models;
pub mod nodes;
pub mod repositories;
pub mod scheduler;
pub mod telemetry;
pub use migration;
