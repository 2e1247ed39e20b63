//! Database migrations for the autoscaler control plane.
//!
//! This module contains all database migrations using SeaORM Migration.

pub use sea_orm_migration::prelude::*;

mod m2026_01_05_090000_create_operation_records;
mod m2026_01_05_090100_create_scale_locks;
mod m2026_01_05_090200_create_control_leases;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m2026_01_05_090000_create_operation_records::Migration),
            Box::new(m2026_01_05_090100_create_scale_locks::Migration),
            Box::new(m2026_01_05_090200_create_control_leases::Migration),
        ]
    }
}
