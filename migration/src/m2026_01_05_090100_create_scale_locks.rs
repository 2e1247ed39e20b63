//! Migration to create the scale_locks table.
//!
//! Presence of a row means the keyed cluster must not be auto-scaled.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(ScaleLocks::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(ScaleLocks::LockKey)
                            .string_len(255)
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(ScaleLocks::Value).text().null())
                    .col(
                        ColumnDef::new(ScaleLocks::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(ScaleLocks::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum ScaleLocks {
    Table,
    LockKey,
    Value,
    CreatedAt,
}
