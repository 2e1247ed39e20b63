//! Migration to create the control_leases table used for leader election
//! between control-plane replicas.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(ControlLeases::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(ControlLeases::LeaseKey)
                            .string_len(255)
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(ControlLeases::Owner).string_len(64).not_null())
                    .col(
                        ColumnDef::new(ControlLeases::ExpiresAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(ControlLeases::UpdatedAt)
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
            .drop_table(Table::drop().table(ControlLeases::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum ControlLeases {
    Table,
    LeaseKey,
    Owner,
    ExpiresAt,
    UpdatedAt,
}
