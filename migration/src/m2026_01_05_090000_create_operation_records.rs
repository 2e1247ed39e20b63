//! Migration to create the operation_records table.
//!
//! One row per scaling-affecting action (node add/remove, label updates,
//! scheduled deletions). Rows are keyed by an auto-increment id and queried
//! by cluster, record type, status and pipeline id.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(OperationRecords::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(OperationRecords::Id)
                            .big_integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(OperationRecords::RecordType)
                            .string_len(32)
                            .not_null(),
                    )
                    .col(ColumnDef::new(OperationRecords::UserId).text().not_null())
                    .col(
                        ColumnDef::new(OperationRecords::OrgId)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(OperationRecords::ClusterName)
                            .text()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(OperationRecords::Status)
                            .string_len(16)
                            .not_null()
                            .default("processing"),
                    )
                    .col(
                        ColumnDef::new(OperationRecords::Detail)
                            .text()
                            .not_null()
                            .default(""),
                    )
                    .col(
                        ColumnDef::new(OperationRecords::PipelineId)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(OperationRecords::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(OperationRecords::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        // Latest-record lookups per cluster and type
        manager
            .create_index(
                Index::create()
                    .name("idx_operation_records_cluster_type_status")
                    .table(OperationRecords::Table)
                    .col(OperationRecords::ClusterName)
                    .col(OperationRecords::RecordType)
                    .col(OperationRecords::Status)
                    .to_owned(),
            )
            .await?;

        // Reconciliation scans
        manager
            .create_index(
                Index::create()
                    .name("idx_operation_records_status_pipeline")
                    .table(OperationRecords::Table)
                    .col(OperationRecords::Status)
                    .col(OperationRecords::PipelineId)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(
                Index::drop()
                    .name("idx_operation_records_cluster_type_status")
                    .to_owned(),
            )
            .await?;

        manager
            .drop_index(
                Index::drop()
                    .name("idx_operation_records_status_pipeline")
                    .to_owned(),
            )
            .await?;

        manager
            .drop_table(Table::drop().table(OperationRecords::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum OperationRecords {
    Table,
    Id,
    RecordType,
    UserId,
    OrgId,
    ClusterName,
    Status,
    Detail,
    PipelineId,
    CreatedAt,
    UpdatedAt,
}
