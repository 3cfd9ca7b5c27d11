//! Migration to create the transactions table for deposit/withdrawal confirmation tracking
//!
//! Rows are never deleted; terminal rows double as the settlement audit trail.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Transactions::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Transactions::TxId)
                            .string_len(128)
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(Transactions::UserId).string().not_null())
                    .col(ColumnDef::new(Transactions::UserAddress).string().not_null())
                    .col(ColumnDef::new(Transactions::TxType).string_len(16).not_null())
                    .col(
                        ColumnDef::new(Transactions::Status)
                            .string_len(16)
                            .not_null()
                            .default("pending"),
                    )
                    .col(ColumnDef::new(Transactions::StxAmount).big_integer().null())
                    .col(ColumnDef::new(Transactions::PlmdAmount).big_integer().null())
                    .col(ColumnDef::new(Transactions::Nav).big_integer().null())
                    .col(ColumnDef::new(Transactions::Fee).big_integer().null())
                    .col(ColumnDef::new(Transactions::NetAmount).big_integer().null())
                    .col(ColumnDef::new(Transactions::BlockHeight).big_integer().null())
                    .col(
                        ColumnDef::new(Transactions::RetryCount)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(Transactions::LastPolledAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(Transactions::ConfirmedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(Transactions::TimeoutAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(ColumnDef::new(Transactions::ErrorMessage).text().null())
                    .col(
                        ColumnDef::new(Transactions::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(Transactions::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .to_owned(),
            )
            .await?;

        // Per-user history listing
        manager
            .create_index(
                Index::create()
                    .name("idx_transactions_user_id")
                    .table(Transactions::Table)
                    .col(Transactions::UserId)
                    .col(Transactions::CreatedAt)
                    .to_owned(),
            )
            .await?;

        // Timeout reconciliation scans pending rows past their deadline
        manager
            .create_index(
                Index::create()
                    .name("idx_transactions_status_timeout_at")
                    .table(Transactions::Table)
                    .col(Transactions::Status)
                    .col(Transactions::TimeoutAt)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Transactions::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum Transactions {
    Table,
    TxId,
    UserId,
    UserAddress,
    TxType,
    Status,
    StxAmount,
    PlmdAmount,
    Nav,
    Fee,
    NetAmount,
    BlockHeight,
    RetryCount,
    LastPolledAt,
    ConfirmedAt,
    TimeoutAt,
    ErrorMessage,
    CreatedAt,
    UpdatedAt,
}
