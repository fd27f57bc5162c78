//! Migration to create the connections table.
//!
//! Each row holds one account's credentials for one provider configuration. The
//! credential payload is stored only as ciphertext; `auth_mode` and `expires_at` are
//! non-secret copies kept for listing. `version` backs conditional writes.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Connections::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Connections::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(Connections::AccountId).uuid().not_null())
                    .col(
                        ColumnDef::new(Connections::ProviderConfigKey)
                            .text()
                            .not_null(),
                    )
                    .col(ColumnDef::new(Connections::ConnectionId).text().not_null())
                    .col(ColumnDef::new(Connections::AuthMode).text().not_null())
                    .col(
                        ColumnDef::new(Connections::CredentialsCiphertext)
                            .binary()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(Connections::ExpiresAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(Connections::Version)
                            .big_integer()
                            .not_null()
                            .default(1),
                    )
                    .col(
                        ColumnDef::new(Connections::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(Connections::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_connections_account_config_connection")
                    .table(Connections::Table)
                    .col(Connections::AccountId)
                    .col(Connections::ProviderConfigKey)
                    .col(Connections::ConnectionId)
                    .unique()
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_connections_account_id")
                    .table(Connections::Table)
                    .col(Connections::AccountId)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(
                Index::drop()
                    .name("idx_connections_account_config_connection")
                    .to_owned(),
            )
            .await?;

        manager
            .drop_index(Index::drop().name("idx_connections_account_id").to_owned())
            .await?;

        manager
            .drop_table(Table::drop().table(Connections::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum Connections {
    Table,
    Id,
    AccountId,
    ProviderConfigKey,
    ConnectionId,
    AuthMode,
    CredentialsCiphertext,
    ExpiresAt,
    Version,
    CreatedAt,
    UpdatedAt,
}
