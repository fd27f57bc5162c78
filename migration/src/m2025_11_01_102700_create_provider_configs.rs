//! Migration to create the provider_configs table.
//!
//! Provider configurations are account-scoped OAuth client settings keyed by a
//! caller-chosen unique key, pointing at a provider template by name.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(ProviderConfigs::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(ProviderConfigs::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(ProviderConfigs::AccountId).uuid().not_null())
                    .col(ColumnDef::new(ProviderConfigs::UniqueKey).text().not_null())
                    .col(ColumnDef::new(ProviderConfigs::Provider).text().not_null())
                    .col(
                        ColumnDef::new(ProviderConfigs::OauthClientId)
                            .text()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(ProviderConfigs::OauthClientSecret)
                            .text()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(ProviderConfigs::OauthScopes)
                            .text()
                            .not_null()
                            .default(""),
                    )
                    .col(
                        ColumnDef::new(ProviderConfigs::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(ProviderConfigs::UpdatedAt)
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
                    .name("idx_provider_configs_account_unique_key")
                    .table(ProviderConfigs::Table)
                    .col(ProviderConfigs::AccountId)
                    .col(ProviderConfigs::UniqueKey)
                    .unique()
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(
                Index::drop()
                    .name("idx_provider_configs_account_unique_key")
                    .to_owned(),
            )
            .await?;

        manager
            .drop_table(Table::drop().table(ProviderConfigs::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum ProviderConfigs {
    Table,
    Id,
    AccountId,
    UniqueKey,
    Provider,
    OauthClientId,
    OauthClientSecret,
    OauthScopes,
    CreatedAt,
    UpdatedAt,
}
