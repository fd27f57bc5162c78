//! Provider configuration repository
//!
//! This module provides the ProviderConfigRepository struct which encapsulates
//! SeaORM operations for the provider_configs table. Every lookup is account-scoped.

use anyhow::Result;
use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder, Set,
};
use std::sync::Arc;
use uuid::Uuid;

use crate::models::provider_config::{self, Entity as ProviderConfigEntity};

/// Fields an operator supplies when creating or editing a provider configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderConfigInput {
    pub provider: String,
    pub oauth_client_id: String,
    pub oauth_client_secret: String,
    pub oauth_scopes: Vec<String>,
}

/// Repository for provider configuration database operations
#[derive(Debug, Clone)]
pub struct ProviderConfigRepository {
    /// Database connection pool
    pub db: Arc<DatabaseConnection>,
}

impl ProviderConfigRepository {
    /// Creates a new ProviderConfigRepository instance
    ///
    /// # Arguments
    ///
    /// * `db` - Database connection pool
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    /// Finds the configuration an account registered under `unique_key`
    ///
    /// # Arguments
    ///
    /// * `account_id` - Owning account
    /// * `unique_key` - The provider config key connections reference
    ///
    /// # Returns
    ///
    /// Returns `Ok(None)` when the account has no such configuration
    pub async fn find(
        &self,
        account_id: Uuid,
        unique_key: &str,
    ) -> Result<Option<provider_config::Model>> {
        let config = ProviderConfigEntity::find()
            .filter(provider_config::Column::AccountId.eq(account_id))
            .filter(provider_config::Column::UniqueKey.eq(unique_key))
            .one(&*self.db)
            .await?;
        Ok(config)
    }

    /// Lists every configuration owned by an account, ordered by key
    pub async fn list_by_account(&self, account_id: Uuid) -> Result<Vec<provider_config::Model>> {
        let configs = ProviderConfigEntity::find()
            .filter(provider_config::Column::AccountId.eq(account_id))
            .order_by_asc(provider_config::Column::UniqueKey)
            .all(&*self.db)
            .await?;
        Ok(configs)
    }

    /// Creates the configuration or replaces its fields if the key already exists
    ///
    /// # Arguments
    ///
    /// * `account_id` - Owning account
    /// * `unique_key` - The provider config key
    /// * `input` - Provider name, client credentials and scopes
    ///
    /// # Returns
    ///
    /// Returns the stored configuration
    pub async fn upsert(
        &self,
        account_id: Uuid,
        unique_key: &str,
        input: ProviderConfigInput,
    ) -> Result<provider_config::Model> {
        let now = Utc::now().into();
        let scopes = input.oauth_scopes.join(",");

        match self.find(account_id, unique_key).await? {
            Some(existing) => {
                let mut active: provider_config::ActiveModel = existing.into();
                active.provider = Set(input.provider);
                active.oauth_client_id = Set(input.oauth_client_id);
                active.oauth_client_secret = Set(input.oauth_client_secret);
                active.oauth_scopes = Set(scopes);
                active.updated_at = Set(now);
                Ok(active.update(&*self.db).await?)
            }
            None => {
                let active = provider_config::ActiveModel {
                    id: Set(Uuid::new_v4()),
                    account_id: Set(account_id),
                    unique_key: Set(unique_key.to_string()),
                    provider: Set(input.provider),
                    oauth_client_id: Set(input.oauth_client_id),
                    oauth_client_secret: Set(input.oauth_client_secret),
                    oauth_scopes: Set(scopes),
                    created_at: Set(now),
                    updated_at: Set(now),
                };
                Ok(active.insert(&*self.db).await?)
            }
        }
    }

    /// Deletes a configuration; returns whether a row was removed
    pub async fn delete(&self, account_id: Uuid, unique_key: &str) -> Result<bool> {
        let result = ProviderConfigEntity::delete_many()
            .filter(provider_config::Column::AccountId.eq(account_id))
            .filter(provider_config::Column::UniqueKey.eq(unique_key))
            .exec(&*self.db)
            .await?;
        Ok(result.rows_affected > 0)
    }
}
