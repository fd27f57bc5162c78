//! Provider configuration entity model
//!
//! This module contains the SeaORM entity model for the provider_configs table,
//! holding each account's OAuth client settings for a provider.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use uuid::Uuid;

/// Account-scoped provider configuration
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "provider_configs")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    pub account_id: Uuid,

    /// Caller-chosen key (the "provider config key" connections reference)
    pub unique_key: String,

    /// Provider template name, e.g. `hubspot`
    pub provider: String,

    pub oauth_client_id: String,

    pub oauth_client_secret: String,

    /// Comma-separated scopes
    pub oauth_scopes: String,

    pub created_at: DateTimeWithTimeZone,

    pub updated_at: DateTimeWithTimeZone,
}

impl Model {
    /// Scopes as a list, ignoring blank entries
    pub fn scopes(&self) -> Vec<String> {
        self.oauth_scopes
            .split(',')
            .map(|scope| scope.trim())
            .filter(|scope| !scope.is_empty())
            .map(str::to_string)
            .collect()
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
