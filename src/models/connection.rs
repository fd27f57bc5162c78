//! Connection entity model
//!
//! This module contains the SeaORM entity model for the connections table,
//! which stores encrypted, account-scoped credentials for a provider configuration.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use uuid::Uuid;

/// Stored connection row; credentials exist here only as ciphertext
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "connections")]
pub struct Model {
    /// Surrogate primary key
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    /// Owning account
    pub account_id: Uuid,

    /// Unique key of the provider configuration this connection uses
    pub provider_config_key: String,

    /// Caller-chosen connection identifier (unique per account & config)
    pub connection_id: String,

    /// Plaintext copy of the credential type (OAUTH1|OAUTH2)
    pub auth_mode: String,

    /// Sealed credential payload
    pub credentials_ciphertext: Vec<u8>,

    /// Plaintext copy of the access token expiry
    pub expires_at: Option<DateTimeWithTimeZone>,

    /// Generation counter, bumped on every write
    pub version: i64,

    pub created_at: DateTimeWithTimeZone,

    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
