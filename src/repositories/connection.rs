//! Connection store
//!
//! Persists connections with their credentials sealed by the [`EncryptionManager`].
//! Callers only ever see decrypted [`Connection`] values. Writes are conditioned on
//! the `version` the caller read, so two writers racing on one connection cannot
//! silently overwrite each other.

use chrono::{DateTime, Utc};
use sea_orm::prelude::DateTimeWithTimeZone;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, Condition, DatabaseConnection, DbErr, EntityTrait,
    QueryFilter, QueryOrder, Set,
};
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

use crate::crypto::{CryptoError, EncryptionManager};
use crate::error::is_unique_violation;
use crate::models::connection::{self, Entity as ConnectionEntity};
use crate::models::{AuthMode, Connection, ConnectionKey, ConnectionSummary, Credentials};

/// Errors raised by the connection store
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] DbErr),
    #[error("failed to encrypt credentials for {key}: {source}")]
    Encryption {
        key: ConnectionKey,
        #[source]
        source: CryptoError,
    },
    #[error("failed to decrypt credentials for {key}: {source}")]
    Decryption {
        key: ConnectionKey,
        #[source]
        source: CryptoError,
    },
    #[error("connection {key} changed since version {expected} was read")]
    VersionConflict { key: ConnectionKey, expected: i64 },
    #[error("connection {0} not found")]
    NotFound(ConnectionKey),
    #[error("connection {0} already exists")]
    AlreadyExists(ConnectionKey),
    #[error("connection {key} is corrupt: {reason}")]
    Corrupt { key: ConnectionKey, reason: String },
}

/// Outcome of [`ConnectionStore::reencrypt_stale`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReencryptionReport {
    pub scanned: usize,
    pub reencrypted: usize,
    /// Rows written by someone else between read and re-seal
    pub conflicts: usize,
    /// Rows that could not be opened with any configured key
    pub failed: usize,
}

/// Encrypted, version-guarded persistence for connections
#[derive(Debug, Clone)]
pub struct ConnectionStore {
    /// Database connection pool
    pub db: Arc<DatabaseConnection>,
    encryption: Arc<EncryptionManager>,
}

impl ConnectionStore {
    pub fn new(db: Arc<DatabaseConnection>, encryption: Arc<EncryptionManager>) -> Self {
        Self { db, encryption }
    }

    /// Stores a new connection at version 1.
    ///
    /// Called by the authorization-code exchange once it holds initial credentials.
    pub async fn create(
        &self,
        key: &ConnectionKey,
        credentials: Credentials,
    ) -> Result<Connection, StoreError> {
        let ciphertext = self.seal(key, &credentials)?;
        let now = Utc::now();

        let active = connection::ActiveModel {
            id: Set(Uuid::new_v4()),
            account_id: Set(key.account_id),
            provider_config_key: Set(key.provider_config_key.clone()),
            connection_id: Set(key.connection_id.clone()),
            auth_mode: Set(credentials.auth_mode().as_str().to_string()),
            credentials_ciphertext: Set(ciphertext),
            expires_at: Set(credentials.expires_at().map(Into::into)),
            version: Set(1),
            created_at: Set(now.into()),
            updated_at: Set(now.into()),
        };

        match active.insert(&*self.db).await {
            Ok(_) => Ok(Connection {
                key: key.clone(),
                credentials,
                version: 1,
                created_at: now,
                updated_at: now,
            }),
            Err(err) if is_unique_violation(&err) => Err(StoreError::AlreadyExists(key.clone())),
            Err(err) => Err(err.into()),
        }
    }

    /// Fetches and decrypts a connection
    pub async fn load(&self, key: &ConnectionKey) -> Result<Option<Connection>, StoreError> {
        match self.find_row(key).await? {
            Some(row) => self.open(row).map(Some),
            None => Ok(None),
        }
    }

    /// Persists new credentials for a connection read at `connection.version`.
    ///
    /// Returns the stored connection carrying its new version, or
    /// [`StoreError::VersionConflict`] if another writer committed first.
    pub async fn save(&self, connection: &Connection) -> Result<Connection, StoreError> {
        let key = &connection.key;
        let ciphertext = self.seal(key, &connection.credentials)?;
        let now = Utc::now();
        let next_version = connection.version + 1;

        let expires_at: Option<DateTimeWithTimeZone> =
            connection.credentials.expires_at().map(Into::into);
        let updated_at: DateTimeWithTimeZone = now.into();

        let result = ConnectionEntity::update_many()
            .col_expr(
                connection::Column::CredentialsCiphertext,
                Expr::value(ciphertext),
            )
            .col_expr(
                connection::Column::AuthMode,
                Expr::value(connection.credentials.auth_mode().as_str()),
            )
            .col_expr(connection::Column::ExpiresAt, Expr::value(expires_at))
            .col_expr(connection::Column::Version, Expr::value(next_version))
            .col_expr(connection::Column::UpdatedAt, Expr::value(updated_at))
            .filter(key_condition(key))
            .filter(connection::Column::Version.eq(connection.version))
            .exec(&*self.db)
            .await?;

        if result.rows_affected == 0 {
            return match self.find_row(key).await? {
                Some(_) => Err(StoreError::VersionConflict {
                    key: key.clone(),
                    expected: connection.version,
                }),
                None => Err(StoreError::NotFound(key.clone())),
            };
        }

        Ok(Connection {
            version: next_version,
            updated_at: now,
            ..connection.clone()
        })
    }

    /// Lists an account's connections without decrypting anything
    pub async fn list(&self, account_id: Uuid) -> Result<Vec<ConnectionSummary>, StoreError> {
        let rows = ConnectionEntity::find()
            .filter(connection::Column::AccountId.eq(account_id))
            .order_by_asc(connection::Column::ProviderConfigKey)
            .order_by_asc(connection::Column::ConnectionId)
            .all(&*self.db)
            .await?;

        rows.into_iter()
            .map(|row| {
                let key = row_key(&row);
                let auth_mode = parse_auth_mode(&key, &row.auth_mode)?;
                Ok(ConnectionSummary {
                    key,
                    auth_mode,
                    expires_at: row.expires_at.map(|at| at.with_timezone(&Utc)),
                    version: row.version,
                    created_at: row.created_at.with_timezone(&Utc),
                    updated_at: row.updated_at.with_timezone(&Utc),
                })
            })
            .collect()
    }

    /// Deletes a connection; returns whether it existed
    pub async fn delete(&self, key: &ConnectionKey) -> Result<bool, StoreError> {
        let result = ConnectionEntity::delete_many()
            .filter(key_condition(key))
            .exec(&*self.db)
            .await?;
        Ok(result.rows_affected > 0)
    }

    /// Re-seals every record not encrypted under the current key
    pub async fn reencrypt_stale(&self) -> Result<ReencryptionReport, StoreError> {
        let mut report = ReencryptionReport::default();
        let rows = ConnectionEntity::find()
            .order_by_asc(connection::Column::CreatedAt)
            .all(&*self.db)
            .await?;

        for row in rows {
            report.scanned += 1;
            let key = row_key(&row);

            match self.encryption.needs_reencryption(&row.credentials_ciphertext) {
                Ok(false) => continue,
                Ok(true) => {}
                Err(source) => {
                    tracing::warn!(connection = %key, error = %source, "Skipping unreadable credential blob");
                    report.failed += 1;
                    continue;
                }
            }

            let connection = match self.open(row) {
                Ok(connection) => connection,
                Err(err) => {
                    tracing::warn!(connection = %key, error = %err, "Skipping connection that cannot be decrypted");
                    report.failed += 1;
                    continue;
                }
            };

            match self.save(&connection).await {
                Ok(_) => report.reencrypted += 1,
                Err(StoreError::VersionConflict { .. }) | Err(StoreError::NotFound(_)) => {
                    report.conflicts += 1
                }
                Err(err) => return Err(err),
            }
        }

        tracing::info!(
            scanned = report.scanned,
            reencrypted = report.reencrypted,
            conflicts = report.conflicts,
            failed = report.failed,
            key_id = %self.encryption.current_key_id(),
            "Credential re-encryption pass finished"
        );
        Ok(report)
    }

    async fn find_row(&self, key: &ConnectionKey) -> Result<Option<connection::Model>, StoreError> {
        Ok(ConnectionEntity::find()
            .filter(key_condition(key))
            .one(&*self.db)
            .await?)
    }

    fn seal(&self, key: &ConnectionKey, credentials: &Credentials) -> Result<Vec<u8>, StoreError> {
        self.encryption
            .encrypt_credentials(key, credentials)
            .map_err(|source| StoreError::Encryption {
                key: key.clone(),
                source,
            })
    }

    fn open(&self, row: connection::Model) -> Result<Connection, StoreError> {
        let key = row_key(&row);
        let credentials = self
            .encryption
            .decrypt_credentials(&key, &row.credentials_ciphertext)
            .map_err(|source| {
                tracing::error!(connection = %key, "Credential decryption failed");
                StoreError::Decryption {
                    key: key.clone(),
                    source,
                }
            })?;

        let stored_mode = parse_auth_mode(&key, &row.auth_mode)?;
        if stored_mode != credentials.auth_mode() {
            return Err(StoreError::Corrupt {
                key,
                reason: format!(
                    "auth_mode column is {} but payload holds {}",
                    stored_mode,
                    credentials.auth_mode()
                ),
            });
        }

        Ok(Connection {
            key,
            credentials,
            version: row.version,
            created_at: to_utc(row.created_at),
            updated_at: to_utc(row.updated_at),
        })
    }
}

fn key_condition(key: &ConnectionKey) -> Condition {
    Condition::all()
        .add(connection::Column::AccountId.eq(key.account_id))
        .add(connection::Column::ProviderConfigKey.eq(key.provider_config_key.as_str()))
        .add(connection::Column::ConnectionId.eq(key.connection_id.as_str()))
}

fn row_key(row: &connection::Model) -> ConnectionKey {
    ConnectionKey::new(
        row.account_id,
        row.provider_config_key.clone(),
        row.connection_id.clone(),
    )
}

fn parse_auth_mode(key: &ConnectionKey, value: &str) -> Result<AuthMode, StoreError> {
    value.parse().map_err(|reason| StoreError::Corrupt {
        key: key.clone(),
        reason,
    })
}

fn to_utc(value: DateTimeWithTimeZone) -> DateTime<Utc> {
    value.with_timezone(&Utc)
}
