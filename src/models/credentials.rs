//! Credential domain types
//!
//! `Credentials` is the decrypted, structured value stored for a connection. It is a
//! sum type over the supported auth modes; every consumer matches it exhaustively.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

/// Authentication mode declared by a provider template and carried by credentials
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AuthMode {
    #[serde(rename = "OAUTH1")]
    OAuth1,
    #[serde(rename = "OAUTH2")]
    OAuth2,
}

impl AuthMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthMode::OAuth1 => "OAUTH1",
            AuthMode::OAuth2 => "OAUTH2",
        }
    }
}

impl fmt::Display for AuthMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuthMode {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "OAUTH1" => Ok(AuthMode::OAuth1),
            "OAUTH2" => Ok(AuthMode::OAuth2),
            other => Err(format!("unknown auth mode '{}'", other)),
        }
    }
}

/// OAuth 2.0 token set
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OAuth2Credentials {
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    /// `None` means the provider did not declare an expiry
    pub expires_at: Option<DateTime<Utc>>,
    /// Raw token response as returned by the provider
    #[serde(default)]
    pub raw: JsonValue,
}

/// OAuth 1.0a token pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OAuth1Credentials {
    pub oauth_token: String,
    pub oauth_token_secret: String,
    #[serde(default)]
    pub raw: JsonValue,
}

/// Credentials stored for a connection, tagged by `type`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Credentials {
    #[serde(rename = "OAUTH2")]
    OAuth2(OAuth2Credentials),
    #[serde(rename = "OAUTH1")]
    OAuth1(OAuth1Credentials),
}

impl Credentials {
    pub fn auth_mode(&self) -> AuthMode {
        match self {
            Credentials::OAuth2(_) => AuthMode::OAuth2,
            Credentials::OAuth1(_) => AuthMode::OAuth1,
        }
    }

    /// Expiry of the access token, if the auth mode has one
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        match self {
            Credentials::OAuth2(oauth2) => oauth2.expires_at,
            Credentials::OAuth1(_) => None,
        }
    }
}

/// Unique identity of a connection: `(account, provider config key, connection id)`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionKey {
    pub account_id: Uuid,
    pub provider_config_key: String,
    pub connection_id: String,
}

impl ConnectionKey {
    pub fn new(
        account_id: Uuid,
        provider_config_key: impl Into<String>,
        connection_id: impl Into<String>,
    ) -> Self {
        Self {
            account_id,
            provider_config_key: provider_config_key.into(),
            connection_id: connection_id.into(),
        }
    }

    /// Additional authenticated data binding a ciphertext to this connection
    pub fn aad(&self) -> String {
        format!(
            "{}|{}|{}",
            self.account_id, self.provider_config_key, self.connection_id
        )
    }
}

impl fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.account_id, self.provider_config_key, self.connection_id
        )
    }
}

/// A connection with its decrypted credentials
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Connection {
    #[serde(flatten)]
    pub key: ConnectionKey,
    pub credentials: Credentials,
    /// Generation counter used for conditional writes
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Connection {
    /// Copy of this connection carrying replacement credentials, same version
    pub fn with_credentials(&self, credentials: Credentials) -> Self {
        Self {
            credentials,
            ..self.clone()
        }
    }
}

/// List view of a connection; never carries secrets
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionSummary {
    #[serde(flatten)]
    pub key: ConnectionKey,
    pub auth_mode: AuthMode,
    pub expires_at: Option<DateTime<Utc>>,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Non-fatal condition attached to credentials handed back to a caller
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "condition", rename_all = "snake_case")]
pub enum CredentialCondition {
    /// The access token is expired (or a refresh was forced) and no refresh token exists
    RequiresReauthorization {
        expired_at: Option<DateTime<Utc>>,
    },
}

impl CredentialCondition {
    /// Stable code callers can script against
    pub fn code(&self) -> &'static str {
        match self {
            CredentialCondition::RequiresReauthorization { .. } => "REAUTHORIZATION_REQUIRED",
        }
    }
}

/// Credentials ready for use, with an optional advisory condition
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FetchedCredentials {
    pub connection: Connection,
    /// Whether a provider refresh produced these credentials
    pub refreshed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub condition: Option<CredentialCondition>,
}

impl FetchedCredentials {
    pub fn unchanged(connection: Connection) -> Self {
        Self {
            connection,
            refreshed: false,
            condition: None,
        }
    }

    pub fn requires_reauthorization(&self) -> bool {
        matches!(
            self.condition,
            Some(CredentialCondition::RequiresReauthorization { .. })
        )
    }
}
