//! # Error Handling
//!
//! Error taxonomy for credential fetches and refreshes, plus a problem+json
//! [`ApiError`] that callers exposing credvault over HTTP can return directly.

use std::fmt;

use axum::{
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use uuid::Uuid;

use crate::crypto::CryptoError;
use crate::models::{AuthMode, ConnectionKey};
use crate::repositories::connection::StoreError;
use crate::telemetry;

/// Unified API error response structure
#[derive(Debug, Clone, Serialize)]
pub struct ApiError {
    /// HTTP status code for the response
    #[serde(skip_serializing)]
    pub status: StatusCode,
    /// Error code for programmatic handling
    pub code: Box<str>,
    /// Human-readable error message
    pub message: Box<str>,
    /// Additional error details (optional)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Box<serde_json::Value>>,
    /// Suggested retry delay in seconds (optional)
    pub retry_after: Option<u64>,
    /// Correlation trace ID for debugging (optional)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<Box<str>>,
}

impl ApiError {
    /// Create a new API error with the given status code and message
    pub fn new<S: Into<String>>(status: StatusCode, code: S, message: S) -> Self {
        Self {
            status,
            code: code.into().into_boxed_str(),
            message: message.into().into_boxed_str(),
            details: None,
            retry_after: None,
            trace_id: Self::current_trace_id(),
        }
    }

    /// Add details to the error
    pub fn with_details<V: Into<serde_json::Value>>(mut self, details: V) -> Self {
        self.details = Some(Box::new(details.into()));
        self
    }

    /// Set retry after delay
    pub fn with_retry_after(mut self, seconds: u64) -> Self {
        self.retry_after = Some(seconds);
        self
    }

    /// Trace id of the active request context, or a generated correlation id
    fn current_trace_id() -> Option<Box<str>> {
        telemetry::current_trace_id()
            .map(|trace_id| trace_id.into_boxed_str())
            .or_else(|| Some(format!("corr-{}", &Uuid::new_v4().to_string()[..8]).into_boxed_str()))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut headers = HeaderMap::new();
        headers.insert(
            "content-type",
            HeaderValue::from_static("application/problem+json"),
        );

        if let Some(retry_after) = self.retry_after
            && let Ok(header_value) = HeaderValue::from_str(&retry_after.to_string())
        {
            headers.insert("retry-after", header_value);
        }

        (self.status, headers, axum::Json(self)).into_response()
    }
}

pub(crate) fn is_unique_violation(error: &sea_orm::DbErr) -> bool {
    use sea_orm::RuntimeErr;

    const PG_UNIQUE: &str = "23505";
    const SQLITE_DUPLICATE_CODES: &[&str] = &["1555", "2067"];

    let runtime_err = match error {
        sea_orm::DbErr::Query(RuntimeErr::SqlxError(sqlx_err))
        | sea_orm::DbErr::Exec(RuntimeErr::SqlxError(sqlx_err)) => sqlx_err,
        _ => return false,
    };

    let Some(db_error) = runtime_err.as_database_error() else {
        return false;
    };

    if db_error.is_unique_violation() {
        return true;
    }

    db_error
        .code()
        .is_some_and(|code| code == PG_UNIQUE || SQLITE_DUPLICATE_CODES.contains(&code.as_ref()))
}

/// How a failed refresh should be treated by callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshErrorClassification {
    /// The grant is dead; the user must reauthorize
    Permanent,
    /// Worth retrying later
    Transient,
    /// Provider asked us to slow down
    RateLimited,
}

impl RefreshErrorClassification {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Permanent => "permanent",
            Self::Transient => "transient",
            Self::RateLimited => "rate_limited",
        }
    }
}

impl fmt::Display for RefreshErrorClassification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure of a provider refresh. Cloned to every caller waiting on the same refresh.
#[derive(Debug, Clone, Error)]
pub enum RefreshError {
    #[error("token endpoint did not answer within {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
    #[error("network error calling token endpoint: {0}")]
    Network(String),
    #[error(
        "token endpoint rejected refresh with status {status} ({})",
        .error_code.as_deref().unwrap_or("no error code")
    )]
    Rejected {
        status: u16,
        error_code: Option<String>,
        body: String,
        classification: RefreshErrorClassification,
        retry_after: Option<u64>,
    },
    #[error("malformed token response: {0}")]
    MalformedResponse(String),
    #[error("failed to persist refreshed credentials: {0}")]
    Persistence(String),
    #[error("refresh task ended before completing: {0}")]
    Aborted(String),
}

impl RefreshError {
    pub fn classification(&self) -> RefreshErrorClassification {
        match self {
            RefreshError::Rejected { classification, .. } => *classification,
            RefreshError::Timeout { .. }
            | RefreshError::Network(_)
            | RefreshError::MalformedResponse(_)
            | RefreshError::Persistence(_)
            | RefreshError::Aborted(_) => RefreshErrorClassification::Transient,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.classification() != RefreshErrorClassification::Permanent
    }

    /// Stable API error code
    pub fn code(&self) -> &'static str {
        match self {
            RefreshError::Timeout { .. } => "REFRESH_TIMEOUT",
            RefreshError::Network(_) => "REFRESH_NETWORK_ERROR",
            RefreshError::Rejected {
                classification: RefreshErrorClassification::RateLimited,
                ..
            } => "REFRESH_RATE_LIMITED",
            RefreshError::Rejected { .. } => "REFRESH_REJECTED",
            RefreshError::MalformedResponse(_) => "REFRESH_MALFORMED_RESPONSE",
            RefreshError::Persistence(_) | RefreshError::Aborted(_) => "REFRESH_FAILED",
        }
    }
}

/// Errors returned by `ConnectionService::get_credentials`
#[derive(Debug, Error)]
pub enum CredentialsError {
    #[error("connection {key} not found")]
    MissingConnection { key: ConnectionKey },
    #[error("provider config '{provider_config_key}' not found for account {account_id}")]
    MissingProviderConfig {
        account_id: Uuid,
        provider_config_key: String,
    },
    #[error("no template registered for provider '{provider}'")]
    MissingTemplate { provider: String },
    #[error(
        "connection {key} stores {actual} credentials but provider '{provider}' uses {expected}"
    )]
    CredentialTypeMismatch {
        key: ConnectionKey,
        provider: String,
        expected: AuthMode,
        actual: AuthMode,
    },
    #[error("failed to decrypt credentials for {key}: {source}")]
    Decryption {
        key: ConnectionKey,
        #[source]
        source: CryptoError,
    },
    #[error("failed to refresh credentials for {key}: {source}")]
    Refresh {
        key: ConnectionKey,
        #[source]
        source: RefreshError,
    },
    #[error("credential storage error: {0}")]
    Storage(#[source] StoreError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl CredentialsError {
    /// Stable API error code
    pub fn code(&self) -> &'static str {
        match self {
            CredentialsError::MissingConnection { .. } => "UNKNOWN_CONNECTION",
            CredentialsError::MissingProviderConfig { .. } => "UNKNOWN_PROVIDER_CONFIG",
            CredentialsError::MissingTemplate { .. } => "UNSUPPORTED_PROVIDER",
            CredentialsError::CredentialTypeMismatch { .. } => "CREDENTIAL_TYPE_MISMATCH",
            CredentialsError::Decryption { .. } => "DECRYPTION_FAILED",
            CredentialsError::Refresh { source, .. } => source.code(),
            CredentialsError::Storage(_) | CredentialsError::Other(_) => "INTERNAL_SERVER_ERROR",
        }
    }
}

impl From<StoreError> for CredentialsError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::Decryption { key, source } => CredentialsError::Decryption { key, source },
            StoreError::NotFound(key) => CredentialsError::MissingConnection { key },
            other => CredentialsError::Storage(other),
        }
    }
}

impl From<CredentialsError> for ApiError {
    fn from(error: CredentialsError) -> Self {
        let code = error.code();
        match error {
            CredentialsError::MissingConnection { ref key } => {
                ApiError::new(StatusCode::NOT_FOUND, code, &error.to_string()).with_details(json!({
                    "provider_config_key": key.provider_config_key,
                    "connection_id": key.connection_id,
                }))
            }
            CredentialsError::MissingProviderConfig {
                ref provider_config_key,
                ..
            } => ApiError::new(StatusCode::NOT_FOUND, code, &error.to_string())
                .with_details(json!({ "provider_config_key": provider_config_key })),
            CredentialsError::MissingTemplate { ref provider } => {
                ApiError::new(StatusCode::UNPROCESSABLE_ENTITY, code, &error.to_string())
                    .with_details(json!({ "provider": provider }))
            }
            CredentialsError::CredentialTypeMismatch { .. } | CredentialsError::Decryption { .. } => {
                tracing::error!(error = %error, code, "credential integrity error");
                ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, code, &error.to_string())
            }
            CredentialsError::Refresh { ref source, .. } => refresh_api_error(source, code),
            CredentialsError::Storage(_) | CredentialsError::Other(_) => {
                tracing::error!(error = ?error, "internal credential error");
                ApiError::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    code,
                    "An internal error occurred",
                )
            }
        }
    }
}

fn refresh_api_error(source: &RefreshError, code: &'static str) -> ApiError {
    let message = source.to_string();
    match source {
        RefreshError::Timeout { .. } => ApiError::new(StatusCode::GATEWAY_TIMEOUT, code, &message),
        RefreshError::Network(_) | RefreshError::MalformedResponse(_) => {
            ApiError::new(StatusCode::BAD_GATEWAY, code, &message)
        }
        RefreshError::Rejected {
            status,
            error_code,
            classification,
            retry_after,
            ..
        } => {
            let details = json!({
                "provider_status": status,
                "provider_error": error_code,
                "classification": classification,
                "reauthorization_required": *classification == RefreshErrorClassification::Permanent,
            });
            if *classification == RefreshErrorClassification::RateLimited {
                let error =
                    ApiError::new(StatusCode::TOO_MANY_REQUESTS, code, &message).with_details(details);
                match retry_after {
                    Some(seconds) => error.with_retry_after(*seconds),
                    None => error,
                }
            } else {
                ApiError::new(StatusCode::BAD_GATEWAY, code, &message).with_details(details)
            }
        }
        RefreshError::Persistence(_) | RefreshError::Aborted(_) => {
            ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, code, &message)
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(error: anyhow::Error) -> Self {
        tracing::error!("Internal error: {:?}", error);

        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "INTERNAL_SERVER_ERROR",
            "An internal error occurred",
        )
    }
}
