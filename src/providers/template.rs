//! Provider templates
//!
//! A template describes how to talk to one provider's token endpoint: which auth mode
//! it uses, where to refresh, how to present client credentials and how to read the
//! token response. Templates are loaded once and never change afterwards.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use url::Url;

use crate::config::AppConfig;
use crate::models::AuthMode;

const BUILTIN_TEMPLATES: &str = include_str!("templates.json");

/// Errors raised while loading provider templates
#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("failed to read provider templates from {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse provider templates: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid template for provider '{provider}': {reason}")]
    Invalid { provider: String, reason: String },
}

/// How client credentials are presented to the token endpoint
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientAuthMethod {
    /// `client_id` / `client_secret` form fields
    #[default]
    Body,
    /// HTTP Basic authorization header
    Basic,
}

/// Encoding of the expiry field in a token response
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpiryFormat {
    #[default]
    SecondsFromNow,
    UnixTimestamp,
    Rfc3339,
}

impl ExpiryFormat {
    /// Convert a raw expiry value into an absolute timestamp
    pub fn resolve(&self, value: &JsonValue, now: DateTime<Utc>) -> Result<DateTime<Utc>, String> {
        match self {
            ExpiryFormat::SecondsFromNow => {
                let seconds = as_integer(value).ok_or_else(|| {
                    format!("expected a number of seconds, got {}", value)
                })?;
                Duration::try_seconds(seconds)
                    .and_then(|delta| now.checked_add_signed(delta))
                    .ok_or_else(|| format!("expiry {} out of range", seconds))
            }
            ExpiryFormat::UnixTimestamp => {
                let seconds = as_integer(value)
                    .ok_or_else(|| format!("expected a unix timestamp, got {}", value))?;
                DateTime::from_timestamp(seconds, 0)
                    .ok_or_else(|| format!("timestamp {} out of range", seconds))
            }
            ExpiryFormat::Rfc3339 => {
                let text = value
                    .as_str()
                    .ok_or_else(|| format!("expected an RFC 3339 string, got {}", value))?;
                DateTime::parse_from_rfc3339(text)
                    .map(|parsed| parsed.with_timezone(&Utc))
                    .map_err(|e| format!("invalid RFC 3339 timestamp '{}': {}", text, e))
            }
        }
    }
}

/// Providers disagree on whether numbers are sent as JSON numbers or strings.
fn as_integer(value: &JsonValue) -> Option<i64> {
    match value {
        JsonValue::Number(number) => number
            .as_i64()
            .or_else(|| {
                number
                    .as_f64()
                    .filter(|float| float.is_finite() && float.abs() < i64::MAX as f64)
                    .map(|float| float as i64)
            }),
        JsonValue::String(text) => text.trim().parse().ok(),
        _ => None,
    }
}

/// Field names read from a token response; dots address nested objects
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenResponseMapping {
    pub access_token: String,
    pub refresh_token: String,
    pub expires: String,
    pub expiry_format: ExpiryFormat,
}

impl Default for TokenResponseMapping {
    fn default() -> Self {
        Self {
            access_token: "access_token".to_string(),
            refresh_token: "refresh_token".to_string(),
            expires: "expires_in".to_string(),
            expiry_format: ExpiryFormat::SecondsFromNow,
        }
    }
}

impl TokenResponseMapping {
    /// Look up a dot-separated path, treating JSON `null` as absent
    pub fn lookup<'a>(body: &'a JsonValue, path: &str) -> Option<&'a JsonValue> {
        path.split('.')
            .try_fold(body, |current, segment| current.get(segment))
            .filter(|value| !value.is_null())
    }
}

/// Static description of a provider's token endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderTemplate {
    /// Provider name; filled from the registry key when loaded from JSON
    #[serde(default)]
    pub name: String,
    pub auth_mode: AuthMode,
    pub authorization_url: Url,
    pub token_url: Url,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_url: Option<Url>,
    #[serde(default)]
    pub token_request_auth_method: ClientAuthMethod,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub refresh_params: BTreeMap<String, String>,
    #[serde(default)]
    pub token_response: TokenResponseMapping,
}

impl ProviderTemplate {
    /// OAuth2 template refreshing against `token_url`
    pub fn oauth2(name: impl Into<String>, token_url: Url) -> Self {
        Self {
            name: name.into(),
            auth_mode: AuthMode::OAuth2,
            authorization_url: token_url.clone(),
            token_url,
            refresh_url: None,
            token_request_auth_method: ClientAuthMethod::default(),
            refresh_params: BTreeMap::new(),
            token_response: TokenResponseMapping::default(),
        }
    }

    pub fn oauth1(name: impl Into<String>, token_url: Url) -> Self {
        Self {
            auth_mode: AuthMode::OAuth1,
            ..Self::oauth2(name, token_url)
        }
    }

    pub fn with_client_auth(mut self, method: ClientAuthMethod) -> Self {
        self.token_request_auth_method = method;
        self
    }

    pub fn with_refresh_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.refresh_params.insert(key.into(), value.into());
        self
    }

    pub fn with_token_response(mut self, mapping: TokenResponseMapping) -> Self {
        self.token_response = mapping;
        self
    }

    /// Endpoint used for refresh_token grants
    pub fn refresh_endpoint(&self) -> &Url {
        self.refresh_url.as_ref().unwrap_or(&self.token_url)
    }

    fn validate(&self) -> Result<(), TemplateError> {
        let invalid = |reason: &str| TemplateError::Invalid {
            provider: self.name.clone(),
            reason: reason.to_string(),
        };

        if !matches!(self.refresh_endpoint().scheme(), "http" | "https") {
            return Err(invalid("refresh endpoint must be http(s)"));
        }
        if self.token_response.access_token.trim().is_empty() {
            return Err(invalid("token_response.access_token must not be empty"));
        }
        Ok(())
    }
}

/// Immutable provider-name → template map
#[derive(Debug, Clone, Default)]
pub struct TemplateRegistry {
    templates: HashMap<String, Arc<ProviderTemplate>>,
}

impl TemplateRegistry {
    /// Templates embedded in the crate
    pub fn builtin() -> Result<Self, TemplateError> {
        Self::from_json(BUILTIN_TEMPLATES)
    }

    /// Configured template file if set, built-in templates otherwise
    pub fn from_config(config: &AppConfig) -> Result<Self, TemplateError> {
        match config.provider_templates_path {
            Some(ref path) => Self::from_path(path),
            None => Self::builtin(),
        }
    }

    pub fn from_path(path: &Path) -> Result<Self, TemplateError> {
        let contents = std::fs::read_to_string(path).map_err(|source| TemplateError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&contents)
    }

    /// Parse a JSON object keyed by provider name
    pub fn from_json(json: &str) -> Result<Self, TemplateError> {
        let parsed: BTreeMap<String, ProviderTemplate> = serde_json::from_str(json)?;
        let mut templates = HashMap::with_capacity(parsed.len());
        for (name, mut template) in parsed {
            template.name = name.clone();
            template.validate()?;
            templates.insert(name, Arc::new(template));
        }
        Ok(Self { templates })
    }

    pub fn from_templates(templates: impl IntoIterator<Item = ProviderTemplate>) -> Self {
        Self {
            templates: templates
                .into_iter()
                .map(|template| (template.name.clone(), Arc::new(template)))
                .collect(),
        }
    }

    pub fn get(&self, provider: &str) -> Option<Arc<ProviderTemplate>> {
        self.templates.get(provider).cloned()
    }

    /// Provider names in sorted order
    pub fn providers(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.templates.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }
}
