//! Configuration loading for credvault.
//!
//! Loads layered `.env` files and environment variables prefixed with
//! `CREDVAULT_`, producing a typed [`AppConfig`].

use std::{collections::BTreeMap, env, path::PathBuf, time::Duration};

use base64::{Engine as _, engine::general_purpose};
use serde::{Deserialize, Serialize};
use thiserror::Error;

const ENV_PREFIX: &str = "CREDVAULT_";

/// Application configuration derived from `CREDVAULT_*` environment variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct AppConfig {
    #[serde(default = "default_profile")]
    pub profile: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_log_format")]
    pub log_format: String,
    #[serde(default = "default_database_url")]
    pub database_url: String,
    #[serde(default = "default_db_max_connections")]
    pub db_max_connections: u32,
    #[serde(default = "default_db_acquire_timeout_ms")]
    pub db_acquire_timeout_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crypto_key: Option<Vec<u8>>,
    /// Retired keys that may still have sealed stored records
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub crypto_previous_keys: Vec<Vec<u8>>,
    /// JSON file replacing the built-in provider templates
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_templates_path: Option<PathBuf>,
    #[serde(default)]
    pub token_refresh: TokenRefreshConfig,
}

/// Credential refresh configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct TokenRefreshConfig {
    /// Tokens expiring within this many seconds are refreshed (default: 300)
    #[serde(default = "default_token_refresh_margin_seconds")]
    pub margin_seconds: u64,

    /// Upper bound on a single provider refresh call (default: 10000)
    #[serde(default = "default_token_refresh_http_timeout_ms")]
    pub http_timeout_ms: u64,

    /// Number of failed refresh states remembered (default: 1024)
    #[serde(default = "default_token_refresh_failure_history")]
    pub failure_history: usize,
}

impl TokenRefreshConfig {
    /// Validate token refresh configuration bounds
    pub fn validate(&self) -> Result<(), ConfigError> {
        // Margin must leave room for the token to be usable (max one day)
        if self.margin_seconds > 86400 {
            return Err(ConfigError::InvalidTokenRefreshMargin {
                value: self.margin_seconds,
            });
        }

        if self.http_timeout_ms < 100 || self.http_timeout_ms > 120_000 {
            return Err(ConfigError::InvalidTokenRefreshTimeout {
                value: self.http_timeout_ms,
            });
        }

        if self.failure_history == 0 {
            return Err(ConfigError::InvalidTokenRefreshFailureHistory {
                value: self.failure_history,
            });
        }

        Ok(())
    }

    pub fn margin(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.margin_seconds as i64)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_millis(self.http_timeout_ms)
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            profile: default_profile(),
            log_level: default_log_level(),
            log_format: default_log_format(),
            database_url: default_database_url(),
            db_max_connections: default_db_max_connections(),
            db_acquire_timeout_ms: default_db_acquire_timeout_ms(),
            crypto_key: None,
            crypto_previous_keys: Vec::new(),
            provider_templates_path: None,
            token_refresh: TokenRefreshConfig::default(),
        }
    }
}

impl Default for TokenRefreshConfig {
    fn default() -> Self {
        Self {
            margin_seconds: default_token_refresh_margin_seconds(),
            http_timeout_ms: default_token_refresh_http_timeout_ms(),
            failure_history: default_token_refresh_failure_history(),
        }
    }
}

impl AppConfig {
    /// Returns a redacted JSON representation (secrets are redacted).
    pub fn redacted_json(&self) -> serde_json::Result<String> {
        let mut config = self.clone();
        if config.crypto_key.is_some() {
            config.crypto_key = Some(b"[REDACTED]".to_vec());
        }
        if !config.crypto_previous_keys.is_empty() {
            config.crypto_previous_keys = vec![b"[REDACTED]".to_vec()];
        }
        if let Some(redacted) = redact_database_password(&config.database_url) {
            config.database_url = redacted;
        }
        serde_json::to_string_pretty(&config)
    }

    /// Validates the configuration, returning an error if required settings are missing.
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.crypto_key {
            Some(ref key) if key.len() != 32 => {
                return Err(ConfigError::InvalidCryptoKeyLength { length: key.len() });
            }
            Some(_) => {}
            None => return Err(ConfigError::MissingCryptoKey),
        }

        if let Some(key) = self.crypto_previous_keys.iter().find(|key| key.len() != 32) {
            return Err(ConfigError::InvalidCryptoKeyLength { length: key.len() });
        }

        if !matches!(self.log_format.as_str(), "json" | "pretty") {
            return Err(ConfigError::InvalidLogFormat {
                value: self.log_format.clone(),
            });
        }

        if self.db_max_connections == 0 {
            return Err(ConfigError::InvalidDbMaxConnections {
                value: self.db_max_connections,
            });
        }

        self.token_refresh.validate()?;

        Ok(())
    }
}

fn redact_database_password(database_url: &str) -> Option<String> {
    let mut parsed = url::Url::parse(database_url).ok()?;
    parsed.password()?;
    parsed.set_password(Some("[REDACTED]")).ok()?;
    Some(parsed.to_string())
}

fn default_profile() -> String {
    "local".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

fn default_database_url() -> String {
    "sqlite://credvault.db?mode=rwc".to_string()
}

fn default_db_max_connections() -> u32 {
    10
}

fn default_db_acquire_timeout_ms() -> u64 {
    5000
}

fn default_token_refresh_margin_seconds() -> u64 {
    300
}

fn default_token_refresh_http_timeout_ms() -> u64 {
    10_000
}

fn default_token_refresh_failure_history() -> usize {
    1024
}

/// Errors that can occur while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load environment file {path}: {source}")]
    EnvFile {
        path: PathBuf,
        source: dotenvy::Error,
    },
    #[error("crypto key is missing; set CREDVAULT_CRYPTO_KEY environment variable")]
    MissingCryptoKey,
    #[error("crypto key is invalid base64: {error}")]
    InvalidCryptoKeyBase64 { error: String },
    #[error("crypto key must decode to exactly 32 bytes, got {length} bytes")]
    InvalidCryptoKeyLength { length: usize },
    #[error("log format must be 'json' or 'pretty', got '{value}'")]
    InvalidLogFormat { value: String },
    #[error("database max connections must be at least 1, got {value}")]
    InvalidDbMaxConnections { value: u32 },
    #[error("token refresh margin must not exceed 86400 seconds, got {value}")]
    InvalidTokenRefreshMargin { value: u64 },
    #[error("token refresh http timeout must be between 100 and 120000 ms, got {value}")]
    InvalidTokenRefreshTimeout { value: u64 },
    #[error("token refresh failure history must be at least 1, got {value}")]
    InvalidTokenRefreshFailureHistory { value: usize },
}

/// Loads configuration using layered `.env` files and `CREDVAULT_*` env vars.
pub struct ConfigLoader {
    base_dir: PathBuf,
}

impl ConfigLoader {
    /// Creates a new loader rooted at the current working directory.
    pub fn new() -> Self {
        Self {
            base_dir: env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
        }
    }

    /// Creates a loader rooted at the provided directory (useful for tests).
    pub fn with_base_dir(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    /// Loads and validates configuration.
    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        let (mut layered, profile_hint) = self.collect_layered_env()?;

        // Overlay process environment last so it wins.
        for (key, value) in env::vars() {
            if let Some(stripped) = key.strip_prefix(ENV_PREFIX) {
                layered.insert(stripped.to_string(), value);
            }
        }

        let profile = layered
            .remove("PROFILE")
            .filter(|v| !v.is_empty())
            .unwrap_or(profile_hint);
        let log_level = layered
            .remove("LOG_LEVEL")
            .filter(|v| !v.is_empty())
            .unwrap_or_else(default_log_level);
        let log_format = layered
            .remove("LOG_FORMAT")
            .filter(|v| !v.is_empty())
            .unwrap_or_else(default_log_format);
        let database_url = layered
            .remove("DATABASE_URL")
            .filter(|v| !v.is_empty())
            .unwrap_or_else(default_database_url);
        let db_max_connections = layered
            .remove("DB_MAX_CONNECTIONS")
            .and_then(|v| v.parse().ok())
            .unwrap_or_else(default_db_max_connections);
        let db_acquire_timeout_ms = layered
            .remove("DB_ACQUIRE_TIMEOUT_MS")
            .and_then(|v| v.parse().ok())
            .unwrap_or_else(default_db_acquire_timeout_ms);

        let crypto_key = layered
            .remove("CRYPTO_KEY")
            .filter(|v| !v.trim().is_empty())
            .map(|v| decode_key(&v))
            .transpose()?;

        let crypto_previous_keys = layered
            .remove("CRYPTO_PREVIOUS_KEYS")
            .map(|keys| {
                keys.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(decode_key)
                    .collect::<Result<Vec<_>, _>>()
            })
            .transpose()?
            .unwrap_or_default();

        let provider_templates_path = layered
            .remove("PROVIDER_TEMPLATES_PATH")
            .filter(|v| !v.trim().is_empty())
            .map(|v| {
                let path = PathBuf::from(v.trim());
                if path.is_relative() {
                    self.base_dir.join(path)
                } else {
                    path
                }
            });

        let token_refresh = TokenRefreshConfig {
            margin_seconds: layered
                .remove("TOKEN_REFRESH_MARGIN_SECONDS")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_token_refresh_margin_seconds),
            http_timeout_ms: layered
                .remove("TOKEN_REFRESH_HTTP_TIMEOUT_MS")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_token_refresh_http_timeout_ms),
            failure_history: layered
                .remove("TOKEN_REFRESH_FAILURE_HISTORY")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_token_refresh_failure_history),
        };

        let config = AppConfig {
            profile,
            log_level,
            log_format,
            database_url,
            db_max_connections,
            db_acquire_timeout_ms,
            crypto_key,
            crypto_previous_keys,
            provider_templates_path,
            token_refresh,
        };

        config.validate()?;
        Ok(config)
    }

    fn collect_layered_env(&self) -> Result<(BTreeMap<String, String>, String), ConfigError> {
        let mut values = BTreeMap::new();

        self.merge_dotenv(self.base_dir.join(".env"), &mut values)?;
        self.merge_dotenv(self.base_dir.join(".env.local"), &mut values)?;

        let profile = env::var(format!("{ENV_PREFIX}PROFILE"))
            .ok()
            .or_else(|| values.get("PROFILE").cloned())
            .unwrap_or_else(default_profile);

        self.merge_dotenv(
            self.base_dir.join(format!(".env.{}", &profile)),
            &mut values,
        )?;
        self.merge_dotenv(
            self.base_dir.join(format!(".env.{}.local", &profile)),
            &mut values,
        )?;

        Ok((values, profile))
    }

    fn merge_dotenv(
        &self,
        path: PathBuf,
        values: &mut BTreeMap<String, String>,
    ) -> Result<(), ConfigError> {
        match dotenvy::from_path_iter(&path) {
            Ok(iter) => {
                for item in iter {
                    let (key, value) = item.map_err(|source| ConfigError::EnvFile {
                        path: path.clone(),
                        source,
                    })?;
                    if let Some(stripped) = key.strip_prefix(ENV_PREFIX) {
                        values.insert(stripped.to_string(), value);
                    }
                }
                Ok(())
            }
            Err(dotenvy::Error::Io(ref io_err))
                if io_err.kind() == std::io::ErrorKind::NotFound =>
            {
                Ok(())
            }
            Err(err) => Err(ConfigError::EnvFile { path, source: err }),
        }
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

fn decode_key(value: &str) -> Result<Vec<u8>, ConfigError> {
    general_purpose::STANDARD
        .decode(value.trim())
        .map_err(|e| ConfigError::InvalidCryptoKeyBase64 {
            error: e.to_string(),
        })
}
