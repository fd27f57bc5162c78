//! Credential refresh engine
//!
//! Decides whether OAuth2 credentials are still usable, refreshes them against the
//! provider's token endpoint when they are not, and persists the result. At most one
//! refresh runs per connection; concurrent callers share its outcome. A failed
//! refresh never touches the stored credentials.

pub mod client;
pub mod single_flight;

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Duration, Utc};
use metrics::{counter, histogram};
use tracing::{debug, error, info, instrument, warn};

use crate::config::TokenRefreshConfig;
use crate::error::{RefreshError, RefreshErrorClassification};
use crate::models::{
    Connection, ConnectionKey, CredentialCondition, Credentials, FetchedCredentials,
    OAuth2Credentials, ProviderConfig,
};
use crate::providers::ProviderTemplate;
use crate::repositories::{ConnectionStore, StoreError};

pub use client::{TokenClient, classify_refresh_error, map_token_response};
pub use single_flight::{FlightRole, RefreshCoordinator, RefreshState};

/// Freshness of an access token relative to the refresh margin
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    /// No expiry declared
    NeverExpires,
    Fresh,
    /// Expired or expiring within the margin
    Stale,
}

/// `expires_at <= now + margin` is stale
pub fn freshness(expires_at: Option<DateTime<Utc>>, now: DateTime<Utc>, margin: Duration) -> Freshness {
    match expires_at {
        None => Freshness::NeverExpires,
        Some(expires_at) if expires_at <= now + margin => Freshness::Stale,
        Some(_) => Freshness::Fresh,
    }
}

#[derive(Debug, Clone)]
pub struct CredentialRefreshEngine {
    store: ConnectionStore,
    client: TokenClient,
    coordinator: RefreshCoordinator,
    margin: Duration,
}

impl CredentialRefreshEngine {
    pub fn new(
        store: ConnectionStore,
        client: TokenClient,
        coordinator: RefreshCoordinator,
        margin: Duration,
    ) -> Self {
        Self {
            store,
            client,
            coordinator,
            margin,
        }
    }

    /// Engine with an HTTP client and coordinator built from configuration
    pub fn from_config(
        store: ConnectionStore,
        config: &TokenRefreshConfig,
    ) -> Result<Self, reqwest::Error> {
        Ok(Self::new(
            store,
            TokenClient::new(config.http_timeout())?,
            RefreshCoordinator::new(config.failure_history),
            config.margin(),
        ))
    }

    pub fn freshness(&self, credentials: &OAuth2Credentials, now: DateTime<Utc>) -> Freshness {
        freshness(credentials.expires_at, now, self.margin)
    }

    pub fn refresh_state(&self, key: &ConnectionKey) -> RefreshState {
        self.coordinator.state(key)
    }

    /// Return credentials that are valid for immediate use.
    ///
    /// OAuth1 credentials and fresh OAuth2 credentials come back unchanged. Stale
    /// OAuth2 credentials (or any, with `instant_refresh`) are refreshed, joining a
    /// refresh already running for the same connection. Without a refresh token the
    /// stored credentials are returned with a reauthorization advisory.
    #[instrument(
        skip_all,
        fields(connection = %connection.key, provider = %template.name, instant_refresh)
    )]
    pub async fn ensure_fresh(
        &self,
        connection: Connection,
        config: &ProviderConfig,
        template: Arc<ProviderTemplate>,
        instant_refresh: bool,
    ) -> Result<FetchedCredentials, RefreshError> {
        let oauth2 = match connection.credentials {
            Credentials::OAuth1(_) => return Ok(FetchedCredentials::unchanged(connection)),
            Credentials::OAuth2(ref oauth2) => oauth2,
        };

        let freshness = self.freshness(oauth2, Utc::now());
        if freshness != Freshness::Stale && !instant_refresh {
            return Ok(FetchedCredentials::unchanged(connection));
        }

        if oauth2.refresh_token.is_none() {
            warn!(?freshness, "Credentials need refresh but no refresh token is stored");
            return Ok(requires_reauthorization(connection));
        }

        let provider = template.name.clone();
        counter!("credential_refresh_attempts_total", "provider" => provider.clone()).increment(1);

        let job = RefreshJob {
            store: self.store.clone(),
            client: self.client.clone(),
            template,
            config: config.clone(),
            key: connection.key.clone(),
            loaded_version: connection.version,
            margin: self.margin,
        };

        let started = Instant::now();
        let (result, role) = self
            .coordinator
            .run(connection.key.clone(), move || job.run())
            .await;
        let elapsed_ms = started.elapsed().as_secs_f64() * 1_000.0;

        if role == FlightRole::Joined {
            counter!("credential_refresh_joined_total", "provider" => provider.clone()).increment(1);
        }

        match result {
            Ok(refreshed) if needs_reauthorization(&refreshed, self.margin) => {
                warn!(?role, version = refreshed.version, "Credentials need refresh but no refresh token is stored");
                Ok(requires_reauthorization(refreshed))
            }
            Ok(refreshed) => {
                histogram!("credential_refresh_latency_ms", "provider" => provider.clone())
                    .record(elapsed_ms);
                counter!("credential_refresh_success_total", "provider" => provider).increment(1);
                info!(
                    ?role,
                    version = refreshed.version,
                    expires_at = ?refreshed.credentials.expires_at(),
                    "Credentials refreshed"
                );
                Ok(FetchedCredentials {
                    refreshed: refreshed.version > connection.version,
                    connection: refreshed,
                    condition: None,
                })
            }
            Err(err) => {
                let classification = err.classification();
                counter!(
                    "credential_refresh_failure_total",
                    "provider" => provider,
                    "classification" => classification.as_str()
                )
                .increment(1);
                match classification {
                    RefreshErrorClassification::Permanent => {
                        error!(?role, error = %err, "Credential refresh rejected; reauthorization required")
                    }
                    RefreshErrorClassification::Transient | RefreshErrorClassification::RateLimited => {
                        warn!(?role, %classification, error = %err, "Credential refresh failed")
                    }
                }
                Err(err)
            }
        }
    }
}

/// Stale OAuth2 credentials that cannot be refreshed
fn needs_reauthorization(connection: &Connection, margin: Duration) -> bool {
    match &connection.credentials {
        Credentials::OAuth2(OAuth2Credentials {
            refresh_token: None,
            expires_at,
            ..
        }) => freshness(*expires_at, Utc::now(), margin) == Freshness::Stale,
        _ => false,
    }
}

/// Stored credentials as they are, flagged for reauthorization
fn requires_reauthorization(connection: Connection) -> FetchedCredentials {
    let expired_at = connection.credentials.expires_at();
    FetchedCredentials {
        connection,
        refreshed: false,
        condition: Some(CredentialCondition::RequiresReauthorization { expired_at }),
    }
}

/// Work performed by the leader of a refresh flight
struct RefreshJob {
    store: ConnectionStore,
    client: TokenClient,
    template: Arc<ProviderTemplate>,
    config: ProviderConfig,
    key: ConnectionKey,
    loaded_version: i64,
    margin: Duration,
}

impl RefreshJob {
    async fn run(self) -> Result<Connection, RefreshError> {
        let current = self.reload().await?;
        let Credentials::OAuth2(ref stored) = current.credentials else {
            return Err(RefreshError::Persistence(format!(
                "connection {} no longer holds OAuth2 credentials",
                self.key
            )));
        };

        // Another caller or instance may have refreshed since this caller read the record.
        if current.version > self.loaded_version
            && freshness(stored.expires_at, Utc::now(), self.margin) != Freshness::Stale
        {
            debug!(version = current.version, "Using credentials refreshed concurrently");
            return Ok(current);
        }

        let Some(refresh_token) = stored.refresh_token.clone() else {
            warn!(version = current.version, "Stored credentials lost their refresh token");
            return Ok(current);
        };
        let refreshed = self
            .client
            .refresh(&self.template, &self.config, &refresh_token)
            .await?;

        let updated = current.with_credentials(Credentials::OAuth2(refreshed));
        match self.store.save(&updated).await {
            Ok(saved) => Ok(saved),
            Err(StoreError::VersionConflict { expected, .. }) => {
                warn!(expected, "Lost refresh write race; returning the winner's credentials");
                self.reload().await
            }
            Err(err) => Err(RefreshError::Persistence(err.to_string())),
        }
    }

    async fn reload(&self) -> Result<Connection, RefreshError> {
        self.store
            .load(&self.key)
            .await
            .map_err(|err| RefreshError::Persistence(err.to_string()))?
            .ok_or_else(|| {
                RefreshError::Persistence(format!("connection {} was deleted", self.key))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn freshness_respects_margin() {
        let now = Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap();
        let margin = Duration::minutes(5);

        assert_eq!(freshness(None, now, margin), Freshness::NeverExpires);
        assert_eq!(
            freshness(Some(now - Duration::seconds(1)), now, margin),
            Freshness::Stale
        );
        assert_eq!(
            freshness(Some(now + Duration::minutes(5)), now, margin),
            Freshness::Stale
        );
        assert_eq!(
            freshness(Some(now + Duration::minutes(5) + Duration::seconds(1)), now, margin),
            Freshness::Fresh
        );
        assert_eq!(
            freshness(Some(now + Duration::hours(1)), now, margin),
            Freshness::Fresh
        );
    }
}
