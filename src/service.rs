//! Connection service
//!
//! The entry point callers use to obtain usable credentials for a connection.
//! Composes the connection store, the provider config registry and the refresh
//! engine, and reports every outcome to the audit and analytics sinks.

use std::sync::Arc;

use anyhow::Context;
use sea_orm::DatabaseConnection;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::audit::{
    AnalyticsEvent, AnalyticsSink, AuditEvent, AuditLevel, AuditSink, MetricsAnalyticsSink,
    TracingAuditSink,
};
use crate::config::AppConfig;
use crate::crypto::EncryptionManager;
use crate::error::CredentialsError;
use crate::models::{ConnectionKey, ConnectionSummary, FetchedCredentials};
use crate::providers::{ProviderConfigRegistry, TemplateRegistry};
use crate::repositories::{ConnectionStore, ProviderConfigRepository};
use crate::token_refresh::{CredentialRefreshEngine, RefreshState};

#[derive(Clone)]
pub struct ConnectionService {
    store: ConnectionStore,
    registry: ProviderConfigRegistry,
    engine: CredentialRefreshEngine,
    audit: Arc<dyn AuditSink>,
    analytics: Arc<dyn AnalyticsSink>,
}

impl std::fmt::Debug for ConnectionService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionService")
            .field("store", &self.store)
            .field("registry", &self.registry)
            .field("engine", &self.engine)
            .finish_non_exhaustive()
    }
}

impl ConnectionService {
    /// Service reporting to the tracing audit sink and metrics analytics sink
    pub fn new(
        store: ConnectionStore,
        registry: ProviderConfigRegistry,
        engine: CredentialRefreshEngine,
    ) -> Self {
        Self {
            store,
            registry,
            engine,
            audit: Arc::new(TracingAuditSink),
            analytics: Arc::new(MetricsAnalyticsSink),
        }
    }

    /// Wires the full service from configuration and an open database pool
    pub fn from_config(config: &AppConfig, db: Arc<DatabaseConnection>) -> anyhow::Result<Self> {
        let encryption = EncryptionManager::from_config(config)
            .context("Failed to initialise credential encryption")?;
        let templates = TemplateRegistry::from_config(config)
            .context("Failed to load provider templates")?;
        info!(
            providers = templates.len(),
            key_id = %encryption.current_key_id(),
            "Connection service configured"
        );

        let store = ConnectionStore::new(Arc::clone(&db), Arc::new(encryption));
        let registry =
            ProviderConfigRegistry::new(ProviderConfigRepository::new(db), Arc::new(templates));
        let engine = CredentialRefreshEngine::from_config(store.clone(), &config.token_refresh)
            .context("Failed to build token refresh HTTP client")?;

        Ok(Self::new(store, registry, engine))
    }

    pub fn with_audit_sink(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = audit;
        self
    }

    pub fn with_analytics_sink(mut self, analytics: Arc<dyn AnalyticsSink>) -> Self {
        self.analytics = analytics;
        self
    }

    pub fn registry(&self) -> &ProviderConfigRegistry {
        &self.registry
    }

    /// Returns credentials for the connection, refreshing them first if they are
    /// expired, about to expire, or `instant_refresh` is set.
    ///
    /// Every failure is written to the audit sink before it is returned. A successful
    /// fetch emits a `connection_fetched` analytics event; analytics failures are
    /// logged and otherwise ignored.
    #[instrument(skip(self))]
    pub async fn get_credentials(
        &self,
        account_id: Uuid,
        provider_config_key: &str,
        connection_id: &str,
        instant_refresh: bool,
    ) -> Result<FetchedCredentials, CredentialsError> {
        let key = ConnectionKey::new(account_id, provider_config_key, connection_id);

        match self.fetch(&key, instant_refresh).await {
            Ok((fetched, provider)) => {
                if let Some(condition) = &fetched.condition {
                    self.audit(
                        AuditEvent::new(
                            AuditLevel::Warn,
                            &key,
                            "Credentials need reauthorization; returning stored credentials",
                        )
                        .with_error_code(condition.code()),
                    )
                    .await;
                }

                let event = AnalyticsEvent::ConnectionFetched {
                    account_id,
                    provider,
                    provider_config_key: provider_config_key.to_string(),
                    refreshed: fetched.refreshed,
                };
                if let Err(err) = self.analytics.track(event).await {
                    warn!(error = %err, "Failed to record analytics event");
                }

                Ok(fetched)
            }
            Err(err) => {
                self.audit(
                    AuditEvent::new(AuditLevel::Error, &key, err.to_string())
                        .with_error_code(err.code()),
                )
                .await;
                Err(err)
            }
        }
    }

    /// Lists an account's connections; no credentials are decrypted
    pub async fn list_connections(
        &self,
        account_id: Uuid,
    ) -> Result<Vec<ConnectionSummary>, CredentialsError> {
        Ok(self.store.list(account_id).await?)
    }

    /// Deletes a connection. Returns `false` if it did not exist.
    pub async fn delete_connection(&self, key: &ConnectionKey) -> Result<bool, CredentialsError> {
        let deleted = self.store.delete(key).await?;
        if deleted {
            self.audit(AuditEvent::new(AuditLevel::Info, key, "Connection deleted"))
                .await;
        }
        Ok(deleted)
    }

    pub fn refresh_state(&self, key: &ConnectionKey) -> RefreshState {
        self.engine.refresh_state(key)
    }

    async fn fetch(
        &self,
        key: &ConnectionKey,
        instant_refresh: bool,
    ) -> Result<(FetchedCredentials, String), CredentialsError> {
        if key.connection_id.is_empty() {
            return Err(CredentialsError::MissingConnection { key: key.clone() });
        }
        if key.provider_config_key.is_empty() {
            return Err(CredentialsError::MissingProviderConfig {
                account_id: key.account_id,
                provider_config_key: String::new(),
            });
        }

        let connection = self
            .store
            .load(key)
            .await?
            .ok_or_else(|| CredentialsError::MissingConnection { key: key.clone() })?;

        let config = self
            .registry
            .resolve_config(key.account_id, &key.provider_config_key)
            .await?;
        let template = self.registry.resolve_template(&config.provider)?;

        let actual = connection.credentials.auth_mode();
        if template.auth_mode != actual {
            return Err(CredentialsError::CredentialTypeMismatch {
                key: key.clone(),
                provider: config.provider.clone(),
                expected: template.auth_mode,
                actual,
            });
        }

        let provider = config.provider.clone();
        let fetched = self
            .engine
            .ensure_fresh(connection, &config, template, instant_refresh)
            .await
            .map_err(|source| CredentialsError::Refresh {
                key: key.clone(),
                source,
            })?;

        Ok((fetched, provider))
    }

    async fn audit(&self, event: AuditEvent) {
        if let Err(err) = self.audit.record(event).await {
            warn!(error = %err, "Failed to record audit event");
        }
    }
}
