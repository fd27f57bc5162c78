//! Test utilities for database-backed credential tests.
//!
//! Sets up in-memory SQLite databases with migrations applied and wires the
//! credential service against provider templates that point at a mock server.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use credvault::audit::{AnalyticsEvent, AnalyticsSink, AuditEvent, AuditSink};
use credvault::crypto::{CryptoKey, EncryptionManager};
use credvault::models::{Credentials, OAuth1Credentials, OAuth2Credentials};
use credvault::providers::{ProviderConfigRegistry, ProviderTemplate, TemplateRegistry};
use credvault::repositories::{ConnectionStore, ProviderConfigInput, ProviderConfigRepository};
use credvault::token_refresh::{CredentialRefreshEngine, RefreshCoordinator, TokenClient};
use credvault::{ConnectionKey, ConnectionService};
use migration::{Migrator, MigratorTrait};
use sea_orm::{ConnectOptions, Database, DatabaseConnection};
use std::sync::{Arc, Mutex};
use url::Url;
use uuid::Uuid;

/// Sets up an in-memory SQLite database with all migrations applied.
///
/// The pool holds a single connection; every SQLite in-memory connection is its
/// own database.
pub async fn setup_test_db() -> Result<Arc<DatabaseConnection>> {
    let mut options = ConnectOptions::new("sqlite::memory:");
    options.max_connections(1).sqlx_logging(false);
    let db = Database::connect(options).await?;

    Migrator::up(&db, None).await?;

    Ok(Arc::new(db))
}

#[allow(dead_code)]
pub fn test_key(byte: u8) -> CryptoKey {
    CryptoKey::new(vec![byte; 32]).expect("32-byte key")
}

#[allow(dead_code)]
pub fn encryption(byte: u8) -> Arc<EncryptionManager> {
    Arc::new(EncryptionManager::new(test_key(byte)))
}

#[allow(dead_code)]
pub fn oauth2(
    access_token: &str,
    refresh_token: Option<&str>,
    expires_at: Option<DateTime<Utc>>,
) -> Credentials {
    Credentials::OAuth2(OAuth2Credentials {
        access_token: access_token.to_string(),
        refresh_token: refresh_token.map(str::to_string),
        expires_at,
        raw: serde_json::json!({ "access_token": access_token }),
    })
}

#[allow(dead_code)]
pub fn oauth1(token: &str, secret: &str) -> Credentials {
    Credentials::OAuth1(OAuth1Credentials {
        oauth_token: token.to_string(),
        oauth_token_secret: secret.to_string(),
        raw: serde_json::Value::Null,
    })
}

#[allow(dead_code)]
pub fn expired() -> Option<DateTime<Utc>> {
    Some(Utc::now() - Duration::minutes(1))
}

#[allow(dead_code)]
pub fn fresh() -> Option<DateTime<Utc>> {
    Some(Utc::now() + Duration::hours(1))
}

/// Templates for a mock OAuth2 provider `acme` and a mock OAuth1 provider `legacy`,
/// both refreshing against `{base_uri}/oauth/token`.
#[allow(dead_code)]
pub fn mock_templates(base_uri: &str) -> TemplateRegistry {
    let token_url = Url::parse(&format!("{base_uri}/oauth/token")).expect("mock token url");
    TemplateRegistry::from_templates([
        ProviderTemplate::oauth2("acme", token_url.clone()),
        ProviderTemplate::oauth1("legacy", token_url),
    ])
}

/// Registers `provider_config_key` for `account_id`, backed by `provider`
#[allow(dead_code)]
pub async fn insert_provider_config(
    db: &Arc<DatabaseConnection>,
    account_id: Uuid,
    provider_config_key: &str,
    provider: &str,
) -> Result<()> {
    ProviderConfigRepository::new(Arc::clone(db))
        .upsert(
            account_id,
            provider_config_key,
            ProviderConfigInput {
                provider: provider.to_string(),
                oauth_client_id: "client-id".to_string(),
                oauth_client_secret: "client-secret".to_string(),
                oauth_scopes: vec!["read".to_string()],
            },
        )
        .await?;
    Ok(())
}

/// Everything a service-level test needs
#[allow(dead_code)]
pub struct TestHarness {
    pub db: Arc<DatabaseConnection>,
    pub store: ConnectionStore,
    pub service: ConnectionService,
    pub audit: Arc<RecordingAuditSink>,
    pub account_id: Uuid,
}

#[allow(dead_code)]
impl TestHarness {
    /// Service over a fresh database whose templates point at `base_uri`, with a
    /// registered `acme` config under key `acme-prod` and `legacy` under `legacy-prod`
    pub async fn new(base_uri: &str) -> Result<Self> {
        Self::with_timeout(base_uri, std::time::Duration::from_secs(5)).await
    }

    pub async fn with_timeout(base_uri: &str, timeout: std::time::Duration) -> Result<Self> {
        let db = setup_test_db().await?;
        let account_id = Uuid::new_v4();
        insert_provider_config(&db, account_id, "acme-prod", "acme").await?;
        insert_provider_config(&db, account_id, "legacy-prod", "legacy").await?;

        let store = ConnectionStore::new(Arc::clone(&db), encryption(7));
        let service = build_service(&db, store.clone(), base_uri, timeout)?;
        let audit = Arc::new(RecordingAuditSink::default());
        let service = service.with_audit_sink(audit.clone());

        Ok(Self {
            db,
            store,
            service,
            audit,
            account_id,
        })
    }

    pub fn key(&self, provider_config_key: &str, connection_id: &str) -> ConnectionKey {
        ConnectionKey::new(self.account_id, provider_config_key, connection_id)
    }
}

/// A second service sharing `store`'s database, standing in for another instance
#[allow(dead_code)]
pub fn build_service(
    db: &Arc<DatabaseConnection>,
    store: ConnectionStore,
    base_uri: &str,
    timeout: std::time::Duration,
) -> Result<ConnectionService> {
    let registry = ProviderConfigRegistry::new(
        ProviderConfigRepository::new(Arc::clone(db)),
        Arc::new(mock_templates(base_uri)),
    );
    let engine = CredentialRefreshEngine::new(
        store.clone(),
        TokenClient::new(timeout)?,
        RefreshCoordinator::new(64),
        Duration::minutes(5),
    );
    Ok(ConnectionService::new(store, registry, engine))
}

/// Audit sink keeping every event in memory
#[allow(dead_code)]
#[derive(Default)]
pub struct RecordingAuditSink {
    events: Mutex<Vec<AuditEvent>>,
}

#[allow(dead_code)]
impl RecordingAuditSink {
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl AuditSink for RecordingAuditSink {
    async fn record(&self, event: AuditEvent) -> anyhow::Result<()> {
        self.events.lock().unwrap().push(event);
        Ok(())
    }
}

/// Analytics sink that always fails
#[allow(dead_code)]
pub struct FailingAnalyticsSink;

#[async_trait]
impl AnalyticsSink for FailingAnalyticsSink {
    async fn track(&self, _event: AnalyticsEvent) -> anyhow::Result<()> {
        anyhow::bail!("analytics backend unavailable")
    }
}
