//! Audit and analytics sinks
//!
//! Credential fetches report failures and advisories to an [`AuditSink`] and
//! successful fetches to an [`AnalyticsSink`]. Both are collaborators owned by the
//! surrounding service; the defaults here write to `tracing` and `metrics`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metrics::counter;
use serde::Serialize;
use uuid::Uuid;

use crate::models::ConnectionKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditLevel {
    Info,
    Warn,
    Error,
}

/// Structured activity record for one credential operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuditEvent {
    pub level: AuditLevel,
    pub timestamp: DateTime<Utc>,
    pub message: String,
    pub account_id: Uuid,
    pub provider_config_key: String,
    pub connection_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
}

impl AuditEvent {
    pub fn new(level: AuditLevel, key: &ConnectionKey, message: impl Into<String>) -> Self {
        Self {
            level,
            timestamp: Utc::now(),
            message: message.into(),
            account_id: key.account_id,
            provider_config_key: key.provider_config_key.clone(),
            connection_id: key.connection_id.clone(),
            error_code: None,
        }
    }

    pub fn with_error_code(mut self, code: impl Into<String>) -> Self {
        self.error_code = Some(code.into());
        self
    }
}

#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, event: AuditEvent) -> anyhow::Result<()>;
}

/// Writes audit events as `tracing` events under the `credvault::audit` target
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn record(&self, event: AuditEvent) -> anyhow::Result<()> {
        let code = event.error_code.as_deref().unwrap_or("");
        match event.level {
            AuditLevel::Info => tracing::info!(
                target: "credvault::audit",
                account_id = %event.account_id,
                provider_config_key = %event.provider_config_key,
                connection_id = %event.connection_id,
                error_code = code,
                "{}", event.message
            ),
            AuditLevel::Warn => tracing::warn!(
                target: "credvault::audit",
                account_id = %event.account_id,
                provider_config_key = %event.provider_config_key,
                connection_id = %event.connection_id,
                error_code = code,
                "{}", event.message
            ),
            AuditLevel::Error => tracing::error!(
                target: "credvault::audit",
                account_id = %event.account_id,
                provider_config_key = %event.provider_config_key,
                connection_id = %event.connection_id,
                error_code = code,
                "{}", event.message
            ),
        }
        Ok(())
    }
}

/// Product analytics event
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AnalyticsEvent {
    ConnectionFetched {
        account_id: Uuid,
        provider: String,
        provider_config_key: String,
        refreshed: bool,
    },
}

impl AnalyticsEvent {
    pub fn name(&self) -> &'static str {
        match self {
            AnalyticsEvent::ConnectionFetched { .. } => "connection_fetched",
        }
    }
}

#[async_trait]
pub trait AnalyticsSink: Send + Sync {
    async fn track(&self, event: AnalyticsEvent) -> anyhow::Result<()>;
}

/// Counts analytics events through the `metrics` facade
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsAnalyticsSink;

#[async_trait]
impl AnalyticsSink for MetricsAnalyticsSink {
    async fn track(&self, event: AnalyticsEvent) -> anyhow::Result<()> {
        match event {
            AnalyticsEvent::ConnectionFetched {
                ref provider,
                refreshed,
                ..
            } => {
                counter!(
                    "credvault_connection_fetched_total",
                    "provider" => provider.clone(),
                    "refreshed" => if refreshed { "true" } else { "false" }
                )
                .increment(1);
            }
        }
        tracing::debug!(event = event.name(), "Analytics event recorded");
        Ok(())
    }
}
