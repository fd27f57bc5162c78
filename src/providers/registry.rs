//! Provider configuration registry
//!
//! Resolves an account's provider configuration and the global template for its
//! provider. The two lookups fail differently: a missing configuration is the
//! caller's mistake, a missing template means the configuration names a provider
//! this deployment does not know.

use std::sync::Arc;

use uuid::Uuid;

use crate::error::CredentialsError;
use crate::models::ProviderConfig;
use crate::providers::template::{ProviderTemplate, TemplateRegistry};
use crate::repositories::ProviderConfigRepository;

#[derive(Debug, Clone)]
pub struct ProviderConfigRegistry {
    repo: ProviderConfigRepository,
    templates: Arc<TemplateRegistry>,
}

impl ProviderConfigRegistry {
    pub fn new(repo: ProviderConfigRepository, templates: Arc<TemplateRegistry>) -> Self {
        Self { repo, templates }
    }

    pub async fn resolve_config(
        &self,
        account_id: Uuid,
        provider_config_key: &str,
    ) -> Result<ProviderConfig, CredentialsError> {
        self.repo
            .find(account_id, provider_config_key)
            .await?
            .ok_or_else(|| CredentialsError::MissingProviderConfig {
                account_id,
                provider_config_key: provider_config_key.to_string(),
            })
    }

    pub fn resolve_template(&self, provider: &str) -> Result<Arc<ProviderTemplate>, CredentialsError> {
        self.templates
            .get(provider)
            .ok_or_else(|| CredentialsError::MissingTemplate {
                provider: provider.to_string(),
            })
    }
}
