//! Provider templates and account-scoped provider configuration lookup.

pub mod registry;
pub mod template;

pub use registry::ProviderConfigRegistry;
pub use template::{
    ClientAuthMethod, ExpiryFormat, ProviderTemplate, TemplateError, TemplateRegistry,
    TokenResponseMapping,
};
