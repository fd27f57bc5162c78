//! # Data Models
//!
//! SeaORM entities for stored rows and the decrypted domain types handed to callers.

pub mod connection;
pub mod credentials;
pub mod provider_config;

pub use credentials::{
    AuthMode, Connection, ConnectionKey, ConnectionSummary, CredentialCondition, Credentials,
    FetchedCredentials, OAuth1Credentials, OAuth2Credentials,
};
pub use provider_config::Model as ProviderConfig;
