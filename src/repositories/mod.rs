//! # Repository Layer
//!
//! SeaORM-backed persistence for provider configurations and encrypted connections.

pub mod connection;
pub mod provider_config;

pub use connection::{ConnectionStore, ReencryptionReport, StoreError};
pub use provider_config::{ProviderConfigInput, ProviderConfigRepository};
