//! # credvault
//!
//! Credential manager for third-party integrations. Stores OAuth1 and OAuth2
//! credentials encrypted at rest, one record per `(account, provider config,
//! connection)`, and hands callers credentials that are valid for immediate use,
//! refreshing expired OAuth2 access tokens against the provider's token endpoint.
//! Concurrent requests for the same connection share a single refresh.

pub mod audit;
pub mod config;
pub mod crypto;
pub mod db;
pub mod error;
pub mod models;
pub mod providers;
pub mod repositories;
pub mod service;
pub mod telemetry;
pub mod token_refresh;
pub use migration;

pub use error::{ApiError, CredentialsError, RefreshError};
pub use models::{ConnectionKey, Credentials, FetchedCredentials};
pub use service::ConnectionService;
