use std::sync::Arc;

use anyhow::{Context, Result};
use credvault::{config::ConfigLoader, crypto::EncryptionManager, db, repositories::ConnectionStore, telemetry};

#[tokio::main]
async fn main() -> Result<()> {
    let loader = ConfigLoader::new();
    let config = loader.load().context("loading configuration")?;
    telemetry::init_tracing(&config).context("initializing tracing")?;

    if config.crypto_previous_keys.is_empty() {
        eprintln!(
            "warning: CREDVAULT_CRYPTO_PREVIOUS_KEYS is empty; only records already under the current key can be read"
        );
    }

    let encryption = EncryptionManager::from_config(&config).context("initializing keyring")?;
    let key_id = encryption.current_key_id();

    let db = db::init_pool(&config)
        .await
        .context("initializing database connection pool")?;
    let store = ConnectionStore::new(Arc::new(db), Arc::new(encryption));

    let report = store
        .reencrypt_stale()
        .await
        .context("re-encrypting connections")?;

    println!(
        "Scanned {} connection(s): {} re-encrypted under key {}, {} changed concurrently, {} unreadable.",
        report.scanned, report.reencrypted, key_id, report.conflicts, report.failed
    );

    if report.failed > 0 {
        anyhow::bail!(
            "{} connection(s) could not be decrypted with the configured keys",
            report.failed
        );
    }
    Ok(())
}
