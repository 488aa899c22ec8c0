use anyhow::Context;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use kost_sync::config::{self, SyncConfig};
use kost_sync::storage::KeyringStore;
use kost_sync::{diagnostics, ApiClient, DisabledPushProvider, Kost};

/// Keyring service name the dashboard login stores the bearer token under.
const KEYRING_SERVICE: &str = "kost-sync";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = SyncConfig::load(None).context("failed to load configuration")?;
    // Dropping the guard flushes the file writer, so hold it until exit.
    let _log_guard = diagnostics::init_logging(&config);

    info!(
        "Starting kost-sync v{} (backend: {})",
        env!("CARGO_PKG_VERSION"),
        config.api_base_url
    );
    info!(about = %diagnostics::get_about_info(), "Build info");

    let token = match config::resolve_api_token(&KeyringStore::new(KEYRING_SERVICE)) {
        Ok(token) => token,
        Err(e) => {
            warn!(error = %e, "credential store unavailable");
            None
        }
    };
    if token.is_none() {
        warn!("No API token configured; replays will fail until the dashboard logs in");
    }

    let api = Arc::new(
        ApiClient::new(&config.api_base_url, token, config.request_timeout())
            .context("failed to build HTTP client")?,
    );
    let kost = Kost::open(config, api, Arc::new(DisabledPushProvider::default()))
        .context("failed to open local database")?;

    let cancel = CancellationToken::new();
    let tasks = kost.start(cancel.clone())?;

    match diagnostics::get_sync_health(&kost.db) {
        Ok(health) => debug!(health = %health, "Sync health"),
        Err(e) => warn!(error = %e, "failed to read sync health"),
    }
    if let Ok(status) = kost.sync.status() {
        info!(
            pending = status.queue.pending,
            failed = status.queue.failed,
            needs_attention = status.queue.needs_attention,
            "Queue loaded"
        );
    }

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("Shutting down");
    cancel.cancel();
    for task in tasks {
        let _ = task.await;
    }
    Ok(())
}
