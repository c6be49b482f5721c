//! Extension Host
//!
//! Runs the extension manager behind the control API.

use extension_host::{api, core, db, plugin};

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let config = match core::Config::load() {
        Ok(cfg) => cfg,
        Err(e) => {
            // Logging is not initialized yet
            eprintln!("Failed to load configuration: {}", e);
            return Err(e.into());
        }
    };

    let _logger = match core::Logger::init(&config.logging) {
        Ok(logger) => logger,
        Err(e) => {
            eprintln!("Failed to initialize logging: {}", e);
            return Err(e);
        }
    };

    info!("Starting Extension Host v{}", extension_host::VERSION);
    info!(
        host = %config.server.host,
        port = config.server.port,
        "Server configuration"
    );
    info!(
        extension_dir = ?config.extensions.extension_dir,
        profile = %config.extensions.profile,
        "Extension configuration"
    );

    tokio::fs::create_dir_all(&config.extensions.extension_dir)
        .await
        .with_context(|| format!("failed to create {}", config.extensions.extension_dir.display()))?;

    info!(path = ?config.database.path, "Opening database");
    let db = Arc::new(db::DatabaseManager::new(
        &config.database.path,
        config.database.connection_pool_size,
        Duration::from_millis(config.database.busy_timeout),
    )?);

    let store = Arc::new(db::SqliteKvStore::new(db.clone()));
    let repository = db::ExtensionRepository::new(db);
    let manager = Arc::new(plugin::ExtensionManager::new(
        config.extensions.clone(),
        &config.cache,
        store,
        Some(repository),
    )?);

    let report = manager.restore().await?;
    info!(
        loaded = report.loaded.len(),
        failed = report.failed.len(),
        "Persisted extensions restored"
    );
    for failure in &report.failed {
        warn!(extension_id = %failure.id, error = %failure.error, "Extension skipped");
    }

    if config.extensions.load_builtin {
        manager.register_builtin().await?;
    }

    let server = api::ApiServer::new(config.server.clone(), manager.clone());
    info!("Extension Host initialized");

    let served = server.serve().await;

    manager.shutdown_all().await;
    info!("All extensions shut down");

    served
}
