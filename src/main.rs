//! Tenant Backup Service
//!
//! Serves `POST /admin/backup`, which streams every record set and stored
//! object of the tenant into a single zip archive.

// tenantbackup/src/main.rs
mod backup;
mod catalog;
mod config;
mod errors;
mod logging;
mod server;
mod stores;

use anyhow::{Context, Result};
use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use backup::BackupOrchestrator;
use config::AppConfig;
use server::{AppState, JobRegistry, StaticTokenAuthenticator};
use stores::{PostgresRecordStore, S3ObjectStore};

const DEFAULT_CONFIG_PATH: &str = "config.json";

#[tokio::main]
async fn main() -> ExitCode {
    dotenv::dotenv().ok();
    logging::init_logging();

    match run_app().await {
        Ok(_) => {
            tracing::info!("server shut down cleanly");
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!(error = ?e, "fatal error");
            ExitCode::FAILURE
        }
    }
}

async fn run_app() -> Result<()> {
    let config_path = env::var("BACKUP_CONFIG_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH));
    let app_config = AppConfig::load_from_json(&config_path).context(format!(
        "Failed to load application configuration from {}",
        config_path.display()
    ))?;

    tracing::info!(
        record_sets = app_config.catalog.record_sets().len(),
        containers = app_config.catalog.containers().len(),
        "loaded backup catalog"
    );

    let records = PostgresRecordStore::connect(
        &app_config.database_url,
        app_config.database_max_connections,
    )
    .await
    .context("Record store is unavailable")?;
    let objects = S3ObjectStore::connect(&app_config.spaces_config).await;

    let orchestrator = BackupOrchestrator::new(
        Arc::new(app_config.catalog.clone()),
        Arc::new(records),
        Arc::new(objects),
        app_config.backup.clone(),
    );

    let state = AppState {
        orchestrator,
        authenticator: Arc::new(StaticTokenAuthenticator::new(app_config.api_tokens.clone())),
        jobs: JobRegistry::default(),
        stream_buffer_bytes: app_config.stream_buffer_bytes,
    };

    server::start_server(state, app_config.bind_address).await
}
