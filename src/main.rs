//! ntl_cloud server
//!
//! Serves the deployment dashboard API.
//! - Storage: Sled trees for users, deployments and the domain index
//! - Lifecycle: one Tokio task per in-flight deployment polling the provider
//! - Provider: external hosting REST API, or the local stand-in when unset
//!
//! Usage:
//!   cargo run --bin load_data    # seed a demo user + deployment
//!   cargo run --bin ntl_cloud    # start server (see NTL_* env vars)

use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::info;

use ntl_cloud::config::Config;
use ntl_cloud::monitor::LogNotifier;
use ntl_cloud::provider::{HostingProvider, HttpProvider, LocalProvider};
use ntl_cloud::rest::{create_router, AppState};
use ntl_cloud::storage::Storage;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    let config = Config::from_env()?;
    let _log_guard = ntl_cloud::logging::init(&config);
    config.log_warnings();

    let storage = Storage::open(&config.data_dir)?;
    tokio::fs::create_dir_all(&config.upload_dir).await?;

    let provider: Arc<dyn HostingProvider> = match &config.provider {
        Some(provider) => Arc::new(HttpProvider::new(provider)?),
        None => Arc::new(LocalProvider),
    };
    info!(
        bind = %config.bind_addr,
        data_dir = %config.data_dir.display(),
        provider = provider.name(),
        poll_interval_secs = config.poll.interval.as_secs(),
        poll_max_attempts = config.poll.max_attempts,
        "starting ntl_cloud"
    );

    let bind_addr = config.bind_addr;
    let state = Arc::new(AppState::new(config, storage.clone(), provider, Arc::new(LogNotifier)));
    state.monitor.recover()?;
    let app = create_router(state);

    let listener = TcpListener::bind(bind_addr).await?;
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %err, "failed to listen for shutdown signal");
            }
        })
        .await?;

    info!("shutting down, flushing store");
    storage.flush().await?;
    Ok(())
}
