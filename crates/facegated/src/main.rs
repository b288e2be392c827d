use std::sync::Arc;

use anyhow::{Context, Result};
use facegate_core::AuthService;
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod store;

use config::Config;
use dbus_interface::{AppState, FacegateService};
use store::SqliteIdentityStore;

const BUS_NAME: &str = "org.facegate.Facegate1";
const OBJECT_PATH: &str = "/org/facegate/Facegate1";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("facegated starting");

    let config = Config::from_env().context("failed to load configuration")?;
    tracing::info!(
        db = %config.db_path.display(),
        embedding_length = config.auth.embedding_length,
        similarity_threshold = config.auth.thresholds.similarity_threshold,
        session_bus = config.session_bus,
        "configuration loaded"
    );

    let store = SqliteIdentityStore::open(&config.db_path, config.auth.embedding_length)
        .await
        .with_context(|| format!("failed to open {}", config.db_path.display()))?;
    let enrolled = store.count().await.unwrap_or(0);
    tracing::info!(enrolled, "identity store opened");

    let service = AuthService::new(config.auth.clone(), store)?;
    let session_bus = config.session_bus;
    let facegate = FacegateService {
        state: Arc::new(AppState { config, service }),
    };

    let builder = if session_bus {
        zbus::connection::Builder::session()?
    } else {
        zbus::connection::Builder::system()?
    };
    let _conn = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, facegate)?
        .build()
        .await
        .context("failed to register on D-Bus")?;

    tracing::info!(bus = BUS_NAME, path = OBJECT_PATH, "facegated ready");

    // Keep running until signaled
    tokio::signal::ctrl_c().await?;
    tracing::info!("facegated shutting down");

    Ok(())
}
