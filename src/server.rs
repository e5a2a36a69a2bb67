use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use axum::Router;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use crate::api::{api_router, AppState, SharedState};
use crate::config::ServiceConfig;
use crate::db::{DbHandle, SiteDb};
use crate::llm::{GenerativeModel, ModelClient};
use crate::vercel::VercelClient;
use crate::verifier::BuildVerifier;

/// Configuration for the sitesmith server process.
pub struct ServerConfig {
    pub port: u16,
    pub db_path: std::path::PathBuf,
    pub dev_mode: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 4141,
            db_path: std::path::PathBuf::from("sitesmith.db"),
            dev_mode: false,
        }
    }
}

/// Assemble shared state from config. Missing credentials degrade the
/// matching endpoints instead of preventing startup.
pub fn build_state(service_config: ServiceConfig, db: SiteDb) -> SharedState {
    let model: Option<Arc<dyn GenerativeModel>> = match ModelClient::new(&service_config) {
        Ok(client) => Some(Arc::new(client)),
        Err(e) => {
            warn!("model API unavailable: {}", e);
            None
        }
    };
    let vercel = match VercelClient::new(&service_config) {
        Ok(client) => Some(Arc::new(client)),
        Err(_) => {
            warn!("hosting provider token not set; publish/preview disabled");
            None
        }
    };
    let verifier = Arc::new(BuildVerifier::new(&service_config));

    Arc::new(AppState {
        db: DbHandle::new(db),
        config: service_config,
        model,
        vercel,
        verifier,
        active_builds: Mutex::new(HashSet::new()),
    })
}

pub fn build_router(state: SharedState) -> Router {
    api_router().with_state(state)
}

/// Start the sitesmith server.
pub async fn start_server(config: ServerConfig) -> Result<()> {
    if let Some(parent) = config.db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).context("Failed to create database directory")?;
        }
    }

    let service_config = ServiceConfig::load(std::path::Path::new("."))
        .context("Failed to load service configuration")?;
    let db = SiteDb::new(&config.db_path).context("Failed to initialize database")?;
    let state = build_state(service_config, db);

    let mut app = build_router(state);
    if config.dev_mode {
        app = app.layer(CorsLayer::permissive());
    }

    let host = if config.dev_mode { "0.0.0.0" } else { "127.0.0.1" };
    let addr = format!("{}:{}", host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    let local_addr = listener.local_addr()?;
    info!("sitesmith running at http://{}", local_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("server shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("failed to install Ctrl+C handler: {}", e);
    }
    info!("shutting down...");
}
