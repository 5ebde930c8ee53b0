//! Agentum API server entry point.

use std::path::PathBuf;
use std::sync::Arc;

use agentum_core::auth::AuthService;
use agentum_core::config::AppConfig;
use agentum_core::store::MetadataStore;
use agentum_core::AgentumContext;

use agentum_server::{build_router, SharedState};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config_path = std::env::var("AGENTUM_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("config/api.yaml"));
    let config = AppConfig::load(&config_path)?;
    log_configuration(&config);

    std::fs::create_dir_all(&config.paths.sessions_root)?;
    let store = Arc::new(MetadataStore::open(&config.database.path).await?);
    let auth = Arc::new(AuthService::open(config.secrets_file())?);

    let addr = format!("{}:{}", config.api.host, config.api.external_port);
    let ctx = AgentumContext::builder(config, store, auth).build();

    // No supervisor survives a restart; reconcile orphaned rows first.
    let cleaned = ctx.lifecycle.cleanup_stale_sessions().await?;
    if cleaned > 0 {
        log::warn!("reconciled {cleaned} stale running sessions");
    }

    let state = SharedState::new(ctx);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    log::info!("agentum api listening on http://{addr}");

    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        log::error!("failed to install shutdown handler: {e}");
        return;
    }
    log::info!("shutdown signal received");
}

/// One-time startup summary. Only non-sensitive settings are printed; the
/// token secret never leaves `secrets.yaml`.
fn log_configuration(config: &AppConfig) {
    log::info!("configuration:");
    log::info!("  api: {}:{}", config.api.host, config.api.external_port);
    log::info!("  database: {}", config.database.path.display());
    log::info!("  sessions root: {}", config.paths.sessions_root.display());
    log::info!("  skills dir: {}", config.paths.skills_dir.display());
    log::info!("  agent command: {:?}", config.agent.command);
    log::info!(
        "  limits: {} concurrent sessions, {}s timeout, {} event buffer",
        config.runtime.max_concurrent_sessions,
        config.agent.timeout_seconds,
        config.runtime.subscriber_buffer
    );
    log::info!("  cors origins: {:?}", config.cors_origins());
}
