//! HTTP server setup and configuration.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use reqwest::Client;
use tower::limit::ConcurrencyLimitLayer;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use super::handlers;
use crate::config::Config;
use crate::health::HealthTracker;
use crate::registry::Registry;
use crate::router::Selector;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<Registry>,
    pub selector: Selector,
    pub http_client: Client,
    pub config: Arc<Config>,
}

impl AppState {
    /// Build the state for `config`, registering its backends.
    pub fn new(config: Config, http_client: Client) -> crate::Result<Self> {
        let registry = Arc::new(Registry::new(config.backends.clone())?);
        Ok(Self {
            selector: Selector::new(Arc::clone(&registry)),
            registry,
            http_client,
            config: Arc::new(config),
        })
    }
}

/// Build the upstream HTTP client.
///
/// No overall timeout: request and stream deadlines are enforced per request.
pub fn build_http_client(config: &Config) -> reqwest::Result<Client> {
    Client::builder()
        .connect_timeout(config.routing.connect_timeout())
        .build()
}

/// Create the axum router with all endpoints.
pub fn create_router(state: AppState) -> Router {
    let cors = state.config.server.cors;
    let max_concurrent = state.config.server.max_concurrent_requests;

    let mut router = Router::new()
        // OpenAI-compatible endpoints
        .route("/v1/chat/completions", post(handlers::chat_completions))
        .route("/v1/models", get(handlers::list_models))
        // infergate extensions
        .route("/health", get(handlers::health))
        .route("/stats", get(handlers::stats))
        .with_state(state);

    if let Some(limit) = max_concurrent {
        router = router.layer(ConcurrencyLimitLayer::new(limit));
    }
    if cors {
        router = router.layer(CorsLayer::permissive());
    }

    router.layer(TraceLayer::new_for_http())
}

/// Re-read the backends section of `path` and publish it.
///
/// Server, routing, and health settings only take effect on restart.
pub fn reload_from_file(
    path: &Path,
    registry: &Registry,
    tracker: &HealthTracker,
) -> anyhow::Result<()> {
    let (config, _) = Config::from_file_with_env(path)?;
    registry.reload(config.backends)?;
    tracker.sync();
    Ok(())
}

/// Run the HTTP server until ctrl-c.
///
/// With `config_path` set, SIGHUP reloads the backend set from that file.
pub async fn run_server(config: Config, config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let listen_addr = config.server.listen.clone();
    let http_client = build_http_client(&config)?;
    let state = AppState::new(config, http_client.clone())?;

    let tracker = Arc::new(HealthTracker::new(
        Arc::clone(&state.registry),
        http_client,
        state.config.health.clone(),
    ));
    tracker.sync();

    #[cfg(unix)]
    {
        if let Some(path) = config_path {
            spawn_reload_listener(path, Arc::clone(&state.registry), Arc::clone(&tracker))?;
        }
    }
    #[cfg(not(unix))]
    let _ = config_path;

    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(&listen_addr).await?;
    tracing::info!(address = %listen_addr, "Starting infergate proxy server");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracker.shutdown();
    tracing::info!("Server stopped");
    Ok(())
}

#[cfg(unix)]
fn spawn_reload_listener(
    path: PathBuf,
    registry: Arc<Registry>,
    tracker: Arc<HealthTracker>,
) -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = signal(SignalKind::hangup())?;
    tokio::spawn(async move {
        while hangup.recv().await.is_some() {
            tracing::info!(path = %path.display(), "SIGHUP received, reloading backends");
            if let Err(e) = reload_from_file(&path, &registry, &tracker) {
                tracing::error!(error = %e, "Reload failed, keeping current backends");
            }
        }
    });
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
