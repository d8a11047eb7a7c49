// ABOUTME: Execution server wiring: shared state, router, logging and the serve loop
// ABOUTME: Image preparation runs in the background while the listener is already up

use anyhow::Context;
use axum::http::{HeaderValue, Method};
use axum::Router;
use coderun_sandbox::{
    DockerProvider, ImagePreparer, LanguageRegistry, Provider, ReadinessState, SessionManager,
};
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

pub mod api;
pub mod config;
pub mod error;
pub mod stream;

use config::Config;

/// State shared by every request handler
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<SessionManager>,
    pub readiness: ReadinessState,
    pub output_pacing: Duration,
}

impl AppState {
    pub fn new(
        manager: Arc<SessionManager>,
        readiness: ReadinessState,
        output_pacing: Duration,
    ) -> Self {
        Self {
            manager,
            readiness,
            output_pacing,
        }
    }
}

/// Install the global subscriber. `RUST_LOG` overrides the `info` default.
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
}

pub fn build_router(state: AppState, cors_origin: &str) -> anyhow::Result<Router> {
    let origin = cors_origin
        .parse::<HeaderValue>()
        .with_context(|| format!("Invalid CORS origin '{}'", cors_origin))?;

    let cors = CorsLayer::new()
        .allow_origin(origin)
        .allow_methods([Method::GET])
        .allow_headers(Any);

    Ok(api::create_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors))
}

pub fn docker_provider(config: &Config) -> anyhow::Result<Arc<dyn Provider>> {
    let provider = DockerProvider::with_pull_timeout(config.pull_timeout)
        .context("Failed to connect to Docker")?;
    Ok(Arc::new(provider))
}

pub async fn run_server(config: Config) -> anyhow::Result<()> {
    let registry = Arc::new(config.load_registry()?);
    let provider = docker_provider(&config)?;

    info!(
        languages = ?registry.ids(),
        workspace_root = %config.workspace_root.display(),
        "Loaded language registry"
    );

    let readiness = ReadinessState::new();
    spawn_preparation(provider.clone(), registry.clone(), readiness.clone());

    let manager = Arc::new(SessionManager::new(
        registry,
        provider,
        config.sandbox_settings(),
    ));
    let state = AppState::new(manager, readiness, config.output_pacing);
    let app = build_router(state, &config.cors_origin)?;

    let addr = config.socket_addr();
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!("Server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server stopped");
    Ok(())
}

fn spawn_preparation(
    provider: Arc<dyn Provider>,
    registry: Arc<LanguageRegistry>,
    readiness: ReadinessState,
) {
    tokio::spawn(async move {
        let preparer = ImagePreparer::new(provider, registry);
        if let Err(e) = preparer.prepare_into(&readiness).await {
            warn!("Execution requests will be refused: {}", e);
        }
    });
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
