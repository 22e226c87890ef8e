//! Policy Engine Control Plane Server
//!
//! Accepts workflow run requests and GitHub webhooks, executes runs through
//! the configured task backend and serves their status.

use std::net::SocketAddr;
use std::sync::Arc;

use policy_engine::Runner;
use tokio::net::TcpListener;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use policy_engine_control_plane::{
    backend::{InProcessBackend, NatsBackend, TaskBackend},
    build_router,
    config::{AppConfig, BackendKind},
    github::GitHubReporter,
    services::{FileWorkflowResolver, WebhookService},
    state::AppState,
};

/// Initialize tracing/logging.
fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "info,policy_engine=debug,policy_engine_control_plane=debug,tower_http=debug".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Build the backend selected by configuration.
async fn create_backend(config: &AppConfig) -> anyhow::Result<Arc<dyn TaskBackend>> {
    Ok(match config.backend {
        BackendKind::InProcess => {
            Arc::new(InProcessBackend::new(Runner::new(config.engine_config())))
        }
        BackendKind::Nats => Arc::new(NatsBackend::connect(config).await?),
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if present
    dotenvy::dotenv().ok();

    init_tracing();

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        "Starting Policy Engine Control Plane"
    );

    let app_config = AppConfig::from_env().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "Failed to load app config, using defaults");
        AppConfig::default()
    });

    tracing::info!(
        host = %app_config.host,
        port = app_config.port,
        backend = app_config.backend.as_str(),
        debug = app_config.debug,
        "Configuration loaded"
    );

    let config = Arc::new(app_config);
    let backend = create_backend(&config).await?;
    let mut state = AppState::new(config.clone(), backend.clone());

    match &config.webhook_workflows_dir {
        Some(dir) => {
            let webhooks = WebhookService::new(
                backend,
                Arc::new(GitHubReporter::new(&config)),
                Arc::new(FileWorkflowResolver::new(dir)),
                config.clone(),
            );
            state = state.with_webhooks(webhooks);
            tracing::info!(workflows_dir = %dir.display(), "Webhook ingress enabled");
        }
        None => tracing::info!("POLICY_ENGINE_WEBHOOK_WORKFLOWS_DIR not set, webhook ingress disabled"),
    }

    let app = build_router(state);

    let addr: SocketAddr = config.bind_address().parse()?;
    let listener = TcpListener::bind(addr).await?;

    tracing::info!(address = %addr, "Server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Server shutdown complete");

    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, starting graceful shutdown");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        }
    }
}
