//! HTTP route wiring, server startup and the background expiry sweep.

use std::sync::Arc;

use axum::middleware;
use axum::{
    extract::{DefaultBodyLimit, State},
    response::Json,
    routing::get,
    Router,
};
use chrono::SecondsFormat;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::marketplace::artifact::MAX_PROOF_BYTES;
use crate::marketplace::{create_market_store, Marketplace, Role, SystemClock};

use super::admin;
use super::auth;
use super::proofs::ProofStorage;
use super::tasks;
use super::types::HealthResponse;
use super::wallet;

/// Shared application state.
pub struct AppState {
    pub config: Config,
    /// Marketplace service (claims, proofs, verification, earnings)
    pub market: Arc<Marketplace>,
    /// On-disk proof images
    pub proofs: ProofStorage,
}

/// Open the configured store and assemble the application state.
pub async fn build_state(config: Config) -> anyhow::Result<Arc<AppState>> {
    let store = create_market_store(config.store_type, config.data_dir.clone()).await?;
    tracing::info!(
        "Marketplace store ready (persistent={})",
        store.is_persistent()
    );

    let market = Arc::new(Marketplace::new(
        Arc::from(store),
        Arc::new(SystemClock::new()),
        config.claim_window(),
    ));

    if let Some(admin) = &config.bootstrap_admin {
        market
            .ensure_user(admin.id, &admin.name, Role::Superadmin)
            .await?;
    }

    let proofs = ProofStorage::new(config.upload_dir.clone());
    tracing::info!("Proof uploads stored in {}", proofs.root().display());
    Ok(Arc::new(AppState {
        config,
        market,
        proofs,
    }))
}

/// Build the router for a prepared state.
pub fn router(state: Arc<AppState>) -> Router {
    let public_routes = Router::new().route("/api/health", get(health));

    let admin_routes = admin::routes().layer(middleware::from_fn(auth::require_admin));

    let protected_routes = Router::new()
        .nest("/api", tasks::routes())
        .route("/api/wallet", get(wallet::wallet))
        .nest("/api/admin", admin_routes)
        // Multipart bodies carry the proof image plus form overhead.
        .layer(DefaultBodyLimit::max(MAX_PROOF_BYTES as usize + 64 * 1024))
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            auth::require_auth,
        ));

    Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the HTTP server.
pub async fn serve(config: Config) -> anyhow::Result<()> {
    let state = build_state(config.clone()).await?;

    let sweeper = spawn_sweeper(Arc::clone(&state));

    let app = router(Arc::clone(&state));

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("Server listening on {}", addr);

    // Setup graceful shutdown on SIGTERM/SIGINT
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Some(handle) = sweeper {
        handle.abort();
    }
    tracing::info!("Graceful shutdown complete");
    Ok(())
}

/// Periodically fail lapsed claims. Disabled when the interval is zero.
fn spawn_sweeper(state: Arc<AppState>) -> Option<tokio::task::JoinHandle<()>> {
    let secs = state.config.sweep_interval_secs;
    if secs == 0 {
        tracing::info!("Expiry sweep disabled");
        return None;
    }
    Some(tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(secs));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            match state.market.sweep_expired().await {
                Ok(failed) if !failed.is_empty() => {
                    tracing::info!("Expiry sweep failed {} lapsed claims", failed.len());
                }
                Ok(_) => {}
                Err(e) => tracing::warn!("Expiry sweep error: {}", e),
            }
        }
    }))
}

/// Wait for SIGINT/SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}

/// Health check endpoint.
async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: state.market.now().to_rfc3339_opts(SecondsFormat::Secs, true),
        persistent_store: state.market.store().is_persistent(),
        dev_mode: state.config.dev_mode,
    })
}
