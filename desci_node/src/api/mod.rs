//! Read-only HTTP API over the projected store

use axum::{
    http::Method,
    routing::{get, post},
    Router,
};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::ApiConfig;
use crate::error::{Result, SyncError};
use crate::listener::SharedStatus;
use crate::storage::SyncStore;
use crate::verify::ContentVerifier;

pub mod errors;
pub mod handlers;

pub use errors::{ApiError, ApiResult};

use handlers::{datasets, health, metrics, research};

/// Shared state handed to every handler
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<SyncStore>,
    pub verifier: Arc<ContentVerifier>,
    pub listeners: Vec<SharedStatus>,
    pub api: ApiConfig,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health_check))
        .route("/metrics", get(metrics::get_metrics))
        // Research
        .route("/api/research/latest", get(research::get_latest_research))
        .route("/api/research/by-author/:address", get(research::get_research_by_author))
        .route("/api/research/:token_id", get(research::get_research))
        .route("/api/research/:token_id/verify", post(research::verify_research))
        .route("/api/research/:token_id/reviews", get(research::get_research_reviews))
        .route("/api/research/:token_id/citations", get(research::get_research_citations))
        // Datasets and users
        .route("/api/dataset/:dataset_id", get(datasets::get_dataset))
        .route("/api/users/:address", get(datasets::get_user))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods([Method::GET, Method::POST])
                .allow_headers(Any),
        )
        .with_state(state)
}

/// Serve the API until `shutdown` resolves
pub async fn serve<F>(config: &ApiConfig, state: AppState, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .map_err(|e| SyncError::Config(format!("invalid API address {}:{}: {}", config.host, config.port, e)))?;

    let listener = tokio::net::TcpListener::bind(addr).await?;
    log::info!("Query API listening on http://{}", addr);

    axum::serve(listener, create_router(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}
