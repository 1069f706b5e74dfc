use axum::{extract::State, Json};
use serde::Serialize;

use crate::api::AppState;
use crate::listener::{ListenerState, ListenerStatus};

/// Response for `/health`
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// `ok`, or `degraded` when the store is unreachable or a listener failed
    pub status: String,
    pub service: String,
    /// Store connectivity: `ok` or `error`
    pub db: String,
    /// Lowest checkpoint across listeners
    pub last_event_block: u64,
    pub listeners: Vec<ListenerStatus>,
}

/// Store connectivity plus sync progress
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let listeners: Vec<ListenerStatus> = state.listeners.iter().map(|s| s.read().clone()).collect();

    let db_ok = match state.store.ping() {
        Ok(()) => true,
        Err(e) => {
            log::warn!("Health check store ping failed: {}", e);
            false
        }
    };

    let last_event_block = if db_ok {
        last_event_block(&state, &listeners)
    } else {
        0
    };

    let any_failed = listeners.iter().any(|l| l.state == ListenerState::Failed);
    let status = if db_ok && !any_failed { "ok" } else { "degraded" };

    Json(HealthResponse {
        status: status.to_string(),
        service: "desci-node".to_string(),
        db: if db_ok { "ok" } else { "error" }.to_string(),
        last_event_block,
        listeners,
    })
}

fn last_event_block(state: &AppState, listeners: &[ListenerStatus]) -> u64 {
    let stored = match state.store.checkpoints() {
        Ok(checkpoints) => checkpoints,
        Err(e) => {
            log::warn!("Failed to read checkpoints: {}", e);
            return 0;
        }
    };

    let blocks: Vec<u64> = if listeners.is_empty() {
        stored.iter().map(|c| c.last_processed_block).collect()
    } else {
        listeners
            .iter()
            .map(|l| {
                stored
                    .iter()
                    .find(|c| c.listener == l.name)
                    .map(|c| c.last_processed_block)
                    .unwrap_or(0)
            })
            .collect()
    };

    blocks.into_iter().min().unwrap_or(0)
}
