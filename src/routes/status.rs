//! Diagnostic status endpoint.

use axum::{Json, Router, extract::State, routing::get};
use serde::Serialize;

use crate::routes::AppError;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/status", get(status))
}

#[derive(Serialize)]
pub struct StatusReport {
    pub pairs: usize,
    pub tombstones: usize,
    pub channels: usize,
    pub channels_due_for_renewal: usize,
    pub queue_depth: usize,
    pub dedup_entries: usize,
}

/// GET /status - Snapshot of the engine's working state
async fn status(State(state): State<AppState>) -> Result<Json<StatusReport>, AppError> {
    let (pairs, tombstones) = state.store.counts();
    let due = state
        .registry
        .renewal_due(
            chrono::Duration::hours(boardcal_core::RENEWAL_LEAD_HOURS),
            chrono::Utc::now(),
        )
        .len();

    Ok(Json(StatusReport {
        pairs,
        tombstones,
        channels: state.registry.len(),
        channels_due_for_renewal: due,
        queue_depth: state.queue.depth(),
        dedup_entries: state.dedup.len(),
    }))
}
