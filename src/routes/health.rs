//! Health-check endpoint.

use axum::{extract::State, Json};
use serde_json::{json, Value};

use crate::state::AppState;

/// `GET /health` — liveness probe.
///
/// Returns status, uptime, and session occupancy. Suitable for
/// load-balancer health checks.
pub async fn health(State(state): State<AppState>) -> Json<Value> {
    let uptime = state.start_time.elapsed().as_secs();
    let active = state.session_manager.count().await;

    Json(json!({
        "status": "ok",
        "uptime_s": uptime,
        "version": env!("CARGO_PKG_VERSION"),
        "active_sessions": active,
        "max_sessions": state.session_manager.max_sessions(),
    }))
}
