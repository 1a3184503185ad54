//! Unauthenticated health-check endpoint.

use axum::{extract::State, Json};
use serde_json::{json, Value};

use crate::state::AppState;

/// `GET /api/health` — liveness probe.
///
/// Returns status, uptime, version and the number of open tunnel sessions.
/// No authentication required, suitable for load-balancer health checks.
pub async fn health(State(state): State<AppState>) -> Json<Value> {
    let uptime = state.start_time.elapsed().as_secs();

    Json(json!({
        "status": if state.shutdown.is_cancelled() { "draining" } else { "ok" },
        "uptime_secs": uptime,
        "version": env!("CARGO_PKG_VERSION"),
        "sessions": state.sessions.total(),
    }))
}
