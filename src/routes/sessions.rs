//! `GET /api/sessions` — active tunnel session gauges.
//!
//! One sample per (channel kind, instance) seen since the last prune:
//!
//! ```json
//! {"sessions": [{"metric": "kubevirt_vmi_vsock_active_connections",
//!                "kind": "vsock", "namespace": "default", "name": "fedora",
//!                "value": 1}],
//!  "total": 1}
//! ```

use axum::{extract::State, Json};
use serde_json::{json, Value};

use crate::state::AppState;

pub async fn list_sessions(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "sessions": state.sessions.snapshot(),
        "total": state.sessions.total(),
    }))
}
