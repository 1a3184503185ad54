//! HTTP route handlers.
//!
//! Each sub-module corresponds to an API endpoint group. All handlers except
//! [`health`] sit behind [`crate::auth::require_api_key`] when an API key is
//! configured.

pub mod health;
pub mod sessions;
pub mod subresources;

use axum::{middleware, routing::get, Extension, Router};
use tower_http::trace::TraceLayer;

use crate::auth::{require_api_key, ApiKey};
use crate::state::AppState;

/// Prefix shared by the per-instance subresource routes.
pub const SUBRESOURCE_PREFIX: &str =
    "/apis/subresources.kubevirt.io/v1/namespaces/{namespace}/virtualmachineinstances/{name}";

/// Build the gateway router.
pub fn router(state: AppState) -> Router {
    let public_routes = Router::new().route("/api/health", get(health::health));

    let mut guarded_routes = Router::new()
        .route("/api/sessions", get(sessions::list_sessions))
        .route(
            &format!("{SUBRESOURCE_PREFIX}/vsock"),
            get(subresources::vsock),
        )
        .route(
            &format!("{SUBRESOURCE_PREFIX}/console"),
            get(subresources::console),
        )
        .route(&format!("{SUBRESOURCE_PREFIX}/vnc"), get(subresources::vnc));

    if let Some(ref key) = state.config.auth.api_key {
        guarded_routes = guarded_routes
            .layer(middleware::from_fn(require_api_key))
            .layer(Extension(ApiKey(key.clone())));
    }

    Router::new()
        .merge(public_routes)
        .merge(guarded_routes)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
