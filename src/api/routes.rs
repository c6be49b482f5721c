//! API routes

use crate::api::handlers::{
    check_compatibility, get_extension, health_check, invoke_capability, list_extensions,
    load_extension, resolve_stream, set_enabled, unload_extension, validate_manifest, AppState,
};
use axum::{
    routing::{get, post, put},
    Router,
};

/// Build the `/api` routes
pub fn build_api_routes(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health_check))
        .route("/api/extensions", get(list_extensions).post(load_extension))
        .route("/api/extensions/:id", get(get_extension).delete(unload_extension))
        .route("/api/extensions/:id/enabled", put(set_enabled))
        .route("/api/extensions/:id/compatibility", get(check_compatibility))
        .route("/api/extensions/:id/invoke/:capability", post(invoke_capability))
        .route("/api/manifests/validate", post(validate_manifest))
        .route("/api/streams/resolve", post(resolve_stream))
        .with_state(state)
}
