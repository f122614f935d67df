//! HTTP surface: router assembly and CORS.

pub mod client_ip;
pub mod handlers;
pub mod middleware;

use std::sync::Arc;

use axum::{
    http::HeaderValue,
    routing::{get, post},
    Router,
};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::state::ServiceState;

/// Build the application router. CORS origins come from
/// `INBOXOS_CORS_ORIGINS` (comma-separated whitelist); no origins means
/// no CORS headers at all.
pub fn build_router(state: Arc<ServiceState>) -> Router {
    let mut router = Router::new()
        .route("/classify", post(handlers::classify))
        .route("/verify", post(handlers::verify))
        .route("/digest", post(handlers::digest))
        .route("/feedback", post(handlers::feedback))
        .route("/health", get(handlers::health))
        .route("/config/confidence", get(handlers::config_confidence))
        .route("/features/:name/:action", post(handlers::toggle_feature))
        .route("/rules", get(handlers::list_rules))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::auth_middleware,
        ))
        .layer(TraceLayer::new_for_http());

    let origins: Vec<HeaderValue> = std::env::var("INBOXOS_CORS_ORIGINS")
        .unwrap_or_default()
        .split(',')
        .filter_map(|o| {
            let trimmed = o.trim();
            if trimmed.is_empty() {
                None
            } else {
                HeaderValue::from_str(trimmed).ok()
            }
        })
        .collect();
    if !origins.is_empty() {
        router = router.layer(CorsLayer::new().allow_origin(AllowOrigin::list(origins)));
    }

    router.with_state(state)
}
