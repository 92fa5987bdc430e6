use axum::{
    middleware,
    routing::{get, post, put},
    Router,
};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use super::auth::{admin_auth_middleware, AdminAuth};
use super::handlers;
use super::middleware::track_latency;
use super::router::EdgeRouter;

pub fn create_edge_router(edge: Arc<EdgeRouter>) -> Router {
    let auth = Arc::new(AdminAuth::new(edge.config().admin_token.clone()));
    if !auth.is_enabled() {
        tracing::warn!("EDGE_ADMIN_TOKEN is not set, admin endpoints are unauthenticated");
    }

    let admin_routes = Router::new()
        .route("/edge/emit", post(handlers::emit))
        .route("/edge/cache/refresh", post(handlers::refresh_cache))
        .route("/edge/queue/flush", post(handlers::flush_queue))
        .route("/edge/dlq", get(handlers::list_dead_letters))
        .route("/edge/dlq/replay", post(handlers::replay_dead_letters))
        .route("/edge/rules/{kind}", put(handlers::put_rule))
        .route_layer(middleware::from_fn(move |headers, req, next| {
            let auth = Arc::clone(&auth);
            admin_auth_middleware(auth, headers, req, next)
        }));

    let edge_routes = Router::new()
        .route("/edge/verify", get(handlers::verify))
        .route("/edge/diagnostics", get(handlers::diagnostics))
        .route("/edge/status", get(handlers::status))
        .route("/edge/metrics", get(handlers::metrics))
        .route("/edge/health", get(handlers::health))
        .merge(admin_routes)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );

    Router::new()
        .route("/c/{signed_code}", get(handlers::click))
        .merge(edge_routes)
        .layer(middleware::from_fn(track_latency))
        .with_state(edge)
}
