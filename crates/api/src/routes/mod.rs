//! API routes

pub mod billing;
pub mod health;
pub mod plans;

use axum::{
    extract::DefaultBodyLimit,
    middleware,
    routing::{get, post},
    Router,
};

use crate::{auth::require_auth, state::AppState};

/// Create all API routes
pub fn create_router(state: AppState) -> Router {
    // Health check routes (at root level for infrastructure monitoring)
    let health_routes = Router::new()
        .route("/health", get(health::health))
        .route("/health/live", get(health::liveness))
        .route("/health/ready", get(health::readiness));

    // Public API routes (no auth required) - under /api/v1.
    // The webhook authenticates with its own signature, never with a JWT.
    let public_api_routes = Router::new()
        .route("/plans", get(plans::list_plans))
        .route("/billing/webhook", post(billing::webhook));

    // Protected API routes (auth required) - under /api/v1
    let protected_api_routes = Router::new()
        .route("/billing/checkout", post(billing::create_checkout))
        .route("/billing/subscription", get(billing::get_subscription))
        .layer(middleware::from_fn_with_state(state.clone(), require_auth));

    let api_v1_routes = Router::new()
        .merge(public_api_routes)
        .merge(protected_api_routes);

    Router::new()
        .merge(health_routes)
        .nest("/api/v1", api_v1_routes)
        // Global request body size limit to prevent DoS via large payloads
        .layer(DefaultBodyLimit::max(1024 * 1024))
        .with_state(state)
}
