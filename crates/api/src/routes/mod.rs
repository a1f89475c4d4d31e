//! API routes

pub mod admin;
pub mod billing;
pub mod dashboard;
pub mod health;

use axum::{
    extract::DefaultBodyLimit,
    middleware,
    routing::{get, post},
    Router,
};

use crate::{
    auth::{require_auth, require_paid_access},
    state::AppState,
};

/// Provider webhook bodies are small JSON documents
const WEBHOOK_BODY_LIMIT: usize = 256 * 1024;

/// Create all API routes
pub fn create_router(state: AppState) -> Router {
    // Health check routes (at root level for infrastructure monitoring)
    let health_routes = Router::new()
        .route("/health", get(health::health))
        .route("/health/live", get(health::liveness))
        .route("/health/ready", get(health::readiness));

    // Public API routes (signature auth, not JWT)
    let public_api_routes = Router::new()
        .route("/billing/webhook", post(billing::webhook))
        .layer(DefaultBodyLimit::max(WEBHOOK_BODY_LIMIT));

    // Protected API routes (JWT required)
    let protected_api_routes = Router::new()
        .route("/billing/trial", post(billing::start_trial))
        .route("/billing/status", get(billing::get_status))
        .route("/billing/access", get(billing::get_access))
        .route("/billing/checkout", post(billing::create_checkout))
        .route(
            "/admin/accounts/:account_id/lifetime",
            post(admin::grant_lifetime),
        )
        .route(
            "/admin/accounts/:account_id/events",
            get(admin::account_history),
        )
        .route("/admin/billing/webhooks", get(admin::list_webhook_events));

    // Paid routes: the access gate runs after auth and before any handler
    let paid_api_routes = Router::new()
        .route("/dashboard/entitlement", get(dashboard::entitlement))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            require_paid_access,
        ));

    let authenticated_routes = Router::new()
        .merge(protected_api_routes)
        .merge(paid_api_routes)
        .layer(middleware::from_fn_with_state(state.clone(), require_auth));

    // Combine API routes under /api/v1 prefix
    let api_v1_routes = Router::new()
        .merge(public_api_routes)
        .merge(authenticated_routes);

    Router::new()
        .merge(health_routes)
        .nest("/api/v1", api_v1_routes)
        .layer(DefaultBodyLimit::max(1024 * 1024))
        .with_state(state)
}
