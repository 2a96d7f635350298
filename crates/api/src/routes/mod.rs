//! HTTP route definitions

mod admin;
mod assistant;
mod health;
mod webhook;

use axum::routing::{get, post};
use axum::Router;

use crate::state::AppState;

/// Build the full application router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health_check))
        .route("/api/assistant", post(assistant::generate))
        .route("/api/usage", get(assistant::usage))
        .route("/api/webhooks/billing", post(webhook::handle_webhook))
        .route("/api/admin/users", post(admin::create_user))
        .route("/api/admin/override", post(admin::override_subscription))
        .route("/api/admin/dedupe", post(admin::dedupe_subscriptions))
        .route("/api/admin/invariants", get(admin::run_invariants))
        .route(
            "/api/admin/invariants/{name}",
            get(admin::run_single_invariant),
        )
        .with_state(state)
}
