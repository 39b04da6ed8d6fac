//! HTTP routes

pub mod admin;
pub mod billing;
pub mod cron;
pub mod webhooks;

#[cfg(test)]
mod router_tests;

use axum::{
    middleware,
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};

use crate::{
    auth::{require_admin_secret, require_auth, require_cron_secret},
    state::AppState,
};

async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

pub fn create_router(state: AppState) -> Router {
    let user_routes = Router::new()
        .route("/me", get(billing::me))
        .route("/plans", get(billing::plans))
        .route("/credits/history", get(billing::credit_history))
        .route("/orders", post(billing::create_order))
        .route("/payments", get(billing::list_payments))
        .route("/payments/confirm", post(billing::confirm_payment))
        .route("/payments/{order_id}", get(billing::get_payment))
        .route(
            "/subscription",
            get(billing::current_subscription).post(billing::subscribe),
        )
        .route("/subscription/preview", get(billing::preview_change))
        .route("/subscription/change", post(billing::change_plan))
        .route("/subscription/cancel", post(billing::cancel_subscription))
        .route("/subscription/resume", post(billing::resume_subscription))
        .route("/subscription/pause", post(billing::pause_subscription))
        .route("/subscription/unpause", post(billing::unpause_subscription))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth));

    let cron_routes = Router::new()
        .route("/renewals", get(cron::renewals))
        .route("/quota-reset", get(cron::quota_reset))
        .route("/credit-expiry", get(cron::credit_expiry))
        .route("/webhook-retry", get(cron::webhook_retry))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_cron_secret,
        ));

    let admin_routes = Router::new()
        .route("/payments/{id}/refund", post(admin::refund_payment))
        .route("/credits/adjust", post(admin::adjust_credits))
        .route("/webhooks", get(admin::list_webhook_logs))
        .route("/webhooks/{id}/replay", post(admin::replay_webhook))
        .route("/subscriptions/{id}/cancel", post(admin::cancel_subscription))
        .route("/invariants", get(admin::run_invariant_checks))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_admin_secret,
        ));

    Router::new()
        .route("/health", get(health))
        .route("/api/webhooks/gateway", post(webhooks::gateway_webhook))
        .nest("/api/billing", user_routes)
        .nest("/api/cron", cron_routes)
        .nest("/api/admin", admin_routes)
        .with_state(state)
}
