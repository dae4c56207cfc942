//! API routes

mod billing;
mod cron;
mod merchants;
mod webhooks;

#[cfg(test)]
mod router_tests;

use axum::{
    middleware,
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};

use crate::{
    auth::{require_cron, require_user},
    state::AppState,
};

pub fn create_router(state: AppState) -> Router {
    let merchant_routes = Router::new()
        .route("/api/merchants", post(merchants::register))
        .route("/api/billing/status", get(billing::status))
        .route("/api/billing/retry", post(billing::retry))
        .route("/api/billing/pay-now", post(billing::pay_now))
        .route("/api/billing/flow-access", get(billing::flow_access))
        .route("/api/billing/payment-methods", get(billing::payment_methods))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_user));

    let cron_routes = Router::new()
        .route("/api/cron/billing", post(cron::run_billing_cycle))
        .route("/api/cron/invariants", get(cron::invariants))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_cron));

    Router::new()
        .route("/health", get(health))
        .route("/api/webhooks/whop", post(webhooks::whop))
        .merge(merchant_routes)
        .merge(cron_routes)
        .with_state(state)
}

async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
