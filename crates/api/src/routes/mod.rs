//! Route registration

pub mod billing;
pub mod webhooks;

use axum::routing::{get, post};
use axum::Router;

use crate::state::AppState;

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/api/billing/checkout/trial", post(billing::start_trial_checkout))
        .route(
            "/api/billing/checkout/trial/complete",
            post(billing::complete_trial_checkout),
        )
        .route("/api/billing/checkout/paid", post(billing::start_paid_checkout))
        .route("/api/billing/plan/upgrade", post(billing::change_plan))
        .route("/api/billing/seat-plan", post(billing::change_seat_plan))
        .route("/api/billing/payment/verify", post(billing::verify_payment))
        .route("/api/billing/subscription", get(billing::current_subscription))
        .route(
            "/api/billing/subscription/history",
            get(billing::subscription_history),
        )
        .route("/api/billing/employee-count", post(billing::record_employee_count))
        .route("/api/webhooks/payment", post(webhooks::payment_webhook))
        .route("/health", get(health))
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}
