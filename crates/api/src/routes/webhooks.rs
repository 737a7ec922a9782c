//! Payment gateway webhook endpoint
//!
//! Signature-verified, not JWT-authenticated. Always answers 200 for events
//! that were verified and claimed, even when processing decided to do
//! nothing, so the gateway stops redelivering.

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use serde_json::json;

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

pub const SIGNATURE_HEADER: &str = "x-signature";

pub async fn payment_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> ApiResult<(StatusCode, Json<serde_json::Value>)> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or(ApiError::Billing(
            staffly_billing::BillingError::WebhookSignatureInvalid,
        ))?;

    let event = state.billing.webhooks.verify_event(&body, signature)?;
    state.billing.webhooks.handle_event(event).await?;

    Ok((StatusCode::OK, Json(json!({ "received": true }))))
}
