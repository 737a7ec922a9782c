//! API error mapping
//!
//! Converts the billing error taxonomy into HTTP responses with a stable
//! JSON shape the UI renders directly.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use staffly_billing::BillingError;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Missing authentication")]
    MissingAuth,
    #[error("Invalid or expired token")]
    InvalidToken,
    #[error(transparent)]
    Billing(#[from] BillingError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ApiError::MissingAuth => {
                (StatusCode::UNAUTHORIZED, "Authentication required".to_string())
            }
            ApiError::InvalidToken => {
                (StatusCode::UNAUTHORIZED, "Invalid or expired token".to_string())
            }
            ApiError::Billing(e) => billing_status(e),
        };

        if status.is_server_error() {
            tracing::error!(error = %self, status = status.as_u16(), "Request failed");
        } else {
            tracing::debug!(error = %self, status = status.as_u16(), "Request rejected");
        }

        let body = Json(json!({
            "error": message,
            "code": status.as_u16()
        }));
        (status, body).into_response()
    }
}

fn billing_status(e: &BillingError) -> (StatusCode, String) {
    use BillingError::*;

    let status = match e {
        Validation(_) => StatusCode::BAD_REQUEST,
        PlanNotFound(_) | SeatPlanNotFound(_) | SubscriptionNotFound(_) | SessionNotFound(_) => {
            StatusCode::NOT_FOUND
        }
        NoMatchingTier { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        AlreadyUsedTrial
        | TrialAlreadyActive
        | InvalidTransition { .. }
        | SeatLimitExceeded { .. }
        | ConcurrentModification
        | InvalidSession { .. } => StatusCode::CONFLICT,
        SessionExpired(_) => StatusCode::GONE,
        PaymentNotCompleted(_) => StatusCode::PAYMENT_REQUIRED,
        WebhookSignatureInvalid => StatusCode::UNAUTHORIZED,
        Gateway(_) => StatusCode::BAD_GATEWAY,
        Notifier(_) | Database(_) | Invariant(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };

    // Internal details stay in the log, not the response body.
    let message = if status.is_server_error() {
        "Internal server error".to_string()
    } else {
        e.to_string()
    };
    (status, message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn conflicts_map_to_409() {
        for e in [
            BillingError::AlreadyUsedTrial,
            BillingError::TrialAlreadyActive,
            BillingError::ConcurrentModification,
            BillingError::SeatLimitExceeded { count: 30, max: 25 },
        ] {
            assert_eq!(billing_status(&e).0, StatusCode::CONFLICT);
        }
    }

    #[test]
    fn expired_session_maps_to_410() {
        let e = BillingError::SessionExpired(Uuid::new_v4());
        assert_eq!(billing_status(&e).0, StatusCode::GONE);
    }

    #[test]
    fn internal_errors_hide_details() {
        let e = BillingError::Database("connection reset by peer".to_string());
        let (status, message) = billing_status(&e);
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(!message.contains("connection reset"));
    }
}
