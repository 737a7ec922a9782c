//! Billing error taxonomy
//!
//! Variants map one-to-one onto the caller-visible failure classes:
//! validation (no state change), conflicts (no state change), session expiry
//! (session is moved to `expired` as a side effect), gateway failures
//! (transient, caller retries initiation; webhook redelivery covers
//! completion), and invariant violations (fail closed, never auto-repaired).

use staffly_shared::SubscriptionStatus;
use uuid::Uuid;

use crate::subscriptions::SubscriptionEventKind;

/// Result alias used throughout the billing crate
pub type BillingResult<T> = Result<T, BillingError>;

/// Errors from the payment gateway boundary.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("gateway request failed: {0}")]
    Transport(String),

    #[error("gateway rejected request ({status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("gateway returned malformed response: {0}")]
    Malformed(String),

    #[error("gateway invoice not found: {0}")]
    InvoiceNotFound(String),
}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        GatewayError::Transport(err.to_string())
    }
}

/// All errors surfaced by the billing engine.
#[derive(Debug, thiserror::Error)]
pub enum BillingError {
    // --- Validation (malformed request, no state change) ---
    #[error("validation failed: {0}")]
    Validation(String),

    // --- Not found ---
    #[error("subscription plan not found: {0}")]
    PlanNotFound(Uuid),

    #[error("seat plan not found: {0}")]
    SeatPlanNotFound(Uuid),

    #[error("no seat tier of plan {plan_id} covers a headcount of {count}")]
    NoMatchingTier { plan_id: Uuid, count: i32 },

    #[error("no subscription found for tenant {0}")]
    SubscriptionNotFound(Uuid),

    #[error("checkout session not found: {0}")]
    SessionNotFound(Uuid),

    // --- Conflicts (reported, no state change) ---
    #[error("tenant has already used their one lifetime trial")]
    AlreadyUsedTrial,

    #[error("a trial is already active for this tenant")]
    TrialAlreadyActive,

    #[error("invalid transition: {event} is not allowed from {from}")]
    InvalidTransition {
        from: DisplayableStatus,
        event: SubscriptionEventKind,
    },

    #[error("employee count {count} exceeds the seat limit of {max}")]
    SeatLimitExceeded { count: i32, max: i32 },

    #[error("subscription was modified by another process, retry the operation")]
    ConcurrentModification,

    // --- Session lifecycle ---
    #[error("checkout session {0} has expired")]
    SessionExpired(Uuid),

    #[error("checkout session {id} is {status} and cannot be completed")]
    InvalidSession { id: Uuid, status: String },

    #[error("payment for session {0} has not completed")]
    PaymentNotCompleted(Uuid),

    // --- Collaborators ---
    #[error("payment gateway unavailable: {0}")]
    Gateway(#[from] GatewayError),

    #[error("webhook signature verification failed")]
    WebhookSignatureInvalid,

    #[error("notifier failed: {0}")]
    Notifier(String),

    // --- Infrastructure / integrity ---
    #[error("database error: {0}")]
    Database(String),

    #[error("data integrity violation: {0}")]
    Invariant(String),
}

impl From<sqlx::Error> for BillingError {
    fn from(err: sqlx::Error) -> Self {
        BillingError::Database(err.to_string())
    }
}

/// `Option<SubscriptionStatus>` with a Display impl so `InvalidTransition`
/// can name the pre-trial "no subscription" state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisplayableStatus(pub Option<SubscriptionStatus>);

impl std::fmt::Display for DisplayableStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.0 {
            Some(status) => f.write_str(status.as_str()),
            None => f.write_str("no subscription"),
        }
    }
}

impl From<Option<SubscriptionStatus>> for DisplayableStatus {
    fn from(status: Option<SubscriptionStatus>) -> Self {
        DisplayableStatus(status)
    }
}

impl BillingError {
    /// Conflict errors are reported to the caller without any state change.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            BillingError::AlreadyUsedTrial
                | BillingError::TrialAlreadyActive
                | BillingError::InvalidTransition { .. }
                | BillingError::SeatLimitExceeded { .. }
                | BillingError::ConcurrentModification
        )
    }
}
