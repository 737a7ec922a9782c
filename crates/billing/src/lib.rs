// Billing crate clippy configuration
#![allow(clippy::result_large_err)] // BillingError carries structured variant payloads
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Staffly Billing Module
//!
//! Subscription lifecycle for the HR platform: plan catalog, seat tiers,
//! trials, checkout sessions, mid-cycle proration, auto-renewal, and
//! payment gateway reconciliation.
//!
//! ## Features
//!
//! - **Plan Catalog**: Plans with feature grants and contiguous seat tiers
//! - **Trials**: One 14-day trial per tenant, expired by a scheduled sweep
//! - **Checkout Sessions**: Single-use, idempotently completed payment intents
//! - **Proration**: Exact integer math for mid-cycle plan and seat changes
//! - **Auto-Renewal**: Claimed once per billing period, suspend on failure
//! - **Webhooks**: Signed gateway events routed into session completion

pub mod catalog;
pub mod checkout;
pub mod error;
pub mod gateway;
pub mod invariants;
pub mod notify;
pub mod proration;
pub mod records;
pub mod subscriptions;
pub mod sweeps;
pub mod webhooks;

#[cfg(test)]
mod edge_case_tests;

// Catalog
pub use catalog::{PgPlanCatalog, PlanCatalog, SeatPlan, StaticPlanCatalog, SubscriptionPlan};

// Checkout
pub use checkout::{
    ChangeOutcome, ChangeRequest, CheckoutService, CheckoutSession, GatewayConfirmation,
    SessionStatus, SessionType, VerifyOutcome, SESSION_TTL,
};

// Error
pub use error::{BillingError, BillingResult, GatewayError};

// Gateway
pub use gateway::{
    ChargeOutcome, ChargeRequest as GatewayChargeRequest, CreateInvoiceRequest, GatewayConfig,
    HttpPaymentGateway, Invoice, MockPaymentGateway, PaymentGateway, PaymentStatus,
};

// Invariants
pub use invariants::{
    InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity,
};

// Notify
pub use notify::{LogNotifier, TrialEndingNotice, TrialNotifier};

// Proration
pub use proration::{compute_proration, CurrentTerm, Proration, TargetTerm};

// Records
pub use records::{ChangeRecordLogger, ChangeType, NewChangeRecord, SubscriptionChangeRecord};

// Subscriptions
pub use subscriptions::{
    next_status, SubscriptionEvent, SubscriptionEventKind, SubscriptionService, UserSubscription,
    TRIAL_DAYS,
};

// Sweeps
pub use sweeps::{
    trial_standing, RenewalResult, SweepService, TrialExpiryResult, TrialStanding,
    TrialWarningResult, TRIAL_WARNING_WINDOW_DAYS,
};

// Webhooks
pub use webhooks::{GatewayEvent, GatewayEventData, WebhookHandler};

use std::sync::Arc;

use sqlx::PgPool;

/// Settlement currency for all prices and charges (IDR, zero-exponent
/// minor units).
pub const CURRENCY: &str = "IDR";

/// Main billing service that combines all billing functionality
pub struct BillingService {
    pub catalog: Arc<dyn PlanCatalog>,
    pub subscriptions: SubscriptionService,
    pub checkout: CheckoutService,
    pub sweeps: SweepService,
    pub webhooks: WebhookHandler,
    pub invariants: InvariantChecker,
}

impl BillingService {
    /// Create a new billing service from environment variables
    pub fn from_env(pool: PgPool) -> BillingResult<Self> {
        let config = GatewayConfig::from_env()?;
        let gateway: Arc<dyn PaymentGateway> = Arc::new(HttpPaymentGateway::new(config.clone()));
        Ok(Self::with_gateway(
            pool,
            gateway,
            Arc::new(LogNotifier),
            config.webhook_secret,
        ))
    }

    /// Create a new billing service with explicit collaborators. Tests use
    /// this with the mock gateway and a recording notifier.
    pub fn with_gateway(
        pool: PgPool,
        gateway: Arc<dyn PaymentGateway>,
        notifier: Arc<dyn TrialNotifier>,
        webhook_secret: String,
    ) -> Self {
        let catalog: Arc<dyn PlanCatalog> = Arc::new(PgPlanCatalog::new(pool.clone()));
        let subscriptions = SubscriptionService::new(pool.clone());
        let checkout = CheckoutService::new(
            pool.clone(),
            catalog.clone(),
            gateway.clone(),
            subscriptions.clone(),
            CURRENCY.to_string(),
        );
        let sweeps = SweepService::new(
            pool.clone(),
            subscriptions.clone(),
            catalog.clone(),
            gateway,
            notifier,
            CURRENCY.to_string(),
        );
        let webhooks = WebhookHandler::new(pool.clone(), checkout.clone(), webhook_secret);
        let invariants = InvariantChecker::new(pool);

        Self {
            catalog,
            subscriptions,
            checkout,
            sweeps,
            webhooks,
            invariants,
        }
    }
}
