//! Billing routes
//!
//! Thin handlers: authenticate, deserialize, call the billing crate, map
//! the result. All state transitions and money math live in the billing
//! crate.

use axum::extract::State;
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use staffly_billing::{
    ChangeOutcome, ChangeRequest, CheckoutSession, Invoice, SeatPlan, SubscriptionChangeRecord,
    SubscriptionPlan, UserSubscription,
};
use uuid::Uuid;

use crate::auth::AuthUser;
use crate::error::ApiResult;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct TrialCheckoutRequest {
    pub subscription_plan_id: Uuid,
    pub seat_plan_id: Uuid,
}

#[derive(Debug, Deserialize)]
pub struct CompleteTrialRequest {
    pub session_id: Uuid,
}

#[derive(Debug, Deserialize)]
pub struct PaidCheckoutRequest {
    pub subscription_plan_id: Uuid,
    pub seat_plan_id: Uuid,
    pub is_monthly: bool,
}

#[derive(Debug, Serialize)]
pub struct PaidCheckoutResponse {
    pub checkout_session: CheckoutSession,
    pub invoice: Invoice,
}

#[derive(Debug, Deserialize)]
pub struct PlanUpgradeRequest {
    pub new_subscription_plan_id: Uuid,
    pub new_seat_plan_id: Option<Uuid>,
    pub is_monthly: bool,
}

#[derive(Debug, Deserialize)]
pub struct SeatPlanChangeRequest {
    pub new_seat_plan_id: Uuid,
    pub is_monthly: bool,
}

/// The UI sends the reference the payment page handed back; it is the
/// checkout session id either way.
#[derive(Debug, Deserialize)]
pub struct VerifyPaymentRequest {
    #[serde(alias = "transaction_id")]
    pub session_id: Uuid,
}

#[derive(Debug, Deserialize)]
pub struct EmployeeCountRequest {
    pub employee_count: i32,
}

/// Change endpoints answer with either the new subscription (applied
/// immediately) or the prorated session the tenant still has to pay.
#[derive(Debug, Serialize)]
pub struct SubscriptionChangeResponse {
    pub applied: bool,
    pub proration_amount: i64,
    pub is_upgrade: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subscription: Option<UserSubscription>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checkout_session: Option<CheckoutSession>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub invoice: Option<Invoice>,
}

impl From<ChangeOutcome> for SubscriptionChangeResponse {
    fn from(outcome: ChangeOutcome) -> Self {
        match outcome {
            ChangeOutcome::Applied {
                subscription,
                proration,
            } => Self {
                applied: true,
                proration_amount: proration.amount_due,
                is_upgrade: proration.is_upgrade,
                subscription: Some(subscription),
                checkout_session: None,
                invoice: None,
            },
            ChangeOutcome::PaymentRequired {
                session,
                invoice,
                proration,
            } => Self {
                applied: false,
                proration_amount: proration.amount_due,
                is_upgrade: proration.is_upgrade,
                subscription: None,
                checkout_session: Some(session),
                invoice: Some(invoice),
            },
        }
    }
}

/// Current subscription with the plan and seat tier expanded for the UI.
#[derive(Debug, Serialize)]
pub struct SubscriptionView {
    #[serde(flatten)]
    pub subscription: UserSubscription,
    pub plan: Option<SubscriptionPlan>,
    pub seat_plan: Option<SeatPlan>,
}

pub async fn start_trial_checkout(
    State(state): State<AppState>,
    user: AuthUser,
    Json(req): Json<TrialCheckoutRequest>,
) -> ApiResult<Json<CheckoutSession>> {
    let session = state
        .billing
        .checkout
        .initiate_trial(user.owner_id, req.subscription_plan_id, req.seat_plan_id)
        .await?;
    Ok(Json(session))
}

pub async fn complete_trial_checkout(
    State(state): State<AppState>,
    _user: AuthUser,
    Json(req): Json<CompleteTrialRequest>,
) -> ApiResult<Json<UserSubscription>> {
    let subscription = state
        .billing
        .checkout
        .complete_trial_session(req.session_id)
        .await?;
    Ok(Json(subscription))
}

pub async fn start_paid_checkout(
    State(state): State<AppState>,
    user: AuthUser,
    Json(req): Json<PaidCheckoutRequest>,
) -> ApiResult<Json<PaidCheckoutResponse>> {
    let (checkout_session, invoice) = state
        .billing
        .checkout
        .initiate_paid_checkout(
            user.owner_id,
            req.subscription_plan_id,
            req.seat_plan_id,
            req.is_monthly,
        )
        .await?;
    Ok(Json(PaidCheckoutResponse {
        checkout_session,
        invoice,
    }))
}

pub async fn change_plan(
    State(state): State<AppState>,
    user: AuthUser,
    Json(req): Json<PlanUpgradeRequest>,
) -> ApiResult<Json<SubscriptionChangeResponse>> {
    let outcome = state
        .billing
        .checkout
        .initiate_change(
            user.owner_id,
            ChangeRequest {
                new_plan_id: Some(req.new_subscription_plan_id),
                new_seat_plan_id: req.new_seat_plan_id,
                is_monthly: req.is_monthly,
            },
        )
        .await?;
    Ok(Json(outcome.into()))
}

pub async fn change_seat_plan(
    State(state): State<AppState>,
    user: AuthUser,
    Json(req): Json<SeatPlanChangeRequest>,
) -> ApiResult<Json<SubscriptionChangeResponse>> {
    let outcome = state
        .billing
        .checkout
        .initiate_change(
            user.owner_id,
            ChangeRequest {
                new_plan_id: None,
                new_seat_plan_id: Some(req.new_seat_plan_id),
                is_monthly: req.is_monthly,
            },
        )
        .await?;
    Ok(Json(outcome.into()))
}

pub async fn verify_payment(
    State(state): State<AppState>,
    user: AuthUser,
    Json(req): Json<VerifyPaymentRequest>,
) -> ApiResult<Json<Value>> {
    let outcome = state
        .billing
        .checkout
        .verify_payment(user.owner_id, req.session_id)
        .await?;
    Ok(Json(json!({
        "subscription_activated": outcome.subscription_activated,
        "payment_status": outcome.payment_status,
        "subscription": outcome.subscription,
    })))
}

/// `null` body when the tenant has never subscribed.
pub async fn current_subscription(
    State(state): State<AppState>,
    user: AuthUser,
) -> ApiResult<Json<Option<SubscriptionView>>> {
    let Some(subscription) = state
        .billing
        .subscriptions
        .current_for_owner(user.owner_id)
        .await?
    else {
        return Ok(Json(None));
    };

    let plan = match subscription.subscription_plan_id {
        Some(id) => Some(state.billing.catalog.plan(id).await?),
        None => None,
    };
    let seat_plan = match subscription.seat_plan_id {
        Some(id) => Some(state.billing.catalog.seat_plan(id).await?),
        None => None,
    };

    Ok(Json(Some(SubscriptionView {
        subscription,
        plan,
        seat_plan,
    })))
}

/// Audit trail of the tenant's subscription changes, oldest first.
pub async fn subscription_history(
    State(state): State<AppState>,
    user: AuthUser,
) -> ApiResult<Json<Vec<SubscriptionChangeRecord>>> {
    let history = state
        .billing
        .subscriptions
        .records()
        .history_for_owner(user.owner_id)
        .await?;
    Ok(Json(history))
}

/// Denormalized headcount update from the HR side; rejects counts over the
/// seat limit while the subscription is trial or active.
pub async fn record_employee_count(
    State(state): State<AppState>,
    user: AuthUser,
    Json(req): Json<EmployeeCountRequest>,
) -> ApiResult<Json<Value>> {
    state
        .billing
        .subscriptions
        .record_employee_count(user.owner_id, req.employee_count)
        .await?;
    Ok(Json(json!({ "employee_count": req.employee_count })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_payment_accepts_both_reference_spellings() {
        let id = Uuid::new_v4();

        let by_session: VerifyPaymentRequest =
            serde_json::from_value(json!({ "session_id": id })).unwrap();
        assert_eq!(by_session.session_id, id);

        let by_transaction: VerifyPaymentRequest =
            serde_json::from_value(json!({ "transaction_id": id })).unwrap();
        assert_eq!(by_transaction.session_id, id);
    }
}
