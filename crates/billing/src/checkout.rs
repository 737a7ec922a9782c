//! Checkout sessions
//!
//! A checkout session is a single-use, time-boxed intent to change
//! subscription state. Trial sessions carry no money; paid sessions are
//! backed by a gateway invoice created before the session row exists, so a
//! gateway failure never leaves an orphan pending session.
//!
//! Completion is idempotent: the `pending -> completed` transition is a
//! conditional update taken under a row lock, in the same transaction as the
//! subscription change itself. A duplicate webhook delivery (or a user poll
//! racing a webhook) lands on the already-completed session and gets the
//! recorded result back without side effects.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use staffly_shared::{BillingInterval, PlanType, SubscriptionStatus, TriggeredBy};
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::catalog::{PlanCatalog, SeatPlan};
use crate::error::{BillingError, BillingResult};
use crate::gateway::{CreateInvoiceRequest, Invoice, PaymentGateway, PaymentStatus};
use crate::proration::{compute_proration, CurrentTerm, Proration, TargetTerm};
use crate::records::ChangeType;
use crate::subscriptions::{
    advance_one_cycle, retreat_one_cycle, SubscriptionEvent, SubscriptionService, UserSubscription,
};

/// How long a session stays completable.
pub const SESSION_TTL: Duration = Duration::hours(24);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionType {
    Trial,
    Paid,
}

impl SessionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionType::Trial => "trial",
            SessionType::Paid => "paid",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Pending,
    Completed,
    Expired,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Pending => "pending",
            SessionStatus::Completed => "completed",
            SessionStatus::Expired => "expired",
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A checkout session row. The id doubles as the idempotency key the gateway
/// echoes back on webhooks.
#[derive(Debug, Clone, Serialize)]
pub struct CheckoutSession {
    pub id: Uuid,
    pub user_id: Uuid,
    pub subscription_plan_id: Uuid,
    pub seat_plan_id: Uuid,
    pub amount: i64,
    pub currency: String,
    pub is_monthly: bool,
    pub session_type: SessionType,
    pub status: SessionStatus,
    pub payment_url: Option<String>,
    /// Gateway invoice id; `None` for trial sessions.
    pub external_reference: Option<String>,
    pub resulting_subscription_id: Option<Uuid>,
    #[serde(with = "time::serde::rfc3339")]
    pub initiated_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub completed_at: Option<OffsetDateTime>,
}

/// Payment confirmation delivered by webhook or recovered by polling.
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfirmation {
    pub status: PaymentStatus,
    pub transaction_id: Option<String>,
}

/// A plan/seat change request from the tenant.
#[derive(Debug, Clone, Deserialize)]
pub struct ChangeRequest {
    pub new_plan_id: Option<Uuid>,
    pub new_seat_plan_id: Option<Uuid>,
    pub is_monthly: bool,
}

/// Result of initiating a change: either applied on the spot (free or
/// non-positive proration) or parked behind a payment.
#[derive(Debug)]
pub enum ChangeOutcome {
    Applied {
        subscription: UserSubscription,
        proration: Proration,
    },
    PaymentRequired {
        session: CheckoutSession,
        invoice: Invoice,
        proration: Proration,
    },
}

/// Result of a user-initiated payment verification poll.
#[derive(Debug)]
pub struct VerifyOutcome {
    pub subscription_activated: bool,
    pub payment_status: PaymentStatus,
    pub subscription: Option<UserSubscription>,
}

#[derive(Debug, sqlx::FromRow)]
struct SessionRow {
    id: Uuid,
    user_id: Uuid,
    subscription_plan_id: Uuid,
    seat_plan_id: Uuid,
    amount: i64,
    currency: String,
    is_monthly: bool,
    session_type: String,
    status: String,
    payment_url: Option<String>,
    external_reference: Option<String>,
    resulting_subscription_id: Option<Uuid>,
    initiated_at: OffsetDateTime,
    expires_at: OffsetDateTime,
    completed_at: Option<OffsetDateTime>,
}

impl SessionRow {
    fn into_session(self) -> BillingResult<CheckoutSession> {
        let session_type = match self.session_type.as_str() {
            "trial" => SessionType::Trial,
            "paid" => SessionType::Paid,
            other => {
                return Err(BillingError::Invariant(format!(
                    "unknown session type: {other}"
                )))
            }
        };
        let status = match self.status.as_str() {
            "pending" => SessionStatus::Pending,
            "completed" => SessionStatus::Completed,
            "expired" => SessionStatus::Expired,
            other => {
                return Err(BillingError::Invariant(format!(
                    "unknown session status: {other}"
                )))
            }
        };
        Ok(CheckoutSession {
            id: self.id,
            user_id: self.user_id,
            subscription_plan_id: self.subscription_plan_id,
            seat_plan_id: self.seat_plan_id,
            amount: self.amount,
            currency: self.currency,
            is_monthly: self.is_monthly,
            session_type,
            status,
            payment_url: self.payment_url,
            external_reference: self.external_reference,
            resulting_subscription_id: self.resulting_subscription_id,
            initiated_at: self.initiated_at,
            expires_at: self.expires_at,
            completed_at: self.completed_at,
        })
    }
}

const SESSION_COLUMNS: &str = "id, user_id, subscription_plan_id, seat_plan_id, amount, currency, \
     is_monthly, session_type, status, payment_url, external_reference, \
     resulting_subscription_id, initiated_at, expires_at, completed_at";

/// What a completion attempt should do with the locked session row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CompletionAction {
    /// Claim the row and apply the subscription change.
    Finalize,
    /// Already completed: hand back the recorded result, change nothing.
    Replay,
    /// Mark the row expired and report the expiry.
    MarkExpired,
    /// Already settled as expired.
    RejectExpired,
    /// Payment not confirmed; the row stays pending.
    LeavePending,
    /// A paid session attempted without a gateway confirmation.
    MissingConfirmation,
}

fn completion_action(
    status: SessionStatus,
    session_type: SessionType,
    expires_at: OffsetDateTime,
    confirmation: Option<&GatewayConfirmation>,
    now: OffsetDateTime,
) -> CompletionAction {
    match status {
        SessionStatus::Completed => return CompletionAction::Replay,
        SessionStatus::Expired => return CompletionAction::RejectExpired,
        SessionStatus::Pending => {}
    }
    if now > expires_at {
        return CompletionAction::MarkExpired;
    }
    match (confirmation, session_type) {
        (Some(c), _) => match c.status {
            PaymentStatus::Paid => CompletionAction::Finalize,
            PaymentStatus::Expired => CompletionAction::MarkExpired,
            // Failed or still pending at the gateway: the session stays
            // pending until it pays or times out.
            PaymentStatus::Failed | PaymentStatus::Pending => CompletionAction::LeavePending,
        },
        (None, SessionType::Trial) => CompletionAction::Finalize,
        (None, SessionType::Paid) => CompletionAction::MissingConfirmation,
    }
}

/// Creates, tracks, and finalizes checkout sessions.
#[derive(Clone)]
pub struct CheckoutService {
    pool: PgPool,
    catalog: Arc<dyn PlanCatalog>,
    gateway: Arc<dyn PaymentGateway>,
    subscriptions: SubscriptionService,
    currency: String,
}

impl CheckoutService {
    pub fn new(
        pool: PgPool,
        catalog: Arc<dyn PlanCatalog>,
        gateway: Arc<dyn PaymentGateway>,
        subscriptions: SubscriptionService,
        currency: String,
    ) -> Self {
        Self {
            pool,
            catalog,
            gateway,
            subscriptions,
            currency,
        }
    }

    /// Begin the free-trial flow. No money, no gateway invoice.
    pub async fn initiate_trial(
        &self,
        user_id: Uuid,
        plan_id: Uuid,
        seat_plan_id: Uuid,
    ) -> BillingResult<CheckoutSession> {
        if let Some(current) = self.subscriptions.current_for_owner(user_id).await? {
            if current.status == SubscriptionStatus::Trial {
                return Err(BillingError::TrialAlreadyActive);
            }
            if current.is_trial_used {
                return Err(BillingError::AlreadyUsedTrial);
            }
        }

        let (plan, seat) = self.resolve_plan_pair(plan_id, seat_plan_id).await?;

        let now = OffsetDateTime::now_utc();
        let session = CheckoutSession {
            id: Uuid::new_v4(),
            user_id,
            subscription_plan_id: plan.id,
            seat_plan_id: seat.id,
            amount: 0,
            currency: self.currency.clone(),
            is_monthly: true,
            session_type: SessionType::Trial,
            status: SessionStatus::Pending,
            payment_url: None,
            external_reference: None,
            resulting_subscription_id: None,
            initiated_at: now,
            expires_at: now + SESSION_TTL,
            completed_at: None,
        };
        self.insert_session(&session).await?;

        tracing::info!(
            user_id = %user_id,
            session_id = %session.id,
            plan = %plan.name,
            "Trial checkout session created"
        );
        Ok(session)
    }

    /// Begin a paid checkout (trial conversion or reactivation of an
    /// expired/cancelled/inactive subscription). The gateway invoice is
    /// created first; if that fails no session row is left behind.
    pub async fn initiate_paid_checkout(
        &self,
        user_id: Uuid,
        plan_id: Uuid,
        seat_plan_id: Uuid,
        is_monthly: bool,
    ) -> BillingResult<(CheckoutSession, Invoice)> {
        self.subscriptions
            .current_for_owner(user_id)
            .await?
            .ok_or(BillingError::SubscriptionNotFound(user_id))?;

        let (plan, seat) = self.resolve_plan_pair(plan_id, seat_plan_id).await?;
        let interval = BillingInterval::from_is_monthly(is_monthly);
        let amount = seat.price_for(interval);

        let now = OffsetDateTime::now_utc();
        let session_id = Uuid::new_v4();
        let expires_at = now + SESSION_TTL;

        let invoice = self
            .gateway
            .create_invoice(CreateInvoiceRequest {
                external_id: session_id,
                amount,
                currency: self.currency.clone(),
                description: format!("{} / {} ({interval})", plan.name, seat.name),
                expires_at,
            })
            .await?;

        let session = CheckoutSession {
            id: session_id,
            user_id,
            subscription_plan_id: plan.id,
            seat_plan_id: seat.id,
            amount,
            currency: self.currency.clone(),
            is_monthly,
            session_type: SessionType::Paid,
            status: SessionStatus::Pending,
            payment_url: Some(invoice.invoice_url.clone()),
            external_reference: Some(invoice.id.clone()),
            resulting_subscription_id: None,
            initiated_at: now,
            expires_at,
            completed_at: None,
        };
        self.insert_session(&session).await?;

        tracing::info!(
            user_id = %user_id,
            session_id = %session.id,
            amount = amount,
            "Paid checkout session created"
        );
        Ok((session, invoice))
    }

    /// Request a plan and/or seat change with mid-cycle proration.
    ///
    /// A non-positive net amount is applied immediately (no cash refunds, by
    /// policy); a positive one returns a pending paid session for the delta.
    pub async fn initiate_change(
        &self,
        user_id: Uuid,
        request: ChangeRequest,
    ) -> BillingResult<ChangeOutcome> {
        if request.new_plan_id.is_none() && request.new_seat_plan_id.is_none() {
            return Err(BillingError::Validation(
                "change request names neither a plan nor a seat plan".into(),
            ));
        }

        let current = self
            .subscriptions
            .current_for_owner(user_id)
            .await?
            .ok_or(BillingError::SubscriptionNotFound(user_id))?;
        if !matches!(
            current.status,
            SubscriptionStatus::Active | SubscriptionStatus::Suspended
        ) {
            return Err(BillingError::Validation(format!(
                "plan changes require an active or suspended subscription, not {}",
                current.status
            )));
        }

        let current_plan_id = current
            .subscription_plan_id
            .ok_or_else(|| BillingError::Invariant("active subscription without a plan".into()))?;
        let current_seat_id = current
            .seat_plan_id
            .ok_or_else(|| BillingError::Invariant("active subscription without a seat".into()))?;
        let current_interval = current.billing_interval.ok_or_else(|| {
            BillingError::Invariant("active subscription without a billing interval".into())
        })?;
        let cycle_end = current.end_date.ok_or_else(|| {
            BillingError::Invariant("active subscription without a billing period".into())
        })?;

        let current_plan = self.catalog.plan(current_plan_id).await?;
        let current_seat = self.catalog.seat_plan(current_seat_id).await?;

        let target_plan_id = request.new_plan_id.unwrap_or(current_plan_id);
        let target_plan = self.catalog.plan(target_plan_id).await?;
        let target_seat = match request.new_seat_plan_id {
            Some(seat_id) => {
                let seat = self.catalog.seat_plan(seat_id).await?;
                if seat.plan_id != target_plan.id {
                    return Err(BillingError::Validation(format!(
                        "seat plan {seat_id} does not belong to plan {target_plan_id}"
                    )));
                }
                seat
            }
            // Plan change without an explicit seat: keep the tenant's
            // headcount in the matching tier of the new plan.
            None => {
                let headcount = current.current_employee_count.max(1);
                self.catalog
                    .seat_plan_for_headcount(target_plan.id, headcount)
                    .await?
            }
        };
        let target_interval = BillingInterval::from_is_monthly(request.is_monthly);

        let now = OffsetDateTime::now_utc();
        let cycle_start = retreat_one_cycle(cycle_end, current_interval).max(current.start_date);
        let proration = compute_proration(
            &CurrentTerm {
                seat_plan: current_seat.clone(),
                interval: current_interval,
                cycle_start,
                cycle_end,
            },
            &TargetTerm {
                seat_plan: target_seat.clone(),
                interval: target_interval,
            },
            now,
        );

        let change_type = classify_change(
            current_plan.plan_type,
            target_plan.plan_type,
            current_seat.max_employees,
            target_seat.max_employees,
            proration.is_upgrade,
        );

        if !proration.payment_required() {
            let subscription = self
                .subscriptions
                .apply_change(
                    user_id,
                    SubscriptionEvent::PlanOrSeatChange {
                        plan_id: target_plan.id,
                        seat_plan_id: target_seat.id,
                        max_employees: target_seat.max_employees,
                        interval: Some(target_interval),
                        end_date: None,
                        change_type,
                    },
                    TriggeredBy::User,
                    Some(proration.amount_due),
                )
                .await?;
            return Ok(ChangeOutcome::Applied {
                subscription,
                proration,
            });
        }

        let session_id = Uuid::new_v4();
        let expires_at = now + SESSION_TTL;
        let invoice = self
            .gateway
            .create_invoice(CreateInvoiceRequest {
                external_id: session_id,
                amount: proration.amount_due,
                currency: self.currency.clone(),
                description: format!(
                    "Prorated change to {} / {}",
                    target_plan.name, target_seat.name
                ),
                expires_at,
            })
            .await?;

        let session = CheckoutSession {
            id: session_id,
            user_id,
            subscription_plan_id: target_plan.id,
            seat_plan_id: target_seat.id,
            amount: proration.amount_due,
            currency: self.currency.clone(),
            is_monthly: request.is_monthly,
            session_type: SessionType::Paid,
            status: SessionStatus::Pending,
            payment_url: Some(invoice.invoice_url.clone()),
            external_reference: Some(invoice.id.clone()),
            resulting_subscription_id: None,
            initiated_at: now,
            expires_at,
            completed_at: None,
        };
        self.insert_session(&session).await?;

        Ok(ChangeOutcome::PaymentRequired {
            session,
            invoice,
            proration,
        })
    }

    /// Finalize a trial session: no payment involved.
    pub async fn complete_trial_session(
        &self,
        session_id: Uuid,
    ) -> BillingResult<UserSubscription> {
        self.do_complete(session_id, None, TriggeredBy::User).await
    }

    /// Finalize a paid session against a gateway confirmation. Idempotent
    /// per session id: replays return the originally produced subscription
    /// and append nothing.
    pub async fn complete_session(
        &self,
        session_id: Uuid,
        confirmation: GatewayConfirmation,
        triggered_by: TriggeredBy,
    ) -> BillingResult<UserSubscription> {
        self.do_complete(session_id, Some(confirmation), triggered_by)
            .await
    }

    /// User-initiated poll after returning from the payment page. A safe,
    /// repeatable read: completion itself stays idempotent.
    pub async fn verify_payment(
        &self,
        user_id: Uuid,
        session_id: Uuid,
    ) -> BillingResult<VerifyOutcome> {
        let session = self
            .fetch_session(session_id)
            .await?
            .ok_or(BillingError::SessionNotFound(session_id))?;
        if session.user_id != user_id {
            return Err(BillingError::SessionNotFound(session_id));
        }

        if session.status == SessionStatus::Completed {
            let subscription = self.resulting_subscription(&session).await?;
            return Ok(VerifyOutcome {
                subscription_activated: true,
                payment_status: PaymentStatus::Paid,
                subscription: Some(subscription),
            });
        }

        let invoice_id = session.external_reference.as_deref().ok_or_else(|| {
            BillingError::Validation("trial sessions carry no payment to verify".into())
        })?;
        let payment_status = self.gateway.invoice_status(invoice_id).await?;

        match payment_status {
            PaymentStatus::Paid => {
                let subscription = self
                    .complete_session(
                        session_id,
                        GatewayConfirmation {
                            status: PaymentStatus::Paid,
                            transaction_id: None,
                        },
                        TriggeredBy::User,
                    )
                    .await?;
                Ok(VerifyOutcome {
                    subscription_activated: true,
                    payment_status,
                    subscription: Some(subscription),
                })
            }
            other => Ok(VerifyOutcome {
                subscription_activated: false,
                payment_status: other,
                subscription: None,
            }),
        }
    }

    /// Look up a session by the gateway's invoice reference (webhooks that
    /// only echo the external reference).
    pub async fn session_by_external_reference(
        &self,
        reference: &str,
    ) -> BillingResult<Option<CheckoutSession>> {
        let query = format!(
            "SELECT {SESSION_COLUMNS} FROM checkout_sessions WHERE external_reference = $1"
        );
        let row: Option<SessionRow> = sqlx::query_as(&query)
            .bind(reference)
            .fetch_optional(&self.pool)
            .await?;
        row.map(SessionRow::into_session).transpose()
    }

    pub async fn fetch_session(&self, id: Uuid) -> BillingResult<Option<CheckoutSession>> {
        let query = format!("SELECT {SESSION_COLUMNS} FROM checkout_sessions WHERE id = $1");
        let row: Option<SessionRow> = sqlx::query_as(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(SessionRow::into_session).transpose()
    }

    // =========================================================================
    // Internals
    // =========================================================================

    async fn do_complete(
        &self,
        session_id: Uuid,
        confirmation: Option<GatewayConfirmation>,
        triggered_by: TriggeredBy,
    ) -> BillingResult<UserSubscription> {
        let now = OffsetDateTime::now_utc();
        let mut tx = self.pool.begin().await?;

        // Row lock serializes concurrent completion attempts for this id.
        let query =
            format!("SELECT {SESSION_COLUMNS} FROM checkout_sessions WHERE id = $1 FOR UPDATE");
        let row: Option<SessionRow> = sqlx::query_as(&query)
            .bind(session_id)
            .fetch_optional(&mut *tx)
            .await?;
        let session = row
            .map(SessionRow::into_session)
            .transpose()?
            .ok_or(BillingError::SessionNotFound(session_id))?;

        match completion_action(
            session.status,
            session.session_type,
            session.expires_at,
            confirmation.as_ref(),
            now,
        ) {
            CompletionAction::Replay => {
                // Duplicate delivery: hand back the recorded result.
                tracing::info!(
                    session_id = %session_id,
                    "Duplicate completion absorbed, session already completed"
                );
                return self.resulting_subscription(&session).await;
            }
            CompletionAction::RejectExpired => {
                return Err(BillingError::InvalidSession {
                    id: session_id,
                    status: session.status.to_string(),
                });
            }
            CompletionAction::MarkExpired => {
                // The expiry is real; record it even though the call fails.
                sqlx::query(
                    "UPDATE checkout_sessions SET status = 'expired' WHERE id = $1 AND status = 'pending'",
                )
                .bind(session_id)
                .execute(&mut *tx)
                .await?;
                tx.commit().await?;
                return Err(BillingError::SessionExpired(session_id));
            }
            CompletionAction::LeavePending => {
                return Err(BillingError::PaymentNotCompleted(session_id));
            }
            CompletionAction::MissingConfirmation => {
                return Err(BillingError::Validation(
                    "paid sessions require a gateway confirmation".into(),
                ));
            }
            CompletionAction::Finalize => {}
        }

        let claimed = sqlx::query(
            "UPDATE checkout_sessions SET status = 'completed', completed_at = $1 \
             WHERE id = $2 AND status = 'pending'",
        )
        .bind(now)
        .bind(session_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        if claimed == 0 {
            // Unreachable while we hold the row lock; fail closed regardless.
            return Err(BillingError::ConcurrentModification);
        }

        let event = self.completion_event(&session).await?;
        let proration_amount = match session.session_type {
            SessionType::Paid => Some(session.amount),
            SessionType::Trial => None,
        };
        let subscription = self
            .subscriptions
            .apply_change_in(&mut tx, session.user_id, event, triggered_by, proration_amount)
            .await?;

        sqlx::query("UPDATE checkout_sessions SET resulting_subscription_id = $1 WHERE id = $2")
            .bind(subscription.id)
            .bind(session_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        tracing::info!(
            session_id = %session_id,
            user_id = %session.user_id,
            subscription_id = %subscription.id,
            status = %subscription.status,
            "Checkout session completed"
        );
        Ok(subscription)
    }

    /// Choose the state-machine event a finished session drives, based on
    /// where the tenant currently is.
    async fn completion_event(&self, session: &CheckoutSession) -> BillingResult<SubscriptionEvent> {
        let seat = self.catalog.seat_plan(session.seat_plan_id).await?;
        let plan = self.catalog.plan(session.subscription_plan_id).await?;
        let interval = BillingInterval::from_is_monthly(session.is_monthly);
        let now = OffsetDateTime::now_utc();

        if session.session_type == SessionType::Trial {
            return Ok(SubscriptionEvent::StartTrial {
                plan_id: plan.id,
                seat_plan_id: seat.id,
                max_employees: seat.max_employees,
            });
        }

        let current = self
            .subscriptions
            .current_for_owner(session.user_id)
            .await?
            .ok_or(BillingError::SubscriptionNotFound(session.user_id))?;

        let event = match current.status {
            SubscriptionStatus::Trial => SubscriptionEvent::Convert {
                plan_id: plan.id,
                seat_plan_id: seat.id,
                max_employees: seat.max_employees,
                interval,
                end_date: advance_one_cycle(now, interval),
            },
            SubscriptionStatus::Active | SubscriptionStatus::Suspended => {
                let (current_plan_type, current_seat_max) = match (
                    current.subscription_plan_id,
                    current.seat_plan_id,
                ) {
                    (Some(plan_id), Some(seat_id)) => {
                        let cur_plan = self.catalog.plan(plan_id).await?;
                        let cur_seat = self.catalog.seat_plan(seat_id).await?;
                        (cur_plan.plan_type, cur_seat.max_employees)
                    }
                    _ => (plan.plan_type, seat.max_employees),
                };
                SubscriptionEvent::PlanOrSeatChange {
                    plan_id: plan.id,
                    seat_plan_id: seat.id,
                    max_employees: seat.max_employees,
                    interval: Some(interval),
                    end_date: None,
                    change_type: classify_change(
                        current_plan_type,
                        plan.plan_type,
                        current_seat_max,
                        seat.max_employees,
                        session.amount > 0,
                    ),
                }
            }
            SubscriptionStatus::Expired
            | SubscriptionStatus::Cancelled
            | SubscriptionStatus::Inactive => SubscriptionEvent::NewCheckoutCompleted {
                plan_id: plan.id,
                seat_plan_id: seat.id,
                max_employees: seat.max_employees,
                interval,
                end_date: advance_one_cycle(now, interval),
            },
        };
        Ok(event)
    }

    async fn resulting_subscription(
        &self,
        session: &CheckoutSession,
    ) -> BillingResult<UserSubscription> {
        let id = session.resulting_subscription_id.ok_or_else(|| {
            BillingError::Invariant(format!(
                "completed session {} has no resulting subscription",
                session.id
            ))
        })?;
        self.subscriptions
            .by_id(id)
            .await?
            .ok_or_else(|| {
                BillingError::Invariant(format!(
                    "completed session {} points at missing subscription {id}",
                    session.id
                ))
            })
    }

    async fn resolve_plan_pair(
        &self,
        plan_id: Uuid,
        seat_plan_id: Uuid,
    ) -> BillingResult<(crate::catalog::SubscriptionPlan, SeatPlan)> {
        let plan = self.catalog.plan(plan_id).await?;
        if !plan.is_active {
            return Err(BillingError::Validation(format!(
                "plan {plan_id} is no longer offered"
            )));
        }
        let seat = self.catalog.seat_plan(seat_plan_id).await?;
        if seat.plan_id != plan.id {
            return Err(BillingError::Validation(format!(
                "seat plan {seat_plan_id} does not belong to plan {plan_id}"
            )));
        }
        if !seat.is_active {
            return Err(BillingError::Validation(format!(
                "seat plan {seat_plan_id} is no longer offered"
            )));
        }
        Ok((plan, seat))
    }

    async fn insert_session(&self, session: &CheckoutSession) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO checkout_sessions
                (id, user_id, subscription_plan_id, seat_plan_id, amount, currency,
                 is_monthly, session_type, status, payment_url, external_reference,
                 initiated_at, expires_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(session.id)
        .bind(session.user_id)
        .bind(session.subscription_plan_id)
        .bind(session.seat_plan_id)
        .bind(session.amount)
        .bind(&session.currency)
        .bind(session.is_monthly)
        .bind(session.session_type.as_str())
        .bind(session.status.as_str())
        .bind(&session.payment_url)
        .bind(&session.external_reference)
        .bind(session.initiated_at)
        .bind(session.expires_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// Classify a plan/seat change for the audit log. Plan-type movement wins
/// over seat movement; an interval-only change falls back to the direction
/// of the money.
pub fn classify_change(
    current_plan: PlanType,
    target_plan: PlanType,
    current_seat_max: i32,
    target_seat_max: i32,
    is_upgrade: bool,
) -> ChangeType {
    use std::cmp::Ordering;

    match target_plan.rank().cmp(&current_plan.rank()) {
        Ordering::Greater => ChangeType::PlanUpgrade,
        Ordering::Less => ChangeType::PlanDowngrade,
        Ordering::Equal => match target_seat_max.cmp(&current_seat_max) {
            Ordering::Greater => ChangeType::SeatUpgrade,
            Ordering::Less => ChangeType::SeatDowngrade,
            Ordering::Equal => {
                if is_upgrade {
                    ChangeType::PlanUpgrade
                } else {
                    ChangeType::PlanDowngrade
                }
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn confirm(status: PaymentStatus) -> GatewayConfirmation {
        GatewayConfirmation {
            status,
            transaction_id: None,
        }
    }

    #[test]
    fn completing_a_completed_session_replays_and_never_finalizes_again() {
        let now = OffsetDateTime::now_utc();
        let live = now + Duration::hours(1);
        // Finalize is the only action that appends a change record, so a
        // second completion of a completed session must replay no matter
        // who drives it or what the confirmation says.
        for session_type in [SessionType::Trial, SessionType::Paid] {
            for confirmation in [
                None,
                Some(confirm(PaymentStatus::Paid)),
                Some(confirm(PaymentStatus::Expired)),
                Some(confirm(PaymentStatus::Failed)),
            ] {
                assert_eq!(
                    completion_action(
                        SessionStatus::Completed,
                        session_type,
                        live,
                        confirmation.as_ref(),
                        now,
                    ),
                    CompletionAction::Replay
                );
            }
        }
    }

    #[test]
    fn paid_confirmation_on_a_live_session_finalizes() {
        let now = OffsetDateTime::now_utc();
        assert_eq!(
            completion_action(
                SessionStatus::Pending,
                SessionType::Paid,
                now + Duration::hours(1),
                Some(&confirm(PaymentStatus::Paid)),
                now,
            ),
            CompletionAction::Finalize
        );
    }

    #[test]
    fn trial_sessions_finalize_without_a_confirmation() {
        let now = OffsetDateTime::now_utc();
        assert_eq!(
            completion_action(
                SessionStatus::Pending,
                SessionType::Trial,
                now + Duration::hours(1),
                None,
                now,
            ),
            CompletionAction::Finalize
        );
    }

    #[test]
    fn paid_sessions_require_a_confirmation() {
        let now = OffsetDateTime::now_utc();
        assert_eq!(
            completion_action(
                SessionStatus::Pending,
                SessionType::Paid,
                now + Duration::hours(1),
                None,
                now,
            ),
            CompletionAction::MissingConfirmation
        );
    }

    #[test]
    fn a_lapsed_ttl_beats_even_a_paid_confirmation() {
        let now = OffsetDateTime::now_utc();
        assert_eq!(
            completion_action(
                SessionStatus::Pending,
                SessionType::Paid,
                now - Duration::minutes(1),
                Some(&confirm(PaymentStatus::Paid)),
                now,
            ),
            CompletionAction::MarkExpired
        );
    }

    #[test]
    fn gateway_expiry_marks_the_session_expired() {
        let now = OffsetDateTime::now_utc();
        assert_eq!(
            completion_action(
                SessionStatus::Pending,
                SessionType::Paid,
                now + Duration::hours(1),
                Some(&confirm(PaymentStatus::Expired)),
                now,
            ),
            CompletionAction::MarkExpired
        );
    }

    #[test]
    fn unpaid_confirmations_leave_the_session_pending() {
        let now = OffsetDateTime::now_utc();
        for status in [PaymentStatus::Failed, PaymentStatus::Pending] {
            assert_eq!(
                completion_action(
                    SessionStatus::Pending,
                    SessionType::Paid,
                    now + Duration::hours(1),
                    Some(&confirm(status)),
                    now,
                ),
                CompletionAction::LeavePending
            );
        }
    }

    #[test]
    fn a_settled_expired_session_is_rejected() {
        let now = OffsetDateTime::now_utc();
        assert_eq!(
            completion_action(
                SessionStatus::Expired,
                SessionType::Paid,
                now + Duration::hours(1),
                Some(&confirm(PaymentStatus::Paid)),
                now,
            ),
            CompletionAction::RejectExpired
        );
    }

    #[test]
    fn plan_movement_wins_over_seat_movement() {
        assert_eq!(
            classify_change(PlanType::Standard, PlanType::Premium, 100, 25, true),
            ChangeType::PlanUpgrade
        );
        assert_eq!(
            classify_change(PlanType::Ultra, PlanType::Premium, 25, 100, false),
            ChangeType::PlanDowngrade
        );
    }

    #[test]
    fn same_plan_classifies_by_seat_range() {
        assert_eq!(
            classify_change(PlanType::Premium, PlanType::Premium, 25, 50, true),
            ChangeType::SeatUpgrade
        );
        assert_eq!(
            classify_change(PlanType::Premium, PlanType::Premium, 50, 25, false),
            ChangeType::SeatDowngrade
        );
    }

    #[test]
    fn interval_only_change_follows_the_money() {
        assert_eq!(
            classify_change(PlanType::Premium, PlanType::Premium, 25, 25, true),
            ChangeType::PlanUpgrade
        );
        assert_eq!(
            classify_change(PlanType::Premium, PlanType::Premium, 25, 25, false),
            ChangeType::PlanDowngrade
        );
    }
}
