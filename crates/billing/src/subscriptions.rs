//! Subscription state machine
//!
//! Owns `user_subscriptions` and is the single authoritative mutation path
//! for tenant subscription state. Every transition goes through
//! [`SubscriptionService::apply_change`]: it validates against the transition
//! table, demotes the previous current row (append-only history, never
//! mutated in place), inserts the successor, and writes the audit record in
//! the same transaction.
//!
//! Per-tenant linearization: the current row is read `FOR UPDATE`, and the
//! demotion carries an optimistic `version` guard so a webhook completion and
//! a scheduler sweep for the same tenant can never interleave.

use serde::{Deserialize, Serialize};
use sqlx::{PgConnection, PgPool};
use staffly_shared::{BillingInterval, SubscriptionStatus, TriggeredBy};
use std::str::FromStr;
use time::{Date, Duration, Month, OffsetDateTime};
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::records::{ChangeRecordLogger, ChangeType, NewChangeRecord};

/// Trial length. `trial_end_date` is always exactly this far past
/// `trial_start_date`.
pub const TRIAL_DAYS: i64 = 14;

/// A tenant's subscription state. One row per tenant is current
/// (`is_current`); superseded rows remain as history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserSubscription {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub status: SubscriptionStatus,
    pub subscription_plan_id: Option<Uuid>,
    pub seat_plan_id: Option<Uuid>,
    #[serde(with = "time::serde::rfc3339")]
    pub start_date: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub end_date: Option<OffsetDateTime>,
    pub is_auto_renew: bool,
    /// Cycle length of the paid term; `None` while on trial or never paid.
    pub billing_interval: Option<BillingInterval>,
    /// Denormalized headcount cache, maintained by the HR collaborator via
    /// [`SubscriptionService::record_employee_count`].
    pub current_employee_count: i32,
    pub max_employee_count: i32,
    /// Lifetime flag: set the instant a trial starts, never cleared.
    pub is_trial_used: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub trial_start_date: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub trial_end_date: Option<OffsetDateTime>,
    #[serde(skip)]
    pub is_current: bool,
    #[serde(skip)]
    pub version: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

/// Events accepted by the state machine. Payloads carry the concrete target
/// state; upgrade/downgrade classification is decided by the caller that has
/// catalog access.
#[derive(Debug, Clone)]
pub enum SubscriptionEvent {
    /// `(none) -> trial`. The one lifetime trial; sets the trial window.
    StartTrial {
        plan_id: Uuid,
        seat_plan_id: Uuid,
        max_employees: i32,
    },
    /// `trial -> active` on confirmed payment.
    Convert {
        plan_id: Uuid,
        seat_plan_id: Uuid,
        max_employees: i32,
        interval: BillingInterval,
        end_date: OffsetDateTime,
    },
    /// `trial -> expired` when the trial window lapses unconverted.
    Expire,
    /// `active -> suspended` after a failed renewal charge.
    RenewalFailure,
    /// `suspended -> active` once payment is resolved.
    PaymentResolved,
    /// `active -> cancelled` by the tenant.
    Cancel,
    /// `active|suspended -> active` with updated plan/seat refs.
    PlanOrSeatChange {
        plan_id: Uuid,
        seat_plan_id: Uuid,
        max_employees: i32,
        interval: Option<BillingInterval>,
        end_date: Option<OffsetDateTime>,
        change_type: ChangeType,
    },
    /// `active -> active` with the billing period advanced one cycle.
    Renew { new_end_date: OffsetDateTime },
    /// `expired|cancelled|inactive -> active` via a fresh completed checkout.
    NewCheckoutCompleted {
        plan_id: Uuid,
        seat_plan_id: Uuid,
        max_employees: i32,
        interval: BillingInterval,
        end_date: OffsetDateTime,
    },
}

impl SubscriptionEvent {
    pub fn kind(&self) -> SubscriptionEventKind {
        match self {
            SubscriptionEvent::StartTrial { .. } => SubscriptionEventKind::StartTrial,
            SubscriptionEvent::Convert { .. } => SubscriptionEventKind::Convert,
            SubscriptionEvent::Expire => SubscriptionEventKind::Expire,
            SubscriptionEvent::RenewalFailure => SubscriptionEventKind::RenewalFailure,
            SubscriptionEvent::PaymentResolved => SubscriptionEventKind::PaymentResolved,
            SubscriptionEvent::Cancel => SubscriptionEventKind::Cancel,
            SubscriptionEvent::PlanOrSeatChange { .. } => SubscriptionEventKind::PlanOrSeatChange,
            SubscriptionEvent::Renew { .. } => SubscriptionEventKind::Renew,
            SubscriptionEvent::NewCheckoutCompleted { .. } => {
                SubscriptionEventKind::NewCheckoutCompleted
            }
        }
    }

    fn change_type(&self) -> ChangeType {
        match self {
            SubscriptionEvent::StartTrial { .. } => ChangeType::TrialStarted,
            SubscriptionEvent::Convert { .. } => ChangeType::TrialConversion,
            SubscriptionEvent::Expire => ChangeType::TrialExpired,
            SubscriptionEvent::RenewalFailure => ChangeType::Suspension,
            SubscriptionEvent::PaymentResolved => ChangeType::Reactivation,
            SubscriptionEvent::Cancel => ChangeType::Cancellation,
            SubscriptionEvent::PlanOrSeatChange { change_type, .. } => *change_type,
            SubscriptionEvent::Renew { .. } => ChangeType::Renewal,
            SubscriptionEvent::NewCheckoutCompleted { .. } => ChangeType::Activation,
        }
    }
}

/// Fieldless event discriminant, used in error reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionEventKind {
    StartTrial,
    Convert,
    Expire,
    RenewalFailure,
    PaymentResolved,
    Cancel,
    PlanOrSeatChange,
    Renew,
    NewCheckoutCompleted,
}

impl std::fmt::Display for SubscriptionEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SubscriptionEventKind::StartTrial => "start_trial",
            SubscriptionEventKind::Convert => "convert",
            SubscriptionEventKind::Expire => "expire",
            SubscriptionEventKind::RenewalFailure => "renewal_failure",
            SubscriptionEventKind::PaymentResolved => "payment_resolved",
            SubscriptionEventKind::Cancel => "cancel",
            SubscriptionEventKind::PlanOrSeatChange => "plan_or_seat_change",
            SubscriptionEventKind::Renew => "renew",
            SubscriptionEventKind::NewCheckoutCompleted => "new_checkout_completed",
        };
        f.write_str(name)
    }
}

/// The transition table. Pure; everything else in this module defers to it.
pub fn next_status(
    current: Option<SubscriptionStatus>,
    event: &SubscriptionEvent,
) -> BillingResult<SubscriptionStatus> {
    use SubscriptionStatus::*;

    let next = match (current, event.kind()) {
        (None, SubscriptionEventKind::StartTrial) => Trial,
        (Some(Trial), SubscriptionEventKind::Convert) => Active,
        (Some(Trial), SubscriptionEventKind::Expire) => Expired,
        (Some(Active), SubscriptionEventKind::RenewalFailure) => Suspended,
        (Some(Suspended), SubscriptionEventKind::PaymentResolved) => Active,
        (Some(Active), SubscriptionEventKind::Cancel) => Cancelled,
        (Some(Active | Suspended), SubscriptionEventKind::PlanOrSeatChange) => Active,
        (Some(Active), SubscriptionEventKind::Renew) => Active,
        (Some(Expired | Cancelled | Inactive), SubscriptionEventKind::NewCheckoutCompleted) => {
            Active
        }
        (from, kind) => {
            return Err(BillingError::InvalidTransition {
                from: from.into(),
                event: kind,
            })
        }
    };
    Ok(next)
}

/// Advance a billing period boundary by one cycle, clamping the day-of-month
/// the way payment anchors do (Jan 31 + 1 month = Feb 28/29).
pub fn advance_one_cycle(from: OffsetDateTime, interval: BillingInterval) -> OffsetDateTime {
    let date = from.date();
    let (year, month) = match interval {
        BillingInterval::Monthly => match date.month() {
            Month::December => (date.year() + 1, Month::January),
            month => (date.year(), month.next()),
        },
        BillingInterval::Yearly => (date.year() + 1, date.month()),
    };
    let day = date.day().min(time::util::days_in_year_month(year, month));
    match Date::from_calendar_date(year, month, day) {
        Ok(new_date) => from.replace_date(new_date),
        // Unreachable after the clamp; keep the original date rather than panic.
        Err(_) => from,
    }
}

/// Inverse of [`advance_one_cycle`], used to recover the start of the cycle
/// a renewal boundary closes.
pub fn retreat_one_cycle(from: OffsetDateTime, interval: BillingInterval) -> OffsetDateTime {
    let date = from.date();
    let (year, month) = match interval {
        BillingInterval::Monthly => match date.month() {
            Month::January => (date.year() - 1, Month::December),
            month => (date.year(), month.previous()),
        },
        BillingInterval::Yearly => (date.year() - 1, date.month()),
    };
    let day = date.day().min(time::util::days_in_year_month(year, month));
    match Date::from_calendar_date(year, month, day) {
        Ok(new_date) => from.replace_date(new_date),
        Err(_) => from,
    }
}

#[derive(Debug, sqlx::FromRow)]
struct SubscriptionRow {
    id: Uuid,
    owner_id: Uuid,
    status: String,
    subscription_plan_id: Option<Uuid>,
    seat_plan_id: Option<Uuid>,
    start_date: OffsetDateTime,
    end_date: Option<OffsetDateTime>,
    is_auto_renew: bool,
    billing_interval: Option<String>,
    current_employee_count: i32,
    max_employee_count: i32,
    is_trial_used: bool,
    trial_start_date: Option<OffsetDateTime>,
    trial_end_date: Option<OffsetDateTime>,
    is_current: bool,
    version: i64,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl SubscriptionRow {
    fn into_subscription(self) -> BillingResult<UserSubscription> {
        let status = SubscriptionStatus::from_str(&self.status)
            .map_err(|e| BillingError::Invariant(e.to_string()))?;
        let billing_interval = match self.billing_interval.as_deref() {
            Some("monthly") => Some(BillingInterval::Monthly),
            Some("yearly") => Some(BillingInterval::Yearly),
            Some(other) => {
                return Err(BillingError::Invariant(format!(
                    "unknown billing interval: {other}"
                )))
            }
            None => None,
        };
        Ok(UserSubscription {
            id: self.id,
            owner_id: self.owner_id,
            status,
            subscription_plan_id: self.subscription_plan_id,
            seat_plan_id: self.seat_plan_id,
            start_date: self.start_date,
            end_date: self.end_date,
            is_auto_renew: self.is_auto_renew,
            billing_interval,
            current_employee_count: self.current_employee_count,
            max_employee_count: self.max_employee_count,
            is_trial_used: self.is_trial_used,
            trial_start_date: self.trial_start_date,
            trial_end_date: self.trial_end_date,
            is_current: self.is_current,
            version: self.version,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

const SELECT_COLUMNS: &str = "id, owner_id, status, subscription_plan_id, seat_plan_id, \
     start_date, end_date, is_auto_renew, billing_interval, current_employee_count, \
     max_employee_count, is_trial_used, trial_start_date, trial_end_date, is_current, \
     version, created_at, updated_at";

/// Authoritative owner of `user_subscriptions`.
#[derive(Clone)]
pub struct SubscriptionService {
    pool: PgPool,
    records: ChangeRecordLogger,
}

impl SubscriptionService {
    pub fn new(pool: PgPool) -> Self {
        let records = ChangeRecordLogger::new(pool.clone());
        Self { pool, records }
    }

    pub fn records(&self) -> &ChangeRecordLogger {
        &self.records
    }

    /// The tenant's current subscription, `None` when they have never
    /// subscribed (a valid pre-trial state, not a seventh status).
    pub async fn current_for_owner(
        &self,
        owner_id: Uuid,
    ) -> BillingResult<Option<UserSubscription>> {
        let query = format!(
            "SELECT {SELECT_COLUMNS} FROM user_subscriptions WHERE owner_id = $1 AND is_current"
        );
        let row: Option<SubscriptionRow> = sqlx::query_as(&query)
            .bind(owner_id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(SubscriptionRow::into_subscription).transpose()
    }

    /// Fetch a specific subscription row, current or historical. Used by
    /// idempotent checkout replays to return the originally produced row.
    pub async fn by_id(&self, id: Uuid) -> BillingResult<Option<UserSubscription>> {
        let query = format!("SELECT {SELECT_COLUMNS} FROM user_subscriptions WHERE id = $1");
        let row: Option<SubscriptionRow> = sqlx::query_as(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(SubscriptionRow::into_subscription).transpose()
    }

    /// Apply a validated transition in its own transaction.
    pub async fn apply_change(
        &self,
        owner_id: Uuid,
        event: SubscriptionEvent,
        triggered_by: TriggeredBy,
        proration_amount: Option<i64>,
    ) -> BillingResult<UserSubscription> {
        let mut tx = self.pool.begin().await?;
        let subscription = self
            .apply_change_in(&mut tx, owner_id, event, triggered_by, proration_amount)
            .await?;
        tx.commit().await?;
        Ok(subscription)
    }

    /// Apply a validated transition inside the caller's transaction.
    ///
    /// Used by checkout completion so the session claim and the subscription
    /// transition commit or roll back together.
    pub async fn apply_change_in(
        &self,
        conn: &mut PgConnection,
        owner_id: Uuid,
        event: SubscriptionEvent,
        triggered_by: TriggeredBy,
        proration_amount: Option<i64>,
    ) -> BillingResult<UserSubscription> {
        let now = OffsetDateTime::now_utc();

        // Row lock on the tenant's current subscription linearizes all
        // mutations for this tenant.
        let query = format!(
            "SELECT {SELECT_COLUMNS} FROM user_subscriptions \
             WHERE owner_id = $1 AND is_current FOR UPDATE"
        );
        let previous: Option<SubscriptionRow> = sqlx::query_as(&query)
            .bind(owner_id)
            .fetch_optional(&mut *conn)
            .await?;
        let previous = previous
            .map(SubscriptionRow::into_subscription)
            .transpose()?;

        let new_status = next_status(previous.as_ref().map(|p| p.status), &event)?;
        let successor = build_successor(owner_id, previous.as_ref(), &event, new_status, now)?;

        if let Some(prev) = &previous {
            let demoted = sqlx::query(
                "UPDATE user_subscriptions SET is_current = false, updated_at = NOW() \
                 WHERE id = $1 AND version = $2 AND is_current",
            )
            .bind(prev.id)
            .bind(prev.version)
            .execute(&mut *conn)
            .await?
            .rows_affected();

            if demoted == 0 {
                return Err(BillingError::ConcurrentModification);
            }
        }

        sqlx::query(
            r#"
            INSERT INTO user_subscriptions
                (id, owner_id, status, subscription_plan_id, seat_plan_id,
                 start_date, end_date, is_auto_renew, billing_interval,
                 current_employee_count, max_employee_count, is_trial_used,
                 trial_start_date, trial_end_date, is_current, version,
                 created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, true, $15, $16, $16)
            "#,
        )
        .bind(successor.id)
        .bind(successor.owner_id)
        .bind(successor.status.as_str())
        .bind(successor.subscription_plan_id)
        .bind(successor.seat_plan_id)
        .bind(successor.start_date)
        .bind(successor.end_date)
        .bind(successor.is_auto_renew)
        .bind(successor.billing_interval.map(|i| i.as_str()))
        .bind(successor.current_employee_count)
        .bind(successor.max_employee_count)
        .bind(successor.is_trial_used)
        .bind(successor.trial_start_date)
        .bind(successor.trial_end_date)
        .bind(successor.version)
        .bind(now)
        .execute(&mut *conn)
        .await?;

        let before_snapshot = previous
            .as_ref()
            .map(serde_json::to_value)
            .transpose()
            .map_err(|e| BillingError::Invariant(e.to_string()))?;
        let after_snapshot = serde_json::to_value(&successor)
            .map_err(|e| BillingError::Invariant(e.to_string()))?;

        self.records
            .append_in(
                conn,
                NewChangeRecord {
                    subscription_id: successor.id,
                    owner_id,
                    change_type: event.change_type(),
                    before_snapshot,
                    after_snapshot,
                    proration_amount,
                    effective_date: now,
                    triggered_by,
                },
            )
            .await?;

        tracing::info!(
            owner_id = %owner_id,
            from = %crate::error::DisplayableStatus(previous.map(|p| p.status)),
            to = %new_status,
            event = %event.kind(),
            triggered_by = %triggered_by,
            "Subscription transition applied"
        );

        Ok(successor)
    }

    /// Record a headcount change reported by the HR collaborator.
    ///
    /// Read-side enforcement: an increase beyond the seat limit while the
    /// subscription is trial or active fails with `SeatLimitExceeded` and
    /// writes nothing. The collaborator rejects the hire before it happens;
    /// this is the engine's backstop.
    pub async fn record_employee_count(
        &self,
        owner_id: Uuid,
        count: i32,
    ) -> BillingResult<UserSubscription> {
        if count < 0 {
            return Err(BillingError::Validation(format!(
                "employee count cannot be negative: {count}"
            )));
        }

        let mut tx = self.pool.begin().await?;

        let query = format!(
            "SELECT {SELECT_COLUMNS} FROM user_subscriptions \
             WHERE owner_id = $1 AND is_current FOR UPDATE"
        );
        let row: Option<SubscriptionRow> = sqlx::query_as(&query)
            .bind(owner_id)
            .fetch_optional(&mut *tx)
            .await?;
        let mut subscription = row
            .map(SubscriptionRow::into_subscription)
            .transpose()?
            .ok_or(BillingError::SubscriptionNotFound(owner_id))?;

        let gated = matches!(
            subscription.status,
            SubscriptionStatus::Trial | SubscriptionStatus::Active
        );
        if gated && count > subscription.max_employee_count {
            return Err(BillingError::SeatLimitExceeded {
                count,
                max: subscription.max_employee_count,
            });
        }

        sqlx::query(
            "UPDATE user_subscriptions SET current_employee_count = $1, updated_at = NOW() \
             WHERE id = $2",
        )
        .bind(count)
        .bind(subscription.id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        subscription.current_employee_count = count;
        Ok(subscription)
    }
}

/// Build the successor row for a validated transition. Pure aside from the
/// fresh row id.
fn build_successor(
    owner_id: Uuid,
    previous: Option<&UserSubscription>,
    event: &SubscriptionEvent,
    new_status: SubscriptionStatus,
    now: OffsetDateTime,
) -> BillingResult<UserSubscription> {
    let employee_count = previous.map(|p| p.current_employee_count).unwrap_or(0);

    let check_seat_limit = |max: i32| {
        if employee_count > max {
            Err(BillingError::SeatLimitExceeded {
                count: employee_count,
                max,
            })
        } else {
            Ok(())
        }
    };

    let mut successor = UserSubscription {
        id: Uuid::new_v4(),
        owner_id,
        status: new_status,
        subscription_plan_id: previous.and_then(|p| p.subscription_plan_id),
        seat_plan_id: previous.and_then(|p| p.seat_plan_id),
        start_date: previous.map(|p| p.start_date).unwrap_or(now),
        end_date: previous.and_then(|p| p.end_date),
        is_auto_renew: previous.map(|p| p.is_auto_renew).unwrap_or(false),
        billing_interval: previous.and_then(|p| p.billing_interval),
        current_employee_count: employee_count,
        max_employee_count: previous.map(|p| p.max_employee_count).unwrap_or(0),
        // Lifetime flag survives every transition.
        is_trial_used: previous.map(|p| p.is_trial_used).unwrap_or(false),
        // Trial dates are frozen history after the trial ends, never cleared.
        trial_start_date: previous.and_then(|p| p.trial_start_date),
        trial_end_date: previous.and_then(|p| p.trial_end_date),
        is_current: true,
        version: previous.map(|p| p.version + 1).unwrap_or(0),
        created_at: now,
        updated_at: now,
    };

    match event {
        SubscriptionEvent::StartTrial {
            plan_id,
            seat_plan_id,
            max_employees,
        } => {
            check_seat_limit(*max_employees)?;
            successor.subscription_plan_id = Some(*plan_id);
            successor.seat_plan_id = Some(*seat_plan_id);
            successor.max_employee_count = *max_employees;
            successor.start_date = now;
            successor.end_date = None;
            successor.trial_start_date = Some(now);
            successor.trial_end_date = Some(now + Duration::days(TRIAL_DAYS));
            successor.is_trial_used = true;
            successor.is_auto_renew = false;
        }
        SubscriptionEvent::Convert {
            plan_id,
            seat_plan_id,
            max_employees,
            interval,
            end_date,
        } => {
            check_seat_limit(*max_employees)?;
            successor.subscription_plan_id = Some(*plan_id);
            successor.seat_plan_id = Some(*seat_plan_id);
            successor.max_employee_count = *max_employees;
            successor.start_date = now;
            successor.end_date = Some(*end_date);
            successor.billing_interval = Some(*interval);
            successor.is_auto_renew = true;
        }
        SubscriptionEvent::Expire => {
            // Frozen trial dates document when the trial ran.
        }
        SubscriptionEvent::RenewalFailure => {}
        SubscriptionEvent::PaymentResolved => {}
        SubscriptionEvent::Cancel => {
            successor.is_auto_renew = false;
        }
        SubscriptionEvent::PlanOrSeatChange {
            plan_id,
            seat_plan_id,
            max_employees,
            interval,
            end_date,
            ..
        } => {
            check_seat_limit(*max_employees)?;
            successor.subscription_plan_id = Some(*plan_id);
            successor.seat_plan_id = Some(*seat_plan_id);
            successor.max_employee_count = *max_employees;
            if let Some(new_interval) = interval {
                successor.billing_interval = Some(*new_interval);
            }
            if let Some(end) = end_date {
                successor.end_date = Some(*end);
            }
        }
        SubscriptionEvent::Renew { new_end_date } => {
            successor.end_date = Some(*new_end_date);
        }
        SubscriptionEvent::NewCheckoutCompleted {
            plan_id,
            seat_plan_id,
            max_employees,
            interval,
            end_date,
        } => {
            check_seat_limit(*max_employees)?;
            successor.subscription_plan_id = Some(*plan_id);
            successor.seat_plan_id = Some(*seat_plan_id);
            successor.max_employee_count = *max_employees;
            successor.start_date = now;
            successor.end_date = Some(*end_date);
            successor.billing_interval = Some(*interval);
            successor.is_auto_renew = true;
        }
    }

    // Trial rows always carry their window.
    if successor.status == SubscriptionStatus::Trial
        && (successor.trial_start_date.is_none() || successor.trial_end_date.is_none())
    {
        return Err(BillingError::Invariant(format!(
            "trial subscription for tenant {owner_id} is missing its trial window"
        )));
    }

    Ok(successor)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn start_trial_event() -> SubscriptionEvent {
        SubscriptionEvent::StartTrial {
            plan_id: Uuid::new_v4(),
            seat_plan_id: Uuid::new_v4(),
            max_employees: 25,
        }
    }

    fn all_events() -> Vec<SubscriptionEvent> {
        let now = OffsetDateTime::now_utc();
        vec![
            start_trial_event(),
            SubscriptionEvent::Convert {
                plan_id: Uuid::new_v4(),
                seat_plan_id: Uuid::new_v4(),
                max_employees: 25,
                interval: BillingInterval::Monthly,
                end_date: now,
            },
            SubscriptionEvent::Expire,
            SubscriptionEvent::RenewalFailure,
            SubscriptionEvent::PaymentResolved,
            SubscriptionEvent::Cancel,
            SubscriptionEvent::PlanOrSeatChange {
                plan_id: Uuid::new_v4(),
                seat_plan_id: Uuid::new_v4(),
                max_employees: 50,
                interval: None,
                end_date: None,
                change_type: ChangeType::SeatUpgrade,
            },
            SubscriptionEvent::Renew { new_end_date: now },
            SubscriptionEvent::NewCheckoutCompleted {
                plan_id: Uuid::new_v4(),
                seat_plan_id: Uuid::new_v4(),
                max_employees: 25,
                interval: BillingInterval::Monthly,
                end_date: now,
            },
        ]
    }

    #[test]
    fn transition_table_accepts_exactly_the_specified_pairs() {
        use SubscriptionEventKind as K;
        use SubscriptionStatus::*;

        let allowed: &[(Option<SubscriptionStatus>, K)] = &[
            (None, K::StartTrial),
            (Some(Trial), K::Convert),
            (Some(Trial), K::Expire),
            (Some(Active), K::RenewalFailure),
            (Some(Suspended), K::PaymentResolved),
            (Some(Active), K::Cancel),
            (Some(Active), K::PlanOrSeatChange),
            (Some(Suspended), K::PlanOrSeatChange),
            (Some(Active), K::Renew),
            (Some(Expired), K::NewCheckoutCompleted),
            (Some(Cancelled), K::NewCheckoutCompleted),
            (Some(Inactive), K::NewCheckoutCompleted),
        ];

        let mut states: Vec<Option<SubscriptionStatus>> =
            SubscriptionStatus::ALL.iter().copied().map(Some).collect();
        states.push(None);

        for state in states {
            for event in all_events() {
                let expected = allowed
                    .iter()
                    .any(|(s, k)| *s == state && *k == event.kind());
                let result = next_status(state, &event);
                assert_eq!(
                    result.is_ok(),
                    expected,
                    "state {state:?} event {} expected allowed={expected}",
                    event.kind()
                );
                if let Err(err) = result {
                    assert!(matches!(err, BillingError::InvalidTransition { .. }));
                }
            }
        }
    }

    #[test]
    fn trial_window_is_exactly_fourteen_days() {
        let now = OffsetDateTime::now_utc();
        let sub = build_successor(
            Uuid::new_v4(),
            None,
            &start_trial_event(),
            SubscriptionStatus::Trial,
            now,
        )
        .unwrap();

        assert_eq!(sub.trial_start_date, Some(now));
        assert_eq!(sub.trial_end_date, Some(now + Duration::days(14)));
        assert!(sub.is_trial_used);
        assert!(!sub.is_auto_renew);
        assert_eq!(sub.end_date, None);
    }

    #[test]
    fn trial_flags_survive_expiry() {
        let now = OffsetDateTime::now_utc();
        let owner = Uuid::new_v4();
        let trial = build_successor(
            owner,
            None,
            &start_trial_event(),
            SubscriptionStatus::Trial,
            now,
        )
        .unwrap();

        let expired = build_successor(
            owner,
            Some(&trial),
            &SubscriptionEvent::Expire,
            SubscriptionStatus::Expired,
            now + Duration::days(15),
        )
        .unwrap();

        assert!(expired.is_trial_used);
        assert_eq!(expired.trial_start_date, trial.trial_start_date);
        assert_eq!(expired.trial_end_date, trial.trial_end_date);
        assert_eq!(expired.version, trial.version + 1);
    }

    #[test]
    fn no_path_back_to_trial_once_used() {
        // Already in trial.
        assert!(matches!(
            next_status(Some(SubscriptionStatus::Trial), &start_trial_event()),
            Err(BillingError::InvalidTransition { .. })
        ));
        // And after expiry or cancellation the table still has no path back:
        // StartTrial is only valid from no-subscription.
        for terminal in [SubscriptionStatus::Expired, SubscriptionStatus::Cancelled] {
            assert!(next_status(Some(terminal), &start_trial_event()).is_err());
        }
    }

    #[test]
    fn conversion_moves_to_paid_term() {
        let now = datetime!(2024-03-01 00:00:00 UTC);
        let owner = Uuid::new_v4();
        let trial = build_successor(
            owner,
            None,
            &start_trial_event(),
            SubscriptionStatus::Trial,
            now,
        )
        .unwrap();

        let plan_id = Uuid::new_v4();
        let seat_id = Uuid::new_v4();
        let end = datetime!(2024-04-01 00:00:00 UTC);
        let active = build_successor(
            owner,
            Some(&trial),
            &SubscriptionEvent::Convert {
                plan_id,
                seat_plan_id: seat_id,
                max_employees: 25,
                interval: BillingInterval::Monthly,
                end_date: end,
            },
            SubscriptionStatus::Active,
            datetime!(2024-03-05 00:00:00 UTC),
        )
        .unwrap();

        assert_eq!(active.status, SubscriptionStatus::Active);
        assert_eq!(active.subscription_plan_id, Some(plan_id));
        assert_eq!(active.seat_plan_id, Some(seat_id));
        assert_eq!(active.end_date, Some(end));
        assert_eq!(active.billing_interval, Some(BillingInterval::Monthly));
        assert!(active.is_auto_renew);
        // Trial history frozen.
        assert_eq!(active.trial_start_date, trial.trial_start_date);
        assert_eq!(active.trial_end_date, trial.trial_end_date);
    }

    #[test]
    fn seat_downgrade_below_headcount_is_rejected() {
        let now = OffsetDateTime::now_utc();
        let owner = Uuid::new_v4();
        let mut active = build_successor(
            owner,
            None,
            &start_trial_event(),
            SubscriptionStatus::Trial,
            now,
        )
        .unwrap();
        active.status = SubscriptionStatus::Active;
        active.current_employee_count = 30;
        active.max_employee_count = 50;

        let err = build_successor(
            owner,
            Some(&active),
            &SubscriptionEvent::PlanOrSeatChange {
                plan_id: Uuid::new_v4(),
                seat_plan_id: Uuid::new_v4(),
                max_employees: 25,
                interval: None,
                end_date: None,
                change_type: ChangeType::SeatDowngrade,
            },
            SubscriptionStatus::Active,
            now,
        )
        .unwrap_err();

        assert!(matches!(
            err,
            BillingError::SeatLimitExceeded { count: 30, max: 25 }
        ));
    }

    #[test]
    fn monthly_cycle_advances_with_day_clamp() {
        let jan31 = datetime!(2024-01-31 08:00:00 UTC);
        let feb = advance_one_cycle(jan31, BillingInterval::Monthly);
        assert_eq!(feb, datetime!(2024-02-29 08:00:00 UTC));

        let dec15 = datetime!(2024-12-15 00:00:00 UTC);
        assert_eq!(
            advance_one_cycle(dec15, BillingInterval::Monthly),
            datetime!(2025-01-15 00:00:00 UTC)
        );
    }

    #[test]
    fn retreat_recovers_cycle_start() {
        let mar31 = datetime!(2024-03-31 00:00:00 UTC);
        assert_eq!(
            retreat_one_cycle(mar31, BillingInterval::Monthly),
            datetime!(2024-02-29 00:00:00 UTC)
        );
        let jan15 = datetime!(2024-01-15 00:00:00 UTC);
        assert_eq!(
            retreat_one_cycle(jan15, BillingInterval::Monthly),
            datetime!(2023-12-15 00:00:00 UTC)
        );
    }

    #[test]
    fn yearly_cycle_advances_with_leap_day_clamp() {
        let leap = datetime!(2024-02-29 00:00:00 UTC);
        assert_eq!(
            advance_one_cycle(leap, BillingInterval::Yearly),
            datetime!(2025-02-28 00:00:00 UTC)
        );
    }
}
