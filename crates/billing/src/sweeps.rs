//! Scheduled sweep logic.
//!
//! Three idempotent passes the worker runs on a cron: expire lapsed trials,
//! warn tenants whose trial is about to end, and collect auto-renewals.
//! Each sweep isolates per-tenant failures and reports a result enum per
//! tenant so the worker can count and log outcomes in one place.

use std::sync::Arc;

use sqlx::PgPool;
use staffly_shared::TriggeredBy;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::catalog::PlanCatalog;
use crate::error::{BillingError, BillingResult};
use crate::gateway::{ChargeRequest, PaymentGateway, PaymentStatus};
use crate::notify::{TrialEndingNotice, TrialNotifier};
use crate::subscriptions::{advance_one_cycle, SubscriptionEvent, SubscriptionService};

/// Warn when a trial ends within this many days.
pub const TRIAL_WARNING_WINDOW_DAYS: i64 = 3;

/// A renewal claim without a recorded outcome older than this is treated as
/// abandoned by a dead run.
const STALE_CLAIM_MINUTES: i64 = 30;

/// Where a trial stands relative to the sweep clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrialStanding {
    /// Past its end date; the expiry sweep owns it.
    Lapsed,
    /// Ends within the warning window.
    EndingSoon { days_left: i64 },
    Ongoing,
}

pub fn trial_standing(trial_end: OffsetDateTime, now: OffsetDateTime) -> TrialStanding {
    if trial_end < now {
        return TrialStanding::Lapsed;
    }
    let remaining = trial_end - now;
    if remaining <= Duration::days(TRIAL_WARNING_WINDOW_DAYS) {
        TrialStanding::EndingSoon {
            days_left: remaining.whole_days().max(0),
        }
    } else {
        TrialStanding::Ongoing
    }
}

/// Whether a renewal claim left by an earlier run may be taken over. Only
/// claims that never reached a recorded outcome qualify, and only after a
/// grace window so an in-flight charge is not raced.
fn claim_reclaimable(status: &str, created_at: OffsetDateTime, now: OffsetDateTime) -> bool {
    status == "pending" && now - created_at > Duration::minutes(STALE_CLAIM_MINUTES)
}

#[derive(Debug)]
pub enum TrialExpiryResult {
    Expired { user_id: Uuid },
    Error { user_id: Uuid, error: String },
}

#[derive(Debug)]
pub enum TrialWarningResult {
    Warned { user_id: Uuid, days_left: i64 },
    /// Another run already claimed today's warning for this tenant.
    AlreadyWarned { user_id: Uuid },
    Error { user_id: Uuid, error: String },
}

#[derive(Debug)]
pub enum RenewalResult {
    Renewed { user_id: Uuid, amount: i64 },
    /// The charge failed; the subscription was moved to suspended.
    Suspended { user_id: Uuid, reason: String },
    /// A concurrent run already claimed this billing period.
    AlreadyClaimed { user_id: Uuid },
    Error { user_id: Uuid, error: String },
}

#[derive(Debug, sqlx::FromRow)]
struct DueSubscription {
    id: Uuid,
    owner_id: Uuid,
    seat_plan_id: Option<Uuid>,
    end_date: Option<OffsetDateTime>,
    billing_interval: Option<String>,
}

/// Runs the scheduled lifecycle sweeps.
#[derive(Clone)]
pub struct SweepService {
    pool: PgPool,
    subscriptions: SubscriptionService,
    catalog: Arc<dyn PlanCatalog>,
    gateway: Arc<dyn PaymentGateway>,
    notifier: Arc<dyn TrialNotifier>,
    currency: String,
}

impl SweepService {
    pub fn new(
        pool: PgPool,
        subscriptions: SubscriptionService,
        catalog: Arc<dyn PlanCatalog>,
        gateway: Arc<dyn PaymentGateway>,
        notifier: Arc<dyn TrialNotifier>,
        currency: String,
    ) -> Self {
        Self {
            pool,
            subscriptions,
            catalog,
            gateway,
            notifier,
            currency,
        }
    }

    /// Expire trials whose window has lapsed. Reruns are no-ops: the status
    /// guard in the selection means an already-expired tenant never matches
    /// again.
    pub async fn expire_trials(&self) -> BillingResult<Vec<TrialExpiryResult>> {
        let now = OffsetDateTime::now_utc();
        let due: Vec<(Uuid,)> = sqlx::query_as(
            "SELECT owner_id FROM user_subscriptions \
             WHERE is_current AND status = 'trial' AND trial_end_date < $1",
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        let mut results = Vec::with_capacity(due.len());
        for (user_id,) in due {
            match self
                .subscriptions
                .apply_change(user_id, SubscriptionEvent::Expire, TriggeredBy::SystemJob, None)
                .await
            {
                Ok(_) => results.push(TrialExpiryResult::Expired { user_id }),
                // A concurrent conversion or an earlier run got there first.
                Err(e) if e.is_conflict() => {
                    tracing::debug!(user_id = %user_id, "Trial no longer expirable, skipping");
                }
                Err(e) => results.push(TrialExpiryResult::Error {
                    user_id,
                    error: e.to_string(),
                }),
            }
        }
        Ok(results)
    }

    /// Notify tenants whose trial ends within the warning window. The
    /// `last_trial_warning_on` date column gates delivery to at most one
    /// warning per tenant per day, across concurrent runs.
    pub async fn warn_ending_trials(&self) -> BillingResult<Vec<TrialWarningResult>> {
        let now = OffsetDateTime::now_utc();
        let horizon = now + Duration::days(TRIAL_WARNING_WINDOW_DAYS);
        let today = now.date();

        let candidates: Vec<(Uuid, Uuid, OffsetDateTime)> = sqlx::query_as(
            "SELECT id, owner_id, trial_end_date FROM user_subscriptions \
             WHERE is_current AND status = 'trial' \
               AND trial_end_date >= $1 AND trial_end_date <= $2",
        )
        .bind(now)
        .bind(horizon)
        .fetch_all(&self.pool)
        .await?;

        let mut results = Vec::with_capacity(candidates.len());
        for (row_id, user_id, trial_end) in candidates {
            // The clock can move past the end date between selection and
            // here; such a row belongs to the expiry sweep, not a warning.
            let days_left = match trial_standing(trial_end, OffsetDateTime::now_utc()) {
                TrialStanding::EndingSoon { days_left } => days_left,
                TrialStanding::Lapsed | TrialStanding::Ongoing => continue,
            };

            let claimed = sqlx::query(
                "UPDATE user_subscriptions SET last_trial_warning_on = $1 \
                 WHERE id = $2 AND last_trial_warning_on IS DISTINCT FROM $1",
            )
            .bind(today)
            .bind(row_id)
            .execute(&self.pool)
            .await?
            .rows_affected();
            if claimed == 0 {
                results.push(TrialWarningResult::AlreadyWarned { user_id });
                continue;
            }
            let notice = TrialEndingNotice {
                user_id,
                trial_end_date: trial_end,
                days_left,
            };
            match self.notifier.trial_ending(&notice).await {
                Ok(()) => results.push(TrialWarningResult::Warned { user_id, days_left }),
                Err(e) => results.push(TrialWarningResult::Error {
                    user_id,
                    error: e.to_string(),
                }),
            }
        }
        Ok(results)
    }

    /// Collect renewals for active, auto-renewing subscriptions whose
    /// billing period has ended. A unique claim row per (subscription,
    /// period) guarantees at most one charge attempt even if two workers
    /// sweep the same tenant.
    pub async fn run_auto_renewals(&self) -> BillingResult<Vec<RenewalResult>> {
        let now = OffsetDateTime::now_utc();
        let due: Vec<DueSubscription> = sqlx::query_as(
            "SELECT id, owner_id, seat_plan_id, end_date, billing_interval \
             FROM user_subscriptions \
             WHERE is_current AND status = 'active' AND is_auto_renew AND end_date <= $1",
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        let mut results = Vec::with_capacity(due.len());
        for sub in due {
            let user_id = sub.owner_id;
            match self.renew_one(&sub).await {
                Ok(result) => results.push(result),
                Err(e) => results.push(RenewalResult::Error {
                    user_id,
                    error: e.to_string(),
                }),
            }
        }
        Ok(results)
    }

    async fn renew_one(&self, sub: &DueSubscription) -> BillingResult<RenewalResult> {
        let seat_plan_id = sub.seat_plan_id.ok_or_else(|| {
            BillingError::Invariant(format!(
                "renewable subscription {} has no seat plan",
                sub.id
            ))
        })?;
        let period_start = sub.end_date.ok_or_else(|| {
            BillingError::Invariant(format!(
                "renewable subscription {} has no end date",
                sub.id
            ))
        })?;
        let interval = sub
            .billing_interval
            .as_deref()
            .map(str::parse::<staffly_shared::BillingInterval>)
            .transpose()
            .map_err(|e| BillingError::Invariant(e.to_string()))?
            .ok_or_else(|| {
                BillingError::Invariant(format!(
                    "renewable subscription {} has no billing interval",
                    sub.id
                ))
            })?;

        let seat = self.catalog.seat_plan(seat_plan_id).await?;
        let amount = seat.price_for(interval);
        let period_end = advance_one_cycle(period_start, interval);

        // Atomic claim: exactly one sweep run charges this period. A claim a
        // dead run left without an outcome is taken over after the grace
        // window instead of blocking the tenant's renewal forever.
        let inserted: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO renewal_charges
                (id, subscription_id, user_id, period_start, period_end, amount, currency, status)
            VALUES ($1, $2, $3, $4, $5, $6, $7, 'pending')
            ON CONFLICT (subscription_id, period_start) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(sub.id)
        .bind(sub.owner_id)
        .bind(period_start)
        .bind(period_end)
        .bind(amount)
        .bind(&self.currency)
        .fetch_optional(&self.pool)
        .await?;
        let claim = match inserted {
            Some(row) => Some(row),
            None => self.reclaim_charge(sub.id, period_start).await?,
        };
        let Some((charge_id,)) = claim else {
            return Ok(RenewalResult::AlreadyClaimed {
                user_id: sub.owner_id,
            });
        };

        let outcome = self
            .gateway
            .charge(ChargeRequest {
                subscription_id: sub.id,
                amount,
                currency: self.currency.clone(),
                description: format!("Renewal: {} ({interval})", seat.name),
            })
            .await;

        match outcome {
            Ok(charge) if charge.status == PaymentStatus::Paid => {
                self.settle_charge(charge_id, "succeeded", Some(&charge.reference))
                    .await?;
                self.subscriptions
                    .apply_change(
                        sub.owner_id,
                        SubscriptionEvent::Renew {
                            new_end_date: period_end,
                        },
                        TriggeredBy::SystemJob,
                        Some(amount),
                    )
                    .await?;
                tracing::info!(
                    user_id = %sub.owner_id,
                    amount = amount,
                    period_end = %period_end,
                    "Subscription renewed"
                );
                Ok(RenewalResult::Renewed {
                    user_id: sub.owner_id,
                    amount,
                })
            }
            Ok(charge) => {
                let reason = format!("gateway returned {:?}", charge.status);
                self.settle_charge(charge_id, "failed", Some(&charge.reference))
                    .await?;
                self.suspend_after_failure(sub.owner_id, &reason).await?;
                Ok(RenewalResult::Suspended {
                    user_id: sub.owner_id,
                    reason,
                })
            }
            Err(e) => {
                let reason = e.to_string();
                self.settle_charge(charge_id, "failed", None).await?;
                self.suspend_after_failure(sub.owner_id, &reason).await?;
                Ok(RenewalResult::Suspended {
                    user_id: sub.owner_id,
                    reason,
                })
            }
        }
    }

    /// Take over a stale unsettled claim. The update is a compare-and-swap
    /// on the observed `created_at`, so two concurrent sweeps cannot both
    /// win the same abandoned claim.
    async fn reclaim_charge(
        &self,
        subscription_id: Uuid,
        period_start: OffsetDateTime,
    ) -> BillingResult<Option<(Uuid,)>> {
        let prior: Option<(Uuid, String, OffsetDateTime)> = sqlx::query_as(
            "SELECT id, status, created_at FROM renewal_charges \
             WHERE subscription_id = $1 AND period_start = $2",
        )
        .bind(subscription_id)
        .bind(period_start)
        .fetch_optional(&self.pool)
        .await?;
        let Some((charge_id, status, created_at)) = prior else {
            return Ok(None);
        };
        if !claim_reclaimable(&status, created_at, OffsetDateTime::now_utc()) {
            return Ok(None);
        }

        let row: Option<(Uuid,)> = sqlx::query_as(
            "UPDATE renewal_charges SET created_at = NOW(), updated_at = NOW() \
             WHERE id = $1 AND status = 'pending' AND created_at = $2 \
             RETURNING id",
        )
        .bind(charge_id)
        .bind(created_at)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn settle_charge(
        &self,
        charge_id: Uuid,
        status: &str,
        reference: Option<&str>,
    ) -> BillingResult<()> {
        sqlx::query(
            "UPDATE renewal_charges SET status = $1, gateway_reference = $2, updated_at = NOW() \
             WHERE id = $3",
        )
        .bind(status)
        .bind(reference)
        .bind(charge_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn suspend_after_failure(&self, user_id: Uuid, reason: &str) -> BillingResult<()> {
        tracing::warn!(user_id = %user_id, reason = %reason, "Renewal charge failed, suspending");
        self.subscriptions
            .apply_change(
                user_id,
                SubscriptionEvent::RenewalFailure,
                TriggeredBy::SystemJob,
                None,
            )
            .await?;
        Ok(())
    }
}

/// Count sweep outcomes for one summary log line in the worker.
pub fn summarize_renewals(results: &[RenewalResult]) -> (usize, usize, usize, usize) {
    let renewed = results
        .iter()
        .filter(|r| matches!(r, RenewalResult::Renewed { .. }))
        .count();
    let suspended = results
        .iter()
        .filter(|r| matches!(r, RenewalResult::Suspended { .. }))
        .count();
    let claimed = results
        .iter()
        .filter(|r| matches!(r, RenewalResult::AlreadyClaimed { .. }))
        .count();
    let errors = results
        .iter()
        .filter(|r| matches!(r, RenewalResult::Error { .. }))
        .count();
    (renewed, suspended, claimed, errors)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trial_standing_tracks_the_warning_window() {
        let now = OffsetDateTime::now_utc();
        assert_eq!(trial_standing(now - Duration::hours(1), now), TrialStanding::Lapsed);
        assert_eq!(
            trial_standing(now + Duration::hours(2), now),
            TrialStanding::EndingSoon { days_left: 0 }
        );
        assert_eq!(
            trial_standing(now + Duration::days(3), now),
            TrialStanding::EndingSoon { days_left: 3 }
        );
        assert_eq!(
            trial_standing(now + Duration::days(3) + Duration::hours(1), now),
            TrialStanding::Ongoing
        );
        assert_eq!(trial_standing(now + Duration::days(10), now), TrialStanding::Ongoing);
    }

    #[test]
    fn only_stale_unsettled_claims_are_reclaimable() {
        let now = OffsetDateTime::now_utc();
        assert!(!claim_reclaimable("pending", now - Duration::minutes(5), now));
        assert!(claim_reclaimable("pending", now - Duration::minutes(31), now));
        assert!(!claim_reclaimable("succeeded", now - Duration::hours(2), now));
        assert!(!claim_reclaimable("failed", now - Duration::hours(2), now));
    }

    #[test]
    fn renewal_summary_counts_each_variant() {
        let user = Uuid::new_v4();
        let results = vec![
            RenewalResult::Renewed {
                user_id: user,
                amount: 290_000,
            },
            RenewalResult::Renewed {
                user_id: user,
                amount: 490_000,
            },
            RenewalResult::Suspended {
                user_id: user,
                reason: "card declined".into(),
            },
            RenewalResult::AlreadyClaimed { user_id: user },
            RenewalResult::Error {
                user_id: user,
                error: "db gone".into(),
            },
        ];
        assert_eq!(summarize_renewals(&results), (2, 1, 1, 1));
    }
}
