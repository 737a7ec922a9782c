//! Billing Invariants Module
//!
//! Provides runnable consistency checks for the subscription lifecycle.
//! These invariants can be run after any mutation, webhook replay, or sweep
//! to confirm the system is in a valid state.
//!
//! ## Design Principles
//!
//! 1. **Executable**: Each invariant is a real SQL query that can be run
//! 2. **Explanatory**: Violations include enough context to debug
//! 3. **Non-destructive**: Checks only read, never write

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;
use crate::subscriptions::TRIAL_DAYS;

/// Result of running a single invariant check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    /// Which invariant was violated
    pub invariant: String,
    /// Tenant(s) affected
    pub owner_ids: Vec<Uuid>,
    /// Human-readable description of the violation
    pub description: String,
    /// Additional context for debugging
    pub context: serde_json::Value,
    /// Severity level
    pub severity: ViolationSeverity,
}

/// Severity of an invariant violation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// Critical - system may be charging incorrectly
    Critical,
    /// High - data inconsistency that needs attention
    High,
    /// Medium - potential issue, should investigate
    Medium,
    /// Low - minor inconsistency, informational
    Low,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
            ViolationSeverity::Low => write!(f, "LOW"),
        }
    }
}

/// Summary of all invariant checks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantCheckSummary {
    /// When the check was run
    pub checked_at: OffsetDateTime,
    /// Total number of checks run
    pub checks_run: usize,
    /// Number of checks that passed
    pub checks_passed: usize,
    /// Number of checks that failed
    pub checks_failed: usize,
    /// List of all violations found
    pub violations: Vec<InvariantViolation>,
    /// Overall health status
    pub healthy: bool,
}

#[derive(Debug, sqlx::FromRow)]
struct MultipleCurrentRow {
    owner_id: Uuid,
    row_count: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct BadTrialRow {
    id: Uuid,
    owner_id: Uuid,
    trial_start_date: Option<OffsetDateTime>,
    trial_end_date: Option<OffsetDateTime>,
}

#[derive(Debug, sqlx::FromRow)]
struct HeadcountRow {
    owner_id: Uuid,
    status: String,
    current_employee_count: i32,
    max_employee_count: i32,
}

#[derive(Debug, sqlx::FromRow)]
struct DanglingSessionRow {
    id: Uuid,
    user_id: Uuid,
    resulting_subscription_id: Option<Uuid>,
}

#[derive(Debug, sqlx::FromRow)]
struct IncompletePaidRow {
    id: Uuid,
    owner_id: Uuid,
    status: String,
}

#[derive(Debug, sqlx::FromRow)]
struct DuplicateChargeRow {
    subscription_id: Uuid,
    user_id: Uuid,
    charge_count: i64,
}

/// Service for running billing invariant checks
pub struct InvariantChecker {
    pool: PgPool,
}

impl InvariantChecker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run all invariant checks and return summary
    pub async fn run_all_checks(&self) -> BillingResult<InvariantCheckSummary> {
        let now = OffsetDateTime::now_utc();
        let checks = Self::available_checks();
        let checks_run = checks.len();

        let mut violations = Vec::new();
        for name in checks {
            violations.extend(self.run_check(name).await?);
        }

        let checks_failed = violations
            .iter()
            .map(|v| &v.invariant)
            .collect::<std::collections::HashSet<_>>()
            .len();
        let checks_passed = checks_run - checks_failed;

        Ok(InvariantCheckSummary {
            checked_at: now,
            checks_run,
            checks_passed,
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        })
    }

    /// Invariant 1: Exactly one current subscription row per tenant
    ///
    /// Two current rows would make "which plan does this tenant have"
    /// ambiguous and could double-charge renewals.
    async fn check_single_current_row(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<MultipleCurrentRow> = sqlx::query_as(
            r#"
            SELECT owner_id, COUNT(*) as row_count
            FROM user_subscriptions
            WHERE is_current
            GROUP BY owner_id
            HAVING COUNT(*) > 1
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "single_current_row".to_string(),
                owner_ids: vec![row.owner_id],
                description: format!(
                    "Tenant has {} current subscription rows (expected 1)",
                    row.row_count
                ),
                context: serde_json::json!({
                    "row_count": row.row_count,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Invariant 2: Trial rows carry both trial dates
    async fn check_trial_rows_have_window(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<BadTrialRow> = sqlx::query_as(
            r#"
            SELECT id, owner_id, trial_start_date, trial_end_date
            FROM user_subscriptions
            WHERE is_current
              AND status = 'trial'
              AND (trial_start_date IS NULL OR trial_end_date IS NULL)
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "trial_rows_have_window".to_string(),
                owner_ids: vec![row.owner_id],
                description: "Trial subscription is missing its trial window".to_string(),
                context: serde_json::json!({
                    "subscription_id": row.id,
                    "trial_start_date": row.trial_start_date,
                    "trial_end_date": row.trial_end_date,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Invariant 3: Every trial window is exactly the fixed trial length
    async fn check_trial_window_length(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<BadTrialRow> = sqlx::query_as(
            r#"
            SELECT id, owner_id, trial_start_date, trial_end_date
            FROM user_subscriptions
            WHERE status = 'trial'
              AND trial_start_date IS NOT NULL
              AND trial_end_date IS NOT NULL
              AND trial_end_date != trial_start_date + ($1 || ' days')::INTERVAL
            "#,
        )
        .bind(TRIAL_DAYS)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "trial_window_length".to_string(),
                owner_ids: vec![row.owner_id],
                description: format!("Trial window is not exactly {TRIAL_DAYS} days"),
                context: serde_json::json!({
                    "subscription_id": row.id,
                    "trial_start_date": row.trial_start_date,
                    "trial_end_date": row.trial_end_date,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Invariant 4: Recorded headcount never exceeds the seat limit while
    /// the subscription is trial or active
    async fn check_headcount_within_seat_limit(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<HeadcountRow> = sqlx::query_as(
            r#"
            SELECT owner_id, status, current_employee_count, max_employee_count
            FROM user_subscriptions
            WHERE is_current
              AND status IN ('trial', 'active')
              AND current_employee_count > max_employee_count
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "headcount_within_seat_limit".to_string(),
                owner_ids: vec![row.owner_id],
                description: format!(
                    "Tenant records {} employees against a seat limit of {}",
                    row.current_employee_count, row.max_employee_count
                ),
                context: serde_json::json!({
                    "status": row.status,
                    "current_employee_count": row.current_employee_count,
                    "max_employee_count": row.max_employee_count,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Invariant 5: Completed sessions point at the subscription they made
    ///
    /// The idempotent replay path depends on this link; a completed session
    /// without it cannot return a stable result.
    async fn check_completed_sessions_resolve(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<DanglingSessionRow> = sqlx::query_as(
            r#"
            SELECT id, user_id, resulting_subscription_id
            FROM checkout_sessions
            WHERE status = 'completed'
              AND resulting_subscription_id IS NULL
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "completed_sessions_resolve".to_string(),
                owner_ids: vec![row.user_id],
                description: "Completed checkout session has no resulting subscription"
                    .to_string(),
                context: serde_json::json!({
                    "session_id": row.id,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Invariant 6: Paying statuses always carry a plan and a seat tier
    async fn check_paid_rows_have_plan(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<IncompletePaidRow> = sqlx::query_as(
            r#"
            SELECT id, owner_id, status
            FROM user_subscriptions
            WHERE is_current
              AND status IN ('trial', 'active', 'suspended')
              AND (subscription_plan_id IS NULL OR seat_plan_id IS NULL)
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "paid_rows_have_plan".to_string(),
                owner_ids: vec![row.owner_id],
                description: format!(
                    "Subscription in status '{}' is missing a plan or seat tier",
                    row.status
                ),
                context: serde_json::json!({
                    "subscription_id": row.id,
                    "status": row.status,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Invariant 7: At most one renewal charge per subscription and period
    ///
    /// The unique constraint enforces this at write time; this check catches
    /// any window where the constraint was missing or bypassed.
    async fn check_renewal_charge_uniqueness(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<DuplicateChargeRow> = sqlx::query_as(
            r#"
            SELECT subscription_id, MIN(user_id::text)::uuid as user_id, COUNT(*) as charge_count
            FROM renewal_charges
            GROUP BY subscription_id, period_start
            HAVING COUNT(*) > 1
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "renewal_charge_uniqueness".to_string(),
                owner_ids: vec![row.user_id],
                description: format!(
                    "Subscription has {} renewal charges for one billing period",
                    row.charge_count
                ),
                context: serde_json::json!({
                    "subscription_id": row.subscription_id,
                    "charge_count": row.charge_count,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Run a single invariant check by name
    pub async fn run_check(&self, name: &str) -> BillingResult<Vec<InvariantViolation>> {
        match name {
            "single_current_row" => self.check_single_current_row().await,
            "trial_rows_have_window" => self.check_trial_rows_have_window().await,
            "trial_window_length" => self.check_trial_window_length().await,
            "headcount_within_seat_limit" => self.check_headcount_within_seat_limit().await,
            "completed_sessions_resolve" => self.check_completed_sessions_resolve().await,
            "paid_rows_have_plan" => self.check_paid_rows_have_plan().await,
            "renewal_charge_uniqueness" => self.check_renewal_charge_uniqueness().await,
            _ => Ok(vec![]),
        }
    }

    /// Get list of all available invariant checks
    pub fn available_checks() -> Vec<&'static str> {
        vec![
            "single_current_row",
            "trial_rows_have_window",
            "trial_window_length",
            "headcount_within_seat_limit",
            "completed_sessions_resolve",
            "paid_rows_have_plan",
            "renewal_charge_uniqueness",
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_violation_severity_display() {
        assert_eq!(ViolationSeverity::Critical.to_string(), "CRITICAL");
        assert_eq!(ViolationSeverity::High.to_string(), "HIGH");
        assert_eq!(ViolationSeverity::Medium.to_string(), "MEDIUM");
        assert_eq!(ViolationSeverity::Low.to_string(), "LOW");
    }

    #[test]
    fn test_available_checks() {
        let checks = InvariantChecker::available_checks();
        assert_eq!(checks.len(), 7);
        assert!(checks.contains(&"single_current_row"));
        assert!(checks.contains(&"renewal_charge_uniqueness"));
    }

    #[tokio::test]
    async fn unknown_check_name_reports_no_violations() {
        let pool = sqlx::PgPool::connect_lazy("postgres://localhost/unused").unwrap();
        let checker = InvariantChecker::new(pool);
        assert!(checker.run_check("not_a_check").await.unwrap().is_empty());
    }
}
