//! Subscription change log
//!
//! Append-only audit trail of every subscription transition. Rows are written
//! inside the same transaction as the transition itself so the log can never
//! disagree with the subscription table.

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sqlx::{PgConnection, PgPool};
use staffly_shared::TriggeredBy;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;

/// What kind of transition a change record describes.
///
/// Covers the full transition table, not just the paid-change types, so the
/// periodic sweeps leave an audit trail too (and their idempotence can be
/// checked by counting records).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    TrialStarted,
    TrialConversion,
    TrialExpired,
    PlanUpgrade,
    PlanDowngrade,
    SeatUpgrade,
    SeatDowngrade,
    Renewal,
    Suspension,
    Reactivation,
    Cancellation,
    Activation,
}

impl ChangeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeType::TrialStarted => "trial_started",
            ChangeType::TrialConversion => "trial_conversion",
            ChangeType::TrialExpired => "trial_expired",
            ChangeType::PlanUpgrade => "plan_upgrade",
            ChangeType::PlanDowngrade => "plan_downgrade",
            ChangeType::SeatUpgrade => "seat_upgrade",
            ChangeType::SeatDowngrade => "seat_downgrade",
            ChangeType::Renewal => "renewal",
            ChangeType::Suspension => "suspension",
            ChangeType::Reactivation => "reactivation",
            ChangeType::Cancellation => "cancellation",
            ChangeType::Activation => "activation",
        }
    }
}

impl std::fmt::Display for ChangeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChangeType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "trial_started" => Ok(ChangeType::TrialStarted),
            "trial_conversion" => Ok(ChangeType::TrialConversion),
            "trial_expired" => Ok(ChangeType::TrialExpired),
            "plan_upgrade" => Ok(ChangeType::PlanUpgrade),
            "plan_downgrade" => Ok(ChangeType::PlanDowngrade),
            "seat_upgrade" => Ok(ChangeType::SeatUpgrade),
            "seat_downgrade" => Ok(ChangeType::SeatDowngrade),
            "renewal" => Ok(ChangeType::Renewal),
            "suspension" => Ok(ChangeType::Suspension),
            "reactivation" => Ok(ChangeType::Reactivation),
            "cancellation" => Ok(ChangeType::Cancellation),
            "activation" => Ok(ChangeType::Activation),
            other => Err(format!("unknown change type: {other}")),
        }
    }
}

/// One audit row. Snapshots are the serialized subscription state before and
/// after the transition; `before` is null for a tenant's first row.
#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionChangeRecord {
    pub id: Uuid,
    pub subscription_id: Uuid,
    pub owner_id: Uuid,
    pub change_type: ChangeType,
    pub before_snapshot: Option<serde_json::Value>,
    pub after_snapshot: serde_json::Value,
    pub proration_amount: Option<i64>,
    #[serde(with = "time::serde::rfc3339")]
    pub effective_date: OffsetDateTime,
    pub triggered_by: TriggeredBy,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Fields for a new record; ids and timestamps are assigned on append.
#[derive(Debug, Clone)]
pub struct NewChangeRecord {
    pub subscription_id: Uuid,
    pub owner_id: Uuid,
    pub change_type: ChangeType,
    pub before_snapshot: Option<serde_json::Value>,
    pub after_snapshot: serde_json::Value,
    pub proration_amount: Option<i64>,
    pub effective_date: OffsetDateTime,
    pub triggered_by: TriggeredBy,
}

#[derive(Debug, sqlx::FromRow)]
struct ChangeRecordRow {
    id: Uuid,
    subscription_id: Uuid,
    owner_id: Uuid,
    change_type: String,
    before_snapshot: Option<serde_json::Value>,
    after_snapshot: serde_json::Value,
    proration_amount: Option<i64>,
    effective_date: OffsetDateTime,
    triggered_by: String,
    created_at: OffsetDateTime,
}

impl ChangeRecordRow {
    fn into_record(self) -> BillingResult<SubscriptionChangeRecord> {
        let change_type = ChangeType::from_str(&self.change_type)
            .map_err(crate::error::BillingError::Invariant)?;
        let triggered_by = TriggeredBy::from_str(&self.triggered_by)
            .map_err(|e| crate::error::BillingError::Invariant(e.to_string()))?;
        Ok(SubscriptionChangeRecord {
            id: self.id,
            subscription_id: self.subscription_id,
            owner_id: self.owner_id,
            change_type,
            before_snapshot: self.before_snapshot,
            after_snapshot: self.after_snapshot,
            proration_amount: self.proration_amount,
            effective_date: self.effective_date,
            triggered_by,
            created_at: self.created_at,
        })
    }
}

/// Writer/reader for the change log.
#[derive(Clone)]
pub struct ChangeRecordLogger {
    pool: PgPool,
}

impl ChangeRecordLogger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Append a record inside the caller's transaction.
    pub async fn append_in(
        &self,
        conn: &mut PgConnection,
        record: NewChangeRecord,
    ) -> BillingResult<Uuid> {
        let id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO subscription_change_records
                (id, subscription_id, owner_id, change_type, before_snapshot,
                 after_snapshot, proration_amount, effective_date, triggered_by, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, NOW())
            "#,
        )
        .bind(id)
        .bind(record.subscription_id)
        .bind(record.owner_id)
        .bind(record.change_type.as_str())
        .bind(&record.before_snapshot)
        .bind(&record.after_snapshot)
        .bind(record.proration_amount)
        .bind(record.effective_date)
        .bind(record.triggered_by.as_str())
        .execute(conn)
        .await?;
        Ok(id)
    }

    /// Full history for a tenant, oldest first.
    pub async fn history_for_owner(
        &self,
        owner_id: Uuid,
    ) -> BillingResult<Vec<SubscriptionChangeRecord>> {
        let rows: Vec<ChangeRecordRow> = sqlx::query_as(
            r#"
            SELECT id, subscription_id, owner_id, change_type, before_snapshot,
                   after_snapshot, proration_amount, effective_date, triggered_by, created_at
            FROM subscription_change_records
            WHERE owner_id = $1
            ORDER BY created_at
            "#,
        )
        .bind(owner_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(ChangeRecordRow::into_record).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn change_type_round_trips() {
        for ct in [
            ChangeType::TrialStarted,
            ChangeType::TrialConversion,
            ChangeType::TrialExpired,
            ChangeType::PlanUpgrade,
            ChangeType::PlanDowngrade,
            ChangeType::SeatUpgrade,
            ChangeType::SeatDowngrade,
            ChangeType::Renewal,
            ChangeType::Suspension,
            ChangeType::Reactivation,
            ChangeType::Cancellation,
            ChangeType::Activation,
        ] {
            assert_eq!(ChangeType::from_str(ct.as_str()), Ok(ct));
        }
    }
}
