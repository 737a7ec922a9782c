//! Plan catalog
//!
//! Read-only registry of subscription plans, their seat tiers, and feature
//! grants. The catalog is an injected trait so request handlers and tests can
//! run against an in-memory fixture while production reads Postgres. No
//! component other than migrations/seeding ever writes catalog data.

use std::collections::HashMap;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use staffly_shared::{BillingInterval, FeatureCode, PlanType};
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};

/// A subscription plan and its feature grants.
///
/// Plans are immutable once referenced by a live subscription; a pricing or
/// feature revision is a new row with a new id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionPlan {
    pub id: Uuid,
    pub name: String,
    pub plan_type: PlanType,
    /// Ordered as displayed; gating uses [`SubscriptionPlan::includes_feature`].
    pub features: Vec<FeatureCode>,
    pub is_active: bool,
}

impl SubscriptionPlan {
    /// The only feature-gating surface: callers never compare raw strings.
    pub fn includes_feature(&self, code: FeatureCode) -> bool {
        self.features.contains(&code)
    }
}

/// A seat tier of a plan: an employee-count bucket with its prices.
///
/// A count is covered when `min_employees <= count <= max_employees`.
/// For one plan the tiers partition headcounts into non-overlapping,
/// monotonically increasing ranges.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeatPlan {
    pub id: Uuid,
    pub plan_id: Uuid,
    pub name: String,
    pub min_employees: i32,
    pub max_employees: i32,
    /// Minor units (IDR by default, exponent 0).
    pub price_monthly: i64,
    pub price_yearly: i64,
    pub is_active: bool,
}

impl SeatPlan {
    pub fn covers(&self, count: i32) -> bool {
        self.min_employees <= count && count <= self.max_employees
    }

    pub fn price_for(&self, interval: BillingInterval) -> i64 {
        match interval {
            BillingInterval::Monthly => self.price_monthly,
            BillingInterval::Yearly => self.price_yearly,
        }
    }
}

/// Read-only plan lookup seam.
#[async_trait]
pub trait PlanCatalog: Send + Sync {
    async fn plan(&self, id: Uuid) -> BillingResult<SubscriptionPlan>;

    async fn seat_plan(&self, id: Uuid) -> BillingResult<SeatPlan>;

    /// Find the tier of `plan_id` covering `count` employees.
    ///
    /// Fails with `NoMatchingTier` when the count exceeds every tier; callers
    /// surface that as "no plan covers this headcount", never clamp.
    async fn seat_plan_for_headcount(&self, plan_id: Uuid, count: i32) -> BillingResult<SeatPlan>;

    async fn plans(&self) -> BillingResult<Vec<SubscriptionPlan>>;
}

/// Validate that a plan's seat tiers partition headcounts.
///
/// `tiers` must be non-empty, sorted non-decreasing by `min_employees`, each
/// range non-empty, and each tier must start exactly one past the previous
/// tier's maximum.
pub fn validate_seat_tiers(plan_id: Uuid, tiers: &[SeatPlan]) -> BillingResult<()> {
    if tiers.is_empty() {
        return Err(BillingError::Invariant(format!(
            "plan {plan_id} has no seat tiers"
        )));
    }
    let mut previous_max: Option<i32> = None;
    for tier in tiers {
        if tier.min_employees > tier.max_employees {
            return Err(BillingError::Invariant(format!(
                "seat tier {} of plan {plan_id} has an empty range [{}, {}]",
                tier.id, tier.min_employees, tier.max_employees
            )));
        }
        if let Some(prev) = previous_max {
            if tier.min_employees != prev + 1 {
                return Err(BillingError::Invariant(format!(
                    "seat tiers of plan {plan_id} do not partition headcounts: \
                     tier {} starts at {} after a previous maximum of {}",
                    tier.id, tier.min_employees, prev
                )));
            }
        }
        previous_max = Some(tier.max_employees);
    }
    Ok(())
}

// =============================================================================
// Postgres implementation
// =============================================================================

#[derive(Debug, sqlx::FromRow)]
struct PlanRow {
    id: Uuid,
    name: String,
    plan_type: String,
    features: Vec<String>,
    is_active: bool,
}

impl PlanRow {
    fn into_plan(self) -> BillingResult<SubscriptionPlan> {
        let plan_type = PlanType::from_str(&self.plan_type)
            .map_err(|e| BillingError::Invariant(e.to_string()))?;
        let features = self
            .features
            .iter()
            .map(|code| FeatureCode::from_str(code))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| BillingError::Invariant(e.to_string()))?;
        Ok(SubscriptionPlan {
            id: self.id,
            name: self.name,
            plan_type,
            features,
            is_active: self.is_active,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct SeatPlanRow {
    id: Uuid,
    plan_id: Uuid,
    name: String,
    min_employees: i32,
    max_employees: i32,
    price_monthly: i64,
    price_yearly: i64,
    is_active: bool,
}

impl From<SeatPlanRow> for SeatPlan {
    fn from(row: SeatPlanRow) -> Self {
        SeatPlan {
            id: row.id,
            plan_id: row.plan_id,
            name: row.name,
            min_employees: row.min_employees,
            max_employees: row.max_employees,
            price_monthly: row.price_monthly,
            price_yearly: row.price_yearly,
            is_active: row.is_active,
        }
    }
}

/// Postgres-backed catalog.
#[derive(Clone)]
pub struct PgPlanCatalog {
    pool: PgPool,
}

impl PgPlanCatalog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PlanCatalog for PgPlanCatalog {
    async fn plan(&self, id: Uuid) -> BillingResult<SubscriptionPlan> {
        let row: Option<PlanRow> = sqlx::query_as(
            "SELECT id, name, plan_type, features, is_active
             FROM subscription_plans WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.ok_or(BillingError::PlanNotFound(id))?.into_plan()
    }

    async fn seat_plan(&self, id: Uuid) -> BillingResult<SeatPlan> {
        let row: Option<SeatPlanRow> = sqlx::query_as(
            "SELECT id, plan_id, name, min_employees, max_employees,
                    price_monthly, price_yearly, is_active
             FROM seat_plans WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(SeatPlan::from)
            .ok_or(BillingError::SeatPlanNotFound(id))
    }

    async fn seat_plan_for_headcount(&self, plan_id: Uuid, count: i32) -> BillingResult<SeatPlan> {
        let row: Option<SeatPlanRow> = sqlx::query_as(
            "SELECT id, plan_id, name, min_employees, max_employees,
                    price_monthly, price_yearly, is_active
             FROM seat_plans
             WHERE plan_id = $1 AND is_active
               AND min_employees <= $2 AND max_employees >= $2
             ORDER BY min_employees
             LIMIT 1",
        )
        .bind(plan_id)
        .bind(count)
        .fetch_optional(&self.pool)
        .await?;

        row.map(SeatPlan::from)
            .ok_or(BillingError::NoMatchingTier { plan_id, count })
    }

    async fn plans(&self) -> BillingResult<Vec<SubscriptionPlan>> {
        let rows: Vec<PlanRow> = sqlx::query_as(
            "SELECT id, name, plan_type, features, is_active
             FROM subscription_plans WHERE is_active ORDER BY plan_type, name",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(PlanRow::into_plan).collect()
    }
}

// =============================================================================
// In-memory implementation (tests, seeding dry-runs)
// =============================================================================

/// In-memory catalog fixture. The constructor enforces the seat-tier
/// partition invariant so a broken fixture fails loudly at setup.
#[derive(Clone, Default)]
pub struct StaticPlanCatalog {
    plans: HashMap<Uuid, SubscriptionPlan>,
    seat_plans: HashMap<Uuid, SeatPlan>,
}

impl StaticPlanCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_plan(
        mut self,
        plan: SubscriptionPlan,
        tiers: Vec<SeatPlan>,
    ) -> BillingResult<Self> {
        validate_seat_tiers(plan.id, &tiers)?;
        for tier in tiers {
            self.seat_plans.insert(tier.id, tier);
        }
        self.plans.insert(plan.id, plan);
        Ok(self)
    }
}

#[async_trait]
impl PlanCatalog for StaticPlanCatalog {
    async fn plan(&self, id: Uuid) -> BillingResult<SubscriptionPlan> {
        self.plans
            .get(&id)
            .cloned()
            .ok_or(BillingError::PlanNotFound(id))
    }

    async fn seat_plan(&self, id: Uuid) -> BillingResult<SeatPlan> {
        self.seat_plans
            .get(&id)
            .cloned()
            .ok_or(BillingError::SeatPlanNotFound(id))
    }

    async fn seat_plan_for_headcount(&self, plan_id: Uuid, count: i32) -> BillingResult<SeatPlan> {
        self.seat_plans
            .values()
            .filter(|tier| tier.plan_id == plan_id && tier.is_active)
            .find(|tier| tier.covers(count))
            .cloned()
            .ok_or(BillingError::NoMatchingTier { plan_id, count })
    }

    async fn plans(&self) -> BillingResult<Vec<SubscriptionPlan>> {
        let mut plans: Vec<_> = self.plans.values().cloned().collect();
        plans.sort_by_key(|p| (p.plan_type.rank(), p.name.clone()));
        Ok(plans)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tier(plan_id: Uuid, min: i32, max: i32, monthly: i64) -> SeatPlan {
        SeatPlan {
            id: Uuid::new_v4(),
            plan_id,
            name: format!("{min}-{max} employees"),
            min_employees: min,
            max_employees: max,
            price_monthly: monthly,
            price_yearly: monthly * 10,
            is_active: true,
        }
    }

    fn premium_plan() -> SubscriptionPlan {
        SubscriptionPlan {
            id: Uuid::new_v4(),
            name: "Premium".to_string(),
            plan_type: PlanType::Premium,
            features: vec![
                FeatureCode::AttendanceTracking,
                FeatureCode::LeaveManagement,
                FeatureCode::PayrollExport,
            ],
            is_active: true,
        }
    }

    #[tokio::test]
    async fn headcount_resolves_to_covering_tier() {
        let plan = premium_plan();
        let tiers = vec![
            tier(plan.id, 1, 25, 290_000),
            tier(plan.id, 26, 50, 490_000),
            tier(plan.id, 51, 100, 790_000),
        ];
        let catalog = StaticPlanCatalog::new()
            .with_plan(plan.clone(), tiers)
            .unwrap();

        let found = catalog.seat_plan_for_headcount(plan.id, 26).await.unwrap();
        assert_eq!(found.min_employees, 26);
        assert_eq!(found.price_monthly, 490_000);
    }

    #[tokio::test]
    async fn headcount_beyond_every_tier_is_rejected_not_clamped() {
        let plan = premium_plan();
        let tiers = vec![tier(plan.id, 1, 25, 290_000), tier(plan.id, 26, 50, 490_000)];
        let catalog = StaticPlanCatalog::new()
            .with_plan(plan.clone(), tiers)
            .unwrap();

        let err = catalog
            .seat_plan_for_headcount(plan.id, 51)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            BillingError::NoMatchingTier { count: 51, .. }
        ));
    }

    #[test]
    fn overlapping_tiers_fail_validation() {
        let plan_id = Uuid::new_v4();
        let tiers = vec![tier(plan_id, 1, 25, 290_000), tier(plan_id, 20, 50, 490_000)];
        assert!(validate_seat_tiers(plan_id, &tiers).is_err());
    }

    #[test]
    fn gapped_tiers_fail_validation() {
        let plan_id = Uuid::new_v4();
        let tiers = vec![tier(plan_id, 1, 25, 290_000), tier(plan_id, 30, 50, 490_000)];
        assert!(validate_seat_tiers(plan_id, &tiers).is_err());
    }

    #[test]
    fn contiguous_tiers_pass_validation() {
        let plan_id = Uuid::new_v4();
        let tiers = vec![
            tier(plan_id, 1, 25, 290_000),
            tier(plan_id, 26, 50, 490_000),
            tier(plan_id, 51, 100, 790_000),
        ];
        assert!(validate_seat_tiers(plan_id, &tiers).is_ok());
    }

    #[test]
    fn feature_gating_is_enum_based() {
        let plan = premium_plan();
        assert!(plan.includes_feature(FeatureCode::PayrollExport));
        assert!(!plan.includes_feature(FeatureCode::ApiAccess));
    }
}
