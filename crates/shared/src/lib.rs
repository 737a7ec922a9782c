#![cfg_attr(test, allow(clippy::unwrap_used))]

//! Staffly Shared Types
//!
//! Closed enums and small types used by every crate: subscription lifecycle
//! states, plan/billing classifiers, and the feature-gating codes. These are
//! string-backed so they round-trip cleanly through Postgres TEXT columns and
//! JSON payloads.

use serde::{Deserialize, Serialize};

/// Error returned when parsing one of the closed enums from its wire string.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind} value: {value}")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

/// Lifecycle state of a tenant's subscription.
///
/// Exactly these six values are valid; "no subscription yet" is modeled as
/// the absence of a row, never as a status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Trial,
    Active,
    Inactive,
    Suspended,
    Expired,
    Cancelled,
}

impl SubscriptionStatus {
    pub const ALL: [SubscriptionStatus; 6] = [
        SubscriptionStatus::Trial,
        SubscriptionStatus::Active,
        SubscriptionStatus::Inactive,
        SubscriptionStatus::Suspended,
        SubscriptionStatus::Expired,
        SubscriptionStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Trial => "trial",
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::Inactive => "inactive",
            SubscriptionStatus::Suspended => "suspended",
            SubscriptionStatus::Expired => "expired",
            SubscriptionStatus::Cancelled => "cancelled",
        }
    }
}

impl std::str::FromStr for SubscriptionStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "trial" => Ok(SubscriptionStatus::Trial),
            "active" => Ok(SubscriptionStatus::Active),
            "inactive" => Ok(SubscriptionStatus::Inactive),
            "suspended" => Ok(SubscriptionStatus::Suspended),
            "expired" => Ok(SubscriptionStatus::Expired),
            "cancelled" => Ok(SubscriptionStatus::Cancelled),
            other => Err(ParseEnumError {
                kind: "subscription status",
                value: other.to_string(),
            }),
        }
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Plan family. Ordering is the upgrade order (standard < premium < ultra).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanType {
    Standard,
    Premium,
    Ultra,
}

impl PlanType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanType::Standard => "standard",
            PlanType::Premium => "premium",
            PlanType::Ultra => "ultra",
        }
    }

    /// Numeric rank used to classify a plan change as upgrade or downgrade.
    pub fn rank(&self) -> u8 {
        match self {
            PlanType::Standard => 0,
            PlanType::Premium => 1,
            PlanType::Ultra => 2,
        }
    }
}

impl std::str::FromStr for PlanType {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "standard" => Ok(PlanType::Standard),
            "premium" => Ok(PlanType::Premium),
            "ultra" => Ok(PlanType::Ultra),
            other => Err(ParseEnumError {
                kind: "plan type",
                value: other.to_string(),
            }),
        }
    }
}

impl std::fmt::Display for PlanType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Billing cycle length for a paid subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingInterval {
    Monthly,
    Yearly,
}

impl BillingInterval {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingInterval::Monthly => "monthly",
            BillingInterval::Yearly => "yearly",
        }
    }

    pub fn from_is_monthly(is_monthly: bool) -> Self {
        if is_monthly {
            BillingInterval::Monthly
        } else {
            BillingInterval::Yearly
        }
    }
}

impl std::str::FromStr for BillingInterval {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "monthly" => Ok(BillingInterval::Monthly),
            "yearly" => Ok(BillingInterval::Yearly),
            other => Err(ParseEnumError {
                kind: "billing interval",
                value: other.to_string(),
            }),
        }
    }
}

impl std::fmt::Display for BillingInterval {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Feature grants attached to a subscription plan.
///
/// Closed set by design: feature gating compares enum variants, never raw
/// strings, so a typo in a caller is a compile error rather than a silently
/// denied feature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureCode {
    AttendanceTracking,
    WorkSchedules,
    LeaveManagement,
    PayrollExport,
    ShiftScheduling,
    PerformanceReviews,
    AdvancedReports,
    ApiAccess,
    PrioritySupport,
}

impl FeatureCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeatureCode::AttendanceTracking => "attendance_tracking",
            FeatureCode::WorkSchedules => "work_schedules",
            FeatureCode::LeaveManagement => "leave_management",
            FeatureCode::PayrollExport => "payroll_export",
            FeatureCode::ShiftScheduling => "shift_scheduling",
            FeatureCode::PerformanceReviews => "performance_reviews",
            FeatureCode::AdvancedReports => "advanced_reports",
            FeatureCode::ApiAccess => "api_access",
            FeatureCode::PrioritySupport => "priority_support",
        }
    }
}

impl std::str::FromStr for FeatureCode {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "attendance_tracking" => Ok(FeatureCode::AttendanceTracking),
            "work_schedules" => Ok(FeatureCode::WorkSchedules),
            "leave_management" => Ok(FeatureCode::LeaveManagement),
            "payroll_export" => Ok(FeatureCode::PayrollExport),
            "shift_scheduling" => Ok(FeatureCode::ShiftScheduling),
            "performance_reviews" => Ok(FeatureCode::PerformanceReviews),
            "advanced_reports" => Ok(FeatureCode::AdvancedReports),
            "api_access" => Ok(FeatureCode::ApiAccess),
            "priority_support" => Ok(FeatureCode::PrioritySupport),
            other => Err(ParseEnumError {
                kind: "feature code",
                value: other.to_string(),
            }),
        }
    }
}

impl std::fmt::Display for FeatureCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who caused a subscription mutation. Recorded on every change-log row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggeredBy {
    User,
    SystemJob,
    Webhook,
}

impl TriggeredBy {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggeredBy::User => "user",
            TriggeredBy::SystemJob => "system_job",
            TriggeredBy::Webhook => "webhook",
        }
    }
}

impl std::str::FromStr for TriggeredBy {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(TriggeredBy::User),
            "system_job" => Ok(TriggeredBy::SystemJob),
            "webhook" => Ok(TriggeredBy::Webhook),
            other => Err(ParseEnumError {
                kind: "triggered by",
                value: other.to_string(),
            }),
        }
    }
}

impl std::fmt::Display for TriggeredBy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
