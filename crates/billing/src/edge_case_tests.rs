// Test file - these are expected patterns in test code
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

//! Edge Case Tests for the Subscription Lifecycle
//!
//! Tests critical boundary conditions spanning modules:
//! - Seat tier resolution at tier boundaries
//! - Proration at cycle boundaries and rounding edges
//! - Gateway failure behavior through the mock
//! - State machine terminal-state behavior

#[cfg(test)]
mod seat_tier_boundary_tests {
    use crate::catalog::{PlanCatalog, SeatPlan, StaticPlanCatalog, SubscriptionPlan};
    use crate::error::BillingError;
    use staffly_shared::{FeatureCode, PlanType};
    use uuid::Uuid;

    fn premium_catalog() -> (StaticPlanCatalog, Uuid) {
        let plan_id = Uuid::new_v4();
        let plan = SubscriptionPlan {
            id: plan_id,
            name: "Premium".to_string(),
            plan_type: PlanType::Premium,
            features: vec![FeatureCode::AttendanceTracking, FeatureCode::LeaveManagement],
            is_active: true,
        };
        let tiers = vec![
            tier(plan_id, 1, 25, 290_000),
            tier(plan_id, 26, 50, 490_000),
            tier(plan_id, 51, 100, 790_000),
        ];
        let catalog = StaticPlanCatalog::new().with_plan(plan, tiers).unwrap();
        (catalog, plan_id)
    }

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

    // =========================================================================
    // Headcount exactly at a tier's max maps to that tier, not the next
    // =========================================================================
    #[tokio::test]
    async fn headcount_at_tier_max_stays_in_tier() {
        let (catalog, plan_id) = premium_catalog();

        let at_max = catalog.seat_plan_for_headcount(plan_id, 25).await.unwrap();
        assert_eq!(at_max.max_employees, 25);

        let over_max = catalog.seat_plan_for_headcount(plan_id, 26).await.unwrap();
        assert_eq!(over_max.max_employees, 50);
    }

    // =========================================================================
    // Headcount past the largest tier is an error, never a silent clamp
    // =========================================================================
    #[tokio::test]
    async fn headcount_past_largest_tier_fails() {
        let (catalog, plan_id) = premium_catalog();

        let result = catalog.seat_plan_for_headcount(plan_id, 101).await;
        assert!(matches!(
            result,
            Err(BillingError::NoMatchingTier { count: 101, .. })
        ));
    }

    // =========================================================================
    // Headcount of 1 resolves the smallest tier
    // =========================================================================
    #[tokio::test]
    async fn single_employee_resolves_smallest_tier() {
        let (catalog, plan_id) = premium_catalog();

        let smallest = catalog.seat_plan_for_headcount(plan_id, 1).await.unwrap();
        assert_eq!(smallest.min_employees, 1);
        assert_eq!(smallest.price_monthly, 290_000);
    }
}

#[cfg(test)]
mod proration_boundary_tests {
    use crate::catalog::SeatPlan;
    use crate::proration::{compute_proration, CurrentTerm, TargetTerm};
    use staffly_shared::BillingInterval;
    use time::macros::datetime;
    use uuid::Uuid;

    fn seat(monthly: i64) -> SeatPlan {
        SeatPlan {
            id: Uuid::new_v4(),
            plan_id: Uuid::new_v4(),
            name: "fixture".to_string(),
            min_employees: 1,
            max_employees: 50,
            price_monthly: monthly,
            price_yearly: monthly * 10,
            is_active: true,
        }
    }

    // =========================================================================
    // A change at the exact cycle start owes the full price difference
    // =========================================================================
    #[test]
    fn change_at_cycle_start_owes_full_difference() {
        let current = CurrentTerm {
            seat_plan: seat(290_000),
            interval: BillingInterval::Monthly,
            cycle_start: datetime!(2026-06-01 00:00 UTC),
            cycle_end: datetime!(2026-07-01 00:00 UTC),
        };
        let target = TargetTerm {
            seat_plan: seat(490_000),
            interval: BillingInterval::Monthly,
        };

        let p = compute_proration(&current, &target, datetime!(2026-06-01 00:00 UTC));
        assert_eq!(p.amount_due, 200_000);
        assert!(p.is_upgrade);
    }

    // =========================================================================
    // A change at the exact cycle end owes nothing
    // =========================================================================
    #[test]
    fn change_at_cycle_end_owes_nothing() {
        let current = CurrentTerm {
            seat_plan: seat(290_000),
            interval: BillingInterval::Monthly,
            cycle_start: datetime!(2026-06-01 00:00 UTC),
            cycle_end: datetime!(2026-07-01 00:00 UTC),
        };
        let target = TargetTerm {
            seat_plan: seat(490_000),
            interval: BillingInterval::Monthly,
        };

        let p = compute_proration(&current, &target, datetime!(2026-07-01 00:00 UTC));
        assert_eq!(p.amount_due, 0);
        assert!(!p.payment_required());
    }

    // =========================================================================
    // Monthly to yearly mid-cycle compares the yearly price against the
    // unused monthly remainder
    // =========================================================================
    #[test]
    fn interval_switch_prices_against_yearly() {
        let current = CurrentTerm {
            seat_plan: seat(290_000),
            interval: BillingInterval::Monthly,
            cycle_start: datetime!(2026-06-01 00:00 UTC),
            cycle_end: datetime!(2026-07-01 00:00 UTC),
        };
        let target = TargetTerm {
            seat_plan: seat(290_000),
            interval: BillingInterval::Yearly,
        };

        // Half the month remains: (2_900_000 - 290_000) * 15/30
        let p = compute_proration(&current, &target, datetime!(2026-06-16 00:00 UTC));
        assert_eq!(p.amount_due, 1_305_000);
        assert!(p.is_upgrade);
    }
}

#[cfg(test)]
mod gateway_failure_tests {
    use crate::gateway::{
        ChargeRequest, CreateInvoiceRequest, MockPaymentGateway, PaymentGateway, PaymentStatus,
    };
    use time::{Duration, OffsetDateTime};
    use uuid::Uuid;

    // =========================================================================
    // Invoice creation failure propagates, leaving no recorded invoice
    // =========================================================================
    #[tokio::test]
    async fn failed_invoice_creation_records_nothing() {
        let gateway = MockPaymentGateway::new();
        gateway.fail_invoice_creation();

        let result = gateway
            .create_invoice(CreateInvoiceRequest {
                external_id: Uuid::new_v4(),
                amount: 490_000,
                currency: "IDR".to_string(),
                description: "Premium / 26-50 employees".to_string(),
                expires_at: OffsetDateTime::now_utc() + Duration::hours(24),
            })
            .await;

        assert!(result.is_err());
        assert_eq!(gateway.created_invoice_count(), 0);
    }

    // =========================================================================
    // A declined charge comes back as a failed outcome, not a silent success
    // =========================================================================
    #[tokio::test]
    async fn declined_charge_reports_failed_status() {
        let gateway = MockPaymentGateway::new();
        gateway.fail_charges();

        let outcome = gateway
            .charge(ChargeRequest {
                subscription_id: Uuid::new_v4(),
                amount: 290_000,
                currency: "IDR".to_string(),
                description: "Renewal".to_string(),
            })
            .await
            .unwrap();

        assert_eq!(outcome.status, PaymentStatus::Failed);
        assert_eq!(gateway.charge_count(), 1);
    }

    // =========================================================================
    // Overriding an invoice's status is what polling observes
    // =========================================================================
    #[tokio::test]
    async fn invoice_status_override_is_observed() {
        let gateway = MockPaymentGateway::new();
        let invoice = gateway
            .create_invoice(CreateInvoiceRequest {
                external_id: Uuid::new_v4(),
                amount: 290_000,
                currency: "IDR".to_string(),
                description: "Standard / 1-25 employees".to_string(),
                expires_at: OffsetDateTime::now_utc() + Duration::hours(24),
            })
            .await
            .unwrap();

        assert_eq!(
            gateway.invoice_status(&invoice.id).await.unwrap(),
            PaymentStatus::Pending
        );

        gateway.set_invoice_status(&invoice.id, PaymentStatus::Paid);
        assert_eq!(
            gateway.invoice_status(&invoice.id).await.unwrap(),
            PaymentStatus::Paid
        );
    }
}

#[cfg(test)]
mod terminal_state_tests {
    use crate::error::BillingError;
    use crate::subscriptions::{next_status, SubscriptionEvent};
    use staffly_shared::SubscriptionStatus;
    use uuid::Uuid;

    // =========================================================================
    // Cancelled and expired tenants cannot be mutated except through a new
    // checkout
    // =========================================================================
    #[test]
    fn terminal_states_only_accept_new_checkout() {
        for terminal in [SubscriptionStatus::Cancelled, SubscriptionStatus::Expired] {
            for event in [
                SubscriptionEvent::Cancel,
                SubscriptionEvent::Expire,
                SubscriptionEvent::RenewalFailure,
                SubscriptionEvent::PaymentResolved,
            ] {
                let result = next_status(Some(terminal), &event);
                assert!(
                    matches!(result, Err(BillingError::InvalidTransition { .. })),
                    "{terminal:?} should reject {event:?}"
                );
            }

            let revive = SubscriptionEvent::NewCheckoutCompleted {
                plan_id: Uuid::new_v4(),
                seat_plan_id: Uuid::new_v4(),
                max_employees: 25,
                interval: staffly_shared::BillingInterval::Monthly,
                end_date: time::OffsetDateTime::now_utc(),
            };
            assert_eq!(
                next_status(Some(terminal), &revive).unwrap(),
                SubscriptionStatus::Active
            );
        }
    }

    // =========================================================================
    // A suspended tenant resumes only through payment resolution
    // =========================================================================
    #[test]
    fn suspension_resolves_only_by_payment() {
        assert_eq!(
            next_status(
                Some(SubscriptionStatus::Suspended),
                &SubscriptionEvent::PaymentResolved
            )
            .unwrap(),
            SubscriptionStatus::Active
        );
        assert!(next_status(
            Some(SubscriptionStatus::Suspended),
            &SubscriptionEvent::Renew {
                new_end_date: time::OffsetDateTime::now_utc()
            }
        )
        .is_err());
        assert!(next_status(
            Some(SubscriptionStatus::Suspended),
            &SubscriptionEvent::Cancel
        )
        .is_err());
    }
}
