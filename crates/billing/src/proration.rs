//! Mid-cycle proration
//!
//! Pure arithmetic: no storage, no gateway, no clock access beyond the
//! `as_of` argument. Amounts are currency minor units; the fraction math runs
//! in i128 so a yearly Ultra price times a second-granularity cycle cannot
//! overflow.

use serde::Serialize;
use time::OffsetDateTime;

use crate::catalog::SeatPlan;
use staffly_shared::BillingInterval;

/// The paid term a tenant is currently inside.
#[derive(Debug, Clone)]
pub struct CurrentTerm {
    pub seat_plan: SeatPlan,
    pub interval: BillingInterval,
    pub cycle_start: OffsetDateTime,
    pub cycle_end: OffsetDateTime,
}

/// The term the tenant wants to move to.
#[derive(Debug, Clone)]
pub struct TargetTerm {
    pub seat_plan: SeatPlan,
    pub interval: BillingInterval,
}

/// Outcome of a proration computation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Proration {
    /// Net amount due in minor units. Negative or zero means the change is
    /// applied immediately with no payment; the engine never pays out cash.
    pub amount_due: i64,
    pub is_upgrade: bool,
}

impl Proration {
    pub fn payment_required(&self) -> bool {
        self.amount_due > 0
    }
}

/// Compute the net charge for changing plan/seat/interval mid-cycle.
///
/// `remaining_fraction = (cycle_end - as_of) / (cycle_end - cycle_start)`,
/// clamped to [0, 1]; a degenerate cycle (`cycle_start >= cycle_end`) counts
/// as a full remaining period. The unused fraction of the current price is
/// credited against the same fraction of the target price and the net is
/// rounded half-up (away from zero) once, at minor-unit precision.
pub fn compute_proration(
    current: &CurrentTerm,
    target: &TargetTerm,
    as_of: OffsetDateTime,
) -> Proration {
    let current_price = current.seat_plan.price_for(current.interval);
    let target_price = target.seat_plan.price_for(target.interval);

    let (remaining, total) = remaining_fraction(current.cycle_start, current.cycle_end, as_of);

    // refund = current_price * f, new_charge = target_price * f; the net is
    // (target - current) * f computed exactly, then rounded once.
    let net = (target_price as i128 - current_price as i128) * remaining;
    let amount_due = div_round_half_up(net, total);

    Proration {
        amount_due,
        is_upgrade: amount_due > 0,
    }
}

/// Remaining/total cycle seconds, clamped so the fraction lands in [0, 1].
fn remaining_fraction(
    cycle_start: OffsetDateTime,
    cycle_end: OffsetDateTime,
    as_of: OffsetDateTime,
) -> (i128, i128) {
    let total = (cycle_end - cycle_start).whole_seconds() as i128;
    if total <= 0 {
        // Degenerate cycle: treat the whole period as remaining.
        return (1, 1);
    }
    let remaining = (cycle_end - as_of).whole_seconds() as i128;
    (remaining.clamp(0, total), total)
}

/// Integer division rounding halves away from zero. `den` must be positive.
fn div_round_half_up(num: i128, den: i128) -> i64 {
    debug_assert!(den > 0);
    let rounded = if num >= 0 {
        (2 * num + den) / (2 * den)
    } else {
        -((2 * -num + den) / (2 * den))
    };
    rounded as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;
    use uuid::Uuid;

    fn seat(monthly: i64, yearly: i64) -> SeatPlan {
        SeatPlan {
            id: Uuid::new_v4(),
            plan_id: Uuid::new_v4(),
            name: "tier".to_string(),
            min_employees: 1,
            max_employees: 25,
            price_monthly: monthly,
            price_yearly: yearly,
            is_active: true,
        }
    }

    fn thirty_day_term(seat_plan: SeatPlan) -> CurrentTerm {
        CurrentTerm {
            seat_plan,
            interval: BillingInterval::Monthly,
            cycle_start: datetime!(2024-03-01 00:00:00 UTC),
            cycle_end: datetime!(2024-03-31 00:00:00 UTC),
        }
    }

    #[test]
    fn identity_change_is_always_zero() {
        let plan = seat(290_000, 2_900_000);
        let current = thirty_day_term(plan.clone());
        let target = TargetTerm {
            seat_plan: plan,
            interval: BillingInterval::Monthly,
        };

        for as_of in [
            datetime!(2024-03-01 00:00:00 UTC),
            datetime!(2024-03-16 12:30:00 UTC),
            datetime!(2024-03-31 00:00:00 UTC),
            datetime!(2024-04-15 00:00:00 UTC),
        ] {
            let p = compute_proration(&current, &target, as_of);
            assert_eq!(p.amount_due, 0);
            assert!(!p.is_upgrade);
        }
    }

    #[test]
    fn premium_seat_upgrade_with_ten_days_left() {
        // Premium monthly 290,000 -> 490,000 with 10 of 30 days remaining:
        // (490000 - 290000) * 10/30 = 66666.67, half-up to 66,667.
        let current = thirty_day_term(seat(290_000, 2_900_000));
        let target = TargetTerm {
            seat_plan: seat(490_000, 4_900_000),
            interval: BillingInterval::Monthly,
        };

        let p = compute_proration(&current, &target, datetime!(2024-03-21 00:00:00 UTC));
        assert_eq!(p.amount_due, 66_667);
        assert!(p.is_upgrade);
        assert!(p.payment_required());
    }

    #[test]
    fn downgrade_never_pays_out() {
        let current = thirty_day_term(seat(490_000, 4_900_000));
        let target = TargetTerm {
            seat_plan: seat(290_000, 2_900_000),
            interval: BillingInterval::Monthly,
        };

        let p = compute_proration(&current, &target, datetime!(2024-03-21 00:00:00 UTC));
        assert_eq!(p.amount_due, -66_667);
        assert!(!p.is_upgrade);
        assert!(!p.payment_required());
    }

    #[test]
    fn as_of_before_cycle_start_clamps_to_full_period() {
        let current = thirty_day_term(seat(100_000, 1_000_000));
        let target = TargetTerm {
            seat_plan: seat(200_000, 2_000_000),
            interval: BillingInterval::Monthly,
        };

        let p = compute_proration(&current, &target, datetime!(2024-02-01 00:00:00 UTC));
        assert_eq!(p.amount_due, 100_000);
    }

    #[test]
    fn as_of_after_cycle_end_clamps_to_zero() {
        let current = thirty_day_term(seat(100_000, 1_000_000));
        let target = TargetTerm {
            seat_plan: seat(200_000, 2_000_000),
            interval: BillingInterval::Monthly,
        };

        let p = compute_proration(&current, &target, datetime!(2024-05-01 00:00:00 UTC));
        assert_eq!(p.amount_due, 0);
        assert!(!p.payment_required());
    }

    #[test]
    fn degenerate_cycle_counts_as_fully_remaining() {
        let plan = seat(100_000, 1_000_000);
        let current = CurrentTerm {
            seat_plan: plan,
            interval: BillingInterval::Monthly,
            cycle_start: datetime!(2024-03-01 00:00:00 UTC),
            cycle_end: datetime!(2024-03-01 00:00:00 UTC),
        };
        let target = TargetTerm {
            seat_plan: seat(250_000, 2_500_000),
            interval: BillingInterval::Monthly,
        };

        let p = compute_proration(&current, &target, datetime!(2024-03-01 00:00:00 UTC));
        assert_eq!(p.amount_due, 150_000);
    }

    #[test]
    fn interval_switch_uses_each_terms_own_price() {
        // Monthly 290,000 -> yearly 2,900,000 halfway through the cycle:
        // (2900000 - 290000) * 15/30 = 1,305,000.
        let current = thirty_day_term(seat(290_000, 0));
        let target = TargetTerm {
            seat_plan: seat(0, 2_900_000),
            interval: BillingInterval::Yearly,
        };

        let p = compute_proration(&current, &target, datetime!(2024-03-16 00:00:00 UTC));
        assert_eq!(p.amount_due, 1_305_000);
    }

    #[test]
    fn half_minor_unit_rounds_away_from_zero() {
        assert_eq!(div_round_half_up(3, 2), 2); // 1.5 -> 2
        assert_eq!(div_round_half_up(-3, 2), -2); // -1.5 -> -2
        assert_eq!(div_round_half_up(1, 3), 0); // 0.33 -> 0
        assert_eq!(div_round_half_up(2, 3), 1); // 0.67 -> 1
    }
}
