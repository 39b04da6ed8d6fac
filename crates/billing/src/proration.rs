//! Proration for mid-period plan and cycle changes
//!
//! Plans are compared by daily rate (cycle price / cycle days), not list
//! price, since a yearly plan of a lower tier can cost more up front than a
//! monthly plan of a higher tier.
//!
//! Pricing policy:
//! - upgrade: immediate, charge `(new_rate - current_rate) * days_remaining`
//!   rounded to the won, waived below the minimum charge
//! - downgrade: deferred to the end of the paid period, never refunded
//! - monthly → yearly: immediate, charge the yearly price minus the unused
//!   value of the current period, period restarts
//! - yearly → monthly: deferred like a downgrade

use inkwell_shared::{BillingCycle, Plan};
use serde::Serialize;
use time::OffsetDateTime;

use crate::models::days_until;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    Same,
    Upgrade,
    Downgrade,
    CycleChange,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProrationResult {
    pub change_type: ChangeType,
    pub prorated_amount: i64,
    pub effective_date: OffsetDateTime,
    pub requires_payment: bool,
    /// Whether the change is applied now (as opposed to at `effective_date` = period end)
    pub immediate: bool,
    pub days_remaining: i64,
    pub current_daily_rate: f64,
    pub new_daily_rate: f64,
}

/// Compute the charge and timing for moving from one plan/cycle to another.
/// An immediate change is charged only when the amount exceeds `minimum_charge`.
pub fn calculate_proration(
    current_plan: &Plan,
    current_cycle: BillingCycle,
    new_plan: &Plan,
    new_cycle: BillingCycle,
    period_end: OffsetDateTime,
    now: OffsetDateTime,
    minimum_charge: i64,
) -> ProrationResult {
    let days_remaining = days_until(period_end, now);
    let current_daily_rate = current_plan.daily_rate(current_cycle);
    let new_daily_rate = new_plan.daily_rate(new_cycle);

    let deferred = |change_type| ProrationResult {
        change_type,
        prorated_amount: 0,
        effective_date: period_end,
        requires_payment: false,
        immediate: false,
        days_remaining,
        current_daily_rate,
        new_daily_rate,
    };
    let immediate = |change_type, amount: i64| ProrationResult {
        change_type,
        prorated_amount: amount,
        effective_date: now,
        requires_payment: amount > minimum_charge,
        immediate: true,
        days_remaining,
        current_daily_rate,
        new_daily_rate,
    };

    if current_plan.id == new_plan.id {
        if current_cycle == new_cycle {
            return ProrationResult {
                immediate: false,
                effective_date: now,
                ..immediate(ChangeType::Same, 0)
            };
        }
        return match new_cycle {
            BillingCycle::Yearly => {
                let unused = (current_daily_rate * days_remaining as f64).round() as i64;
                let amount = (new_plan.price(new_cycle) - unused).max(0);
                immediate(ChangeType::CycleChange, amount)
            }
            BillingCycle::Monthly => deferred(ChangeType::CycleChange),
        };
    }

    if new_daily_rate > current_daily_rate {
        let amount = ((new_daily_rate - current_daily_rate) * days_remaining as f64).round() as i64;
        immediate(ChangeType::Upgrade, amount)
    } else {
        deferred(ChangeType::Downgrade)
    }
}
