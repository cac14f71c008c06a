//! Pure budget status derivation.

use pcc_common::{BudgetAllocation, BudgetStatus};

#[derive(Debug, Clone, PartialEq)]
pub struct BudgetThresholds {
    /// Remaining share of the period's funds below which status is `warning`.
    pub warning_fraction: f64,
    pub critical_fraction: f64,
    /// Runway (days at the current burn rate) below which status is `warning`.
    pub warning_runway_days: f64,
    pub critical_runway_days: f64,
}

impl Default for BudgetThresholds {
    fn default() -> Self {
        Self {
            warning_fraction: 0.5,
            critical_fraction: 0.2,
            warning_runway_days: 14.0,
            critical_runway_days: 5.0,
        }
    }
}

/// Spend per day. Uses the trailing seven days when there is a week of
/// history, otherwise the month-to-date average.
pub fn burn_rate(
    trailing_7d_usd: f64,
    has_full_week: bool,
    spent_this_period_usd: f64,
    days_into_period: f64,
) -> f64 {
    if has_full_week {
        trailing_7d_usd / 7.0
    } else {
        spent_this_period_usd / days_into_period.max(1.0)
    }
}

pub fn runway_days(remaining_usd: f64, burn_rate: f64) -> Option<f64> {
    if burn_rate > 0.0 {
        Some((remaining_usd / burn_rate).max(0.0))
    } else {
        None
    }
}

pub fn derive_status(
    alloc: &BudgetAllocation,
    burn_rate: f64,
    thresholds: &BudgetThresholds,
) -> BudgetStatus {
    let remaining = alloc.remaining_usd();
    let funded = alloc.monthly_allocation_usd;
    if remaining <= f64::EPSILON || funded <= 0.0 {
        return BudgetStatus::Exhausted;
    }
    let fraction = remaining / funded;
    let runway = runway_days(remaining, burn_rate);
    let below = |days: f64| runway.is_some_and(|r| r < days);

    if fraction < thresholds.critical_fraction || below(thresholds.critical_runway_days) {
        BudgetStatus::Critical
    } else if fraction < thresholds.warning_fraction || below(thresholds.warning_runway_days) {
        BudgetStatus::Warning
    } else {
        BudgetStatus::Healthy
    }
}

/// Status after spending. Spend never improves the status within a period,
/// so replaying events cannot make it flap.
pub fn after_spend(previous: BudgetStatus, derived: BudgetStatus) -> BudgetStatus {
    previous.max(derived)
}
