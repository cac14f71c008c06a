use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Derived budget health, ordered from best to worst.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum BudgetStatus {
    Healthy,
    Warning,
    Critical,
    Exhausted,
}

crate::str_enum!(BudgetStatus, "budget status", {
    Healthy => "healthy",
    Warning => "warning",
    Critical => "critical",
    Exhausted => "exhausted",
});

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BudgetAllocation {
    pub project_id: String,
    pub monthly_allocation_usd: f64,
    pub spent_usd: f64,
    pub daily_drip_usd: f64,
    /// Unspent part of today's drip. Reset to `daily_drip_usd` each UTC day
    /// and never carried over.
    pub drip_available_usd: f64,
    /// Spend this period that was charged to the drip instead of the
    /// monthly allocation.
    pub drip_spent_usd: f64,
    /// UTC day of the last drip credit.
    pub drip_credited_on: Option<NaiveDate>,
    /// Estimates held by admitted runs that have not settled yet.
    pub reserved_usd: f64,
    /// Estimates held against today's drip.
    pub drip_reserved_usd: f64,
    pub status: BudgetStatus,
    pub period_start: NaiveDate,
    pub updated_at: DateTime<Utc>,
}

impl BudgetAllocation {
    pub fn new(project_id: &str, monthly_allocation_usd: f64, daily_drip_usd: f64) -> Self {
        let now = Utc::now();
        Self {
            project_id: project_id.to_string(),
            monthly_allocation_usd,
            spent_usd: 0.0,
            daily_drip_usd,
            drip_available_usd: 0.0,
            drip_spent_usd: 0.0,
            drip_credited_on: None,
            reserved_usd: 0.0,
            drip_reserved_usd: 0.0,
            status: BudgetStatus::Healthy,
            period_start: now.date_naive(),
            updated_at: now,
        }
    }

    /// What is left of the monthly allocation. Drip-funded spend does not
    /// count against it, so this goes negative only on overspend.
    pub fn remaining_usd(&self) -> f64 {
        self.monthly_allocation_usd - (self.spent_usd - self.drip_spent_usd)
    }

    /// Remaining budget not already promised to admitted runs.
    pub fn available_usd(&self) -> f64 {
        self.remaining_usd() - self.reserved_usd
    }

    /// Today's drip not already promised to admitted runs.
    pub fn drip_open_usd(&self) -> f64 {
        self.drip_available_usd - self.drip_reserved_usd
    }

    /// Charge `amount` to the monthly pool first and the drip for any
    /// overflow. Returns the part charged to the drip.
    pub fn charge(&mut self, amount: f64) -> f64 {
        let from_monthly = amount.min(self.remaining_usd().max(0.0));
        let from_drip = (amount - from_monthly).min(self.drip_available_usd.max(0.0));
        self.spent_usd += amount;
        self.drip_spent_usd += from_drip;
        self.drip_available_usd -= from_drip;
        from_drip
    }
}

/// Allocation plus the figures derived from it at read time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetSnapshot {
    #[serde(flatten)]
    pub allocation: BudgetAllocation,
    pub remaining_usd: f64,
    pub available_usd: f64,
    pub burn_rate_usd_per_day: f64,
    /// `None` when nothing has been spent yet.
    pub runway_days: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostEvent {
    pub id: String,
    pub project_id: String,
    pub run_id: Option<String>,
    pub amount_usd: f64,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_order_follows_severity() {
        assert!(BudgetStatus::Healthy < BudgetStatus::Warning);
        assert!(BudgetStatus::Warning < BudgetStatus::Critical);
        assert!(BudgetStatus::Critical < BudgetStatus::Exhausted);
    }

    #[test]
    fn drip_is_separate_from_remaining() {
        let mut alloc = BudgetAllocation::new("p1", 10.0, 1.0);
        alloc.spent_usd = 15.0;
        alloc.drip_available_usd = 1.0;
        assert!((alloc.remaining_usd() + 5.0).abs() < 1e-9);
        alloc.drip_reserved_usd = 0.25;
        assert!((alloc.drip_open_usd() - 0.75).abs() < 1e-9);
    }

    #[test]
    fn charge_overflows_into_drip() {
        let mut alloc = BudgetAllocation::new("p1", 10.0, 1.0);
        alloc.drip_available_usd = 1.0;
        assert_eq!(alloc.charge(9.5), 0.0);
        let from_drip = alloc.charge(1.0);
        assert!((from_drip - 0.5).abs() < 1e-9);
        assert!(alloc.remaining_usd().abs() < 1e-9);
        assert!((alloc.drip_available_usd - 0.5).abs() < 1e-9);

        // Past both pools the overspend lands on the monthly allocation.
        alloc.charge(2.0);
        assert!(alloc.drip_available_usd.abs() < 1e-9);
        assert!((alloc.remaining_usd() + 1.5).abs() < 1e-9);
        assert!((alloc.spent_usd - 12.5).abs() < 1e-9);
    }
}
