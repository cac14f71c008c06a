use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, params};

use pcc_common::{BudgetAllocation, CostEvent};

use super::{PccDb, enum_col};

const BUDGET_COLUMNS: &str = "project_id, monthly_allocation_usd, spent_usd, daily_drip_usd, \
     drip_available_usd, drip_spent_usd, drip_credited_on, reserved_usd, drip_reserved_usd, \
     status, period_start, updated_at";

fn map_budget(row: &rusqlite::Row<'_>) -> rusqlite::Result<BudgetAllocation> {
    Ok(BudgetAllocation {
        project_id: row.get(0)?,
        monthly_allocation_usd: row.get(1)?,
        spent_usd: row.get(2)?,
        daily_drip_usd: row.get(3)?,
        drip_available_usd: row.get(4)?,
        drip_spent_usd: row.get(5)?,
        drip_credited_on: row.get(6)?,
        reserved_usd: row.get(7)?,
        drip_reserved_usd: row.get(8)?,
        status: enum_col(row, 9)?,
        period_start: row.get(10)?,
        updated_at: row.get(11)?,
    })
}

impl PccDb {
    pub fn get_budget(&self, project_id: &str) -> Result<Option<BudgetAllocation>> {
        self.conn
            .query_row(
                &format!("SELECT {BUDGET_COLUMNS} FROM budgets WHERE project_id = ?1"),
                params![project_id],
                map_budget,
            )
            .optional()
            .context("Failed to query budget")
    }

    pub fn list_budgets(&self) -> Result<Vec<BudgetAllocation>> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT {BUDGET_COLUMNS} FROM budgets ORDER BY project_id"))
            .context("Failed to prepare list_budgets")?;
        let rows = stmt.query_map([], map_budget).context("Failed to query budgets")?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to read budget row")
    }

    pub fn save_budget(&self, alloc: &BudgetAllocation) -> Result<()> {
        self.conn
            .execute(
                &format!(
                    "INSERT INTO budgets ({BUDGET_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
                     ON CONFLICT(project_id) DO UPDATE SET
                        monthly_allocation_usd = excluded.monthly_allocation_usd,
                        spent_usd = excluded.spent_usd,
                        daily_drip_usd = excluded.daily_drip_usd,
                        drip_available_usd = excluded.drip_available_usd,
                        drip_spent_usd = excluded.drip_spent_usd,
                        drip_credited_on = excluded.drip_credited_on,
                        reserved_usd = excluded.reserved_usd,
                        drip_reserved_usd = excluded.drip_reserved_usd,
                        status = excluded.status,
                        period_start = excluded.period_start,
                        updated_at = excluded.updated_at"
                ),
                params![
                    alloc.project_id,
                    alloc.monthly_allocation_usd,
                    alloc.spent_usd,
                    alloc.daily_drip_usd,
                    alloc.drip_available_usd,
                    alloc.drip_spent_usd,
                    alloc.drip_credited_on,
                    alloc.reserved_usd,
                    alloc.drip_reserved_usd,
                    alloc.status.as_str(),
                    alloc.period_start,
                    alloc.updated_at,
                ],
            )
            .with_context(|| format!("Failed to save budget for {}", alloc.project_id))?;
        Ok(())
    }

    /// Insert a cost event. Returns `false` when the event id was seen before.
    pub fn insert_cost_event(&self, event: &CostEvent) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "INSERT OR IGNORE INTO cost_events (id, project_id, run_id, amount_usd, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    event.id,
                    event.project_id,
                    event.run_id,
                    event.amount_usd,
                    event.created_at
                ],
            )
            .context("Failed to insert cost event")?;
        Ok(changed > 0)
    }

    pub fn spend_since(&self, project_id: &str, since: DateTime<Utc>) -> Result<f64> {
        self.conn
            .query_row(
                "SELECT COALESCE(SUM(amount_usd), 0) FROM cost_events
                 WHERE project_id = ?1 AND created_at >= ?2",
                params![project_id, since],
                |r| r.get(0),
            )
            .context("Failed to sum cost events")
    }

    pub fn earliest_cost_event(&self, project_id: &str) -> Result<Option<DateTime<Utc>>> {
        self.conn
            .query_row(
                "SELECT MIN(created_at) FROM cost_events WHERE project_id = ?1",
                params![project_id],
                |r| r.get(0),
            )
            .context("Failed to query earliest cost event")
    }

    /// Drop all reservations; used at startup when no run survives a restart.
    pub fn clear_budget_reservations(&self) -> Result<usize> {
        self.conn
            .execute("UPDATE budgets SET reserved_usd = 0, drip_reserved_usd = 0
                 WHERE reserved_usd != 0 OR drip_reserved_usd != 0", [])
            .context("Failed to clear reservations")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::NewProject;
    use chrono::Duration;

    fn db() -> PccDb {
        let db = PccDb::new_in_memory().unwrap();
        let mut p = NewProject::new("p", "/repo");
        p.id = Some("p".into());
        db.create_project(&p).unwrap();
        db
    }

    #[test]
    fn test_cost_event_replay_is_ignored() {
        let db = db();
        let event = CostEvent {
            id: "r1:1".into(),
            project_id: "p".into(),
            run_id: Some("r1".into()),
            amount_usd: 0.5,
            created_at: Utc::now(),
        };
        assert!(db.insert_cost_event(&event).unwrap());
        assert!(!db.insert_cost_event(&event).unwrap());
        let spent = db.spend_since("p", Utc::now() - Duration::days(1)).unwrap();
        assert!((spent - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_save_and_read_budget() {
        let db = db();
        let mut alloc = BudgetAllocation::new("p", 20.0, 1.0);
        alloc.drip_credited_on = Some(Utc::now().date_naive());
        db.save_budget(&alloc).unwrap();
        alloc.spent_usd = 3.0;
        alloc.drip_reserved_usd = 0.5;
        db.save_budget(&alloc).unwrap();
        let got = db.get_budget("p").unwrap().unwrap();
        assert_eq!(got.spent_usd, 3.0);
        assert_eq!(got.drip_reserved_usd, 0.5);
        assert_eq!(got.drip_credited_on, alloc.drip_credited_on);
        assert!(db.get_budget("missing").unwrap().is_none());
    }
}
