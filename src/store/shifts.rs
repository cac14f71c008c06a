use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{OptionalExtension, params};

use pcc_common::{Handoff, Shift, ShiftPhase};

use super::{PccDb, enum_col, is_unique_violation, opt_json_col, to_json};

const SHIFT_COLUMNS: &str = "id, project_id, phase, started_at, timeout_minutes, ended_at, handoff";

fn map_shift(row: &rusqlite::Row<'_>) -> rusqlite::Result<Shift> {
    Ok(Shift {
        id: row.get(0)?,
        project_id: row.get(1)?,
        phase: enum_col(row, 2)?,
        started_at: row.get(3)?,
        timeout_minutes: row.get(4)?,
        ended_at: row.get(5)?,
        handoff: opt_json_col(row, 6)?,
    })
}

impl PccDb {
    /// Start a shift. Returns `None` when the project already has one active.
    pub fn start_shift(&self, id: &str, project_id: &str, timeout_minutes: u32) -> Result<Option<Shift>> {
        let result = self.conn.execute(
            "INSERT INTO shifts (id, project_id, phase, started_at, timeout_minutes)
             VALUES (?1, ?2, 'context', ?3, ?4)",
            params![id, project_id, Utc::now(), timeout_minutes],
        );
        match result {
            Ok(_) => self.get_shift(id),
            Err(e) if is_unique_violation(&e) => Ok(None),
            Err(e) => Err(anyhow::Error::new(e).context("Failed to insert shift")),
        }
    }

    pub fn get_shift(&self, id: &str) -> Result<Option<Shift>> {
        self.conn
            .query_row(
                &format!("SELECT {SHIFT_COLUMNS} FROM shifts WHERE id = ?1"),
                params![id],
                map_shift,
            )
            .optional()
            .context("Failed to query shift")
    }

    pub fn active_shift(&self, project_id: &str) -> Result<Option<Shift>> {
        self.conn
            .query_row(
                &format!(
                    "SELECT {SHIFT_COLUMNS} FROM shifts WHERE project_id = ?1 AND ended_at IS NULL"
                ),
                params![project_id],
                map_shift,
            )
            .optional()
            .context("Failed to query active shift")
    }

    pub fn list_active_shifts(&self) -> Result<Vec<Shift>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {SHIFT_COLUMNS} FROM shifts WHERE ended_at IS NULL ORDER BY started_at"
            ))
            .context("Failed to prepare list_active_shifts")?;
        let rows = stmt.query_map([], map_shift).context("Failed to query shifts")?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to read shift")
    }

    pub fn set_shift_phase(&self, id: &str, phase: ShiftPhase) -> Result<()> {
        self.conn
            .execute(
                "UPDATE shifts SET phase = ?1 WHERE id = ?2 AND ended_at IS NULL",
                params![phase.as_str(), id],
            )
            .context("Failed to update shift phase")?;
        Ok(())
    }

    pub fn end_shift(&self, id: &str, handoff: &Handoff) -> Result<Option<Shift>> {
        self.conn
            .execute(
                "UPDATE shifts SET phase = 'handoff', ended_at = ?1, handoff = ?2
                 WHERE id = ?3 AND ended_at IS NULL",
                params![Utc::now(), to_json(handoff)?, id],
            )
            .context("Failed to end shift")?;
        self.get_shift(id)
    }

    /// Finished shifts of a project, newest first.
    pub fn list_handoffs(&self, project_id: &str, limit: u32) -> Result<Vec<Shift>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {SHIFT_COLUMNS} FROM shifts
                 WHERE project_id = ?1 AND ended_at IS NOT NULL AND handoff IS NOT NULL
                 ORDER BY ended_at DESC LIMIT ?2"
            ))
            .context("Failed to prepare list_handoffs")?;
        let rows = stmt
            .query_map(params![project_id, limit], map_shift)
            .context("Failed to query handoffs")?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to read handoff")
    }
}
