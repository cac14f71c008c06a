use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{OptionalExtension, params};

use pcc_common::{Communication, EscalationRecord, NewCommunication};

use super::{PccDb, enum_col, is_unique_violation, json_col, opt_json_col, to_json};

const ESCALATION_COLUMNS: &str =
    "id, project_id, run_id, shift_id, reason, detail, payload, dedup_key, created_at, resolved_at";

const COMMUNICATION_COLUMNS: &str = "id, project_id, intent, kind, scope, summary, body, run_id, \
     shift_id, payload, created_at, acknowledged_at";

fn map_escalation(row: &rusqlite::Row<'_>) -> rusqlite::Result<EscalationRecord> {
    Ok(EscalationRecord {
        id: row.get(0)?,
        project_id: row.get(1)?,
        run_id: row.get(2)?,
        shift_id: row.get(3)?,
        reason: enum_col(row, 4)?,
        detail: row.get(5)?,
        payload: json_col(row, 6)?,
        dedup_key: row.get(7)?,
        created_at: row.get(8)?,
        resolved_at: row.get(9)?,
    })
}

fn map_communication(row: &rusqlite::Row<'_>) -> rusqlite::Result<Communication> {
    Ok(Communication {
        id: row.get(0)?,
        project_id: row.get(1)?,
        intent: enum_col(row, 2)?,
        kind: enum_col(row, 3)?,
        scope: enum_col(row, 4)?,
        summary: row.get(5)?,
        body: row.get(6)?,
        run_id: row.get(7)?,
        shift_id: row.get(8)?,
        payload: opt_json_col(row, 9)?,
        created_at: row.get(10)?,
        acknowledged_at: row.get(11)?,
    })
}

impl PccDb {
    /// Insert an escalation unless one with the same dedup key exists.
    ///
    /// Returns the stored record and whether this call created it.
    pub fn insert_escalation(&self, record: &EscalationRecord) -> Result<(EscalationRecord, bool)> {
        let result = self.conn.execute(
            &format!(
                "INSERT INTO escalations ({ESCALATION_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"
            ),
            params![
                record.id,
                record.project_id,
                record.run_id,
                record.shift_id,
                record.reason.as_str(),
                record.detail,
                to_json(&record.payload)?,
                record.dedup_key,
                record.created_at,
                record.resolved_at,
            ],
        );
        match result {
            Ok(_) => Ok((record.clone(), true)),
            Err(e) if is_unique_violation(&e) => {
                let existing = self
                    .escalation_by_dedup_key(&record.dedup_key)?
                    .context("Escalation dedup key conflict without a row")?;
                Ok((existing, false))
            }
            Err(e) => Err(anyhow::Error::new(e).context("Failed to insert escalation")),
        }
    }

    pub fn escalation_by_dedup_key(&self, key: &str) -> Result<Option<EscalationRecord>> {
        self.conn
            .query_row(
                &format!("SELECT {ESCALATION_COLUMNS} FROM escalations WHERE dedup_key = ?1"),
                params![key],
                map_escalation,
            )
            .optional()
            .context("Failed to query escalation")
    }

    pub fn get_escalation(&self, id: &str) -> Result<Option<EscalationRecord>> {
        self.conn
            .query_row(
                &format!("SELECT {ESCALATION_COLUMNS} FROM escalations WHERE id = ?1"),
                params![id],
                map_escalation,
            )
            .optional()
            .context("Failed to query escalation")
    }

    pub fn list_escalations(
        &self,
        project_id: Option<&str>,
        open_only: bool,
    ) -> Result<Vec<EscalationRecord>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {ESCALATION_COLUMNS} FROM escalations
                 WHERE (?1 IS NULL OR project_id = ?1) AND (?2 = 0 OR resolved_at IS NULL)
                 ORDER BY created_at DESC"
            ))
            .context("Failed to prepare list_escalations")?;
        let rows = stmt
            .query_map(params![project_id, open_only], map_escalation)
            .context("Failed to query escalations")?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to read escalation")
    }

    pub fn escalations_for_run(&self, run_id: &str) -> Result<Vec<EscalationRecord>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {ESCALATION_COLUMNS} FROM escalations WHERE run_id = ?1 ORDER BY created_at"
            ))
            .context("Failed to prepare escalations_for_run")?;
        let rows = stmt
            .query_map(params![run_id], map_escalation)
            .context("Failed to query escalations")?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to read escalation")
    }

    pub fn resolve_escalation(&self, id: &str) -> Result<Option<EscalationRecord>> {
        self.conn
            .execute(
                "UPDATE escalations SET resolved_at = ?1 WHERE id = ?2 AND resolved_at IS NULL",
                params![Utc::now(), id],
            )
            .context("Failed to resolve escalation")?;
        self.get_escalation(id)
    }

    pub fn insert_communication(
        &self,
        id: &str,
        project_id: Option<&str>,
        comm: &NewCommunication,
    ) -> Result<Communication> {
        let payload = comm.payload.as_ref().map(to_json).transpose()?;
        self.conn
            .execute(
                &format!(
                    "INSERT INTO communications ({COMMUNICATION_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, NULL)"
                ),
                params![
                    id,
                    project_id,
                    comm.intent.as_str(),
                    comm.kind.as_str(),
                    comm.scope.as_str(),
                    comm.summary,
                    comm.body,
                    comm.run_id,
                    comm.shift_id,
                    payload,
                    Utc::now(),
                ],
            )
            .context("Failed to insert communication")?;
        self.conn
            .query_row(
                &format!("SELECT {COMMUNICATION_COLUMNS} FROM communications WHERE id = ?1"),
                params![id],
                map_communication,
            )
            .context("Communication not found after insert")
    }

    pub fn list_communications(
        &self,
        project_id: Option<&str>,
        unacknowledged_only: bool,
        limit: u32,
    ) -> Result<Vec<Communication>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {COMMUNICATION_COLUMNS} FROM communications
                 WHERE (?1 IS NULL OR project_id = ?1) AND (?2 = 0 OR acknowledged_at IS NULL)
                 ORDER BY created_at DESC LIMIT ?3"
            ))
            .context("Failed to prepare list_communications")?;
        let rows = stmt
            .query_map(params![project_id, unacknowledged_only, limit], map_communication)
            .context("Failed to query communications")?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to read communication")
    }

    /// Mark a communication as seen. Acknowledging twice keeps the first
    /// timestamp.
    pub fn acknowledge_communication(&self, id: &str) -> Result<Option<Communication>> {
        self.conn
            .execute(
                "UPDATE communications SET acknowledged_at = ?1
                 WHERE id = ?2 AND acknowledged_at IS NULL",
                params![Utc::now(), id],
            )
            .context("Failed to acknowledge communication")?;
        self.conn
            .query_row(
                &format!("SELECT {COMMUNICATION_COLUMNS} FROM communications WHERE id = ?1"),
                params![id],
                map_communication,
            )
            .optional()
            .context("Failed to query communication")
    }
}
