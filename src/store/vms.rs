use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, params};

use pcc_common::VmRecord;

use super::{PccDb, enum_col};

const VM_COLUMNS: &str = "project_id, status, instance_name, external_ip, internal_ip, size, \
     last_started_at, last_activity_at, last_error, updated_at";

fn map_vm(row: &rusqlite::Row<'_>) -> rusqlite::Result<VmRecord> {
    Ok(VmRecord {
        project_id: row.get(0)?,
        status: enum_col(row, 1)?,
        instance_name: row.get(2)?,
        external_ip: row.get(3)?,
        internal_ip: row.get(4)?,
        size: enum_col(row, 5)?,
        last_started_at: row.get(6)?,
        last_activity_at: row.get(7)?,
        last_error: row.get(8)?,
        updated_at: row.get(9)?,
    })
}

impl PccDb {
    pub fn get_vm_record(&self, project_id: &str) -> Result<Option<VmRecord>> {
        self.conn
            .query_row(
                &format!("SELECT {VM_COLUMNS} FROM vm_records WHERE project_id = ?1"),
                params![project_id],
                map_vm,
            )
            .optional()
            .context("Failed to query VM record")
    }

    pub fn list_vm_records(&self) -> Result<Vec<VmRecord>> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT {VM_COLUMNS} FROM vm_records ORDER BY project_id"))
            .context("Failed to prepare list_vm_records")?;
        let rows = stmt.query_map([], map_vm).context("Failed to query VM records")?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to read VM record")
    }

    pub fn upsert_vm_record(&self, record: &VmRecord) -> Result<()> {
        self.conn
            .execute(
                &format!(
                    "INSERT INTO vm_records ({VM_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                     ON CONFLICT(project_id) DO UPDATE SET
                        status = excluded.status,
                        instance_name = excluded.instance_name,
                        external_ip = excluded.external_ip,
                        internal_ip = excluded.internal_ip,
                        size = excluded.size,
                        last_started_at = excluded.last_started_at,
                        last_activity_at = excluded.last_activity_at,
                        last_error = excluded.last_error,
                        updated_at = excluded.updated_at"
                ),
                params![
                    record.project_id,
                    record.status.as_str(),
                    record.instance_name,
                    record.external_ip,
                    record.internal_ip,
                    record.size.as_str(),
                    record.last_started_at,
                    record.last_activity_at,
                    record.last_error,
                    record.updated_at,
                ],
            )
            .with_context(|| format!("Failed to upsert VM record for {}", record.project_id))?;
        Ok(())
    }

    pub fn touch_vm_activity(&self, project_id: &str, at: DateTime<Utc>) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "UPDATE vm_records SET last_activity_at = ?1, updated_at = ?1 WHERE project_id = ?2",
                params![at, project_id],
            )
            .context("Failed to touch VM activity")?;
        Ok(changed > 0)
    }
}
