use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{OptionalExtension, params};

use pcc_common::MergeLock;

use super::{PccDb, is_foreign_key_violation, is_unique_violation};

/// Outcome of a single lock insertion attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum LockInsert {
    Acquired(MergeLock),
    /// Another run holds the project's lock.
    Held(MergeLock),
    /// The project id (or run id) no longer exists; the caller should
    /// re-resolve identity and retry.
    StaleReference,
}

fn map_lock(row: &rusqlite::Row<'_>) -> rusqlite::Result<MergeLock> {
    Ok(MergeLock {
        id: row.get(0)?,
        project_id: row.get(1)?,
        run_id: row.get(2)?,
        acquired_at: row.get(3)?,
    })
}

impl PccDb {
    pub fn try_insert_merge_lock(
        &self,
        lock_id: &str,
        project_id: &str,
        run_id: &str,
    ) -> Result<LockInsert> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin merge lock insert")?;
        let now = Utc::now();
        let result = tx.execute(
            "INSERT INTO merge_locks (id, project_id, run_id, acquired_at) VALUES (?1, ?2, ?3, ?4)",
            params![lock_id, project_id, run_id, now],
        );
        match result {
            Ok(_) => {}
            Err(e) if is_unique_violation(&e) => {
                drop(tx);
                return match self.get_merge_lock(project_id)? {
                    Some(holder) => Ok(LockInsert::Held(holder)),
                    // Released between the insert and the read; let the caller retry.
                    None => Ok(LockInsert::StaleReference),
                };
            }
            Err(e) if is_foreign_key_violation(&e) => return Ok(LockInsert::StaleReference),
            Err(e) => return Err(anyhow::Error::new(e).context("Failed to insert merge lock")),
        }
        tx.execute(
            "INSERT INTO merge_lock_history (lock_id, project_id, run_id, acquired_at) VALUES (?1, ?2, ?3, ?4)",
            params![lock_id, project_id, run_id, now],
        )
        .context("Failed to record merge lock history")?;
        tx.commit().context("Failed to commit merge lock")?;
        Ok(LockInsert::Acquired(MergeLock {
            id: lock_id.to_string(),
            project_id: project_id.to_string(),
            run_id: run_id.to_string(),
            acquired_at: now,
        }))
    }

    pub fn get_merge_lock(&self, project_id: &str) -> Result<Option<MergeLock>> {
        self.conn
            .query_row(
                "SELECT id, project_id, run_id, acquired_at FROM merge_locks WHERE project_id = ?1",
                params![project_id],
                map_lock,
            )
            .optional()
            .context("Failed to query merge lock")
    }

    pub fn get_merge_lock_by_id(&self, lock_id: &str) -> Result<Option<MergeLock>> {
        self.conn
            .query_row(
                "SELECT id, project_id, run_id, acquired_at FROM merge_locks WHERE id = ?1",
                params![lock_id],
                map_lock,
            )
            .optional()
            .context("Failed to query merge lock")
    }

    pub fn list_merge_locks(&self) -> Result<Vec<MergeLock>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, project_id, run_id, acquired_at FROM merge_locks ORDER BY acquired_at")
            .context("Failed to prepare list_merge_locks")?;
        let rows = stmt.query_map([], map_lock).context("Failed to query merge locks")?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to read merge lock")
    }

    /// Delete the lock row. Returns the deleted lock, if it existed.
    pub fn delete_merge_lock(&self, lock_id: &str) -> Result<Option<MergeLock>> {
        let Some(lock) = self.get_merge_lock_by_id(lock_id)? else {
            return Ok(None);
        };
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin merge lock release")?;
        tx.execute("DELETE FROM merge_locks WHERE id = ?1", params![lock_id])
            .context("Failed to delete merge lock")?;
        tx.execute(
            "UPDATE merge_lock_history SET released_at = ?1 WHERE lock_id = ?2",
            params![Utc::now(), lock_id],
        )
        .context("Failed to record merge lock release")?;
        tx.commit().context("Failed to commit merge lock release")?;
        Ok(Some(lock))
    }

    /// Number of locks ever acquired for a run.
    pub fn merge_lock_acquisitions(&self, run_id: &str) -> Result<usize> {
        let n: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM merge_lock_history WHERE run_id = ?1",
                params![run_id],
                |r| r.get(0),
            )
            .context("Failed to count merge lock history")?;
        Ok(n as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::NewProject;
    use pcc_common::{WorkItem, WorkItemStatus};

    fn db() -> PccDb {
        let db = PccDb::new_in_memory().unwrap();
        for id in ["p", "q"] {
            let mut p = NewProject::new(id, "/repo");
            p.id = Some(id.into());
            db.create_project(&p).unwrap();
        }
        let now = Utc::now();
        let items: Vec<WorkItem> = (1..=2)
            .map(|n| WorkItem {
                id: format!("WO-{n}"),
                project_id: "p".into(),
                title: "t".into(),
                goal: String::new(),
                acceptance_criteria: vec![],
                non_goals: vec![],
                stop_conditions: vec![],
                priority: 3,
                tags: vec![],
                depends_on: vec![],
                status: WorkItemStatus::Ready,
                estimate_usd: None,
                spec_path: None,
                created_at: now,
                updated_at: now,
            })
            .collect();
        db.insert_work_items(&items).unwrap();
        db.create_run("r1", "WO-1", "p").unwrap();
        db.create_run("r2", "WO-2", "p").unwrap();
        db
    }

    #[test]
    fn test_second_insert_sees_holder() {
        let db = db();
        assert!(matches!(
            db.try_insert_merge_lock("l1", "p", "r1").unwrap(),
            LockInsert::Acquired(_)
        ));
        match db.try_insert_merge_lock("l2", "p", "r2").unwrap() {
            LockInsert::Held(holder) => assert_eq!(holder.run_id, "r1"),
            other => panic!("expected Held, got {other:?}"),
        }
        assert_eq!(db.list_merge_locks().unwrap().len(), 1);
    }

    #[test]
    fn test_missing_project_is_stale_reference() {
        let db = db();
        assert_eq!(
            db.try_insert_merge_lock("l1", "ghost", "r1").unwrap(),
            LockInsert::StaleReference
        );
    }

    #[test]
    fn test_release_and_history() {
        let db = db();
        db.try_insert_merge_lock("l1", "p", "r1").unwrap();
        assert!(db.delete_merge_lock("l1").unwrap().is_some());
        assert!(db.delete_merge_lock("l1").unwrap().is_none());
        assert_eq!(db.merge_lock_acquisitions("r1").unwrap(), 1);
        assert!(matches!(
            db.try_insert_merge_lock("l2", "p", "r2").unwrap(),
            LockInsert::Acquired(_)
        ));
    }

    #[test]
    fn test_locks_are_per_project() {
        let db = db();
        db.try_insert_merge_lock("l1", "p", "r1").unwrap();
        assert!(matches!(
            db.try_insert_merge_lock("l2", "q", "r2").unwrap(),
            LockInsert::Acquired(_)
        ));
    }
}
