use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, params};

use pcc_common::{FailureReason, Run, RunCommand, RunPhase, RunStatus};

use super::{PccDb, enum_col, is_unique_violation, opt_enum_col};

const RUN_COLUMNS: &str = "id, work_item_id, project_id, status, phase, builder_iteration, \
     log_path, branch_name, cost_usd, error, failure_reason, created_at, started_at, completed_at";

fn map_run(row: &rusqlite::Row<'_>) -> rusqlite::Result<Run> {
    Ok(Run {
        id: row.get(0)?,
        work_item_id: row.get(1)?,
        project_id: row.get(2)?,
        status: enum_col(row, 3)?,
        phase: enum_col(row, 4)?,
        builder_iteration: row.get(5)?,
        log_path: row.get(6)?,
        branch_name: row.get(7)?,
        cost_usd: row.get(8)?,
        error: row.get(9)?,
        failure_reason: opt_enum_col(row, 10)?,
        created_at: row.get(11)?,
        started_at: row.get(12)?,
        completed_at: row.get(13)?,
    })
}

/// Non-terminal field updates; `None` leaves a column unchanged.
#[derive(Debug, Clone, Default)]
pub struct RunUpdate {
    pub status: Option<RunStatus>,
    pub phase: Option<RunPhase>,
    pub builder_iteration: Option<u32>,
    pub log_path: Option<String>,
    pub branch_name: Option<String>,
}

impl RunUpdate {
    pub fn phase(phase: RunPhase) -> Self {
        Self {
            phase: Some(phase),
            ..Default::default()
        }
    }
}

impl PccDb {
    /// Insert a queued run. Returns `None` when the work item already has an
    /// active run.
    pub fn create_run(&self, id: &str, work_item_id: &str, project_id: &str) -> Result<Option<Run>> {
        let result = self.conn.execute(
            "INSERT INTO runs (id, work_item_id, project_id, status, phase, created_at)
             VALUES (?1, ?2, ?3, 'queued', 'queued', ?4)",
            params![id, work_item_id, project_id, Utc::now()],
        );
        match result {
            Ok(_) => self.get_run(id),
            Err(e) if is_unique_violation(&e) => Ok(None),
            Err(e) => Err(anyhow::Error::new(e).context("Failed to insert run")),
        }
    }

    pub fn get_run(&self, id: &str) -> Result<Option<Run>> {
        self.conn
            .query_row(
                &format!("SELECT {RUN_COLUMNS} FROM runs WHERE id = ?1"),
                params![id],
                map_run,
            )
            .optional()
            .context("Failed to query run")
    }

    /// The authoritative project id of a run, read fresh from its row.
    pub fn run_project_id(&self, id: &str) -> Result<Option<String>> {
        self.conn
            .query_row(
                "SELECT project_id FROM runs WHERE id = ?1",
                params![id],
                |r| r.get(0),
            )
            .optional()
            .context("Failed to query run project")
    }

    pub fn active_run_for_work_item(&self, work_item_id: &str) -> Result<Option<Run>> {
        self.conn
            .query_row(
                &format!(
                    "SELECT {RUN_COLUMNS} FROM runs
                     WHERE work_item_id = ?1 AND status IN ('queued', 'running')"
                ),
                params![work_item_id],
                map_run,
            )
            .optional()
            .context("Failed to query active run")
    }

    fn query_runs(&self, sql: &str, params: &[&dyn rusqlite::ToSql]) -> Result<Vec<Run>> {
        let mut stmt = self.conn.prepare(sql).context("Failed to prepare run query")?;
        let rows = stmt
            .query_map(params, map_run)
            .context("Failed to query runs")?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to read run row")
    }

    /// Runs of one work item, newest first.
    pub fn list_runs_for_work_item(&self, work_item_id: &str) -> Result<Vec<Run>> {
        self.query_runs(
            &format!(
                "SELECT {RUN_COLUMNS} FROM runs WHERE work_item_id = ?1
                 ORDER BY created_at DESC, rowid DESC"
            ),
            &[&work_item_id],
        )
    }

    pub fn recent_runs_for_project(&self, project_id: &str, limit: u32) -> Result<Vec<Run>> {
        self.query_runs(
            &format!(
                "SELECT {RUN_COLUMNS} FROM runs WHERE project_id = ?1
                 ORDER BY created_at DESC, rowid DESC LIMIT ?2"
            ),
            &[&project_id, &limit],
        )
    }

    pub fn list_runs_with_status(&self, status: RunStatus) -> Result<Vec<Run>> {
        self.query_runs(
            &format!("SELECT {RUN_COLUMNS} FROM runs WHERE status = ?1 ORDER BY created_at"),
            &[&status.as_str()],
        )
    }

    /// Terminal runs that completed before `cutoff`.
    pub fn terminal_runs_completed_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<Run>> {
        self.query_runs(
            &format!(
                "SELECT {RUN_COLUMNS} FROM runs
                 WHERE status IN ('done', 'failed', 'cancelled') AND completed_at < ?1
                 ORDER BY completed_at"
            ),
            &[&cutoff],
        )
    }

    pub fn update_run(&self, id: &str, update: &RunUpdate) -> Result<Option<Run>> {
        let now = Utc::now();
        self.conn
            .execute(
                "UPDATE runs SET
                    status = COALESCE(?1, status),
                    phase = COALESCE(?2, phase),
                    builder_iteration = COALESCE(?3, builder_iteration),
                    log_path = COALESCE(?4, log_path),
                    branch_name = COALESCE(?5, branch_name),
                    started_at = CASE WHEN ?1 = 'running' AND started_at IS NULL THEN ?6 ELSE started_at END
                 WHERE id = ?7 AND status IN ('queued', 'running')",
                params![
                    update.status.map(|s| s.as_str()),
                    update.phase.map(|p| p.as_str()),
                    update.builder_iteration,
                    update.log_path,
                    update.branch_name,
                    now,
                    id
                ],
            )
            .context("Failed to update run")?;
        self.get_run(id)
    }

    pub fn add_run_cost(&self, id: &str, amount_usd: f64) -> Result<()> {
        self.conn
            .execute(
                "UPDATE runs SET cost_usd = cost_usd + ?1 WHERE id = ?2",
                params![amount_usd, id],
            )
            .context("Failed to add run cost")?;
        Ok(())
    }

    /// Move a run to a terminal status. Returns `false` if it already was.
    pub fn finish_run(
        &self,
        id: &str,
        status: RunStatus,
        error: Option<&str>,
        reason: Option<FailureReason>,
    ) -> Result<bool> {
        anyhow::ensure!(status.is_terminal(), "finish_run needs a terminal status");
        let changed = self
            .conn
            .execute(
                "UPDATE runs SET status = ?1, phase = 'finished', error = ?2, failure_reason = ?3,
                    completed_at = ?4
                 WHERE id = ?5 AND status IN ('queued', 'running')",
                params![
                    status.as_str(),
                    error,
                    reason.map(|r| r.as_str()),
                    Utc::now(),
                    id
                ],
            )
            .context("Failed to finish run")?;
        Ok(changed > 0)
    }

    /// Append an audit row; returns its sequence number.
    pub fn append_run_command(
        &self,
        run_id: &str,
        cwd: &str,
        command: &str,
        exit_code: Option<i32>,
    ) -> Result<i64> {
        let seq: i64 = self
            .conn
            .query_row(
                "INSERT INTO run_commands (run_id, seq, cwd, command, exit_code, created_at)
                 SELECT ?1, COALESCE(MAX(seq), 0) + 1, ?2, ?3, ?4, ?5
                 FROM run_commands WHERE run_id = ?1
                 RETURNING seq",
                params![run_id, cwd, command, exit_code, Utc::now()],
                |r| r.get(0),
            )
            .context("Failed to append run command")?;
        Ok(seq)
    }

    pub fn list_run_commands(&self, run_id: &str) -> Result<Vec<RunCommand>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT run_id, seq, cwd, command, exit_code, created_at
                 FROM run_commands WHERE run_id = ?1 ORDER BY seq",
            )
            .context("Failed to prepare list_run_commands")?;
        let rows = stmt
            .query_map(params![run_id], |r| {
                Ok(RunCommand {
                    run_id: r.get(0)?,
                    seq: r.get(1)?,
                    cwd: r.get(2)?,
                    command: r.get(3)?,
                    exit_code: r.get(4)?,
                    created_at: r.get(5)?,
                })
            })
            .context("Failed to query run commands")?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to read run command")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::NewProject;
    use pcc_common::{WorkItem, WorkItemStatus};

    fn db() -> PccDb {
        let db = PccDb::new_in_memory().unwrap();
        let mut p = NewProject::new("p", "/repo");
        p.id = Some("p".into());
        db.create_project(&p).unwrap();
        let now = Utc::now();
        db.insert_work_items(&[WorkItem {
            id: "WO-1".into(),
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
        }])
        .unwrap();
        db
    }

    #[test]
    fn test_one_active_run_per_work_item() {
        let db = db();
        assert!(db.create_run("r1", "WO-1", "p").unwrap().is_some());
        assert!(db.create_run("r2", "WO-1", "p").unwrap().is_none());
        db.finish_run("r1", RunStatus::Failed, Some("boom"), Some(FailureReason::Internal))
            .unwrap();
        assert!(db.create_run("r3", "WO-1", "p").unwrap().is_some());
    }

    #[test]
    fn test_update_sets_started_at_once() {
        let db = db();
        db.create_run("r1", "WO-1", "p").unwrap();
        let update = RunUpdate {
            status: Some(RunStatus::Running),
            phase: Some(RunPhase::Setup),
            ..Default::default()
        };
        let run = db.update_run("r1", &update).unwrap().unwrap();
        let started = run.started_at.unwrap();
        let run = db.update_run("r1", &update).unwrap().unwrap();
        assert_eq!(run.started_at.unwrap(), started);
        assert_eq!(run.phase, RunPhase::Setup);
    }

    #[test]
    fn test_finish_is_once() {
        let db = db();
        db.create_run("r1", "WO-1", "p").unwrap();
        assert!(db.finish_run("r1", RunStatus::Done, None, None).unwrap());
        assert!(!db.finish_run("r1", RunStatus::Cancelled, None, None).unwrap());
        let run = db.get_run("r1").unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Done);
        assert_eq!(run.phase, RunPhase::Finished);
        assert!(db.finish_run("r1", RunStatus::Running, None, None).is_err());
    }

    #[test]
    fn test_run_commands_sequence() {
        let db = db();
        db.create_run("r1", "WO-1", "p").unwrap();
        assert_eq!(db.append_run_command("r1", "/w", "git status", Some(0)).unwrap(), 1);
        assert_eq!(db.append_run_command("r1", "/w", "claude", None).unwrap(), 2);
        let cmds = db.list_run_commands("r1").unwrap();
        assert_eq!(cmds.len(), 2);
        assert_eq!(cmds[1].command, "claude");
        assert_eq!(cmds[0].exit_code, Some(0));
    }
}
