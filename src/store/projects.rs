use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{OptionalExtension, params};
use serde::{Deserialize, Serialize};

use pcc_common::{Project, ProjectStatus};

use super::{PccDb, enum_col};

/// Alias chains longer than this are treated as corrupt.
const MAX_ALIAS_HOPS: usize = 8;

const PROJECT_COLUMNS: &str =
    "id, name, path, status, priority, trunk_branch, test_command, requires_vm, created_at";

fn map_project(row: &rusqlite::Row<'_>) -> rusqlite::Result<Project> {
    Ok(Project {
        id: row.get(0)?,
        name: row.get(1)?,
        path: row.get(2)?,
        status: enum_col(row, 3)?,
        priority: row.get(4)?,
        trunk_branch: row.get(5)?,
        test_command: row.get(6)?,
        requires_vm: row.get(7)?,
        created_at: row.get(8)?,
    })
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewProject {
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    pub path: String,
    #[serde(default = "default_priority")]
    pub priority: u8,
    #[serde(default = "default_trunk")]
    pub trunk_branch: String,
    #[serde(default)]
    pub test_command: Option<String>,
    #[serde(default)]
    pub requires_vm: bool,
}

fn default_priority() -> u8 {
    3
}

fn default_trunk() -> String {
    "main".to_string()
}

impl NewProject {
    pub fn new(name: &str, path: &str) -> Self {
        Self {
            id: None,
            name: name.to_string(),
            path: path.to_string(),
            priority: default_priority(),
            trunk_branch: default_trunk(),
            test_command: None,
            requires_vm: false,
        }
    }
}

/// What a project identity collapse moved.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CollapseSummary {
    pub duplicate: String,
    pub canonical: String,
    pub work_items_moved: usize,
    pub runs_moved: usize,
    pub merge_lock_moved: bool,
    pub budget_folded: bool,
}

impl PccDb {
    pub fn create_project(&self, new: &NewProject) -> Result<Project> {
        let id = match &new.id {
            Some(id) => id.clone(),
            None => crate::util::slugify(&new.name, 48),
        };
        anyhow::ensure!(!id.is_empty(), "Project id must not be empty");
        self.conn
            .execute(
                "INSERT INTO projects (id, name, path, priority, trunk_branch, test_command, requires_vm, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    id,
                    new.name,
                    new.path,
                    new.priority,
                    new.trunk_branch,
                    new.test_command,
                    new.requires_vm,
                    Utc::now()
                ],
            )
            .with_context(|| format!("Failed to insert project {}", id))?;
        self.get_project(&id)?
            .context("Project not found after insert")
    }

    pub fn get_project(&self, id: &str) -> Result<Option<Project>> {
        self.conn
            .query_row(
                &format!("SELECT {PROJECT_COLUMNS} FROM projects WHERE id = ?1"),
                params![id],
                map_project,
            )
            .optional()
            .context("Failed to query project")
    }

    /// Projects ordered by priority (1 first), then name.
    pub fn list_projects(&self) -> Result<Vec<Project>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {PROJECT_COLUMNS} FROM projects ORDER BY priority, name"
            ))
            .context("Failed to prepare list_projects")?;
        let rows = stmt
            .query_map([], map_project)
            .context("Failed to query projects")?;
        let mut projects = Vec::new();
        for row in rows {
            projects.push(row.context("Failed to read project row")?);
        }
        Ok(projects)
    }

    pub fn update_project_status(&self, id: &str, status: ProjectStatus) -> Result<Option<Project>> {
        let changed = self
            .conn
            .execute(
                "UPDATE projects SET status = ?1 WHERE id = ?2",
                params![status.as_str(), id],
            )
            .context("Failed to update project status")?;
        if changed == 0 {
            return Ok(None);
        }
        self.get_project(id)
    }

    /// Follow the alias table to the live id of a project.
    ///
    /// Returns `None` when neither the id nor anything it aliases to exists.
    pub fn resolve_canonical(&self, id: &str) -> Result<Option<String>> {
        let mut current = id.to_string();
        for _ in 0..MAX_ALIAS_HOPS {
            let exists: bool = self
                .conn
                .query_row(
                    "SELECT EXISTS(SELECT 1 FROM projects WHERE id = ?1)",
                    params![current],
                    |r| r.get(0),
                )
                .context("Failed to check project existence")?;
            if exists {
                return Ok(Some(current));
            }
            let next: Option<String> = self
                .conn
                .query_row(
                    "SELECT canonical_id FROM project_aliases WHERE alias_id = ?1",
                    params![current],
                    |r| r.get(0),
                )
                .optional()
                .context("Failed to query project alias")?;
            match next {
                Some(next) => current = next,
                None => return Ok(None),
            }
        }
        anyhow::bail!("Project alias chain for {} exceeds {} hops", id, MAX_ALIAS_HOPS)
    }

    /// Collapse `duplicate` into `canonical` in a single transaction.
    ///
    /// Every row carrying the duplicate's id is repointed, the duplicate's
    /// budget is folded into the canonical one, an alias is recorded and the
    /// duplicate row is deleted. Runs in flight keep working because their
    /// stored `project_id` is rewritten here.
    pub fn collapse_projects(&self, duplicate: &str, canonical: &str) -> Result<CollapseSummary> {
        anyhow::ensure!(
            duplicate != canonical,
            "Cannot collapse project {} into itself",
            duplicate
        );
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin collapse transaction")?;
        for id in [duplicate, canonical] {
            let exists: bool = tx
                .query_row(
                    "SELECT EXISTS(SELECT 1 FROM projects WHERE id = ?1)",
                    params![id],
                    |r| r.get(0),
                )
                .context("Failed to check project existence")?;
            anyhow::ensure!(exists, "Project {} not found", id);
        }
        let now = Utc::now();
        let has_row = |table: &str, id: &str| -> Result<bool> {
            tx.query_row(
                &format!("SELECT EXISTS(SELECT 1 FROM {table} WHERE project_id = ?1)"),
                params![id],
                |r| r.get(0),
            )
            .with_context(|| format!("Failed to query {table}"))
        };

        // Only one live shift per project: the duplicate's ends if both have one.
        let both_shifting: bool = tx
            .query_row(
                "SELECT COUNT(DISTINCT project_id) = 2 FROM shifts
                 WHERE ended_at IS NULL AND project_id IN (?1, ?2)",
                params![duplicate, canonical],
                |r| r.get(0),
            )
            .context("Failed to query active shifts")?;
        if both_shifting {
            tx.execute(
                "UPDATE shifts SET ended_at = ?1 WHERE project_id = ?2 AND ended_at IS NULL",
                params![now, duplicate],
            )
            .context("Failed to end duplicate shift")?;
        }

        let work_items_moved = tx
            .execute(
                "UPDATE work_items SET project_id = ?1 WHERE project_id = ?2",
                params![canonical, duplicate],
            )
            .context("Failed to repoint work items")?;
        let runs_moved = tx
            .execute(
                "UPDATE runs SET project_id = ?1 WHERE project_id = ?2",
                params![canonical, duplicate],
            )
            .context("Failed to repoint runs")?;
        for table in [
            "shifts",
            "escalations",
            "communications",
            "cost_events",
            "merge_lock_history",
        ] {
            tx.execute(
                &format!("UPDATE {table} SET project_id = ?1 WHERE project_id = ?2"),
                params![canonical, duplicate],
            )
            .with_context(|| format!("Failed to repoint {table}"))?;
        }

        let merge_lock_moved = if has_row("merge_locks", duplicate)? {
            if has_row("merge_locks", canonical)? {
                tx.execute(
                    "DELETE FROM merge_locks WHERE project_id = ?1",
                    params![duplicate],
                )
                .context("Failed to drop duplicate merge lock")?;
                false
            } else {
                tx.execute(
                    "UPDATE merge_locks SET project_id = ?1 WHERE project_id = ?2",
                    params![canonical, duplicate],
                )
                .context("Failed to move merge lock")?;
                true
            }
        } else {
            false
        };

        if has_row("vm_records", duplicate)? {
            if has_row("vm_records", canonical)? {
                tx.execute(
                    "DELETE FROM vm_records WHERE project_id = ?1",
                    params![duplicate],
                )
                .context("Failed to drop duplicate VM record")?;
            } else {
                tx.execute(
                    "UPDATE vm_records SET project_id = ?1 WHERE project_id = ?2",
                    params![canonical, duplicate],
                )
                .context("Failed to move VM record")?;
            }
        }

        let budget_folded = if has_row("budgets", duplicate)? {
            if has_row("budgets", canonical)? {
                tx.execute(
                    "UPDATE budgets SET
                        monthly_allocation_usd = budgets.monthly_allocation_usd + d.monthly_allocation_usd,
                        spent_usd = budgets.spent_usd + d.spent_usd,
                        drip_spent_usd = budgets.drip_spent_usd + d.drip_spent_usd,
                        reserved_usd = budgets.reserved_usd + d.reserved_usd,
                        drip_reserved_usd = budgets.drip_reserved_usd + d.drip_reserved_usd,
                        updated_at = ?3
                     FROM (SELECT * FROM budgets WHERE project_id = ?2) AS d
                     WHERE budgets.project_id = ?1",
                    params![canonical, duplicate, now],
                )
                .context("Failed to fold budgets")?;
                tx.execute("DELETE FROM budgets WHERE project_id = ?1", params![duplicate])
                    .context("Failed to drop duplicate budget")?;
                true
            } else {
                tx.execute(
                    "UPDATE budgets SET project_id = ?1 WHERE project_id = ?2",
                    params![canonical, duplicate],
                )
                .context("Failed to move budget")?;
                false
            }
        } else {
            false
        };

        tx.execute(
            "UPDATE project_aliases SET canonical_id = ?1 WHERE canonical_id = ?2",
            params![canonical, duplicate],
        )
        .context("Failed to repoint aliases")?;
        tx.execute(
            "INSERT OR REPLACE INTO project_aliases (alias_id, canonical_id, created_at) VALUES (?1, ?2, ?3)",
            params![duplicate, canonical, now],
        )
        .context("Failed to record project alias")?;
        tx.execute("DELETE FROM projects WHERE id = ?1", params![duplicate])
            .context("Failed to delete duplicate project")?;
        tx.commit().context("Failed to commit collapse")?;

        Ok(CollapseSummary {
            duplicate: duplicate.to_string(),
            canonical: canonical.to_string(),
            work_items_moved,
            runs_moved,
            merge_lock_moved,
            budget_folded,
        })
    }
}
