use std::collections::HashMap;

use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{OptionalExtension, params};

use pcc_common::{WorkItem, WorkItemEvent, WorkItemPatch, WorkItemStatus};

use super::{PccDb, enum_col, json_col, to_json};

const WORK_ITEM_COLUMNS: &str = "id, project_id, title, goal, acceptance_criteria, non_goals, \
     stop_conditions, priority, tags, status, estimate_usd, spec_path, created_at, updated_at";

fn map_work_item(row: &rusqlite::Row<'_>) -> rusqlite::Result<WorkItem> {
    Ok(WorkItem {
        id: row.get(0)?,
        project_id: row.get(1)?,
        title: row.get(2)?,
        goal: row.get(3)?,
        acceptance_criteria: json_col(row, 4)?,
        non_goals: json_col(row, 5)?,
        stop_conditions: json_col(row, 6)?,
        priority: row.get(7)?,
        tags: json_col(row, 8)?,
        status: enum_col(row, 9)?,
        estimate_usd: row.get(10)?,
        spec_path: row.get(11)?,
        created_at: row.get(12)?,
        updated_at: row.get(13)?,
        depends_on: Vec::new(),
    })
}

impl PccDb {
    /// Next free `WO-<n>` number.
    pub fn next_work_item_number(&self) -> Result<u64> {
        let max: i64 = self
            .conn
            .query_row(
                "SELECT COALESCE(MAX(CAST(SUBSTR(id, 4) AS INTEGER)), 0)
                 FROM work_items WHERE id GLOB 'WO-[0-9]*'",
                [],
                |r| r.get(0),
            )
            .context("Failed to compute next work item id")?;
        Ok(max.max(0) as u64 + 1)
    }

    /// Insert work items and their dependency edges atomically.
    pub fn insert_work_items(&self, items: &[WorkItem]) -> Result<()> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin work item insert")?;
        for item in items {
            tx.execute(
                &format!(
                    "INSERT INTO work_items ({WORK_ITEM_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)"
                ),
                params![
                    item.id,
                    item.project_id,
                    item.title,
                    item.goal,
                    to_json(&item.acceptance_criteria)?,
                    to_json(&item.non_goals)?,
                    to_json(&item.stop_conditions)?,
                    item.priority,
                    to_json(&item.tags)?,
                    item.status.as_str(),
                    item.estimate_usd,
                    item.spec_path,
                    item.created_at,
                    item.updated_at,
                ],
            )
            .with_context(|| format!("Failed to insert work item {}", item.id))?;
        }
        for item in items {
            for dep in &item.depends_on {
                tx.execute(
                    "INSERT INTO work_item_deps (work_item_id, depends_on) VALUES (?1, ?2)",
                    params![item.id, dep],
                )
                .with_context(|| format!("Failed to insert dependency {} -> {}", item.id, dep))?;
            }
        }
        tx.commit().context("Failed to commit work items")?;
        Ok(())
    }

    pub fn work_item_exists(&self, id: &str) -> Result<bool> {
        self.conn
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM work_items WHERE id = ?1)",
                params![id],
                |r| r.get(0),
            )
            .context("Failed to check work item existence")
    }

    pub fn get_work_item(&self, id: &str) -> Result<Option<WorkItem>> {
        let item = self
            .conn
            .query_row(
                &format!("SELECT {WORK_ITEM_COLUMNS} FROM work_items WHERE id = ?1"),
                params![id],
                map_work_item,
            )
            .optional()
            .context("Failed to query work item")?;
        match item {
            Some(mut item) => {
                item.depends_on = self.dependencies_of(&item.id)?;
                Ok(Some(item))
            }
            None => Ok(None),
        }
    }

    /// List work items, optionally filtered. Ordered by priority, then most
    /// recently updated, then id.
    pub fn list_work_items(
        &self,
        project_id: Option<&str>,
        status: Option<WorkItemStatus>,
    ) -> Result<Vec<WorkItem>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {WORK_ITEM_COLUMNS} FROM work_items
                 WHERE (?1 IS NULL OR project_id = ?1) AND (?2 IS NULL OR status = ?2)
                 ORDER BY priority ASC, updated_at DESC, id ASC"
            ))
            .context("Failed to prepare list_work_items")?;
        let rows = stmt
            .query_map(
                params![project_id, status.map(|s| s.as_str())],
                map_work_item,
            )
            .context("Failed to query work items")?;
        let mut items = Vec::new();
        for row in rows {
            items.push(row.context("Failed to read work item row")?);
        }
        let mut deps = self.dependency_map()?;
        for item in &mut items {
            item.depends_on = deps.remove(&item.id).unwrap_or_default();
        }
        Ok(items)
    }

    pub fn dependencies_of(&self, id: &str) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT depends_on FROM work_item_deps WHERE work_item_id = ?1 ORDER BY depends_on")
            .context("Failed to prepare dependencies_of")?;
        let rows = stmt
            .query_map(params![id], |r| r.get::<_, String>(0))
            .context("Failed to query dependencies")?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to read dependency row")
    }

    pub fn dependents_of(&self, id: &str) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT work_item_id FROM work_item_deps WHERE depends_on = ?1 ORDER BY work_item_id")
            .context("Failed to prepare dependents_of")?;
        let rows = stmt
            .query_map(params![id], |r| r.get::<_, String>(0))
            .context("Failed to query dependents")?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to read dependent row")
    }

    /// Every dependency edge, keyed by the dependent item.
    pub fn dependency_map(&self) -> Result<HashMap<String, Vec<String>>> {
        let mut stmt = self
            .conn
            .prepare("SELECT work_item_id, depends_on FROM work_item_deps ORDER BY work_item_id, depends_on")
            .context("Failed to prepare dependency_map")?;
        let rows = stmt
            .query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)))
            .context("Failed to query dependency edges")?;
        let mut map: HashMap<String, Vec<String>> = HashMap::new();
        for row in rows {
            let (from, to) = row.context("Failed to read dependency edge")?;
            map.entry(from).or_default().push(to);
        }
        Ok(map)
    }

    pub fn work_item_status(&self, id: &str) -> Result<Option<WorkItemStatus>> {
        self.conn
            .query_row(
                "SELECT status FROM work_items WHERE id = ?1",
                params![id],
                |r| enum_col(r, 0),
            )
            .optional()
            .context("Failed to query work item status")
    }

    /// Move `id` from `expected` to `target` and append an event row.
    ///
    /// Returns `false` without writing anything when the stored status is no
    /// longer `expected`.
    pub fn compare_and_set_work_item_status(
        &self,
        id: &str,
        expected: WorkItemStatus,
        target: WorkItemStatus,
        cause: &str,
    ) -> Result<bool> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transition")?;
        let now = Utc::now();
        let changed = tx
            .execute(
                "UPDATE work_items SET status = ?1, updated_at = ?2 WHERE id = ?3 AND status = ?4",
                params![target.as_str(), now, id, expected.as_str()],
            )
            .context("Failed to update work item status")?;
        if changed == 0 {
            return Ok(false);
        }
        tx.execute(
            "INSERT INTO work_item_events (work_item_id, from_status, to_status, cause, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![id, expected.as_str(), target.as_str(), cause, now],
        )
        .context("Failed to record work item event")?;
        tx.commit().context("Failed to commit transition")?;
        Ok(true)
    }

    pub fn list_work_item_events(&self, id: &str) -> Result<Vec<WorkItemEvent>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT work_item_id, from_status, to_status, cause, created_at
                 FROM work_item_events WHERE work_item_id = ?1 ORDER BY id",
            )
            .context("Failed to prepare list_work_item_events")?;
        let rows = stmt
            .query_map(params![id], |r| {
                Ok(WorkItemEvent {
                    work_item_id: r.get(0)?,
                    from_status: enum_col(r, 1)?,
                    to_status: enum_col(r, 2)?,
                    cause: r.get(3)?,
                    created_at: r.get(4)?,
                })
            })
            .context("Failed to query work item events")?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to read work item event")
    }

    /// Edit descriptive fields. Status and dependencies are left alone.
    pub fn patch_work_item(&self, id: &str, patch: &WorkItemPatch) -> Result<Option<WorkItem>> {
        let Some(mut item) = self.get_work_item(id)? else {
            return Ok(None);
        };
        if let Some(title) = &patch.title {
            item.title = title.clone();
        }
        if let Some(goal) = &patch.goal {
            item.goal = goal.clone();
        }
        if let Some(criteria) = &patch.acceptance_criteria {
            item.acceptance_criteria = criteria.clone();
        }
        if let Some(non_goals) = &patch.non_goals {
            item.non_goals = non_goals.clone();
        }
        if let Some(stop) = &patch.stop_conditions {
            item.stop_conditions = stop.clone();
        }
        if let Some(priority) = patch.priority {
            item.priority = priority;
        }
        if let Some(tags) = &patch.tags {
            item.tags = tags.clone();
        }
        if patch.estimate_usd.is_some() {
            item.estimate_usd = patch.estimate_usd;
        }
        self.conn
            .execute(
                "UPDATE work_items SET title = ?1, goal = ?2, acceptance_criteria = ?3, non_goals = ?4,
                    stop_conditions = ?5, priority = ?6, tags = ?7, estimate_usd = ?8, updated_at = ?9
                 WHERE id = ?10",
                params![
                    item.title,
                    item.goal,
                    to_json(&item.acceptance_criteria)?,
                    to_json(&item.non_goals)?,
                    to_json(&item.stop_conditions)?,
                    item.priority,
                    to_json(&item.tags)?,
                    item.estimate_usd,
                    Utc::now(),
                    id,
                ],
            )
            .context("Failed to patch work item")?;
        self.get_work_item(id)
    }

    pub fn replace_dependencies(&self, id: &str, deps: &[String]) -> Result<()> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin dependency update")?;
        tx.execute(
            "DELETE FROM work_item_deps WHERE work_item_id = ?1",
            params![id],
        )
        .context("Failed to clear dependencies")?;
        for dep in deps {
            tx.execute(
                "INSERT INTO work_item_deps (work_item_id, depends_on) VALUES (?1, ?2)",
                params![id, dep],
            )
            .with_context(|| format!("Failed to insert dependency {} -> {}", id, dep))?;
        }
        tx.execute(
            "UPDATE work_items SET updated_at = ?1 WHERE id = ?2",
            params![Utc::now(), id],
        )
        .context("Failed to touch work item")?;
        tx.commit().context("Failed to commit dependency update")?;
        Ok(())
    }

    pub fn set_work_item_spec_path(&self, id: &str, spec_path: &str) -> Result<()> {
        self.conn
            .execute(
                "UPDATE work_items SET spec_path = ?1 WHERE id = ?2",
                params![spec_path, id],
            )
            .context("Failed to set spec path")?;
        Ok(())
    }

    /// Counts per status for the given project, or all projects.
    pub fn count_work_items_by_status(
        &self,
        project_id: Option<&str>,
    ) -> Result<HashMap<WorkItemStatus, usize>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT status, COUNT(*) FROM work_items
                 WHERE (?1 IS NULL OR project_id = ?1) GROUP BY status",
            )
            .context("Failed to prepare count_work_items_by_status")?;
        let rows = stmt
            .query_map(params![project_id], |r| {
                Ok((enum_col::<WorkItemStatus>(r, 0)?, r.get::<_, i64>(1)?))
            })
            .context("Failed to count work items")?;
        let mut counts = HashMap::new();
        for row in rows {
            let (status, n) = row.context("Failed to read work item count")?;
            counts.insert(status, n as usize);
        }
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::NewProject;

    fn item(id: &str, deps: &[&str]) -> WorkItem {
        let now = Utc::now();
        WorkItem {
            id: id.to_string(),
            project_id: "p".to_string(),
            title: format!("Item {id}"),
            goal: String::new(),
            acceptance_criteria: vec!["works".into()],
            non_goals: vec![],
            stop_conditions: vec![],
            priority: 3,
            tags: vec!["api".into()],
            depends_on: deps.iter().map(|d| d.to_string()).collect(),
            status: WorkItemStatus::Backlog,
            estimate_usd: None,
            spec_path: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn db() -> PccDb {
        let db = PccDb::new_in_memory().unwrap();
        let mut p = NewProject::new("p", "/repo");
        p.id = Some("p".into());
        db.create_project(&p).unwrap();
        db
    }

    #[test]
    fn test_insert_and_get_with_deps() {
        let db = db();
        db.insert_work_items(&[item("WO-1", &[]), item("WO-2", &["WO-1"])])
            .unwrap();
        let got = db.get_work_item("WO-2").unwrap().unwrap();
        assert_eq!(got.depends_on, vec!["WO-1"]);
        assert_eq!(got.tags, vec!["api"]);
        assert_eq!(db.dependents_of("WO-1").unwrap(), vec!["WO-2"]);
        assert_eq!(db.next_work_item_number().unwrap(), 3);
    }

    #[test]
    fn test_insert_is_atomic() {
        let db = db();
        let err = db.insert_work_items(&[item("WO-1", &["WO-404"])]);
        assert!(err.is_err());
        assert!(!db.work_item_exists("WO-1").unwrap());
    }

    #[test]
    fn test_compare_and_set_guards_stale_status() {
        let db = db();
        db.insert_work_items(&[item("WO-1", &[])]).unwrap();
        assert!(
            db.compare_and_set_work_item_status(
                "WO-1",
                WorkItemStatus::Backlog,
                WorkItemStatus::Ready,
                "test"
            )
            .unwrap()
        );
        assert!(
            !db.compare_and_set_work_item_status(
                "WO-1",
                WorkItemStatus::Backlog,
                WorkItemStatus::Blocked,
                "test"
            )
            .unwrap()
        );
        let events = db.list_work_item_events("WO-1").unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].to_status, WorkItemStatus::Ready);
    }

    #[test]
    fn test_list_filters_and_orders() {
        let db = db();
        let mut urgent = item("WO-2", &[]);
        urgent.priority = 1;
        db.insert_work_items(&[item("WO-1", &[]), urgent]).unwrap();
        let all = db.list_work_items(Some("p"), None).unwrap();
        assert_eq!(all[0].id, "WO-2");
        let ready = db
            .list_work_items(Some("p"), Some(WorkItemStatus::Ready))
            .unwrap();
        assert!(ready.is_empty());
    }

    #[test]
    fn test_patch_keeps_status() {
        let db = db();
        db.insert_work_items(&[item("WO-1", &[])]).unwrap();
        let patch = WorkItemPatch {
            title: Some("Renamed".into()),
            priority: Some(2),
            ..Default::default()
        };
        let patched = db.patch_work_item("WO-1", &patch).unwrap().unwrap();
        assert_eq!(patched.title, "Renamed");
        assert_eq!(patched.priority, 2);
        assert_eq!(patched.status, WorkItemStatus::Backlog);
    }
}
