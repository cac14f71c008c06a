//! Work order CRUD, the status state machine, and the dependency graph.
//!
//! All status changes go through [`WorkItemStore`]. Transitions on one id are
//! serialized by a per-id async mutex and a compare-and-set on the stored
//! status, so two callers racing on the same item cannot both win.

pub mod graph;
pub mod spec_file;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use dashmap::DashMap;
use tracing::{debug, info};

use pcc_common::{
    ControlEvent, WorkItem, WorkItemEvent, WorkItemPatch, WorkItemSpec, WorkItemStatus,
};

use crate::errors::WorkItemError;
use crate::events::EventBus;
use crate::store::{DbHandle, PccDb};

type Result<T> = std::result::Result<T, WorkItemError>;

/// Edges available to callers of [`WorkItemStore::transition`].
pub fn is_valid_transition(from: WorkItemStatus, to: WorkItemStatus) -> bool {
    use WorkItemStatus::*;
    matches!(
        (from, to),
        (Backlog, Ready)
            | (Ready, Building)
            | (Building, AiReview)
            | (AiReview, YouReview)
            | (YouReview, Done)
            | (YouReview, Parked)
            | (Backlog, Blocked)
            | (Blocked, Ready)
    )
}

/// Edges the orchestrator may additionally take: abandoning a run puts its
/// work item back to `ready`.
pub fn is_valid_system_transition(from: WorkItemStatus, to: WorkItemStatus) -> bool {
    is_valid_transition(from, to) || (from, to) == (WorkItemStatus::Building, WorkItemStatus::Ready)
}

#[derive(Clone)]
pub struct WorkItemStore {
    db: DbHandle,
    events: EventBus,
    spec_dir: Option<PathBuf>,
    locks: Arc<DashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl WorkItemStore {
    pub fn new(db: DbHandle, events: EventBus) -> Self {
        Self {
            db,
            events,
            spec_dir: None,
            locks: Arc::new(DashMap::new()),
        }
    }

    /// Write each created work order's spec document under `dir/<project>/`.
    pub fn with_spec_dir(mut self, dir: PathBuf) -> Self {
        self.spec_dir = Some(dir);
        self
    }

    fn lock_for(&self, id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    pub async fn create(&self, project_id: &str, spec: WorkItemSpec) -> Result<WorkItem> {
        let mut created = self.import(project_id, vec![spec]).await?;
        created
            .pop()
            .ok_or_else(|| WorkItemError::Other(anyhow::anyhow!("Import returned no work item")))
    }

    /// Create several work orders at once. The combined graph is checked
    /// before anything is written; either all are created or none.
    pub async fn import(&self, project_id: &str, specs: Vec<WorkItemSpec>) -> Result<Vec<WorkItem>> {
        for spec in &specs {
            spec.validate().map_err(WorkItemError::InvalidSpec)?;
        }
        let project_id = project_id.to_string();
        let items = self
            .db
            .call(move |db| Ok(build_import(db, &project_id, specs)))
            .await??;

        for item in &items {
            info!(work_item_id = %item.id, project_id = %item.project_id, "Work item created");
        }
        if let Some(dir) = &self.spec_dir {
            for item in &items {
                self.write_spec_file(dir, item).await?;
            }
        }
        Ok(items)
    }

    async fn write_spec_file(&self, dir: &std::path::Path, item: &WorkItem) -> Result<()> {
        let body = item.goal.clone();
        let doc = spec_file::render_spec_document(item, &body)?;
        let project_dir = dir.join(&item.project_id);
        let path = project_dir.join(format!("{}.md", item.id));
        tokio::fs::create_dir_all(&project_dir)
            .await
            .with_context(|| format!("Failed to create {}", project_dir.display()))?;
        tokio::fs::write(&path, doc)
            .await
            .with_context(|| format!("Failed to write {}", path.display()))?;
        let id = item.id.clone();
        let spec_path = path.display().to_string();
        self.db
            .call(move |db| db.set_work_item_spec_path(&id, &spec_path))
            .await?;
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Result<WorkItem> {
        let key = id.to_string();
        self.db
            .call(move |db| db.get_work_item(&key))
            .await?
            .ok_or_else(|| WorkItemError::NotFound { id: id.to_string() })
    }

    pub async fn list(
        &self,
        project_id: Option<&str>,
        status: Option<WorkItemStatus>,
    ) -> Result<Vec<WorkItem>> {
        let project_id = project_id.map(str::to_string);
        Ok(self
            .db
            .call(move |db| db.list_work_items(project_id.as_deref(), status))
            .await?)
    }

    pub async fn events(&self, id: &str) -> Result<Vec<WorkItemEvent>> {
        let key = id.to_string();
        Ok(self.db.call(move |db| db.list_work_item_events(&key)).await?)
    }

    /// Move a work item along one of the allowed edges.
    ///
    /// Entering `ready` requires every dependency to be `done`. Entering
    /// `done` promotes dependents whose dependencies are now all satisfied.
    pub async fn transition(&self, id: &str, target: WorkItemStatus) -> Result<WorkItem> {
        self.apply(id, None, target, "manual", is_valid_transition)
            .await
    }

    /// Transition used by the orchestrator, which also may take
    /// `building -> ready`. When `expected` is set, the item must currently be
    /// in that status.
    pub async fn system_transition(
        &self,
        id: &str,
        expected: Option<WorkItemStatus>,
        target: WorkItemStatus,
        cause: &str,
    ) -> Result<WorkItem> {
        self.apply(id, expected, target, cause, is_valid_system_transition)
            .await
    }

    async fn apply(
        &self,
        id: &str,
        expected: Option<WorkItemStatus>,
        target: WorkItemStatus,
        cause: &str,
        allowed: fn(WorkItemStatus, WorkItemStatus) -> bool,
    ) -> Result<WorkItem> {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        let key = id.to_string();
        let cause_owned = cause.to_string();
        let (item, from) = self
            .db
            .call(move |db| Ok(transition_in_db(db, &key, expected, target, &cause_owned, allowed)))
            .await??;
        debug!(work_item_id = %id, from = %from, to = %target, cause, "Work item transitioned");
        self.events.publish(ControlEvent::WorkItemMoved {
            work_item_id: id.to_string(),
            from,
            to: target,
        });

        if target == WorkItemStatus::Done {
            self.cascade_from(id).await?;
        }
        Ok(item)
    }

    /// Promote dependents of a work item that just reached `done`.
    pub async fn cascade_from(&self, done_id: &str) -> Result<Vec<String>> {
        let key = done_id.to_string();
        let promoted = self
            .db
            .call(move |db| {
                let deps = db.dependency_map()?;
                let statuses = statuses_for(db, &deps)?;
                let cause = format!("dependencies satisfied by {key}");
                let mut promoted = Vec::new();
                for id in graph::cascade_candidates(&key, &deps, &statuses) {
                    if db.compare_and_set_work_item_status(
                        &id,
                        WorkItemStatus::Backlog,
                        WorkItemStatus::Ready,
                        &cause,
                    )? {
                        promoted.push(id);
                    }
                }
                Ok(promoted)
            })
            .await?;
        for id in &promoted {
            info!(work_item_id = %id, trigger = %done_id, "Work item auto-promoted to ready");
            self.events.publish(ControlEvent::WorkItemMoved {
                work_item_id: id.clone(),
                from: WorkItemStatus::Backlog,
                to: WorkItemStatus::Ready,
            });
        }
        Ok(promoted)
    }

    pub async fn patch(&self, id: &str, patch: WorkItemPatch) -> Result<WorkItem> {
        if let Some(priority) = patch.priority
            && !(1..=5).contains(&priority)
        {
            return Err(WorkItemError::InvalidSpec(format!(
                "priority must be between 1 and 5, got {priority}"
            )));
        }
        if let Some(title) = &patch.title
            && title.trim().is_empty()
        {
            return Err(WorkItemError::InvalidSpec("title is required".to_string()));
        }
        let key = id.to_string();
        self.db
            .call(move |db| db.patch_work_item(&key, &patch))
            .await?
            .ok_or_else(|| WorkItemError::NotFound { id: id.to_string() })
    }

    /// Replace the dependency list of a work item.
    ///
    /// Rejects unknown ids and cycles. A `ready` item may not gain a
    /// dependency that is not done. A `backlog` item whose new dependencies
    /// are all done is promoted to `ready`.
    pub async fn set_dependencies(&self, id: &str, deps: Vec<String>) -> Result<WorkItem> {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        let key = id.to_string();
        let (item, promoted) = self
            .db
            .call(move |db| Ok(set_dependencies_in_db(db, &key, deps)))
            .await??;
        if promoted {
            self.events.publish(ControlEvent::WorkItemMoved {
                work_item_id: id.to_string(),
                from: WorkItemStatus::Backlog,
                to: WorkItemStatus::Ready,
            });
        }
        Ok(item)
    }
}

fn statuses_for(
    db: &PccDb,
    deps: &HashMap<String, Vec<String>>,
) -> anyhow::Result<HashMap<String, WorkItemStatus>> {
    let mut statuses = HashMap::new();
    for (id, ds) in deps {
        for key in std::iter::once(id).chain(ds.iter()) {
            if !statuses.contains_key(key)
                && let Some(status) = db.work_item_status(key)?
            {
                statuses.insert(key.clone(), status);
            }
        }
    }
    Ok(statuses)
}

fn build_import(db: &PccDb, project_id: &str, specs: Vec<WorkItemSpec>) -> Result<Vec<WorkItem>> {
    let canonical = db
        .resolve_canonical(project_id)?
        .ok_or_else(|| WorkItemError::ProjectNotFound {
            id: project_id.to_string(),
        })?;

    let mut next = db.next_work_item_number()?;
    let now = Utc::now();
    let mut items = Vec::with_capacity(specs.len());
    for spec in specs {
        let id = match spec.id {
            Some(id) => id,
            None => loop {
                let candidate = format!("WO-{next}");
                next += 1;
                if !db.work_item_exists(&candidate)? {
                    break candidate;
                }
            },
        };
        let goal = if spec.goal.is_empty() { spec.body } else { spec.goal };
        items.push(WorkItem {
            id,
            project_id: canonical.clone(),
            title: spec.title,
            goal,
            acceptance_criteria: spec.acceptance_criteria,
            non_goals: spec.non_goals,
            stop_conditions: spec.stop_conditions,
            priority: spec.priority,
            tags: spec.tags,
            depends_on: spec.depends_on,
            status: WorkItemStatus::Backlog,
            estimate_usd: spec.estimate_usd,
            spec_path: None,
            created_at: now,
            updated_at: now,
        });
    }

    let mut graph = db.dependency_map()?;
    let mut batch_ids = std::collections::HashSet::new();
    for item in &items {
        if !batch_ids.insert(item.id.clone()) || db.work_item_exists(&item.id)? {
            return Err(WorkItemError::DuplicateId { id: item.id.clone() });
        }
    }
    for item in &items {
        for dep in &item.depends_on {
            if !batch_ids.contains(dep) && !db.work_item_exists(dep)? {
                return Err(WorkItemError::UnknownDependency {
                    id: item.id.clone(),
                    dependency: dep.clone(),
                });
            }
        }
        graph.insert(item.id.clone(), item.depends_on.clone());
    }
    graph::topological_order(&graph).map_err(|path| WorkItemError::DependencyCycle { path })?;

    db.insert_work_items(&items)?;
    Ok(items)
}

fn transition_in_db(
    db: &PccDb,
    id: &str,
    expected: Option<WorkItemStatus>,
    target: WorkItemStatus,
    cause: &str,
    allowed: fn(WorkItemStatus, WorkItemStatus) -> bool,
) -> Result<(WorkItem, WorkItemStatus)> {
    let item = db
        .get_work_item(id)?
        .ok_or_else(|| WorkItemError::NotFound { id: id.to_string() })?;
    let from = item.status;
    if let Some(expected) = expected
        && expected != from
    {
        return Err(WorkItemError::Conflict {
            id: id.to_string(),
            expected,
        });
    }
    if !allowed(from, target) {
        return Err(WorkItemError::InvalidTransition {
            id: id.to_string(),
            from,
            to: target,
        });
    }
    if target == WorkItemStatus::Ready {
        let mut statuses = HashMap::new();
        for dep in &item.depends_on {
            if let Some(status) = db.work_item_status(dep)? {
                statuses.insert(dep.clone(), status);
            }
        }
        let pending = graph::pending_dependencies(&item.depends_on, &statuses);
        if !pending.is_empty() {
            return Err(WorkItemError::DependenciesNotDone {
                id: id.to_string(),
                pending,
            });
        }
    }
    if !db.compare_and_set_work_item_status(id, from, target, cause)? {
        return Err(WorkItemError::Conflict {
            id: id.to_string(),
            expected: from,
        });
    }
    let item = db
        .get_work_item(id)?
        .ok_or_else(|| WorkItemError::NotFound { id: id.to_string() })?;
    Ok((item, from))
}

fn set_dependencies_in_db(db: &PccDb, id: &str, deps: Vec<String>) -> Result<(WorkItem, bool)> {
    let item = db
        .get_work_item(id)?
        .ok_or_else(|| WorkItemError::NotFound { id: id.to_string() })?;
    let mut deps = deps;
    deps.sort();
    deps.dedup();
    for dep in &deps {
        if dep == id {
            return Err(WorkItemError::DependencyCycle {
                path: vec![id.to_string(), id.to_string()],
            });
        }
        if !db.work_item_exists(dep)? {
            return Err(WorkItemError::UnknownDependency {
                id: id.to_string(),
                dependency: dep.clone(),
            });
        }
    }
    let mut graph = db.dependency_map()?;
    graph.insert(id.to_string(), deps.clone());
    graph::topological_order(&graph).map_err(|path| WorkItemError::DependencyCycle { path })?;

    let mut statuses = HashMap::new();
    for dep in &deps {
        if let Some(status) = db.work_item_status(dep)? {
            statuses.insert(dep.clone(), status);
        }
    }
    let pending = graph::pending_dependencies(&deps, &statuses);
    if item.status == WorkItemStatus::Ready && !pending.is_empty() {
        return Err(WorkItemError::DependenciesNotDone {
            id: id.to_string(),
            pending,
        });
    }

    db.replace_dependencies(id, &deps)?;
    let promoted = item.status == WorkItemStatus::Backlog
        && !deps.is_empty()
        && pending.is_empty()
        && db.compare_and_set_work_item_status(
            id,
            WorkItemStatus::Backlog,
            WorkItemStatus::Ready,
            "dependencies satisfied",
        )?;
    let item = db
        .get_work_item(id)?
        .ok_or_else(|| WorkItemError::NotFound { id: id.to_string() })?;
    Ok((item, promoted))
}
