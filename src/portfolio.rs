//! Cross-project view for outer surfaces: the communications queue, open
//! escalations, action items and the global context summary.

use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use pcc_common::{
    ActionItem, Communication, CommunicationScope, EscalationRecord, GlobalSession,
    NewCommunication, ProjectStatus, WorkItem, WorkItemStatus,
};

use crate::budget::BudgetGovernor;
use crate::errors::PortfolioError;
use crate::shift::SessionCoordinator;
use crate::store::DbHandle;
use crate::work_items::WorkItemStore;

type Result<T> = std::result::Result<T, PortfolioError>;

/// How many communications a listing returns when the caller gives no limit.
pub const DEFAULT_COMMUNICATION_LIMIT: u32 = 50;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProjectCounts {
    pub total: usize,
    pub active: usize,
    pub blocked: usize,
    pub parked: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct WorkItemCounts {
    pub ready: usize,
    pub building: usize,
    pub blocked: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PortfolioBudget {
    pub remaining_usd: f64,
    pub burn_rate_usd_per_day: f64,
    /// `None` while nothing is being spent.
    pub runway_days: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct GlobalContext {
    pub projects: ProjectCounts,
    pub work_items: WorkItemCounts,
    pub open_escalations: usize,
    pub active_shifts: usize,
    pub budget: PortfolioBudget,
    pub session: Option<GlobalSession>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Posted {
    pub communication: Communication,
    /// Set when this message paused an autonomous session.
    pub paused_session: Option<GlobalSession>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ActionOutcome {
    WorkOrder { work_item: WorkItem },
    Communication(Posted),
}

#[derive(Clone)]
pub struct Portfolio {
    db: DbHandle,
    work_items: WorkItemStore,
    budget: BudgetGovernor,
    sessions: SessionCoordinator,
}

impl Portfolio {
    pub fn new(
        db: DbHandle,
        work_items: WorkItemStore,
        budget: BudgetGovernor,
        sessions: SessionCoordinator,
    ) -> Self {
        Self {
            db,
            work_items,
            budget,
            sessions,
        }
    }

    pub async fn global_context(&self) -> Result<GlobalContext> {
        let (projects, by_status, open_escalations, active_shifts) = self
            .db
            .call(|db| {
                Ok((
                    db.list_projects()?,
                    db.count_work_items_by_status(None)?,
                    db.list_escalations(None, true)?.len(),
                    db.list_active_shifts()?.len(),
                ))
            })
            .await?;

        let mut counts = ProjectCounts {
            total: projects.len(),
            ..Default::default()
        };
        for project in &projects {
            match project.status {
                ProjectStatus::Active => counts.active += 1,
                ProjectStatus::Blocked => counts.blocked += 1,
                ProjectStatus::Parked => counts.parked += 1,
            }
        }

        let count = |s: WorkItemStatus| by_status.get(&s).copied().unwrap_or(0);
        let work_items = WorkItemCounts {
            ready: count(WorkItemStatus::Ready),
            building: count(WorkItemStatus::Building),
            blocked: count(WorkItemStatus::Blocked),
        };

        let snapshots = self.budget.list_snapshots().await?;
        let remaining_usd: f64 = snapshots.iter().map(|s| s.remaining_usd.max(0.0)).sum();
        let burn_rate_usd_per_day: f64 = snapshots.iter().map(|s| s.burn_rate_usd_per_day).sum();
        let runway_days = (burn_rate_usd_per_day > 0.0).then(|| remaining_usd / burn_rate_usd_per_day);

        Ok(GlobalContext {
            projects: counts,
            work_items,
            open_escalations,
            active_shifts,
            budget: PortfolioBudget {
                remaining_usd,
                burn_rate_usd_per_day,
                runway_days,
            },
            session: self.sessions.current().await?,
        })
    }

    async fn canonical_project(&self, project_id: &str) -> Result<String> {
        let key = project_id.to_string();
        self.db
            .call(move |db| db.resolve_canonical(&key))
            .await?
            .ok_or_else(|| PortfolioError::ProjectNotFound {
                project_id: project_id.to_string(),
            })
    }

    /// Queue a message. Global and user scoped messages interrupt an
    /// autonomous session.
    pub async fn post_communication(
        &self,
        project_id: Option<&str>,
        communication: NewCommunication,
    ) -> Result<Posted> {
        communication.validate().map_err(PortfolioError::Invalid)?;
        let project_id = match project_id {
            Some(pid) => Some(self.canonical_project(pid).await?),
            None if communication.scope == CommunicationScope::Project => {
                return Err(PortfolioError::Invalid(
                    "project scoped communication needs a project_id".to_string(),
                ));
            }
            None => None,
        };

        let id = Uuid::new_v4().to_string();
        let scope = communication.scope;
        let stored = self
            .db
            .call(move |db| db.insert_communication(&id, project_id.as_deref(), &communication))
            .await?;
        info!(
            communication_id = %stored.id,
            kind = %stored.kind,
            scope = %stored.scope,
            "Communication posted"
        );

        let paused_session = match scope {
            CommunicationScope::Global | CommunicationScope::User => {
                let reason = format!("{}: {}", stored.kind, stored.summary);
                self.sessions.interrupt(&reason).await?
            }
            CommunicationScope::Project => None,
        };
        if let Some(session) = &paused_session {
            info!(session_id = %session.id, "Session paused by incoming communication");
        }
        Ok(Posted {
            communication: stored,
            paused_session,
        })
    }

    pub async fn communications(
        &self,
        project_id: Option<&str>,
        unacknowledged_only: bool,
        limit: Option<u32>,
    ) -> Result<Vec<Communication>> {
        let pid = match project_id {
            Some(pid) => Some(self.canonical_project(pid).await?),
            None => None,
        };
        let limit = limit.unwrap_or(DEFAULT_COMMUNICATION_LIMIT);
        Ok(self
            .db
            .call(move |db| db.list_communications(pid.as_deref(), unacknowledged_only, limit))
            .await?)
    }

    pub async fn acknowledge(&self, communication_id: &str) -> Result<Communication> {
        let key = communication_id.to_string();
        self.db
            .call(move |db| db.acknowledge_communication(&key))
            .await?
            .ok_or_else(|| PortfolioError::CommunicationNotFound {
                id: communication_id.to_string(),
            })
    }

    pub async fn escalations(
        &self,
        project_id: Option<&str>,
        open_only: bool,
    ) -> Result<Vec<EscalationRecord>> {
        let pid = match project_id {
            Some(pid) => Some(self.canonical_project(pid).await?),
            None => None,
        };
        Ok(self
            .db
            .call(move |db| db.list_escalations(pid.as_deref(), open_only))
            .await?)
    }

    /// Close an escalation. Resolving one that is already closed returns it
    /// unchanged.
    pub async fn resolve_escalation(&self, escalation_id: &str) -> Result<EscalationRecord> {
        let key = escalation_id.to_string();
        let resolved = self
            .db
            .call(move |db| db.resolve_escalation(&key))
            .await?
            .ok_or_else(|| PortfolioError::EscalationNotFound {
                id: escalation_id.to_string(),
            })?;
        info!(
            escalation_id = %resolved.id,
            project_id = %resolved.project_id,
            reason = %resolved.reason,
            "Escalation resolved"
        );
        Ok(resolved)
    }

    /// Apply an action item proposed by an outer surface.
    pub async fn apply_action(&self, action: ActionItem) -> Result<ActionOutcome> {
        action.validate().map_err(PortfolioError::Invalid)?;
        match action {
            ActionItem::WorkOrder { project_id, spec } => {
                let pid = self.canonical_project(&project_id).await?;
                let work_item = self.work_items.create(&pid, spec).await?;
                Ok(ActionOutcome::WorkOrder { work_item })
            }
            ActionItem::Communication {
                project_id,
                communication,
            } => {
                let posted = self
                    .post_communication(project_id.as_deref(), communication)
                    .await?;
                Ok(ActionOutcome::Communication(posted))
            }
        }
    }
}
