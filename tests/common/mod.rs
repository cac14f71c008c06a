//! In-process control plane with scripted collaborators.

#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

use pcc::agent::{
    AgentOutcome, BuildRequest, CheckOutcome, CodingAgent, ReviewOutcome, Reviewer, TestSuite,
    Verdict,
};
use pcc::budget::{BudgetGovernor, BudgetSettings};
use pcc::config::CompletionPolicy;
use pcc::events::EventBus;
use pcc::exec::CommandAudit;
use pcc::merge::MergeCoordinator;
use pcc::orchestrator::run_log::RunLog;
use pcc::orchestrator::{Collaborators, OrchestratorDeps, OrchestratorSettings, RunOrchestrator};
use pcc::store::{DbHandle, NewProject};
use pcc::vm::VmManager;
use pcc::vm::retry::RetryPolicy;
use pcc::work_items::WorkItemStore;
use pcc::workspace::{MergeOutcome, Workspace, WorkspaceProvider};
use pcc_common::{Project, WorkItem, WorkItemSpec, WorkItemStatus};

pub const WAIT: Duration = Duration::from_secs(20);

pub struct Options {
    pub verdict: Verdict,
    pub max_iterations: u32,
    pub budget: BudgetSettings,
    /// Collapse `(duplicate, canonical)` while the first build is running.
    pub collapse_during_build: Option<(String, String)>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            verdict: Verdict::Approved,
            max_iterations: 5,
            budget: BudgetSettings::default(),
            collapse_during_build: None,
        }
    }
}

pub struct Agent {
    db: DbHandle,
    collapse: Mutex<Option<(String, String)>>,
    pub builds: AtomicUsize,
}

#[async_trait]
impl CodingAgent for Agent {
    async fn build(&self, _: &BuildRequest<'_>, _: &RunLog) -> Result<AgentOutcome> {
        self.builds.fetch_add(1, Ordering::SeqCst);
        let collapse = self.collapse.lock().unwrap().take();
        if let Some((duplicate, canonical)) = collapse {
            self.db
                .call(move |db| db.collapse_projects(&duplicate, &canonical))
                .await?;
        }
        Ok(AgentOutcome {
            output: "implemented".into(),
            cost_usd: 0.1,
            ..Default::default()
        })
    }
}

struct FixedReviewer(Verdict);

#[async_trait]
impl Reviewer for FixedReviewer {
    async fn review(&self, _: &WorkItem, _: &Workspace, _: &RunLog) -> Result<ReviewOutcome> {
        Ok(ReviewOutcome {
            verdict: self.0,
            feedback: "handle the empty state".into(),
            cost_usd: 0.0,
        })
    }
}

struct PassingTests;

#[async_trait]
impl TestSuite for PassingTests {
    async fn run(&self, _: &Project, _: &Workspace, _: &RunLog) -> Result<CheckOutcome> {
        Ok(CheckOutcome {
            passed: true,
            exit_code: Some(0),
            output: "ok".into(),
        })
    }
}

pub struct Worktrees {
    root: PathBuf,
    pub merges: AtomicUsize,
}

#[async_trait]
impl WorkspaceProvider for Worktrees {
    async fn create(
        &self,
        project: &Project,
        work_item: &WorkItem,
        run_id: &str,
        _: &dyn CommandAudit,
    ) -> Result<Workspace> {
        let path = self.root.join(run_id);
        std::fs::create_dir_all(&path)?;
        Ok(Workspace {
            run_id: run_id.to_string(),
            project_id: project.id.clone(),
            repo_path: PathBuf::from(&project.path),
            path,
            branch: format!("pcc/{}", work_item.id.to_lowercase()),
            trunk_branch: project.trunk_branch.clone(),
            remote: None,
        })
    }

    async fn commit_pending(&self, _: &Workspace, _: &str, _: &dyn CommandAudit) -> Result<bool> {
        Ok(true)
    }

    async fn merge_into_trunk(&self, _: &Workspace, _: &dyn CommandAudit) -> Result<MergeOutcome> {
        self.merges.fetch_add(1, Ordering::SeqCst);
        Ok(MergeOutcome::Merged)
    }

    async fn rebase_onto_trunk(&self, _: &Workspace, _: &dyn CommandAudit) -> Result<bool> {
        Ok(true)
    }

    async fn remove(&self, _: &Workspace, _: &dyn CommandAudit) -> Result<()> {
        Ok(())
    }

    async fn list_worktrees(&self) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    async fn remove_stale(&self, _: &Project, _: &str) -> Result<()> {
        Ok(())
    }
}

pub struct Env {
    pub db: DbHandle,
    pub events: EventBus,
    pub work_items: WorkItemStore,
    pub merge: MergeCoordinator,
    pub budget: BudgetGovernor,
    pub orchestrator: RunOrchestrator,
    pub agent: Arc<Agent>,
    pub worktrees: Arc<Worktrees>,
    _dir: tempfile::TempDir,
}

impl Env {
    pub async fn new(options: Options) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let db = DbHandle::in_memory().unwrap();
        let events = EventBus::new();
        let work_items = WorkItemStore::new(db.clone(), events.clone());
        let merge = MergeCoordinator::new(db.clone(), events.clone());
        let budget = BudgetGovernor::new(db.clone(), events.clone(), options.budget);
        let vm = VmManager::new(
            db.clone(),
            events.clone(),
            None,
            RetryPolicy::immediate(1),
            "/work".into(),
        );

        let agent = Arc::new(Agent {
            db: db.clone(),
            collapse: Mutex::new(options.collapse_during_build),
            builds: AtomicUsize::new(0),
        });
        let worktrees = Arc::new(Worktrees {
            root: dir.path().join("worktrees"),
            merges: AtomicUsize::new(0),
        });
        let settings = OrchestratorSettings {
            max_iterations: options.max_iterations,
            max_blocking_retries: 2,
            blocking_retry_backoff: Duration::from_millis(1),
            completion_policy: CompletionPolicy::Done,
            input_wait_timeout: Duration::from_secs(5),
            admission_wait_timeout: Duration::from_secs(5),
            merge_lock_timeout: Duration::from_secs(5),
            default_estimate_usd: 1.0,
            runs_dir: dir.path().join("runs"),
        };
        let orchestrator = RunOrchestrator::new(
            OrchestratorDeps {
                db: db.clone(),
                events: events.clone(),
                work_items: work_items.clone(),
                merge: merge.clone(),
                vm,
                budget: budget.clone(),
                collaborators: Collaborators {
                    agent: agent.clone(),
                    reviewer: Arc::new(FixedReviewer(options.verdict)),
                    tests: Arc::new(PassingTests),
                    workspaces: worktrees.clone(),
                },
            },
            settings,
        );

        Self {
            db,
            events,
            work_items,
            merge,
            budget,
            orchestrator,
            agent,
            worktrees,
            _dir: dir,
        }
    }

    pub async fn project(&self, id: &str) {
        let mut new = NewProject::new(id, &format!("/srv/{id}"));
        new.id = Some(id.to_string());
        self.db
            .call(move |db| db.create_project(&new))
            .await
            .unwrap();
    }

    /// Create a work item and move it to `ready`.
    pub async fn ready_item(&self, project_id: &str, id: &str) -> WorkItem {
        let spec = WorkItemSpec {
            id: Some(id.to_string()),
            title: format!("Work order {id}"),
            goal: "ship it".into(),
            acceptance_criteria: vec!["tests pass".into()],
            non_goals: Vec::new(),
            stop_conditions: Vec::new(),
            priority: 3,
            tags: Vec::new(),
            depends_on: Vec::new(),
            estimate_usd: None,
            body: String::new(),
        };
        self.work_items.create(project_id, spec).await.unwrap();
        self.work_items
            .transition(id, WorkItemStatus::Ready)
            .await
            .unwrap()
    }
}
