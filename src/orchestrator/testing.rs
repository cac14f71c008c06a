//! Scripted collaborators and a ready-made orchestrator for unit tests.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Result, bail};
use async_trait::async_trait;

use pcc_common::{Project, RunPhase, WorkItem, WorkItemStatus};

use super::{Collaborators, OrchestratorDeps, OrchestratorSettings, RunOrchestrator};
use crate::agent::{
    AgentOutcome, BuildMode, BuildRequest, CheckOutcome, CodingAgent, ReviewOutcome, Reviewer,
    TestSuite, Verdict,
};
use crate::budget::{BudgetGovernor, BudgetSettings};
use crate::config::CompletionPolicy;
use crate::events::EventBus;
use crate::exec::CommandAudit;
use crate::merge::MergeCoordinator;
use crate::orchestrator::run_log::RunLog;
use crate::store::{DbHandle, fixtures};
use crate::vm::VmManager;
use crate::vm::retry::RetryPolicy;
use crate::work_items::WorkItemStore;
use crate::workspace::{MergeOutcome, Workspace, WorkspaceProvider};

/// What the fakes do, in order. Empty queues fall back to the happy path.
pub struct Script {
    pub agent: Vec<AgentOutcome>,
    pub tests: Vec<bool>,
    pub merges: Vec<MergeOutcome>,
    pub rebase_clean: bool,
    pub fail_create: bool,
    pub default_verdict: Verdict,
    pub review_cost: f64,
    pub max_iterations: u32,
    pub input_wait: Duration,
    /// Move building items to `ai_review` behind the run's back as the
    /// merge lands.
    pub advance_on_merge: bool,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            agent: Vec::new(),
            tests: Vec::new(),
            merges: Vec::new(),
            rebase_clean: false,
            fail_create: false,
            default_verdict: Verdict::Approved,
            review_cost: 0.0,
            max_iterations: 10,
            input_wait: Duration::from_secs(10),
            advance_on_merge: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SeenRequest {
    pub iteration: u32,
    pub feedback: Vec<String>,
    pub human_input: Option<String>,
    pub mode: BuildMode,
}

#[derive(Default)]
pub struct FakeAgent {
    outcomes: Mutex<VecDeque<AgentOutcome>>,
    seen: Mutex<Vec<SeenRequest>>,
}

impl FakeAgent {
    pub fn calls(&self) -> usize {
        self.seen.lock().unwrap().len()
    }

    pub fn requests(&self) -> Vec<SeenRequest> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl CodingAgent for FakeAgent {
    async fn build(&self, request: &BuildRequest<'_>, log: &RunLog) -> Result<AgentOutcome> {
        self.seen.lock().unwrap().push(SeenRequest {
            iteration: request.iteration,
            feedback: request.feedback.to_vec(),
            human_input: request.human_input.map(str::to_string),
            mode: request.mode.clone(),
        });
        log.line(&format!("[fake agent] iteration {}", request.iteration))
            .await;
        Ok(self.outcomes.lock().unwrap().pop_front().unwrap_or_default())
    }
}

pub struct FakeReviewer {
    verdict: Verdict,
    cost_usd: f64,
}

#[async_trait]
impl Reviewer for FakeReviewer {
    async fn review(&self, _: &WorkItem, _: &Workspace, _: &RunLog) -> Result<ReviewOutcome> {
        Ok(ReviewOutcome {
            verdict: self.verdict,
            feedback: "please add tests".into(),
            cost_usd: self.cost_usd,
        })
    }
}

#[derive(Default)]
pub struct FakeTests {
    results: Mutex<VecDeque<bool>>,
}

#[async_trait]
impl TestSuite for FakeTests {
    async fn run(&self, _: &Project, _: &Workspace, _: &RunLog) -> Result<CheckOutcome> {
        let passed = self.results.lock().unwrap().pop_front().unwrap_or(true);
        Ok(CheckOutcome {
            passed,
            exit_code: Some(if passed { 0 } else { 1 }),
            output: if passed { "ok".into() } else { "1 test failed".into() },
        })
    }
}

pub struct FakeWorkspaces {
    root: PathBuf,
    merges: Mutex<VecDeque<MergeOutcome>>,
    rebase_clean: bool,
    fail_create: bool,
    merge_calls: Mutex<usize>,
    removed: Mutex<usize>,
    advance_on_merge: Option<DbHandle>,
}

impl FakeWorkspaces {
    pub fn merges(&self) -> usize {
        *self.merge_calls.lock().unwrap()
    }

    pub fn removed(&self) -> usize {
        *self.removed.lock().unwrap()
    }
}

#[async_trait]
impl WorkspaceProvider for FakeWorkspaces {
    async fn create(
        &self,
        project: &Project,
        work_item: &WorkItem,
        run_id: &str,
        _: &dyn CommandAudit,
    ) -> Result<Workspace> {
        if self.fail_create {
            bail!("git worktree add failed: not a git repository");
        }
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
        *self.merge_calls.lock().unwrap() += 1;
        if let Some(db) = &self.advance_on_merge {
            db.call(|db| {
                for item in db.list_work_items(None, Some(WorkItemStatus::Building))? {
                    db.compare_and_set_work_item_status(
                        &item.id,
                        WorkItemStatus::Building,
                        WorkItemStatus::AiReview,
                        "moved by hand",
                    )?;
                }
                Ok(())
            })
            .await?;
        }
        Ok(self
            .merges
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(MergeOutcome::Merged))
    }

    async fn rebase_onto_trunk(&self, _: &Workspace, _: &dyn CommandAudit) -> Result<bool> {
        Ok(self.rebase_clean)
    }

    async fn remove(&self, _: &Workspace, _: &dyn CommandAudit) -> Result<()> {
        *self.removed.lock().unwrap() += 1;
        Ok(())
    }

    async fn list_worktrees(&self) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    async fn remove_stale(&self, _: &Project, _: &str) -> Result<()> {
        Ok(())
    }
}

pub struct Harness {
    pub db: DbHandle,
    pub events: EventBus,
    pub work_items: WorkItemStore,
    pub merge: MergeCoordinator,
    pub budget: BudgetGovernor,
    pub agent: Arc<FakeAgent>,
    pub workspaces: Arc<FakeWorkspaces>,
    pub orchestrator: RunOrchestrator,
    _dir: tempfile::TempDir,
}

impl Harness {
    pub async fn new(script: Script) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let db = DbHandle::in_memory().unwrap();
        fixtures::project(&db.lock_sync().unwrap(), "p");
        let events = EventBus::new();

        let work_items = WorkItemStore::new(db.clone(), events.clone());
        let merge = MergeCoordinator::new(db.clone(), events.clone());
        let vm = VmManager::new(
            db.clone(),
            events.clone(),
            None,
            RetryPolicy::immediate(1),
            "/work".into(),
        );
        let budget = BudgetGovernor::new(db.clone(), events.clone(), BudgetSettings::default());

        let agent = Arc::new(FakeAgent {
            outcomes: Mutex::new(script.agent.into()),
            ..Default::default()
        });
        let workspaces = Arc::new(FakeWorkspaces {
            root: dir.path().join("worktrees"),
            merges: Mutex::new(script.merges.into()),
            rebase_clean: script.rebase_clean,
            fail_create: script.fail_create,
            merge_calls: Mutex::new(0),
            removed: Mutex::new(0),
            advance_on_merge: script.advance_on_merge.then(|| db.clone()),
        });
        let collaborators = Collaborators {
            agent: agent.clone(),
            reviewer: Arc::new(FakeReviewer {
                verdict: script.default_verdict,
                cost_usd: script.review_cost,
            }),
            tests: Arc::new(FakeTests {
                results: Mutex::new(script.tests.into()),
            }),
            workspaces: workspaces.clone(),
        };
        let settings = OrchestratorSettings {
            max_iterations: script.max_iterations,
            max_blocking_retries: 3,
            blocking_retry_backoff: Duration::from_millis(1),
            completion_policy: CompletionPolicy::Done,
            input_wait_timeout: script.input_wait,
            admission_wait_timeout: Duration::from_secs(10),
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
                collaborators,
            },
            settings,
        );
        Self {
            db,
            events,
            work_items,
            merge,
            budget,
            agent,
            workspaces,
            orchestrator,
            _dir: dir,
        }
    }

    pub async fn item(&self, id: &str, status: WorkItemStatus) {
        let wi = fixtures::work_item(id, "p", status);
        self.db
            .call(move |db| db.insert_work_items(&[wi]))
            .await
            .unwrap();
    }

    /// Insert a ready work item in project `p` and return its id.
    pub async fn ready_item(&self, id: &str) -> String {
        self.item(id, WorkItemStatus::Ready).await;
        id.to_string()
    }

    pub async fn status_of(&self, id: &str) -> WorkItemStatus {
        self.work_items.get(id).await.unwrap().status
    }

    pub async fn wait_for_phase(&self, run_id: &str, phase: RunPhase) {
        for _ in 0..500 {
            if self.orchestrator.get(run_id).await.unwrap().phase == phase {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("run {run_id} never reached {phase}");
    }
}
