//! Run orchestration.
//!
//! [`RunOrchestrator`] turns a `ready` work item into a run, asks the budget
//! governor for admission and drives the admitted run through its pipeline on
//! a background task. Callers observe progress through the event bus or by
//! polling the run record; nothing here blocks on a run finishing except
//! [`RunOrchestrator::wait`].

mod pipeline;
pub mod run_log;

#[cfg(test)]
pub(crate) mod testing;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use pcc_common::{
    ControlEvent, EscalationRecord, FailureReason, Run, RunCommand, RunPhase, RunStatus, WorkItem,
    WorkItemStatus,
};

use crate::agent::{CodingAgent, Reviewer, TestSuite};
use crate::budget::{Admission, BudgetGovernor, Released, RescueOffer};
use crate::config::{CompletionPolicy, PccToml};
use crate::errors::RunError;
use crate::events::EventBus;
use crate::merge::MergeCoordinator;
use crate::store::DbHandle;
use crate::vm::VmManager;
use crate::work_items::WorkItemStore;
use crate::workspace::WorkspaceProvider;

pub use pipeline::Ending;
use pipeline::Pipeline;
use run_log::RunLog;

type Result<T> = std::result::Result<T, RunError>;

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub max_iterations: u32,
    pub max_blocking_retries: u32,
    pub blocking_retry_backoff: Duration,
    pub completion_policy: CompletionPolicy,
    pub input_wait_timeout: Duration,
    pub admission_wait_timeout: Duration,
    pub merge_lock_timeout: Duration,
    pub default_estimate_usd: f64,
    /// Per-run logs live at `<runs_dir>/<run_id>/run.log`.
    pub runs_dir: PathBuf,
}

impl OrchestratorSettings {
    pub fn from_config(toml: &PccToml) -> Self {
        let o = &toml.orchestrator;
        Self {
            max_iterations: o.max_iterations,
            max_blocking_retries: o.max_blocking_retries,
            blocking_retry_backoff: Duration::from_millis(o.blocking_retry_backoff_ms),
            completion_policy: o.completion_policy,
            input_wait_timeout: Duration::from_secs(o.input_wait_timeout_secs),
            admission_wait_timeout: Duration::from_secs(o.admission_wait_timeout_secs),
            merge_lock_timeout: Duration::from_secs(o.merge_lock_timeout_secs),
            default_estimate_usd: o.default_estimate_usd,
            runs_dir: toml.store.artifacts_dir.join("runs"),
        }
    }
}

/// The external processes a run drives.
#[derive(Clone)]
pub struct Collaborators {
    pub agent: Arc<dyn CodingAgent>,
    pub reviewer: Arc<dyn Reviewer>,
    pub tests: Arc<dyn TestSuite>,
    pub workspaces: Arc<dyn WorkspaceProvider>,
}

pub struct OrchestratorDeps {
    pub db: DbHandle,
    pub events: EventBus,
    pub work_items: WorkItemStore,
    pub merge: MergeCoordinator,
    pub vm: VmManager,
    pub budget: BudgetGovernor,
    pub collaborators: Collaborators,
}

struct ActiveRun {
    cancel: CancellationToken,
    input: mpsc::Sender<String>,
}

pub(crate) struct Inner {
    db: DbHandle,
    events: EventBus,
    work_items: WorkItemStore,
    merge: MergeCoordinator,
    vm: VmManager,
    budget: BudgetGovernor,
    collaborators: Collaborators,
    settings: OrchestratorSettings,
    active: DashMap<String, ActiveRun>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum EnqueueOutcome {
    Started {
        run: Run,
    },
    Queued {
        run: Run,
        position: usize,
    },
    /// The run was recorded as failed without ever running.
    Denied {
        run: Run,
        escalation: EscalationRecord,
        rescue: RescueOffer,
    },
}

impl EnqueueOutcome {
    pub fn run(&self) -> &Run {
        match self {
            Self::Started { run } | Self::Queued { run, .. } | Self::Denied { run, .. } => run,
        }
    }
}

/// What `recover` cleaned up after an unclean shutdown.
#[derive(Debug, Default, PartialEq, Serialize)]
pub struct Recovery {
    pub runs_failed: usize,
    pub locks_released: usize,
    pub work_items_reset: usize,
}

#[derive(Clone)]
pub struct RunOrchestrator {
    inner: Arc<Inner>,
}

impl RunOrchestrator {
    pub fn new(deps: OrchestratorDeps, settings: OrchestratorSettings) -> Self {
        Self {
            inner: Arc::new(Inner {
                db: deps.db,
                events: deps.events,
                work_items: deps.work_items,
                merge: deps.merge,
                vm: deps.vm,
                budget: deps.budget,
                collaborators: deps.collaborators,
                settings,
                active: DashMap::new(),
            }),
        }
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.inner.settings
    }

    /// Number of runs with a live task in this process.
    pub fn active_count(&self) -> usize {
        self.inner.active.len()
    }

    pub async fn enqueue(&self, work_item_id: &str) -> Result<EnqueueOutcome> {
        let work_item = self.inner.work_items.get(work_item_id).await?;
        if work_item.status != WorkItemStatus::Ready {
            return Err(RunError::NotReady {
                id: work_item.id,
                status: work_item.status,
            });
        }

        let run_id = Uuid::new_v4().to_string();
        let (rid, wid, raw_pid) = (
            run_id.clone(),
            work_item.id.clone(),
            work_item.project_id.clone(),
        );
        let run = self
            .inner
            .db
            .call(move |db| {
                let pid = db.resolve_canonical(&raw_pid)?.unwrap_or(raw_pid);
                db.create_run(&rid, &wid, &pid)
            })
            .await?
            .ok_or_else(|| RunError::AlreadyActive {
                work_item_id: work_item.id.clone(),
            })?;

        let estimate = work_item
            .estimate_usd
            .unwrap_or(self.inner.settings.default_estimate_usd);
        let admission = match self
            .inner
            .budget
            .request_admission(&run.project_id, &run.id, estimate, work_item.priority)
            .await
        {
            Ok(admission) => admission,
            Err(e) => {
                let detail = format!("admission failed: {e}");
                self.abandon(&run, RunStatus::Failed, &detail, Some(FailureReason::Internal))
                    .await;
                return Err(e.into());
            }
        };

        match admission {
            Admission::Admitted { reserved_usd } => {
                info!(run_id = %run.id, work_item_id = %work_item.id, reserved_usd, "Run admitted");
                self.launch(run.clone(), work_item, None);
                Ok(EnqueueOutcome::Started { run })
            }
            Admission::Queued { position, ticket } => {
                info!(run_id = %run.id, work_item_id = %work_item.id, position, "Run queued for budget");
                self.launch(run.clone(), work_item, Some(ticket));
                Ok(EnqueueOutcome::Queued { run, position })
            }
            Admission::Denied { escalation, rescue } => {
                warn!(run_id = %run.id, work_item_id = %work_item.id, escalation_id = %escalation.id, "Run denied: budget exhausted");
                let detail = format!(
                    "{}: project {} has no budget left",
                    FailureReason::BudgetExhausted.describe(),
                    run.project_id
                );
                self.abandon(&run, RunStatus::Failed, &detail, Some(FailureReason::BudgetExhausted))
                    .await;
                let run = self.get(&run.id).await?;
                Ok(EnqueueOutcome::Denied {
                    run,
                    escalation,
                    rescue,
                })
            }
        }
    }

    fn launch(&self, run: Run, work_item: WorkItem, ticket: Option<oneshot::Receiver<Released>>) {
        let cancel = CancellationToken::new();
        let (input_tx, input_rx) = mpsc::channel(4);
        self.inner.active.insert(
            run.id.clone(),
            ActiveRun {
                cancel: cancel.clone(),
                input: input_tx,
            },
        );

        let this = self.clone();
        tokio::spawn(async move {
            if let Some(ticket) = ticket
                && let Err((status, detail, reason)) = this.await_release(&run, ticket, &cancel).await
            {
                this.abandon(&run, status, &detail, reason).await;
                this.inner.active.remove(&run.id);
                return;
            }

            let path = this.inner.settings.runs_dir.join(&run.id).join("run.log");
            let log = match RunLog::open(&run.id, this.inner.db.clone(), path).await {
                Ok(log) => log,
                Err(e) => {
                    warn!(run_id = %run.id, error = %e, "Run log unavailable, continuing without a file");
                    RunLog::detached(&run.id)
                }
            };
            let pipeline = Pipeline::new(
                this.inner.clone(),
                run.id.clone(),
                run.project_id.clone(),
                work_item,
                log,
                cancel,
                input_rx,
            );
            pipeline.run().await;
            this.inner.active.remove(&run.id);
        });
    }

    /// Wait for a queued run's reservation.
    async fn await_release(
        &self,
        run: &Run,
        ticket: oneshot::Receiver<Released>,
        cancel: &CancellationToken,
    ) -> std::result::Result<(), (RunStatus, String, Option<FailureReason>)> {
        let timeout = self.inner.settings.admission_wait_timeout;
        tokio::select! {
            released = ticket => match released {
                Ok(Released { reserved_usd }) => {
                    info!(run_id = %run.id, reserved_usd, "Queued run released");
                    Ok(())
                }
                Err(_) => Err((
                    RunStatus::Failed,
                    format!("{}: admission ticket dropped", FailureReason::Internal.describe()),
                    Some(FailureReason::Internal),
                )),
            },
            _ = cancel.cancelled() => Err((RunStatus::Cancelled, "cancelled".to_string(), None)),
            _ = tokio::time::sleep(timeout) => Err((
                RunStatus::Failed,
                format!(
                    "{}: still queued after {}s",
                    FailureReason::AdmissionWaitTimedOut.describe(),
                    timeout.as_secs()
                ),
                Some(FailureReason::AdmissionWaitTimedOut),
            )),
        }
    }

    /// End a run that never reached its pipeline.
    async fn abandon(
        &self,
        run: &Run,
        status: RunStatus,
        detail: &str,
        reason: Option<FailureReason>,
    ) {
        let (rid, err) = (run.id.clone(), detail.to_string());
        if let Err(e) = self
            .inner
            .db
            .call(move |db| db.finish_run(&rid, status, Some(&err), reason))
            .await
        {
            warn!(run_id = %run.id, error = %e, "Failed to record run result");
        }
        if let Err(e) = self.inner.budget.finish_run(&run.project_id, &run.id).await {
            warn!(run_id = %run.id, error = %e, "Failed to release budget reservation");
        }
        info!(run_id = %run.id, status = %status, error = detail, "Run finished before starting");
        self.inner.events.publish(ControlEvent::RunFinished {
            run_id: run.id.clone(),
            status,
            error: Some(detail.to_string()),
        });
    }

    pub async fn get(&self, run_id: &str) -> Result<Run> {
        let key = run_id.to_string();
        self.inner
            .db
            .call(move |db| db.get_run(&key))
            .await?
            .ok_or_else(|| RunError::NotFound {
                id: run_id.to_string(),
            })
    }

    pub async fn list_for_work_item(&self, work_item_id: &str) -> Result<Vec<Run>> {
        let key = work_item_id.to_string();
        Ok(self
            .inner
            .db
            .call(move |db| db.list_runs_for_work_item(&key))
            .await?)
    }

    /// Request cancellation. The run's task observes it between phases and
    /// at iteration boundaries.
    pub async fn cancel(&self, run_id: &str) -> Result<Run> {
        let run = self.get(run_id).await?;
        if run.status.is_terminal() {
            return Err(RunError::AlreadyFinished {
                id: run.id,
                status: run.status,
            });
        }
        let signalled = match self.inner.active.get(run_id) {
            Some(active) => {
                active.cancel.cancel();
                true
            }
            None => false,
        };
        if signalled {
            info!(run_id, "Run cancellation requested");
        } else {
            // No task owns it; it was left behind by another process.
            self.abandon(&run, RunStatus::Cancelled, "cancelled", None).await;
        }
        self.get(run_id).await
    }

    pub async fn provide_input(&self, run_id: &str, text: &str) -> Result<()> {
        let run = self.get(run_id).await?;
        if run.status.is_terminal() {
            return Err(RunError::AlreadyFinished {
                id: run.id,
                status: run.status,
            });
        }
        if run.phase != RunPhase::WaitingForInput {
            return Err(RunError::NotWaitingForInput { id: run.id });
        }
        let sender = self
            .inner
            .active
            .get(run_id)
            .map(|a| a.input.clone())
            .ok_or_else(|| RunError::NotWaitingForInput { id: run.id.clone() })?;
        sender
            .send(text.to_string())
            .await
            .map_err(|_| RunError::NotWaitingForInput { id: run.id })?;
        info!(run_id, "Input delivered to run");
        Ok(())
    }

    pub async fn log_tail(&self, run_id: &str, lines: usize) -> Result<Vec<String>> {
        let run = self.get(run_id).await?;
        let Some(path) = run.log_path else {
            return Ok(Vec::new());
        };
        Ok(run_log::tail_lines(std::path::Path::new(&path), lines).await?)
    }

    pub async fn commands(&self, run_id: &str) -> Result<Vec<RunCommand>> {
        self.get(run_id).await?;
        let key = run_id.to_string();
        Ok(self.inner.db.call(move |db| db.list_run_commands(&key)).await?)
    }

    /// Block until the run is terminal or `timeout` passes, returning the
    /// latest record either way.
    pub async fn wait(&self, run_id: &str, timeout: Duration) -> Result<Run> {
        let mut rx = self.inner.events.subscribe();
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let run = self.get(run_id).await?;
            if run.status.is_terminal() {
                return Ok(run);
            }
            loop {
                let event = tokio::select! {
                    event = rx.recv() => event,
                    _ = tokio::time::sleep_until(deadline) => return self.get(run_id).await,
                };
                match event {
                    Ok(ControlEvent::RunFinished { run_id: id, .. }) if id == run_id => break,
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(_)) => break,
                    Err(broadcast::error::RecvError::Closed) => return self.get(run_id).await,
                }
            }
        }
    }

    /// Clean up after a process that stopped mid-run: nothing in this process
    /// owns those runs, so they are failed and their resources returned.
    pub async fn recover(&self) -> Result<Recovery> {
        let detail = format!("{}: interrupted by restart", FailureReason::Internal.describe());
        let (summary, reset) = self
            .inner
            .db
            .call(move |db| {
                let mut summary = Recovery::default();
                db.clear_budget_reservations()?;
                let mut orphans = db.list_runs_with_status(RunStatus::Queued)?;
                orphans.extend(db.list_runs_with_status(RunStatus::Running)?);
                let orphan_ids: Vec<&str> = orphans.iter().map(|r| r.id.as_str()).collect();
                for lock in db.list_merge_locks()? {
                    if orphan_ids.contains(&lock.run_id.as_str()) {
                        db.delete_merge_lock(&lock.id)?;
                        summary.locks_released += 1;
                    }
                }
                for run in &orphans {
                    if db.finish_run(&run.id, RunStatus::Failed, Some(&detail), Some(FailureReason::Internal))? {
                        summary.runs_failed += 1;
                    }
                }
                let building = db.list_work_items(None, Some(WorkItemStatus::Building))?;
                Ok((summary, building))
            })
            .await?;

        let mut summary = summary;
        for wi in reset {
            match self
                .inner
                .work_items
                .system_transition(
                    &wi.id,
                    Some(WorkItemStatus::Building),
                    WorkItemStatus::Ready,
                    "run interrupted by restart",
                )
                .await
            {
                Ok(_) => summary.work_items_reset += 1,
                Err(e) => warn!(work_item_id = %wi.id, error = %e, "Failed to reset work item"),
            }
        }
        if summary != Recovery::default() {
            info!(
                runs_failed = summary.runs_failed,
                locks_released = summary.locks_released,
                work_items_reset = summary.work_items_reset,
                "Recovered from unclean shutdown"
            );
        }
        Ok(summary)
    }
}
