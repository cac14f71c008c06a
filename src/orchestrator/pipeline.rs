//! One run, start to finish: Setup, Builder loop, Test, Review, Merge.
//!
//! Every path out of [`Pipeline::run`] goes through `finish`, which releases
//! the merge lock, tears down the workspace, puts the work item back to
//! `ready` unless the change merged, and writes the run's terminal status.

use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use pcc_common::{
    CommunicationIntent, CommunicationScope, CommunicationType, ControlEvent, EscalationReason,
    EscalationRecord, FailureReason, NewCommunication, Project, RunPhase, RunStatus, WorkItem,
    WorkItemStatus,
};

use super::Inner;
use super::run_log::RunLog;
use crate::agent::{AgentFailure, AgentOutcome, BuildMode, BuildRequest, ReviewOutcome, Verdict};
use crate::config::CompletionPolicy;
use crate::errors::WorkItemError;
use crate::merge::AcquirePolicy;
use crate::store::RunUpdate;
use crate::workspace::{MergeOutcome, Workspace};

/// How a run ended.
#[derive(Debug, Clone, PartialEq)]
pub enum Ending {
    Done,
    Failed {
        reason: FailureReason,
        detail: String,
    },
    Cancelled,
}

impl Ending {
    pub fn failed(reason: FailureReason, detail: impl std::fmt::Display) -> Self {
        Self::Failed {
            reason,
            detail: detail.to_string(),
        }
    }

    /// `(status, error, reason)` as stored on the run.
    pub fn outcome(&self) -> (RunStatus, Option<String>, Option<FailureReason>) {
        match self {
            Self::Done => (RunStatus::Done, None, None),
            Self::Cancelled => (RunStatus::Cancelled, Some("cancelled".to_string()), None),
            Self::Failed { reason, detail } if detail.is_empty() => (
                RunStatus::Failed,
                Some(reason.describe().to_string()),
                Some(*reason),
            ),
            Self::Failed { reason, detail } => (
                RunStatus::Failed,
                Some(format!("{}: {}", reason.describe(), detail)),
                Some(*reason),
            ),
        }
    }
}

impl From<anyhow::Error> for Ending {
    fn from(e: anyhow::Error) -> Self {
        Self::failed(FailureReason::Internal, format!("{e:#}"))
    }
}

impl From<WorkItemError> for Ending {
    fn from(e: WorkItemError) -> Self {
        Self::failed(FailureReason::Internal, e)
    }
}

type Stage<T> = std::result::Result<T, Ending>;

/// Escalation raised for a failed run that a human should look at.
fn escalation_for(reason: FailureReason) -> Option<EscalationReason> {
    match reason {
        FailureReason::IterationBudgetExhausted => Some(EscalationReason::IterationBudgetExhausted),
        FailureReason::MergeConflictUnresolved => Some(EscalationReason::MergeConflict),
        FailureReason::SetupFailed => Some(EscalationReason::SetupFailed),
        _ => None,
    }
}

/// Statuses a merged work item walks through, in order.
fn completion_path(policy: CompletionPolicy) -> &'static [WorkItemStatus] {
    use WorkItemStatus::*;
    match policy {
        CompletionPolicy::AiReview => &[AiReview],
        CompletionPolicy::YouReview => &[AiReview, YouReview],
        CompletionPolicy::Done => &[AiReview, YouReview, Done],
    }
}

pub(super) struct Pipeline {
    inner: Arc<Inner>,
    run_id: String,
    /// The project id recorded when the run was created.
    captured_project_id: String,
    work_item: WorkItem,
    log: RunLog,
    cancel: CancellationToken,
    input: mpsc::Receiver<String>,
    cost_seq: u32,
    workspace: Option<Workspace>,
    /// Whether this run moved the work item to `building` and still owns it.
    owns_work_item: bool,
}

impl Pipeline {
    pub(super) fn new(
        inner: Arc<Inner>,
        run_id: String,
        captured_project_id: String,
        work_item: WorkItem,
        log: RunLog,
        cancel: CancellationToken,
        input: mpsc::Receiver<String>,
    ) -> Self {
        Self {
            inner,
            run_id,
            captured_project_id,
            work_item,
            log,
            cancel,
            input,
            cost_seq: 0,
            workspace: None,
            owns_work_item: false,
        }
    }

    pub(super) async fn run(mut self) -> Ending {
        let ending = match self.stages().await {
            Ok(()) => Ending::Done,
            Err(ending) => ending,
        };
        self.finish(&ending).await;
        ending
    }

    async fn stages(&mut self) -> Stage<()> {
        self.start().await?;
        let (project, workspace) = self.setup().await?;
        self.build_loop(&project, &workspace).await?;
        // The change is on trunk; the item must never go back to `ready`.
        self.owns_work_item = false;
        if let Err(ending) = self.complete().await {
            let (_, error, _) = ending.outcome();
            let error = error.unwrap_or_default();
            warn!(run_id = %self.run_id, work_item_id = %self.work_item.id, error = %error, "Merged but could not advance work item");
            let pid = self.project_id().await;
            self.escalate(
                &pid,
                EscalationReason::CompletionBlocked,
                &format!("merged to trunk but {} did not advance: {error}", self.work_item.id),
                format!("completion-blocked:{}", self.run_id),
            )
            .await;
        }
        Ok(())
    }

    fn check_cancel(&self) -> Stage<()> {
        if self.cancel.is_cancelled() {
            Err(Ending::Cancelled)
        } else {
            Ok(())
        }
    }

    /// The run's project id as currently stored; identity collapses rewrite it.
    async fn project_id(&self) -> String {
        let rid = self.run_id.clone();
        match self.inner.db.call(move |db| db.run_project_id(&rid)).await {
            Ok(Some(pid)) => pid,
            Ok(None) => self.captured_project_id.clone(),
            Err(e) => {
                warn!(run_id = %self.run_id, error = %e, "Failed to re-read run project");
                self.captured_project_id.clone()
            }
        }
    }

    async fn update(&self, update: RunUpdate) -> Stage<()> {
        let rid = self.run_id.clone();
        self.inner.db.call(move |db| db.update_run(&rid, &update)).await?;
        Ok(())
    }

    async fn set_phase(&self, phase: RunPhase) -> Stage<()> {
        self.update(RunUpdate::phase(phase)).await?;
        debug!(run_id = %self.run_id, phase = %phase, "Run phase");
        self.inner.events.publish(ControlEvent::RunPhaseChanged {
            run_id: self.run_id.clone(),
            phase,
        });
        Ok(())
    }

    async fn backoff(&self, attempt: u32) -> Stage<()> {
        let delay = self.inner.settings.blocking_retry_backoff * attempt;
        tokio::select! {
            _ = self.cancel.cancelled() => Err(Ending::Cancelled),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }

    async fn record_cost(&mut self, amount_usd: f64) {
        if amount_usd <= 0.0 {
            return;
        }
        self.cost_seq += 1;
        let event_id = format!("{}:{}", self.run_id, self.cost_seq);
        let rid = self.run_id.clone();
        if let Err(e) = self
            .inner
            .db
            .call(move |db| db.add_run_cost(&rid, amount_usd))
            .await
        {
            warn!(run_id = %self.run_id, error = %e, "Failed to accrue run cost");
        }
        let pid = self.project_id().await;
        if let Err(e) = self
            .inner
            .budget
            .record_cost(&pid, Some(&self.run_id), &event_id, amount_usd)
            .await
        {
            warn!(run_id = %self.run_id, event_id = %event_id, error = %e, "Failed to record cost event");
        }
    }

    async fn start(&mut self) -> Stage<()> {
        self.check_cancel()?;
        self.update(RunUpdate {
            status: Some(RunStatus::Running),
            phase: Some(RunPhase::Setup),
            log_path: self.log.path().map(|p| p.display().to_string()),
            ..Default::default()
        })
        .await?;
        self.inner.events.publish(ControlEvent::RunStarted {
            run_id: self.run_id.clone(),
            work_item_id: self.work_item.id.clone(),
            project_id: self.project_id().await,
        });
        self.inner.events.publish(ControlEvent::RunPhaseChanged {
            run_id: self.run_id.clone(),
            phase: RunPhase::Setup,
        });
        info!(run_id = %self.run_id, work_item_id = %self.work_item.id, "Run started");

        let cause = format!("run {} started", self.run_id);
        self.work_item = self
            .inner
            .work_items
            .system_transition(
                &self.work_item.id,
                Some(WorkItemStatus::Ready),
                WorkItemStatus::Building,
                &cause,
            )
            .await
            .map_err(|e| Ending::failed(FailureReason::SetupFailed, e))?;
        self.owns_work_item = true;
        Ok(())
    }

    async fn setup(&mut self) -> Stage<(Project, Workspace)> {
        let pid = self.project_id().await;
        let key = pid.clone();
        let project = self
            .inner
            .db
            .call(move |db| db.get_project(&key))
            .await?
            .ok_or_else(|| Ending::failed(FailureReason::SetupFailed, format!("project {pid} not found")))?;

        let mut workspace = self
            .inner
            .collaborators
            .workspaces
            .create(&project, &self.work_item, &self.run_id, &self.log)
            .await
            .map_err(|e| Ending::failed(FailureReason::SetupFailed, format!("{e:#}")))?;
        self.workspace = Some(workspace.clone());
        self.update(RunUpdate {
            branch_name: Some(workspace.branch.clone()),
            ..Default::default()
        })
        .await?;

        if project.requires_vm {
            let vm = &self.inner.vm;
            if !vm.has_provider() {
                return Err(Ending::failed(
                    FailureReason::SetupFailed,
                    "project requires a VM but no compute provider is configured",
                ));
            }
            vm.provision(&project.id, None)
                .await
                .map_err(|e| Ending::failed(FailureReason::SetupFailed, e))?;
            let remote = vm
                .sync_workspace(&project.id, &self.run_id, &workspace.path, &self.log)
                .await
                .map_err(|e| Ending::failed(FailureReason::SetupFailed, e))?;
            workspace.remote = Some(remote);
            self.workspace = Some(workspace.clone());
        }
        Ok((project, workspace))
    }

    async fn build_loop(&mut self, project: &Project, workspace: &Workspace) -> Stage<()> {
        let max = self.inner.settings.max_iterations;
        let mut iteration = 0u32;
        let mut feedback: Vec<String> = Vec::new();
        let mut human_input: Option<String> = None;
        let mut mode = BuildMode::Implement;
        let mut conflict_attempted = false;
        // Set when a clean rebase already resolved a merge conflict.
        let mut recheck_only = false;

        loop {
            self.check_cancel()?;
            let resolving = recheck_only || matches!(mode, BuildMode::ResolveConflict { .. });
            // A conflict resolution attempt is granted even at the cap.
            if !resolving && iteration >= max {
                return Err(Ending::failed(
                    FailureReason::IterationBudgetExhausted,
                    format!("no approved change after {max} iterations"),
                ));
            }

            if !recheck_only {
                let attempt = iteration + 1;
                self.enter_iteration(attempt).await?;
                let outcome = self
                    .invoke_agent(attempt, workspace, &feedback, human_input.take(), mode.clone())
                    .await?;
                if let Some(question) = &outcome.signals.escalation {
                    // Waiting for a human does not use up an iteration.
                    human_input = Some(self.wait_for_input(attempt, question).await?);
                    continue;
                }
                iteration = attempt;
                mode = BuildMode::Implement;
                if let Some(blocker) = outcome.signals.blockers.first() {
                    self.log.line(&format!("[blocker] {blocker}")).await;
                }
                let message = format!("pcc: {} iteration {}", self.work_item.id, attempt);
                self.inner
                    .collaborators
                    .workspaces
                    .commit_pending(workspace, &message, &self.log)
                    .await?;
                if let Some(AgentFailure::NonBlocking(msg)) = &outcome.failure {
                    feedback = vec![format!("The previous attempt ended with an error:\n{msg}")];
                    continue;
                }
            }
            recheck_only = false;

            self.check_cancel()?;
            self.set_phase(RunPhase::Test).await?;
            let checks = self
                .inner
                .collaborators
                .tests
                .run(project, workspace, &self.log)
                .await
                .map_err(|e| {
                    Ending::failed(
                        FailureReason::AgentEnvironmentFailure,
                        format!("test suite could not run: {e:#}"),
                    )
                })?;
            if !checks.passed {
                debug!(run_id = %self.run_id, iteration, "Checks failed");
                feedback = vec![format!(
                    "Tests failed (exit {:?}):\n{}",
                    checks.exit_code, checks.output
                )];
                continue;
            }

            self.check_cancel()?;
            self.set_phase(RunPhase::Review).await?;
            let review = self.review(workspace).await?;
            if review.verdict == Verdict::ChangesRequested {
                debug!(run_id = %self.run_id, iteration, "Review requested changes");
                feedback = vec![format!("Review requested changes:\n{}", review.feedback)];
                continue;
            }

            self.check_cancel()?;
            self.set_phase(RunPhase::Merge).await?;
            match self.merge(workspace).await? {
                MergeOutcome::Merged => return Ok(()),
                MergeOutcome::Conflict { detail } => {
                    if conflict_attempted {
                        return Err(Ending::failed(FailureReason::MergeConflictUnresolved, detail));
                    }
                    conflict_attempted = true;
                    feedback.clear();
                    self.log.line(&format!("[merge] conflict with trunk:\n{detail}")).await;
                    let rebased = self
                        .inner
                        .collaborators
                        .workspaces
                        .rebase_onto_trunk(workspace, &self.log)
                        .await?;
                    if rebased {
                        recheck_only = true;
                    } else {
                        mode = BuildMode::ResolveConflict { detail };
                    }
                }
            }
        }
    }

    async fn enter_iteration(&self, attempt: u32) -> Stage<()> {
        self.update(RunUpdate {
            phase: Some(RunPhase::Builder),
            builder_iteration: Some(attempt),
            ..Default::default()
        })
        .await?;
        self.inner.events.publish(ControlEvent::RunPhaseChanged {
            run_id: self.run_id.clone(),
            phase: RunPhase::Builder,
        });
        self.inner.events.publish(ControlEvent::RunIteration {
            run_id: self.run_id.clone(),
            iteration: attempt,
        });
        Ok(())
    }

    /// One builder iteration. Blocking failures are retried in place.
    async fn invoke_agent(
        &mut self,
        attempt: u32,
        workspace: &Workspace,
        feedback: &[String],
        human_input: Option<String>,
        mode: BuildMode,
    ) -> Stage<AgentOutcome> {
        let max_retries = self.inner.settings.max_blocking_retries;
        let mut retries = 0;
        loop {
            let request = BuildRequest {
                run_id: &self.run_id,
                iteration: attempt,
                work_item: &self.work_item,
                workspace,
                feedback,
                human_input: human_input.as_deref(),
                mode: mode.clone(),
            };
            let outcome = self
                .inner
                .collaborators
                .agent
                .build(&request, &self.log)
                .await?;
            self.record_cost(outcome.cost_usd).await;
            match &outcome.failure {
                Some(AgentFailure::Blocking(msg)) if retries < max_retries => {
                    retries += 1;
                    warn!(run_id = %self.run_id, attempt, retries, error = %msg, "Blocking agent failure, retrying");
                    self.log.line(&format!("[blocking] {msg} (retry {retries})")).await;
                    self.backoff(retries).await?;
                }
                Some(AgentFailure::Blocking(msg)) => {
                    return Err(Ending::failed(FailureReason::AgentEnvironmentFailure, msg));
                }
                _ => return Ok(outcome),
            }
        }
    }

    async fn review(&mut self, workspace: &Workspace) -> Stage<ReviewOutcome> {
        let max_retries = self.inner.settings.max_blocking_retries;
        let mut retries = 0;
        loop {
            match self
                .inner
                .collaborators
                .reviewer
                .review(&self.work_item, workspace, &self.log)
                .await
            {
                Ok(review) => {
                    self.record_cost(review.cost_usd).await;
                    return Ok(review);
                }
                Err(e) if retries < max_retries => {
                    retries += 1;
                    warn!(run_id = %self.run_id, retries, error = %e, "Review failed to run, retrying");
                    self.backoff(retries).await?;
                }
                Err(e) => {
                    return Err(Ending::failed(
                        FailureReason::AgentEnvironmentFailure,
                        format!("review could not run: {e:#}"),
                    ));
                }
            }
        }
    }

    async fn merge(&self, workspace: &Workspace) -> Stage<MergeOutcome> {
        let wait = AcquirePolicy::Wait(self.inner.settings.merge_lock_timeout);
        let lock = self
            .inner
            .merge
            .acquire(&self.captured_project_id, &self.run_id, wait)
            .await
            .map_err(|e| Ending::failed(FailureReason::Internal, e))?;
        let merged = self
            .inner
            .collaborators
            .workspaces
            .merge_into_trunk(workspace, &self.log)
            .await;
        if let Err(e) = self.inner.merge.release(&lock.id, &self.run_id).await {
            warn!(run_id = %self.run_id, error = %e, "Failed to release merge lock");
        }
        Ok(merged?)
    }

    /// Suspend the loop until someone answers the agent's question.
    async fn wait_for_input(&mut self, attempt: u32, question: &str) -> Stage<String> {
        self.set_phase(RunPhase::WaitingForInput).await?;
        let pid = self.project_id().await;
        let record = EscalationRecord {
            id: Uuid::new_v4().to_string(),
            project_id: pid.clone(),
            run_id: Some(self.run_id.clone()),
            shift_id: None,
            reason: EscalationReason::NeedInput,
            detail: question.to_string(),
            payload: json!({ "iteration": attempt, "work_item_id": self.work_item.id }),
            dedup_key: format!("input:{}:{}", self.run_id, Uuid::new_v4()),
            created_at: Utc::now(),
            resolved_at: None,
        };
        let communication = NewCommunication {
            intent: CommunicationIntent::Escalation,
            kind: CommunicationType::NeedInput,
            scope: CommunicationScope::Project,
            summary: format!("{} needs input", self.work_item.id),
            body: Some(question.to_string()),
            run_id: Some(self.run_id.clone()),
            shift_id: None,
            payload: None,
        };
        let (escalation, _) = self
            .inner
            .db
            .call(move |db| {
                let stored = db.insert_escalation(&record)?;
                db.insert_communication(&Uuid::new_v4().to_string(), Some(&pid), &communication)?;
                Ok(stored)
            })
            .await?;
        info!(run_id = %self.run_id, escalation_id = %escalation.id, "Run waiting for input");
        self.inner.events.publish(ControlEvent::RunWaitingForInput {
            run_id: self.run_id.clone(),
            escalation_id: escalation.id.clone(),
        });
        self.inner.events.publish(ControlEvent::EscalationRaised {
            escalation_id: escalation.id.clone(),
            project_id: escalation.project_id.clone(),
            reason: escalation.reason.to_string(),
        });
        self.log.line(&format!("[escalate] {question}")).await;

        let timeout = self.inner.settings.input_wait_timeout;
        let answer = tokio::select! {
            answer = self.input.recv() => answer,
            _ = self.cancel.cancelled() => return Err(Ending::Cancelled),
            _ = tokio::time::sleep(timeout) => {
                return Err(Ending::failed(
                    FailureReason::InputWaitTimedOut,
                    format!("no answer within {}s", timeout.as_secs()),
                ));
            }
        };
        let Some(answer) = answer else {
            return Err(Ending::failed(FailureReason::Internal, "input channel closed"));
        };
        let eid = escalation.id.clone();
        self.inner.db.call(move |db| db.resolve_escalation(&eid)).await?;
        self.log.line(&format!("[input] {answer}")).await;
        self.set_phase(RunPhase::Builder).await?;
        Ok(answer)
    }

    async fn complete(&mut self) -> Stage<()> {
        let cause = format!("run {} merged", self.run_id);
        let mut from = WorkItemStatus::Building;
        for &to in completion_path(self.inner.settings.completion_policy) {
            self.work_item = self
                .inner
                .work_items
                .system_transition(&self.work_item.id, Some(from), to, &cause)
                .await?;
            from = to;
        }
        Ok(())
    }

    async fn finish(&mut self, ending: &Ending) {
        let (status, error, reason) = ending.outcome();

        if let Err(e) = self.inner.merge.release_for_run(&self.run_id).await {
            warn!(run_id = %self.run_id, error = %e, "Failed to release merge lock");
        }

        if let Some(workspace) = self.workspace.take() {
            // Failed runs keep their worktree for inspection; the reaper
            // removes it after the retention window.
            if !matches!(ending, Ending::Failed { .. })
                && let Err(e) = self
                    .inner
                    .collaborators
                    .workspaces
                    .remove(&workspace, &self.log)
                    .await
            {
                warn!(run_id = %self.run_id, error = %e, "Failed to remove worktree");
            }
            if workspace.remote.is_some()
                && let Err(e) = self.inner.vm.touch_activity(&workspace.project_id).await
            {
                warn!(run_id = %self.run_id, error = %e, "Failed to touch VM activity");
            }
        }

        if self.owns_work_item {
            let cause = match ending {
                Ending::Cancelled => format!("run {} cancelled", self.run_id),
                _ => format!("run {} failed", self.run_id),
            };
            if let Err(e) = self
                .inner
                .work_items
                .system_transition(
                    &self.work_item.id,
                    Some(WorkItemStatus::Building),
                    WorkItemStatus::Ready,
                    &cause,
                )
                .await
            {
                warn!(run_id = %self.run_id, work_item_id = %self.work_item.id, error = %e, "Failed to return work item to ready");
            }
        }

        let rid = self.run_id.clone();
        let err = error.clone();
        if let Err(e) = self
            .inner
            .db
            .call(move |db| db.finish_run(&rid, status, err.as_deref(), reason))
            .await
        {
            warn!(run_id = %self.run_id, error = %e, "Failed to record run result");
        }

        let pid = self.project_id().await;
        if let Some(reason) = reason
            && let Some(escalation) = escalation_for(reason)
        {
            self.escalate(
                &pid,
                escalation,
                error.as_deref().unwrap_or_default(),
                format!("run-failed:{}", self.run_id),
            )
            .await;
        }

        if let Err(e) = self.inner.budget.finish_run(&pid, &self.run_id).await {
            warn!(run_id = %self.run_id, error = %e, "Failed to release budget reservation");
        }
        self.log.line(&format!("--- run {status} ---")).await;
        self.log.flush().await;

        info!(run_id = %self.run_id, status = %status, error = ?error, "Run finished");
        self.inner.events.publish(ControlEvent::RunFinished {
            run_id: self.run_id.clone(),
            status,
            error,
        });
    }

    async fn escalate(
        &self,
        project_id: &str,
        reason: EscalationReason,
        detail: &str,
        dedup_key: String,
    ) {
        let record = EscalationRecord {
            id: Uuid::new_v4().to_string(),
            project_id: project_id.to_string(),
            run_id: Some(self.run_id.clone()),
            shift_id: None,
            reason,
            detail: detail.to_string(),
            payload: json!({ "work_item_id": self.work_item.id }),
            dedup_key,
            created_at: Utc::now(),
            resolved_at: None,
        };
        match self.inner.db.call(move |db| db.insert_escalation(&record)).await {
            Ok((stored, true)) => self.inner.events.publish(ControlEvent::EscalationRaised {
                escalation_id: stored.id,
                project_id: stored.project_id,
                reason: stored.reason.to_string(),
            }),
            Ok(_) => {}
            Err(e) => warn!(run_id = %self.run_id, error = %e, "Failed to raise escalation"),
        }
    }
}
