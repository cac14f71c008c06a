//! Shifts: bounded Context, Assess, Decide, Execute, Handoff cycles per
//! project.
//!
//! A shift commits to exactly one action and always ends with a handoff
//! record, whether the action succeeded, failed or timed out. The handoff is
//! what the next shift reads to pick up where this one stopped.

pub mod assess;
pub mod session;

use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use pcc_common::{
    CommunicationIntent, CommunicationScope, CommunicationType, ControlEvent, EscalationReason,
    EscalationRecord, NewCommunication, Project, RunStatus, Shift, ShiftAction, ShiftPhase,
    WorkItemSpec, WorkItemStatus,
};

use crate::budget::BudgetGovernor;
use crate::config::ShiftSection;
use crate::errors::ShiftError;
use crate::events::EventBus;
use crate::orchestrator::{EnqueueOutcome, RunOrchestrator};
use crate::store::DbHandle;
use crate::work_items::WorkItemStore;

pub use assess::{Assessment, Blocker, ShiftContext, assess, decide};
pub use session::SessionCoordinator;

type Result<T> = std::result::Result<T, ShiftError>;

const RECENT_RUNS: u32 = 20;
/// How long a run cancelled at the shift deadline gets to wind down.
const CANCEL_GRACE: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct ShiftSettings {
    pub timeout_minutes: u32,
}

impl ShiftSettings {
    pub fn from_config(shift: &ShiftSection) -> Self {
        Self {
            timeout_minutes: shift.timeout_minutes,
        }
    }
}

/// Findings accumulated while a shift runs; folded into the handoff.
#[derive(Debug, Default)]
struct Notes {
    work_completed: Vec<String>,
    blockers: Vec<String>,
    decisions: Vec<pcc_common::Decision>,
    outcome: Option<String>,
    timed_out: bool,
}

impl Notes {
    fn blocker(&mut self, text: String) {
        if !self.blockers.contains(&text) {
            self.blockers.push(text);
        }
    }
}

#[derive(Clone)]
pub struct ShiftScheduler {
    db: DbHandle,
    events: EventBus,
    work_items: WorkItemStore,
    budget: BudgetGovernor,
    orchestrator: RunOrchestrator,
    settings: ShiftSettings,
}

impl ShiftScheduler {
    pub fn new(
        db: DbHandle,
        events: EventBus,
        work_items: WorkItemStore,
        budget: BudgetGovernor,
        orchestrator: RunOrchestrator,
        settings: ShiftSettings,
    ) -> Self {
        Self {
            db,
            events,
            work_items,
            budget,
            orchestrator,
            settings,
        }
    }

    async fn project(&self, project_id: &str) -> Result<Project> {
        let key = project_id.to_string();
        self.db
            .call(move |db| {
                let Some(canonical) = db.resolve_canonical(&key)? else {
                    return Ok(None);
                };
                db.get_project(&canonical)
            })
            .await?
            .ok_or_else(|| ShiftError::ProjectNotFound {
                project_id: project_id.to_string(),
            })
    }

    /// Assemble what a shift would see for the project right now.
    pub async fn context(&self, project_id: &str, goals: &[String]) -> Result<ShiftContext> {
        let project = self.project(project_id).await?;
        let pid = project.id.clone();
        let (work_items, recent_runs, last_handoff, open_escalations) = self
            .db
            .call(move |db| {
                let items = db.list_work_items(Some(&pid), None)?;
                let runs = db.recent_runs_for_project(&pid, RECENT_RUNS)?;
                let handoff = db
                    .list_handoffs(&pid, 1)?
                    .into_iter()
                    .next()
                    .and_then(|s| s.handoff);
                let escalations = db.list_escalations(Some(&pid), true)?;
                Ok((items, runs, handoff, escalations))
            })
            .await?;
        let budget = self
            .budget
            .snapshot(&project.id)
            .await
            .map_err(|e| ShiftError::Other(e.into()))?;
        Ok(ShiftContext {
            project,
            work_items,
            recent_runs,
            last_handoff,
            budget,
            open_escalations,
            goals: goals.to_vec(),
        })
    }

    pub async fn active(&self, project_id: &str) -> Result<Option<Shift>> {
        let project = self.project(project_id).await?;
        Ok(self.db.call(move |db| db.active_shift(&project.id)).await?)
    }

    /// Finished shifts, newest first.
    pub async fn handoffs(&self, project_id: &str, limit: u32) -> Result<Vec<Shift>> {
        let project = self.project(project_id).await?;
        Ok(self
            .db
            .call(move |db| db.list_handoffs(&project.id, limit))
            .await?)
    }

    async fn begin(&self, project_id: &str) -> Result<Shift> {
        let project = self.project(project_id).await?;
        let id = Uuid::new_v4().to_string();
        let timeout = self.settings.timeout_minutes;
        let pid = project.id.clone();
        let shift = self
            .db
            .call(move |db| db.start_shift(&id, &pid, timeout))
            .await?
            .ok_or(ShiftError::AlreadyActive {
                project_id: project.id,
            })?;
        info!(shift_id = %shift.id, project_id = %shift.project_id, timeout_minutes = timeout, "Shift started");
        self.events.publish(ControlEvent::ShiftPhaseChanged {
            shift_id: shift.id.clone(),
            project_id: shift.project_id.clone(),
            phase: ShiftPhase::Context,
        });
        Ok(shift)
    }

    /// Run one shift to completion and return it with its handoff.
    pub async fn run(&self, project_id: &str, goals: Vec<String>) -> Result<Shift> {
        let shift = self.begin(project_id).await?;
        self.drive(shift, goals).await
    }

    /// Start a shift in the background.
    pub async fn spawn(&self, project_id: &str, goals: Vec<String>) -> Result<Shift> {
        let shift = self.begin(project_id).await?;
        let this = self.clone();
        let started = shift.clone();
        tokio::spawn(async move {
            let id = shift.id.clone();
            if let Err(e) = this.drive(shift, goals).await {
                warn!(shift_id = %id, error = %e, "Shift ended with an error");
            }
        });
        Ok(started)
    }

    async fn set_phase(&self, shift: &Shift, phase: ShiftPhase) -> Result<()> {
        let id = shift.id.clone();
        self.db.call(move |db| db.set_shift_phase(&id, phase)).await?;
        debug!(shift_id = %shift.id, phase = %phase, "Shift phase");
        self.events.publish(ControlEvent::ShiftPhaseChanged {
            shift_id: shift.id.clone(),
            project_id: shift.project_id.clone(),
            phase,
        });
        Ok(())
    }

    async fn drive(&self, shift: Shift, goals: Vec<String>) -> Result<Shift> {
        let deadline = Instant::now() + Duration::from_secs(u64::from(shift.timeout_minutes) * 60);
        let mut notes = Notes::default();
        if let Err(e) = self.work(&shift, &goals, deadline, &mut notes).await {
            warn!(shift_id = %shift.id, error = %e, "Shift step failed");
            notes.blocker(format!("shift error: {e}"));
        }
        if notes.timed_out {
            self.escalate(
                &shift,
                EscalationReason::ShiftTimeout,
                format!("shift:{}:timeout", shift.id),
                format!("Shift exceeded its {} minute timeout", shift.timeout_minutes),
                json!({ "work_completed": notes.work_completed }),
            )
            .await;
        }
        self.handoff(shift, &goals, notes).await
    }

    async fn work(
        &self,
        shift: &Shift,
        goals: &[String],
        deadline: Instant,
        notes: &mut Notes,
    ) -> Result<()> {
        let ctx = self.context(&shift.project_id, goals).await?;

        self.set_phase(shift, ShiftPhase::Assess).await?;
        let assessment = assess(&ctx);
        for b in &assessment.blockers {
            notes.blocker(format!("{}: {}", b.work_item_id, b.description));
        }

        self.set_phase(shift, ShiftPhase::Decide).await?;
        let (action, decision) = decide(&assessment, &ctx);
        info!(
            shift_id = %shift.id,
            project_id = %shift.project_id,
            action = %decision.action,
            rationale = %decision.rationale,
            "Shift decided"
        );
        notes.decisions.push(decision);

        self.set_phase(shift, ShiftPhase::Execute).await?;
        self.execute(shift, &ctx, &action, deadline, notes).await
    }

    async fn execute(
        &self,
        shift: &Shift,
        ctx: &ShiftContext,
        action: &ShiftAction,
        deadline: Instant,
        notes: &mut Notes,
    ) -> Result<()> {
        match action {
            ShiftAction::RemoveBlocker {
                work_item_id,
                blocker,
            } => {
                let item = ctx.work_items.iter().find(|w| &w.id == work_item_id);
                let unblockable = item.is_some_and(|w| {
                    w.status == WorkItemStatus::Blocked
                        && w.depends_on.iter().all(|d| {
                            ctx.work_items
                                .iter()
                                .any(|o| &o.id == d && o.status == WorkItemStatus::Done)
                        })
                });
                if unblockable {
                    self.work_items
                        .transition(work_item_id, WorkItemStatus::Ready)
                        .await
                        .map_err(|e| ShiftError::Other(e.into()))?;
                    notes.work_completed.push(format!("Unblocked {work_item_id}"));
                    notes.blockers.retain(|b| !b.starts_with(&format!("{work_item_id}:")));
                    return Ok(());
                }
                let reason = if assess::has_repeated_failure(work_item_id, &ctx.recent_runs) {
                    EscalationReason::RepeatedFailure
                } else {
                    EscalationReason::NeedInput
                };
                self.escalate(
                    shift,
                    reason,
                    format!("{}{}", assess::blocker_key(work_item_id), shift.id),
                    format!("{work_item_id}: {blocker}"),
                    json!({ "work_item_id": work_item_id }),
                )
                .await;
                notes
                    .work_completed
                    .push(format!("Escalated blocker on {work_item_id}"));
                Ok(())
            }
            ShiftAction::ExecuteWorkItem { work_item_id } => {
                self.execute_work_item(work_item_id, deadline, notes).await;
                Ok(())
            }
            ShiftAction::CreateWorkItem { title, goal } => {
                let spec = WorkItemSpec {
                    title: title.clone(),
                    goal: goal.clone(),
                    priority: 3,
                    tags: vec![title.to_lowercase()],
                    ..Default::default()
                };
                let created = self
                    .work_items
                    .create(&ctx.project.id, spec)
                    .await
                    .map_err(|e| ShiftError::Other(e.into()))?;
                notes
                    .work_completed
                    .push(format!("Created {} '{}' in backlog", created.id, created.title));
                Ok(())
            }
            ShiftAction::Research { topic } => {
                notes.outcome = Some(format!("No actionable work; {topic} needs research"));
                Ok(())
            }
        }
    }

    /// Hand the item to the orchestrator and follow the run until it ends or
    /// the shift runs out of time.
    async fn execute_work_item(&self, work_item_id: &str, deadline: Instant, notes: &mut Notes) {
        let outcome = match self.orchestrator.enqueue(work_item_id).await {
            Ok(outcome) => outcome,
            Err(e) => {
                notes.blocker(format!("{work_item_id}: could not start a run: {e}"));
                return;
            }
        };
        let run = match outcome {
            EnqueueOutcome::Denied { escalation, .. } => {
                notes.blocker(format!(
                    "{work_item_id}: budget exhausted (escalation {})",
                    escalation.id
                ));
                return;
            }
            EnqueueOutcome::Started { run } | EnqueueOutcome::Queued { run, .. } => run,
        };

        let remaining = deadline.saturating_duration_since(Instant::now());
        let mut run = match self.orchestrator.wait(&run.id, remaining).await {
            Ok(run) => run,
            Err(e) => {
                notes.blocker(format!("{work_item_id}: lost track of run {}: {e}", run.id));
                return;
            }
        };
        if !run.status.is_terminal() {
            notes.timed_out = true;
            warn!(run_id = %run.id, work_item_id, "Shift timed out, cancelling run");
            if let Err(e) = self.orchestrator.cancel(&run.id).await {
                warn!(run_id = %run.id, error = %e, "Failed to cancel run at shift timeout");
            }
            if let Ok(latest) = self.orchestrator.wait(&run.id, CANCEL_GRACE).await {
                run = latest;
            }
            notes.blocker(format!(
                "{work_item_id}: run {} cancelled at shift timeout",
                run.id
            ));
            return;
        }
        match run.status {
            RunStatus::Done => notes.work_completed.push(format!(
                "{work_item_id} merged by run {} after {} iteration(s)",
                run.id, run.builder_iteration
            )),
            status => notes.blocker(format!(
                "{work_item_id}: run {} {}: {}",
                run.id,
                status,
                run.error.as_deref().unwrap_or("no error recorded")
            )),
        }
    }

    async fn escalate(
        &self,
        shift: &Shift,
        reason: EscalationReason,
        dedup_key: String,
        detail: String,
        payload: serde_json::Value,
    ) {
        let record = EscalationRecord {
            id: Uuid::new_v4().to_string(),
            project_id: shift.project_id.clone(),
            run_id: None,
            shift_id: Some(shift.id.clone()),
            reason,
            detail: detail.clone(),
            payload,
            dedup_key,
            created_at: Utc::now(),
            resolved_at: None,
        };
        let communication = NewCommunication {
            intent: CommunicationIntent::Escalation,
            kind: CommunicationType::Blocked,
            scope: CommunicationScope::Project,
            summary: detail,
            body: None,
            run_id: None,
            shift_id: Some(shift.id.clone()),
            payload: None,
        };
        let pid = shift.project_id.clone();
        let stored = self
            .db
            .call(move |db| {
                let (stored, created) = db.insert_escalation(&record)?;
                if created {
                    db.insert_communication(&Uuid::new_v4().to_string(), Some(&pid), &communication)?;
                }
                Ok((stored, created))
            })
            .await;
        match stored {
            Ok((stored, true)) => self.events.publish(ControlEvent::EscalationRaised {
                escalation_id: stored.id,
                project_id: stored.project_id,
                reason: stored.reason.to_string(),
            }),
            Ok(_) => {}
            Err(e) => warn!(shift_id = %shift.id, error = %e, "Failed to raise shift escalation"),
        }
    }

    async fn handoff(&self, shift: Shift, goals: &[String], notes: Notes) -> Result<Shift> {
        self.events.publish(ControlEvent::ShiftPhaseChanged {
            shift_id: shift.id.clone(),
            project_id: shift.project_id.clone(),
            phase: ShiftPhase::Handoff,
        });

        // What is worth doing next, seen after this shift's action.
        let next = match self.context(&shift.project_id, goals).await {
            Ok(ctx) => assess(&ctx).candidates,
            Err(e) => {
                warn!(shift_id = %shift.id, error = %e, "Could not reassess for handoff");
                Vec::new()
            }
        };
        let next_priorities: Vec<String> = next.iter().take(3).map(ShiftAction::label).collect();
        let recommended_next_action = next_priorities
            .first()
            .cloned()
            .unwrap_or_else(|| "review the project manually".to_string());

        let chosen = notes
            .decisions
            .first()
            .map(|d| d.action.clone())
            .unwrap_or_else(|| "no decision".to_string());
        let mut summary = format!(
            "Chose to {chosen}. {} completed, {} blocker(s).",
            notes.work_completed.len(),
            notes.blockers.len()
        );
        if let Some(outcome) = &notes.outcome {
            summary.push(' ');
            summary.push_str(outcome);
        }
        if notes.timed_out {
            summary.push_str(" Timed out.");
        }

        let handoff = pcc_common::Handoff {
            summary,
            work_completed: notes.work_completed,
            blockers: notes.blockers,
            next_priorities,
            recommended_next_action,
            decisions: notes.decisions,
        };
        let id = shift.id.clone();
        let ended = self
            .db
            .call(move |db| db.end_shift(&id, &handoff))
            .await?
            .unwrap_or(shift);
        info!(
            shift_id = %ended.id,
            project_id = %ended.project_id,
            summary = ended.handoff.as_ref().map(|h| h.summary.as_str()).unwrap_or_default(),
            "Shift handed off"
        );
        Ok(ended)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::Verdict;
    use crate::orchestrator::testing::{Harness, Script};

    fn scheduler(h: &Harness) -> ShiftScheduler {
        ShiftScheduler::new(
            h.db.clone(),
            h.events.clone(),
            h.work_items.clone(),
            h.budget.clone(),
            h.orchestrator.clone(),
            ShiftSettings {
                timeout_minutes: 120,
            },
        )
    }

    #[tokio::test]
    async fn test_shift_executes_ready_item_and_hands_off() {
        let h = Harness::new(Script::default()).await;
        h.ready_item("WO-1").await;
        let s = scheduler(&h);

        let shift = s.run("p", vec![]).await.unwrap();
        assert!(!shift.is_active());
        let handoff = shift.handoff.unwrap();
        assert_eq!(handoff.decisions[0].action, "execute WO-1");
        assert!(handoff.work_completed[0].contains("WO-1 merged"));
        assert_eq!(h.status_of("WO-1").await, WorkItemStatus::Done);
        assert_eq!(s.handoffs("p", 10).await.unwrap().len(), 1);
        assert!(s.active("p").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_noop_shift_still_writes_handoff() {
        let h = Harness::new(Script::default()).await;
        let s = scheduler(&h);
        let shift = s.run("p", vec![]).await.unwrap();
        let handoff = shift.handoff.unwrap();
        assert!(handoff.summary.contains("research"));
        assert!(!handoff.recommended_next_action.is_empty());
    }

    #[tokio::test]
    async fn test_failed_run_is_reported_as_blocker() {
        let h = Harness::new(Script {
            default_verdict: Verdict::ChangesRequested,
            max_iterations: 1,
            ..Default::default()
        })
        .await;
        h.ready_item("WO-1").await;
        let s = scheduler(&h);
        let shift = s.run("p", vec![]).await.unwrap();
        let handoff = shift.handoff.unwrap();
        assert!(handoff.blockers.iter().any(|b| b.contains("iteration budget exhausted")));
        // One failure is not yet a streak, so it is still recommended.
        assert_eq!(handoff.recommended_next_action, "execute WO-1");
    }

    #[tokio::test]
    async fn test_second_repeat_failure_escalates_instead_of_rerunning() {
        let h = Harness::new(Script {
            default_verdict: Verdict::ChangesRequested,
            max_iterations: 1,
            ..Default::default()
        })
        .await;
        h.ready_item("WO-1").await;
        let s = scheduler(&h);
        s.run("p", vec![]).await.unwrap();
        s.run("p", vec![]).await.unwrap();
        let calls = h.agent.calls();

        let third = s.run("p", vec![]).await.unwrap().handoff.unwrap();
        assert_eq!(h.agent.calls(), calls, "repeat failure must not be re-run");
        assert_eq!(third.decisions[0].action, "remove blocker on WO-1");
        let open = h
            .db
            .call(|db| db.list_escalations(Some("p"), true))
            .await
            .unwrap();
        assert!(open.iter().any(|e| e.reason == EscalationReason::RepeatedFailure));
    }

    #[tokio::test]
    async fn test_blocked_item_with_done_dependencies_is_unblocked() {
        let h = Harness::new(Script::default()).await;
        h.item("WO-1", WorkItemStatus::Done).await;
        let mut blocked = crate::store::fixtures::work_item("WO-2", "p", WorkItemStatus::Blocked);
        blocked.depends_on = vec!["WO-1".into()];
        h.db.call(move |db| db.insert_work_items(&[blocked])).await.unwrap();

        let shift = scheduler(&h).run("p", vec![]).await.unwrap();
        assert_eq!(shift.handoff.unwrap().work_completed, vec!["Unblocked WO-2"]);
        assert_eq!(h.status_of("WO-2").await, WorkItemStatus::Ready);
    }

    #[tokio::test]
    async fn test_goal_without_work_item_creates_one() {
        let h = Harness::new(Script::default()).await;
        let shift = scheduler(&h)
            .run("p", vec!["search".into()])
            .await
            .unwrap();
        let handoff = shift.handoff.unwrap();
        assert!(handoff.work_completed[0].contains("in backlog"));
        let items = h.work_items.list(Some("p"), None).await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].status, WorkItemStatus::Backlog);
    }

    #[tokio::test]
    async fn test_one_active_shift_per_project() {
        let h = Harness::new(Script::default()).await;
        let s = scheduler(&h);
        h.db.call(|db| db.start_shift("held", "p", 120)).await.unwrap();
        let err = s.run("p", vec![]).await.unwrap_err();
        assert!(matches!(err, ShiftError::AlreadyActive { .. }));
    }

    #[tokio::test]
    async fn test_unknown_project() {
        let h = Harness::new(Script::default()).await;
        let err = scheduler(&h).context("nope", &[]).await.unwrap_err();
        assert!(matches!(err, ShiftError::ProjectNotFound { .. }));
    }
}
