//! The cross-project session: a human briefing, then autonomous shifts.
//!
//! A session only iterates while `autonomous`. Any global or user message
//! that arrives in that state pauses it; the loop finishes the shift in
//! flight and then waits for an explicit resume or stop.

use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

use pcc_common::{BudgetStatus, ControlEvent, GlobalSession, ProjectStatus, SessionState};

use super::ShiftScheduler;
use crate::budget::BudgetGovernor;
use crate::errors::ShiftError;
use crate::events::EventBus;
use crate::store::DbHandle;

type Result<T> = std::result::Result<T, ShiftError>;

struct Inner {
    db: DbHandle,
    events: EventBus,
    shifts: ShiftScheduler,
    budget: BudgetGovernor,
    max_iterations: u32,
    /// Held by the autonomous loop for its whole life, so at most one runs.
    looping: tokio::sync::Mutex<()>,
}

#[derive(Clone)]
pub struct SessionCoordinator {
    inner: Arc<Inner>,
}

impl SessionCoordinator {
    pub fn new(
        db: DbHandle,
        events: EventBus,
        shifts: ShiftScheduler,
        budget: BudgetGovernor,
        max_iterations: u32,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                db,
                events,
                shifts,
                budget,
                max_iterations,
                looping: tokio::sync::Mutex::new(()),
            }),
        }
    }

    pub async fn current(&self) -> Result<Option<GlobalSession>> {
        Ok(self.inner.db.call(|db| db.latest_session()).await?)
    }

    async fn require_current(&self) -> Result<GlobalSession> {
        self.current().await?.ok_or(ShiftError::NoSession)
    }

    /// Apply `change` to the current session if its state is one of
    /// `allowed`, atomically with respect to other updates.
    async fn update<F>(
        &self,
        operation: &'static str,
        allowed: &'static [SessionState],
        change: F,
    ) -> Result<GlobalSession>
    where
        F: FnOnce(&mut GlobalSession) + Send + 'static,
    {
        let outcome = self
            .inner
            .db
            .call(move |db| {
                let Some(mut session) = db.latest_session()? else {
                    return Ok(Err(ShiftError::NoSession));
                };
                if !allowed.contains(&session.state) {
                    return Ok(Err(ShiftError::InvalidSessionState {
                        state: session.state,
                        operation,
                    }));
                }
                change(&mut session);
                session.updated_at = Utc::now();
                db.save_session(&session)?;
                Ok(Ok(session))
            })
            .await??;
        info!(session_id = %outcome.id, state = %outcome.state, operation, "Session updated");
        self.inner.events.publish(ControlEvent::SessionStateChanged {
            session_id: outcome.id.clone(),
            state: outcome.state,
        });
        Ok(outcome)
    }

    /// Start a new session, or revise the goals of one still in briefing.
    pub async fn briefing(
        &self,
        goals: Vec<String>,
        constraints: Vec<String>,
    ) -> Result<GlobalSession> {
        if let Some(current) = self.current().await? {
            match current.state {
                SessionState::Briefing => {
                    return self
                        .update("brief", &[SessionState::Briefing], move |s| {
                            s.goals = goals;
                            s.constraints = constraints;
                        })
                        .await;
                }
                state if !state.is_finished() => {
                    return Err(ShiftError::InvalidSessionState {
                        state,
                        operation: "brief",
                    });
                }
                _ => {}
            }
        }
        let now = Utc::now();
        let session = GlobalSession {
            id: Uuid::new_v4().to_string(),
            state: SessionState::Briefing,
            goals,
            constraints,
            iteration: 0,
            max_iterations: self.inner.max_iterations,
            paused_at: None,
            pause_reason: None,
            created_at: now,
            updated_at: now,
        };
        let saved = session.clone();
        self.inner.db.call(move |db| db.save_session(&saved)).await?;
        info!(session_id = %session.id, goals = ?session.goals, "Session briefing started");
        self.inner.events.publish(ControlEvent::SessionStateChanged {
            session_id: session.id.clone(),
            state: session.state,
        });
        Ok(session)
    }

    /// The human confirmed the briefing; begin iterating.
    pub async fn confirm(&self) -> Result<GlobalSession> {
        let session = self
            .update("confirm", &[SessionState::Briefing], |s| {
                s.state = SessionState::Autonomous;
            })
            .await?;
        self.spawn_loop();
        Ok(session)
    }

    pub async fn resume(&self) -> Result<GlobalSession> {
        let session = self
            .update("resume", &[SessionState::Paused], |s| {
                s.state = SessionState::Autonomous;
                s.paused_at = None;
                s.pause_reason = None;
            })
            .await?;
        self.spawn_loop();
        Ok(session)
    }

    pub async fn stop(&self) -> Result<GlobalSession> {
        self.update(
            "stop",
            &[
                SessionState::Briefing,
                SessionState::Autonomous,
                SessionState::Paused,
            ],
            |s| s.state = SessionState::Stopped,
        )
        .await
    }

    /// Pause an autonomous session because an outside message arrived.
    /// Returns the paused session, or `None` when nothing was running.
    pub async fn interrupt(&self, reason: &str) -> Result<Option<GlobalSession>> {
        let current = self.current().await?;
        if current.map(|s| s.state) != Some(SessionState::Autonomous) {
            return Ok(None);
        }
        let reason = reason.to_string();
        match self
            .update("pause", &[SessionState::Autonomous], move |s| {
                s.state = SessionState::Paused;
                s.paused_at = Some(Utc::now());
                s.pause_reason = Some(reason);
            })
            .await
        {
            Ok(session) => Ok(Some(session)),
            // Lost a race with stop or completion.
            Err(ShiftError::InvalidSessionState { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn spawn_loop(&self) {
        let this = self.clone();
        tokio::spawn(async move {
            let _looping = this.inner.looping.lock().await;
            loop {
                match this.step().await {
                    Ok(true) => continue,
                    Ok(false) => break,
                    Err(e) => {
                        warn!(error = %e, "Session loop stopped");
                        break;
                    }
                }
            }
        });
    }

    /// Pick the next project to work on: active, no shift running, budget
    /// not exhausted. Candidates rotate with the iteration count.
    async fn next_project(&self, iteration: u32) -> Result<Option<String>> {
        let (projects, active) = self
            .inner
            .db
            .call(|db| Ok((db.list_projects()?, db.list_active_shifts()?)))
            .await?;
        let mut eligible = Vec::new();
        for project in projects {
            if project.status != ProjectStatus::Active
                || active.iter().any(|s| s.project_id == project.id)
            {
                continue;
            }
            match self.inner.budget.allocation(&project.id).await {
                Ok(alloc) if alloc.status == BudgetStatus::Exhausted => continue,
                Ok(_) => eligible.push(project.id),
                Err(e) => {
                    warn!(project_id = %project.id, error = %e, "Skipping project with unreadable budget");
                }
            }
        }
        if eligible.is_empty() {
            return Ok(None);
        }
        let pick = iteration as usize % eligible.len();
        Ok(Some(eligible.swap_remove(pick)))
    }

    /// Run one shift of the autonomous loop. Returns whether the loop should
    /// keep going.
    pub async fn step(&self) -> Result<bool> {
        let session = self.require_current().await?;
        if session.state != SessionState::Autonomous {
            return Ok(false);
        }
        if session.iteration >= session.max_iterations {
            self.update("complete", &[SessionState::Autonomous], |s| {
                s.state = SessionState::Completed;
            })
            .await?;
            return Ok(false);
        }
        let Some(project_id) = self.next_project(session.iteration).await? else {
            info!(session_id = %session.id, "No eligible project left");
            self.update("complete", &[SessionState::Autonomous], |s| {
                s.state = SessionState::Completed;
            })
            .await?;
            return Ok(false);
        };

        match self.inner.shifts.run(&project_id, session.goals.clone()).await {
            Ok(shift) => info!(session_id = %session.id, shift_id = %shift.id, project_id = %project_id, "Session shift finished"),
            Err(ShiftError::AlreadyActive { .. }) => {}
            Err(e) => warn!(session_id = %session.id, project_id = %project_id, error = %e, "Session shift failed"),
        }

        let id = session.id.clone();
        let after = self
            .inner
            .db
            .call(move |db| {
                let Some(mut s) = db.get_session(&id)? else {
                    return Ok(None);
                };
                s.iteration += 1;
                if s.state == SessionState::Autonomous && s.iteration >= s.max_iterations {
                    s.state = SessionState::Completed;
                }
                s.updated_at = Utc::now();
                db.save_session(&s)?;
                Ok(Some(s))
            })
            .await?;
        let Some(after) = after else {
            return Ok(false);
        };
        if after.state == SessionState::Completed {
            self.inner.events.publish(ControlEvent::SessionStateChanged {
                session_id: after.id.clone(),
                state: after.state,
            });
        }
        Ok(after.state == SessionState::Autonomous)
    }
}
