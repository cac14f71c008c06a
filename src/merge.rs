//! Per-project merge serialization.
//!
//! At most one run may be merging into a project's trunk. The lock is a row
//! in `merge_locks` (unique per project, foreign key to `projects`), so the
//! database is the arbiter even across processes. Waiters park on a
//! per-project `Notify` instead of polling the table.
//!
//! A run captures its project id when it starts, but a background identity
//! merge may collapse that project into another one mid-run. Every acquire and
//! release therefore re-reads the project id from the run record first.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::Notify;
use tracing::{debug, info, warn};
use uuid::Uuid;

use pcc_common::{ControlEvent, MergeLock};

use crate::errors::MergeError;
use crate::events::EventBus;
use crate::store::{DbHandle, LockInsert};

type Result<T> = std::result::Result<T, MergeError>;

/// How long to re-check the table while parked, in case a collapse moved
/// the lock to a project id nobody will notify.
const RECHECK_INTERVAL: Duration = Duration::from_secs(1);

/// Bound on consecutive stale-reference retries before giving up.
const MAX_STALE_RETRIES: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AcquirePolicy {
    /// Wait up to the given duration for the lock.
    Wait(Duration),
    /// Return [`MergeError::LockHeld`] immediately if another run holds it.
    FailFast,
}

#[derive(Clone)]
pub struct MergeCoordinator {
    db: DbHandle,
    events: EventBus,
    waiters: Arc<DashMap<String, Arc<Notify>>>,
    /// Last project id seen per run, for logging changes once.
    known: Arc<DashMap<String, String>>,
}

impl MergeCoordinator {
    pub fn new(db: DbHandle, events: EventBus) -> Self {
        Self {
            db,
            events,
            waiters: Arc::new(DashMap::new()),
            known: Arc::new(DashMap::new()),
        }
    }

    fn notify_for(&self, project_id: &str) -> Arc<Notify> {
        self.waiters
            .entry(project_id.to_string())
            .or_insert_with(|| Arc::new(Notify::new()))
            .clone()
    }

    /// Authoritative project id for `run_id`, following collapse aliases.
    pub async fn current_project_id(&self, run_id: &str) -> Result<String> {
        let rid = run_id.to_string();
        let recorded = self
            .db
            .call(move |db| db.run_project_id(&rid))
            .await?
            .ok_or_else(|| MergeError::RunNotFound {
                run_id: run_id.to_string(),
            })?;
        let lookup = recorded.clone();
        let canonical = self
            .db
            .call(move |db| db.resolve_canonical(&lookup))
            .await?
            .ok_or(MergeError::ProjectNotFound {
                project_id: recorded,
            })?;

        let previous = self.known.insert(run_id.to_string(), canonical.clone());
        if let Some(previous) = previous
            && previous != canonical
        {
            warn!(
                run_id,
                old_project_id = %previous,
                project_id = %canonical,
                "Project identity changed during run, using refreshed id"
            );
        }
        Ok(canonical)
    }

    /// Acquire the merge lock for the run's project.
    ///
    /// `captured_project_id` is the id the caller recorded at run start; it is
    /// only used to detect and log an identity change.
    pub async fn acquire(
        &self,
        captured_project_id: &str,
        run_id: &str,
        policy: AcquirePolicy,
    ) -> Result<MergeLock> {
        self.known
            .entry(run_id.to_string())
            .or_insert_with(|| captured_project_id.to_string());

        let started = Instant::now();
        let mut stale_retries = 0;
        loop {
            let project_id = self.current_project_id(run_id).await?;
            let notify = self.notify_for(&project_id);
            let notified = notify.notified();
            tokio::pin!(notified);
            // Register before trying so a release between the insert and the
            // wait is not missed.
            notified.as_mut().enable();

            let lock_id = Uuid::new_v4().to_string();
            let (pid, rid) = (project_id.clone(), run_id.to_string());
            let attempt = self
                .db
                .call(move |db| db.try_insert_merge_lock(&lock_id, &pid, &rid))
                .await?;

            match attempt {
                LockInsert::Acquired(lock) => {
                    info!(run_id, project_id = %lock.project_id, lock_id = %lock.id, "Merge lock acquired");
                    self.events.publish(ControlEvent::MergeLockAcquired {
                        project_id: lock.project_id.clone(),
                        run_id: run_id.to_string(),
                    });
                    return Ok(lock);
                }
                LockInsert::StaleReference => {
                    stale_retries += 1;
                    if stale_retries > MAX_STALE_RETRIES {
                        return Err(MergeError::ProjectNotFound { project_id });
                    }
                    debug!(run_id, project_id = %project_id, "Stale project reference, re-resolving");
                    continue;
                }
                LockInsert::Held(holder) => {
                    stale_retries = 0;
                    if holder.run_id == run_id {
                        return Ok(holder);
                    }
                    if self.reclaim_if_abandoned(&holder).await? {
                        continue;
                    }
                    let wait = match policy {
                        AcquirePolicy::FailFast => {
                            return Err(MergeError::LockHeld {
                                project_id,
                                holder: holder.run_id,
                            });
                        }
                        AcquirePolicy::Wait(limit) => {
                            let elapsed = started.elapsed();
                            if elapsed >= limit {
                                return Err(MergeError::Timeout {
                                    project_id,
                                    waited_secs: limit.as_secs(),
                                });
                            }
                            (limit - elapsed).min(RECHECK_INTERVAL)
                        }
                    };
                    debug!(run_id, project_id = %project_id, holder = %holder.run_id, "Waiting for merge lock");
                    let _ = tokio::time::timeout(wait, notified).await;
                }
            }
        }
    }

    /// Drop a lock whose holder run has already finished.
    async fn reclaim_if_abandoned(&self, holder: &MergeLock) -> Result<bool> {
        let rid = holder.run_id.clone();
        let run = self.db.call(move |db| db.get_run(&rid)).await?;
        let abandoned = run.is_none_or(|r| r.status.is_terminal());
        if !abandoned {
            return Ok(false);
        }
        warn!(
            project_id = %holder.project_id,
            holder = %holder.run_id,
            lock_id = %holder.id,
            "Reclaiming merge lock held by a finished run"
        );
        let lock_id = holder.id.clone();
        self.db.call(move |db| db.delete_merge_lock(&lock_id)).await?;
        self.wake(&holder.project_id);
        Ok(true)
    }

    fn wake(&self, project_id: &str) {
        if let Some(notify) = self.waiters.get(project_id) {
            notify.notify_waiters();
        }
    }

    /// Release a lock. Returns `false` if it was already gone.
    pub async fn release(&self, lock_id: &str, run_id: &str) -> Result<bool> {
        // A failed lookup must not strand the lock.
        let project_id = match self.current_project_id(run_id).await {
            Ok(pid) => Some(pid),
            Err(e) => {
                warn!(run_id, error = %e, "Could not re-resolve project before release");
                None
            }
        };
        let id = lock_id.to_string();
        let deleted = self.db.call(move |db| db.delete_merge_lock(&id)).await?;
        self.known.remove(run_id);

        let Some(lock) = deleted else {
            debug!(run_id, lock_id, "Merge lock already released");
            return Ok(false);
        };
        info!(run_id, project_id = %lock.project_id, lock_id, "Merge lock released");
        self.wake(&lock.project_id);
        if let Some(pid) = &project_id
            && *pid != lock.project_id
        {
            self.wake(pid);
        }
        self.events.publish(ControlEvent::MergeLockReleased {
            project_id: project_id.unwrap_or(lock.project_id),
            run_id: run_id.to_string(),
        });
        Ok(true)
    }

    /// Release whatever lock `run_id` holds, if any.
    pub async fn release_for_run(&self, run_id: &str) -> Result<bool> {
        let rid = run_id.to_string();
        let held = self
            .db
            .call(move |db| {
                Ok(db
                    .list_merge_locks()?
                    .into_iter()
                    .find(|lock| lock.run_id == rid))
            })
            .await?;
        match held {
            Some(lock) => self.release(&lock.id, run_id).await,
            None => {
                self.known.remove(run_id);
                Ok(false)
            }
        }
    }

    pub async fn get(&self, project_id: &str) -> Result<Option<MergeLock>> {
        let pid = project_id.to_string();
        Ok(self.db.call(move |db| db.get_merge_lock(&pid)).await?)
    }
}
