//! Background cleanup of idle compute and leftover worktrees.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use pcc_common::VmStatus;

use super::VmManager;
use crate::config::VmSection;
use crate::store::DbHandle;
use crate::workspace::WorkspaceProvider;

#[derive(Debug, Clone)]
pub struct ReaperSettings {
    pub idle_stop_after: chrono::Duration,
    pub retention: chrono::Duration,
    pub interval: Duration,
}

impl ReaperSettings {
    pub fn from_config(vm: &VmSection) -> Self {
        Self {
            idle_stop_after: chrono::Duration::minutes(vm.idle_stop_after_minutes as i64),
            retention: chrono::Duration::hours(vm.retention_hours as i64),
            interval: Duration::from_secs(vm.reaper_interval_secs.max(1)),
        }
    }
}

#[derive(Debug, Default, PartialEq)]
pub struct ReapReport {
    pub stopped: Vec<String>,
    pub deleted: Vec<String>,
    pub worktrees_removed: Vec<String>,
}

pub struct Reaper {
    db: DbHandle,
    vm: VmManager,
    workspaces: Arc<dyn WorkspaceProvider>,
    settings: ReaperSettings,
}

impl Reaper {
    pub fn new(
        db: DbHandle,
        vm: VmManager,
        workspaces: Arc<dyn WorkspaceProvider>,
        settings: ReaperSettings,
    ) -> Self {
        Self {
            db,
            vm,
            workspaces,
            settings,
        }
    }

    /// One pass. Failures on individual resources are logged and skipped.
    pub async fn sweep(&self, now: DateTime<Utc>) -> anyhow::Result<ReapReport> {
        let mut report = ReapReport::default();

        if self.vm.has_provider() {
            for record in self.vm.list().await? {
                let idle_since = record.last_activity_at.or(record.last_started_at);
                let Some(idle_since) = idle_since else { continue };
                let idle = now - idle_since;
                let project_id = record.project_id.clone();
                match record.status {
                    VmStatus::Running if idle > self.settings.idle_stop_after => {
                        match self.vm.stop_if_idle(record).await {
                            Ok(r) if r.status == VmStatus::Stopped => report.stopped.push(project_id),
                            Ok(_) => {}
                            Err(e) => warn!(project_id = %project_id, error = %e, "Failed to stop idle VM"),
                        }
                    }
                    VmStatus::Stopped if idle > self.settings.retention => {
                        match self.vm.delete_if_unchanged(record).await {
                            Ok(r) if r.status == VmStatus::Deleted => report.deleted.push(project_id),
                            Ok(_) => {}
                            Err(e) => warn!(project_id = %project_id, error = %e, "Failed to delete VM"),
                        }
                    }
                    _ => {}
                }
            }
        }

        let cutoff = now - self.settings.retention;
        for run_id in self.workspaces.list_worktrees().await? {
            let rid = run_id.clone();
            let found = self
                .db
                .call(move |db| {
                    let Some(run) = db.get_run(&rid)? else {
                        return Ok(None);
                    };
                    let project = db.get_project(&run.project_id)?;
                    Ok(project.map(|p| (run, p)))
                })
                .await?;
            let Some((run, project)) = found else {
                debug!(run_id = %run_id, "Worktree without a known run, leaving it");
                continue;
            };
            let expired = run.status.is_terminal() && run.completed_at.is_some_and(|at| at < cutoff);
            if !expired {
                continue;
            }
            match self.workspaces.remove_stale(&project, &run_id).await {
                Ok(()) => report.worktrees_removed.push(run_id),
                Err(e) => warn!(run_id = %run_id, error = %e, "Failed to remove stale worktree"),
            }
        }

        if report != ReapReport::default() {
            info!(
                stopped = report.stopped.len(),
                deleted = report.deleted.len(),
                worktrees = report.worktrees_removed.len(),
                "Reaper pass finished"
            );
        }
        Ok(report)
    }

    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.settings.interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep(Utc::now()).await {
                        warn!(error = %e, "Reaper pass failed");
                    }
                }
            }
        }
    }
}
