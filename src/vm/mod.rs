//! VM lifecycle per project.
//!
//! ```text
//! not_provisioned ──provision──▶ running ◀──start/stop──▶ stopped ──delete──▶ deleted
//!                                   └──────── any failed attempt ──▶ error
//! ```
//!
//! `VmManager` owns the `vm_records` table. Operations on one project are
//! serialized; every remote call is retried per [`RetryPolicy`] and a
//! persistent failure lands the record in `error` with `last_error` set.
//! Asking for the state a VM is already in is a no-op.

pub mod provider;
pub mod reaper;
pub mod retry;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use tracing::{info, warn};

use pcc_common::{ControlEvent, SizeClass, VmRecord, VmStatus};

use crate::errors::VmError;
use crate::events::EventBus;
use crate::exec::CommandAudit;
use crate::store::DbHandle;
use crate::util::slugify;
use crate::workspace::RemoteContext;

use provider::{ComputeProvider, InstanceAddresses, RemoteOutput};
use retry::{RetryExhausted, RetryPolicy};

type Result<T> = std::result::Result<T, VmError>;

#[derive(Clone)]
pub struct VmManager {
    db: DbHandle,
    events: EventBus,
    provider: Option<Arc<dyn ComputeProvider>>,
    retry: RetryPolicy,
    remote_root: String,
    locks: Arc<DashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

pub fn instance_name(project_id: &str) -> String {
    format!("pcc-{}", slugify(project_id, 50))
}

impl VmManager {
    pub fn new(
        db: DbHandle,
        events: EventBus,
        provider: Option<Arc<dyn ComputeProvider>>,
        retry: RetryPolicy,
        remote_root: String,
    ) -> Self {
        Self {
            db,
            events,
            provider,
            retry,
            remote_root,
            locks: Arc::new(DashMap::new()),
        }
    }

    pub fn has_provider(&self) -> bool {
        self.provider.is_some()
    }

    fn provider(&self) -> Result<Arc<dyn ComputeProvider>> {
        self.provider
            .clone()
            .ok_or_else(|| VmError::Other(anyhow::anyhow!("No compute provider configured")))
    }

    fn lock_for(&self, project_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .entry(project_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    async fn canonical(&self, project_id: &str) -> Result<String> {
        let pid = project_id.to_string();
        self.db
            .call(move |db| db.resolve_canonical(&pid))
            .await?
            .ok_or_else(|| VmError::ProjectNotFound {
                project_id: project_id.to_string(),
            })
    }

    async fn load(&self, project_id: &str) -> Result<VmRecord> {
        let pid = project_id.to_string();
        let record = self.db.call(move |db| db.get_vm_record(&pid)).await?;
        Ok(record.unwrap_or_else(|| VmRecord::not_provisioned(project_id)))
    }

    async fn save(&self, mut record: VmRecord, previous: VmStatus) -> Result<VmRecord> {
        record.updated_at = Utc::now();
        let to_save = record.clone();
        self.db.call(move |db| db.upsert_vm_record(&to_save)).await?;
        if record.status != previous {
            info!(
                project_id = %record.project_id,
                from = %previous,
                to = %record.status,
                "VM status changed"
            );
            self.events.publish(ControlEvent::VmStatusChanged {
                project_id: record.project_id.clone(),
                status: record.status,
            });
        }
        Ok(record)
    }

    /// Record a persistent failure and turn it into the caller's error.
    async fn fail(
        &self,
        mut record: VmRecord,
        previous: VmStatus,
        operation: &'static str,
        exhausted: RetryExhausted,
    ) -> VmError {
        warn!(
            project_id = %record.project_id,
            operation,
            attempts = exhausted.attempts,
            error = %exhausted.error,
            "VM operation failed"
        );
        record.status = VmStatus::Error;
        record.last_error = Some(format!("{operation}: {}", exhausted.error));
        let project_id = record.project_id.clone();
        if let Err(e) = self.save(record, previous).await {
            return e;
        }
        VmError::OperationFailed {
            project_id,
            operation,
            attempts: exhausted.attempts,
            source: exhausted.error,
        }
    }

    pub async fn status(&self, project_id: &str) -> Result<VmRecord> {
        let pid = self.canonical(project_id).await?;
        self.load(&pid).await
    }

    pub async fn list(&self) -> Result<Vec<VmRecord>> {
        Ok(self.db.call(|db| db.list_vm_records()).await?)
    }

    /// Create the instance, or bring an existing one up.
    pub async fn provision(&self, project_id: &str, size: Option<SizeClass>) -> Result<VmRecord> {
        let pid = self.canonical(project_id).await?;
        let lock = self.lock_for(&pid);
        let _guard = lock.lock().await;
        let record = self.load(&pid).await?;
        match record.status {
            VmStatus::Running => Ok(record),
            VmStatus::Stopped => self.start_locked(record).await,
            VmStatus::NotProvisioned | VmStatus::Deleted | VmStatus::Error => {
                self.create_locked(record, size).await
            }
        }
    }

    async fn create_locked(&self, mut record: VmRecord, size: Option<SizeClass>) -> Result<VmRecord> {
        let provider = self.provider()?;
        let previous = record.status;
        let name = record
            .instance_name
            .clone()
            .unwrap_or_else(|| instance_name(&record.project_id));
        let size = size.unwrap_or(record.size);
        let result = self
            .retry
            .run("provision", || provider.create_instance(&name, size))
            .await;
        match result {
            Ok(addrs) => {
                let now = Utc::now();
                record.status = VmStatus::Running;
                record.instance_name = Some(name);
                record.size = size;
                apply_addresses(&mut record, addrs);
                record.last_started_at = Some(now);
                record.last_activity_at = Some(now);
                record.last_error = None;
                self.save(record, previous).await
            }
            Err(exhausted) => {
                record.instance_name = Some(name);
                Err(self.fail(record, previous, "provision", exhausted).await)
            }
        }
    }

    pub async fn start(&self, project_id: &str) -> Result<VmRecord> {
        let pid = self.canonical(project_id).await?;
        let lock = self.lock_for(&pid);
        let _guard = lock.lock().await;
        let record = self.load(&pid).await?;
        match record.status {
            VmStatus::Running => Ok(record),
            VmStatus::Stopped => self.start_locked(record).await,
            VmStatus::Error if record.instance_name.is_some() => self.start_locked(record).await,
            status => Err(VmError::InvalidState {
                project_id: pid,
                status,
                operation: "start",
            }),
        }
    }

    async fn start_locked(&self, mut record: VmRecord) -> Result<VmRecord> {
        let provider = self.provider()?;
        let previous = record.status;
        let name = record
            .instance_name
            .clone()
            .unwrap_or_else(|| instance_name(&record.project_id));
        match self.retry.run("start", || provider.start_instance(&name)).await {
            Ok(addrs) => {
                let now = Utc::now();
                record.status = VmStatus::Running;
                apply_addresses(&mut record, addrs);
                record.last_started_at = Some(now);
                record.last_activity_at = Some(now);
                record.last_error = None;
                self.save(record, previous).await
            }
            Err(exhausted) => Err(self.fail(record, previous, "start", exhausted).await),
        }
    }

    pub async fn stop(&self, project_id: &str) -> Result<VmRecord> {
        let pid = self.canonical(project_id).await?;
        let lock = self.lock_for(&pid);
        let _guard = lock.lock().await;
        let record = self.load(&pid).await?;
        match record.status {
            VmStatus::Stopped => Ok(record),
            VmStatus::Running => self.stop_locked(record).await,
            VmStatus::Error if record.instance_name.is_some() => self.stop_locked(record).await,
            status => Err(VmError::InvalidState {
                project_id: pid,
                status,
                operation: "stop",
            }),
        }
    }

    async fn stop_locked(&self, mut record: VmRecord) -> Result<VmRecord> {
        let provider = self.provider()?;
        let previous = record.status;
        let Some(name) = record.instance_name.clone() else {
            return Err(VmError::InvalidState {
                project_id: record.project_id,
                status: record.status,
                operation: "stop",
            });
        };
        match self.retry.run("stop", || provider.stop_instance(&name)).await {
            Ok(()) => {
                record.status = VmStatus::Stopped;
                record.external_ip = None;
                record.last_error = None;
                self.save(record, previous).await
            }
            Err(exhausted) => Err(self.fail(record, previous, "stop", exhausted).await),
        }
    }

    /// Change the size class. A running VM is stopped, resized and started
    /// again; a stopped one stays stopped.
    pub async fn resize(&self, project_id: &str, size: SizeClass) -> Result<VmRecord> {
        let pid = self.canonical(project_id).await?;
        let lock = self.lock_for(&pid);
        let _guard = lock.lock().await;
        let record = self.load(&pid).await?;
        if !matches!(record.status, VmStatus::Running | VmStatus::Stopped) {
            // Nothing exists remotely yet; the next provision uses the new size.
            if matches!(record.status, VmStatus::NotProvisioned | VmStatus::Deleted) {
                let previous = record.status;
                let mut record = record;
                record.size = size;
                return self.save(record, previous).await;
            }
            return Err(VmError::InvalidState {
                project_id: pid,
                status: record.status,
                operation: "resize",
            });
        }
        if record.size == size {
            return Ok(record);
        }
        let was_running = record.status == VmStatus::Running;
        let mut record = if was_running {
            self.stop_locked(record).await?
        } else {
            record
        };

        let provider = self.provider()?;
        let previous = record.status;
        let Some(name) = record.instance_name.clone() else {
            return Err(VmError::InvalidState {
                project_id: pid,
                status: record.status,
                operation: "resize",
            });
        };
        match self
            .retry
            .run("resize", || provider.resize_instance(&name, size))
            .await
        {
            Ok(()) => {
                record.size = size;
                let record = self.save(record, previous).await?;
                if was_running {
                    self.start_locked(record).await
                } else {
                    Ok(record)
                }
            }
            Err(exhausted) => Err(self.fail(record, previous, "resize", exhausted).await),
        }
    }

    pub async fn delete(&self, project_id: &str) -> Result<VmRecord> {
        let pid = self.canonical(project_id).await?;
        let lock = self.lock_for(&pid);
        let _guard = lock.lock().await;
        let record = self.load(&pid).await?;
        self.delete_locked(record).await
    }

    async fn delete_locked(&self, mut record: VmRecord) -> Result<VmRecord> {
        let previous = record.status;
        if record.status == VmStatus::Deleted {
            return Ok(record);
        }
        if let Some(name) = record.instance_name.clone() {
            let provider = self.provider()?;
            if let Err(exhausted) = self.retry.run("delete", || provider.delete_instance(&name)).await {
                return Err(self.fail(record, previous, "delete", exhausted).await);
            }
        }
        record.status = VmStatus::Deleted;
        record.instance_name = None;
        record.external_ip = None;
        record.internal_ip = None;
        record.last_error = None;
        self.save(record, previous).await
    }

    pub async fn touch_activity(&self, project_id: &str) -> Result<()> {
        let pid = self.canonical(project_id).await?;
        self.db
            .call(move |db| db.touch_vm_activity(&pid, Utc::now()))
            .await?;
        Ok(())
    }

    /// Copy a run's worktree onto the project's VM.
    ///
    /// Retried on its own; a sync failure leaves the VM status untouched.
    pub async fn sync_workspace(
        &self,
        project_id: &str,
        run_id: &str,
        local: &Path,
        audit: &dyn CommandAudit,
    ) -> Result<RemoteContext> {
        let pid = self.canonical(project_id).await?;
        let record = self.load(&pid).await?;
        let name = match (&record.status, &record.instance_name) {
            (VmStatus::Running, Some(name)) => name.clone(),
            _ => {
                return Err(VmError::InvalidState {
                    project_id: pid,
                    status: record.status,
                    operation: "sync",
                });
            }
        };
        let provider = self.provider()?;
        let remote_path = format!("{}/{}", self.remote_root.trim_end_matches('/'), run_id);
        let result = self
            .retry
            .run("sync", || provider.sync_repo(&name, local, &remote_path, audit))
            .await;
        match result {
            Ok(()) => {
                self.touch_activity(&pid).await?;
                Ok(RemoteContext {
                    instance_name: name,
                    remote_path,
                })
            }
            Err(exhausted) => {
                warn!(project_id = %pid, run_id, error = %exhausted.error, "Repository sync failed");
                Err(VmError::OperationFailed {
                    project_id: pid,
                    operation: "sync",
                    attempts: exhausted.attempts,
                    source: exhausted.error,
                })
            }
        }
    }

    /// Run a command on the VM. Only spawn-level failures are retried; a
    /// command that runs and exits non-zero is returned as-is.
    pub async fn exec(
        &self,
        project_id: &str,
        remote: &RemoteContext,
        command: &str,
        timeout: Duration,
        audit: &dyn CommandAudit,
    ) -> Result<RemoteOutput> {
        let provider = self.provider()?;
        let result = self
            .retry
            .run("exec", || {
                provider.exec(&remote.instance_name, &remote.remote_path, command, timeout, audit)
            })
            .await;
        self.touch_activity(project_id).await?;
        result.map_err(|exhausted| VmError::OperationFailed {
            project_id: project_id.to_string(),
            operation: "exec",
            attempts: exhausted.attempts,
            source: exhausted.error,
        })
    }

    pub(crate) async fn stop_if_idle(&self, record: VmRecord) -> Result<VmRecord> {
        let lock = self.lock_for(&record.project_id);
        let _guard = lock.lock().await;
        // Re-read under the lock; a run may have touched it meanwhile.
        let current = self.load(&record.project_id).await?;
        if current.status != VmStatus::Running || current.last_activity_at != record.last_activity_at {
            return Ok(current);
        }
        self.stop_locked(current).await
    }

    pub(crate) async fn delete_if_unchanged(&self, record: VmRecord) -> Result<VmRecord> {
        let lock = self.lock_for(&record.project_id);
        let _guard = lock.lock().await;
        let current = self.load(&record.project_id).await?;
        if current.status != VmStatus::Stopped || current.last_activity_at != record.last_activity_at {
            return Ok(current);
        }
        self.delete_locked(current).await
    }
}

fn apply_addresses(record: &mut VmRecord, addrs: InstanceAddresses) {
    record.external_ip = addrs.external_ip;
    record.internal_ip = addrs.internal_ip;
}
