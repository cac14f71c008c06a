//! Per-project spend tracking and run admission.
//!
//! `BudgetGovernor` owns the `budgets` and `cost_events` tables. Every
//! read-modify-write of an allocation happens inside a single database call,
//! and admission decisions are serialized by one async mutex so a release
//! from the queue can never race a fresh admission.

pub mod queue;
pub mod status;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Datelike, NaiveDate, Utc};
use dashmap::DashMap;
use serde_json::json;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use pcc_common::{
    BudgetAllocation, BudgetSnapshot, BudgetStatus, CommunicationIntent, CommunicationScope,
    CommunicationType, ControlEvent, CostEvent, EscalationReason, EscalationRecord,
    NewCommunication,
};

use crate::config::BudgetSection;
use crate::errors::BudgetError;
use crate::events::EventBus;
use crate::store::{DbHandle, PccDb};

pub use queue::Released;
pub use status::BudgetThresholds;

use queue::AdmissionQueue;

type Result<T> = std::result::Result<T, BudgetError>;

#[derive(Debug, Clone)]
pub struct BudgetSettings {
    pub default_monthly_usd: f64,
    pub default_daily_drip_usd: f64,
    pub thresholds: BudgetThresholds,
}

impl BudgetSettings {
    pub fn from_config(budget: &BudgetSection) -> Self {
        Self {
            default_monthly_usd: budget.default_monthly_usd,
            default_daily_drip_usd: budget.default_daily_drip_usd,
            thresholds: budget.thresholds(),
        }
    }
}

impl Default for BudgetSettings {
    fn default() -> Self {
        Self::from_config(&BudgetSection::default())
    }
}

/// What the caller can do about a denial.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct RescueOffer {
    pub action: &'static str,
    pub suggested_top_up_usd: f64,
}

#[derive(Debug)]
pub enum Admission {
    Admitted { reserved_usd: f64 },
    /// Held until budget covers it; the receiver fires on release.
    Queued {
        position: usize,
        ticket: oneshot::Receiver<Released>,
    },
    Denied {
        escalation: EscalationRecord,
        rescue: RescueOffer,
    },
}

/// Which pool an admitted run's estimate is held against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Funding {
    Monthly,
    Drip,
}

impl Funding {
    fn reserve(self, alloc: &mut BudgetAllocation, amount: f64) {
        match self {
            Self::Monthly => alloc.reserved_usd += amount,
            Self::Drip => alloc.drip_reserved_usd += amount,
        }
    }

    fn unreserve(self, alloc: &mut BudgetAllocation, amount: f64) {
        match self {
            Self::Monthly => alloc.reserved_usd = (alloc.reserved_usd - amount).max(0.0),
            Self::Drip => alloc.drip_reserved_usd = (alloc.drip_reserved_usd - amount).max(0.0),
        }
    }
}

#[derive(Debug, Clone)]
struct Reservation {
    project_id: String,
    remaining_usd: f64,
    funding: Funding,
}

#[derive(Clone)]
pub struct BudgetGovernor {
    db: DbHandle,
    events: EventBus,
    settings: BudgetSettings,
    queues: Arc<std::sync::Mutex<HashMap<String, AdmissionQueue>>>,
    reservations: Arc<DashMap<String, Reservation>>,
    admission: Arc<tokio::sync::Mutex<()>>,
}

/// Result of one allocation update done inside a database call.
struct Applied {
    allocation: BudgetAllocation,
    previous: BudgetStatus,
}

fn month_start(day: NaiveDate) -> NaiveDate {
    day.with_day(1).unwrap_or(day)
}

fn same_month(a: NaiveDate, b: NaiveDate) -> bool {
    (a.year(), a.month()) == (b.year(), b.month())
}

/// Today's drip can hold `estimate` on top of what it already holds.
fn drip_covers(alloc: &BudgetAllocation, estimate: f64) -> bool {
    alloc.daily_drip_usd > 0.0 && alloc.drip_open_usd() >= estimate
}

/// Current burn rate for an allocation, read from its cost events.
fn burn_rate_for(db: &PccDb, alloc: &BudgetAllocation, now: DateTime<Utc>) -> anyhow::Result<f64> {
    let week_ago = now - chrono::Duration::days(7);
    let trailing = db.spend_since(&alloc.project_id, week_ago)?;
    let has_full_week = db
        .earliest_cost_event(&alloc.project_id)?
        .is_some_and(|first| first <= week_ago);
    let days_into_period = (now.date_naive() - alloc.period_start).num_days() as f64 + 1.0;
    Ok(status::burn_rate(
        trailing,
        has_full_week,
        alloc.spent_usd,
        days_into_period,
    ))
}

impl BudgetGovernor {
    pub fn new(db: DbHandle, events: EventBus, settings: BudgetSettings) -> Self {
        Self {
            db,
            events,
            settings,
            queues: Arc::new(std::sync::Mutex::new(HashMap::new())),
            reservations: Arc::new(DashMap::new()),
            admission: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    async fn canonical(&self, project_id: &str) -> Result<String> {
        let pid = project_id.to_string();
        self.db
            .call(move |db| db.resolve_canonical(&pid))
            .await?
            .ok_or_else(|| BudgetError::ProjectNotFound {
                project_id: project_id.to_string(),
            })
    }

    /// Load the allocation, creating the default one, rolling the period and
    /// crediting today's drip as needed. Runs inside a database call.
    fn load_current(
        db: &PccDb,
        settings: &BudgetSettings,
        project_id: &str,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Applied> {
        let mut alloc = match db.get_budget(project_id)? {
            Some(alloc) => alloc,
            None => {
                let mut alloc = BudgetAllocation::new(
                    project_id,
                    settings.default_monthly_usd,
                    settings.default_daily_drip_usd,
                );
                alloc.period_start = month_start(now.date_naive());
                alloc
            }
        };
        let previous = alloc.status;
        let today = now.date_naive();
        let mut reopened = db.get_budget(project_id)?.is_none();
        let mut credited = false;

        if !same_month(today, alloc.period_start) {
            alloc.period_start = month_start(today);
            alloc.spent_usd = 0.0;
            alloc.drip_spent_usd = 0.0;
            reopened = true;
        }
        if alloc.daily_drip_usd > 0.0 && alloc.drip_credited_on != Some(today) {
            // Yesterday's unspent drip is dropped, not carried over.
            alloc.drip_available_usd = alloc.daily_drip_usd;
            alloc.drip_credited_on = Some(today);
            credited = true;
        }
        if reopened {
            let burn = burn_rate_for(db, &alloc, now)?;
            alloc.status = status::derive_status(&alloc, burn, &settings.thresholds);
        }
        if reopened || credited {
            alloc.updated_at = now;
            db.save_budget(&alloc)?;
        }
        Ok(Applied {
            allocation: alloc,
            previous,
        })
    }

    fn publish_status_change(&self, applied: &Applied) {
        let alloc = &applied.allocation;
        if alloc.status == applied.previous {
            return;
        }
        info!(
            project_id = %alloc.project_id,
            from = %applied.previous,
            to = %alloc.status,
            remaining_usd = alloc.remaining_usd(),
            "Budget status changed"
        );
        self.events.publish(ControlEvent::BudgetStatusChanged {
            project_id: alloc.project_id.clone(),
            status: alloc.status,
        });
    }

    /// Post a budget communication when the status worsens.
    async fn communicate_status(&self, applied: &Applied) -> Result<()> {
        let alloc = &applied.allocation;
        if alloc.status <= applied.previous {
            return Ok(());
        }
        let (kind, intent) = match alloc.status {
            BudgetStatus::Healthy => return Ok(()),
            BudgetStatus::Warning => (CommunicationType::BudgetWarning, CommunicationIntent::Status),
            BudgetStatus::Critical => (CommunicationType::BudgetCritical, CommunicationIntent::Status),
            BudgetStatus::Exhausted => {
                (CommunicationType::BudgetExhausted, CommunicationIntent::Escalation)
            }
        };
        let message = NewCommunication {
            intent,
            kind,
            scope: CommunicationScope::Project,
            summary: format!(
                "Budget for {} is {} (${:.2} remaining)",
                alloc.project_id,
                alloc.status,
                alloc.remaining_usd()
            ),
            body: None,
            run_id: None,
            shift_id: None,
            payload: Some(json!({
                "status": alloc.status,
                "remaining_usd": alloc.remaining_usd(),
                "monthly_allocation_usd": alloc.monthly_allocation_usd,
                "spent_usd": alloc.spent_usd,
            })),
        };
        let pid = alloc.project_id.clone();
        self.db
            .call(move |db| {
                db.insert_communication(&Uuid::new_v4().to_string(), Some(&pid), &message)
            })
            .await?;
        Ok(())
    }

    async fn after_update(&self, applied: &Applied) -> Result<()> {
        self.publish_status_change(applied);
        self.communicate_status(applied).await?;
        if applied.previous == BudgetStatus::Exhausted
            && applied.allocation.status != BudgetStatus::Exhausted
        {
            self.resolve_budget_escalations(&applied.allocation.project_id)
                .await?;
        }
        Ok(())
    }

    async fn resolve_budget_escalations(&self, project_id: &str) -> Result<()> {
        let pid = project_id.to_string();
        let resolved = self
            .db
            .call(move |db| {
                let mut n = 0;
                for esc in db.list_escalations(Some(&pid), true)? {
                    if esc.reason == EscalationReason::BudgetExhausted {
                        db.resolve_escalation(&esc.id)?;
                        n += 1;
                    }
                }
                Ok(n)
            })
            .await?;
        if resolved > 0 {
            info!(project_id, resolved, "Resolved budget escalations");
        }
        Ok(())
    }

    /// Allocation for `project_id`, created with defaults on first use.
    pub async fn allocation(&self, project_id: &str) -> Result<BudgetAllocation> {
        let pid = self.canonical(project_id).await?;
        let settings = self.settings.clone();
        let applied = self
            .db
            .call(move |db| Self::load_current(db, &settings, &pid, Utc::now()))
            .await?;
        self.after_update(&applied).await?;
        Ok(applied.allocation)
    }

    pub async fn snapshot(&self, project_id: &str) -> Result<BudgetSnapshot> {
        let alloc = self.allocation(project_id).await?;
        let for_burn = alloc.clone();
        let burn = self
            .db
            .call(move |db| burn_rate_for(db, &for_burn, Utc::now()))
            .await?;
        Ok(BudgetSnapshot {
            remaining_usd: alloc.remaining_usd(),
            available_usd: alloc.available_usd(),
            burn_rate_usd_per_day: burn,
            runway_days: status::runway_days(alloc.remaining_usd(), burn),
            allocation: alloc,
        })
    }

    pub async fn list_snapshots(&self) -> Result<Vec<BudgetSnapshot>> {
        let projects = self.db.call(|db| db.list_projects()).await?;
        let mut out = Vec::with_capacity(projects.len());
        for project in projects {
            out.push(self.snapshot(&project.id).await?);
        }
        Ok(out)
    }

    /// Decide whether a run may start.
    pub async fn request_admission(
        &self,
        project_id: &str,
        run_id: &str,
        estimate_usd: f64,
        priority: u8,
    ) -> Result<Admission> {
        if !estimate_usd.is_finite() || estimate_usd < 0.0 {
            return Err(BudgetError::InvalidAmount {
                amount: estimate_usd,
            });
        }
        let pid = self.canonical(project_id).await?;
        let _serial = self.admission.lock().await;

        let queue_empty = self.queue_is_empty(&pid);
        let settings = self.settings.clone();
        let (p, r) = (pid.clone(), run_id.to_string());
        let (applied, admitted) = self
            .db
            .call(move |db| {
                let mut applied = Self::load_current(db, &settings, &p, Utc::now())?;
                let alloc = &mut applied.allocation;
                let open = matches!(alloc.status, BudgetStatus::Healthy | BudgetStatus::Warning);
                let funding = if !queue_empty {
                    None
                } else if open && alloc.available_usd() >= estimate_usd {
                    Some(Funding::Monthly)
                } else if alloc.status != BudgetStatus::Critical && drip_covers(alloc, estimate_usd)
                {
                    Some(Funding::Drip)
                } else {
                    None
                };
                if let Some(funding) = funding {
                    funding.reserve(alloc, estimate_usd);
                    alloc.updated_at = Utc::now();
                    db.save_budget(alloc)?;
                    debug!(run_id = %r, project_id = %p, estimate_usd, ?funding, "Reserved budget");
                }
                Ok((applied, funding))
            })
            .await?;
        self.after_update(&applied).await?;

        if let Some(funding) = admitted {
            self.reservations.insert(
                run_id.to_string(),
                Reservation {
                    project_id: pid.clone(),
                    remaining_usd: estimate_usd,
                    funding,
                },
            );
            info!(run_id, project_id = %pid, estimate_usd, ?funding, "Run admitted");
            return Ok(Admission::Admitted {
                reserved_usd: estimate_usd,
            });
        }

        let alloc = applied.allocation;
        if alloc.status == BudgetStatus::Exhausted {
            let (escalation, rescue) = self.deny(&alloc, run_id, estimate_usd).await?;
            return Ok(Admission::Denied { escalation, rescue });
        }

        let (ticket, position) = {
            let mut queues = self.lock_queues()?;
            let queue = queues.entry(pid.clone()).or_default();
            let rx = queue.push(run_id, estimate_usd, priority);
            (rx, queue.position(run_id).unwrap_or(queue.len()))
        };
        info!(
            run_id,
            project_id = %pid,
            status = %alloc.status,
            position,
            "Run queued for budget"
        );
        self.pump_locked(&pid).await?;
        Ok(Admission::Queued { position, ticket })
    }

    async fn deny(
        &self,
        alloc: &BudgetAllocation,
        run_id: &str,
        estimate_usd: f64,
    ) -> Result<(EscalationRecord, RescueOffer)> {
        let rescue = RescueOffer {
            action: "top_up",
            suggested_top_up_usd: (estimate_usd - alloc.available_usd()).max(estimate_usd),
        };
        let record = EscalationRecord {
            id: Uuid::new_v4().to_string(),
            project_id: alloc.project_id.clone(),
            run_id: Some(run_id.to_string()),
            shift_id: None,
            reason: EscalationReason::BudgetExhausted,
            detail: format!(
                "Budget exhausted for project {}: ${:.2} remaining, run needs ${:.2}",
                alloc.project_id,
                alloc.remaining_usd(),
                estimate_usd
            ),
            payload: json!({
                "estimate_usd": estimate_usd,
                "remaining_usd": alloc.remaining_usd(),
                "rescue": &rescue,
            }),
            dedup_key: format!("admission:{run_id}"),
            created_at: Utc::now(),
            resolved_at: None,
        };
        let (escalation, created) = self
            .db
            .call(move |db| db.insert_escalation(&record))
            .await?;
        if created {
            warn!(
                run_id,
                project_id = %alloc.project_id,
                escalation_id = %escalation.id,
                "Admission denied, budget exhausted"
            );
            self.events.publish(ControlEvent::EscalationRaised {
                escalation_id: escalation.id.clone(),
                project_id: escalation.project_id.clone(),
                reason: escalation.reason.to_string(),
            });
        }
        Ok((escalation, rescue))
    }

    fn lock_queues(
        &self,
    ) -> anyhow::Result<std::sync::MutexGuard<'_, HashMap<String, AdmissionQueue>>> {
        self.queues
            .lock()
            .map_err(|e| anyhow::anyhow!("Admission queue lock poisoned: {}", e))
    }

    fn queue_is_empty(&self, project_id: &str) -> bool {
        self.queues
            .lock()
            .map(|q| q.get(project_id).is_none_or(|q| q.is_empty()))
            .unwrap_or(true)
    }

    pub fn queue_len(&self, project_id: &str) -> usize {
        self.queues
            .lock()
            .map(|q| q.get(project_id).map_or(0, |q| q.len()))
            .unwrap_or(0)
    }

    /// Release queued requests the budget can now cover.
    pub async fn pump(&self, project_id: &str) -> Result<usize> {
        let pid = self.canonical(project_id).await?;
        let _serial = self.admission.lock().await;
        self.pump_locked(&pid).await
    }

    async fn pump_locked(&self, project_id: &str) -> Result<usize> {
        self.rekey_collapsed_queues().await?;
        let mut released = 0;
        loop {
            let head = {
                let queues = self.lock_queues()?;
                queues
                    .get(project_id)
                    .and_then(|q| q.peek())
                    .map(|r| (r.run_id.clone(), r.estimate_usd))
            };
            let Some((run_id, estimate)) = head else { break };

            let settings = self.settings.clone();
            let pid = project_id.to_string();
            let (funding, critical) = self
                .db
                .call(move |db| {
                    let mut applied = Self::load_current(db, &settings, &pid, Utc::now())?;
                    let alloc = &mut applied.allocation;
                    let critical = alloc.status == BudgetStatus::Critical;
                    let held = alloc.reserved_usd + alloc.drip_reserved_usd;
                    let funding = if critical && held > f64::EPSILON {
                        None
                    } else if alloc.status != BudgetStatus::Exhausted
                        && alloc.available_usd() >= estimate
                    {
                        Some(Funding::Monthly)
                    } else if drip_covers(alloc, estimate) {
                        Some(Funding::Drip)
                    } else {
                        None
                    };
                    if let Some(funding) = funding {
                        funding.reserve(alloc, estimate);
                        alloc.updated_at = Utc::now();
                        db.save_budget(alloc)?;
                    }
                    Ok((funding, critical))
                })
                .await?;
            let Some(funding) = funding else { break };

            let request = {
                let mut queues = self.lock_queues()?;
                queues.get_mut(project_id).and_then(|q| q.pop())
            };
            let Some(request) = request else { break };
            self.reservations.insert(
                run_id.clone(),
                Reservation {
                    project_id: project_id.to_string(),
                    remaining_usd: estimate,
                    funding,
                },
            );
            if request
                .notify
                .send(Released {
                    reserved_usd: estimate,
                })
                .is_err()
            {
                // The requester gave up; hand the money back.
                debug!(run_id = %run_id, "Queued requester gone, undoing reservation");
                self.release_reservation(&run_id).await?;
                continue;
            }
            info!(run_id = %run_id, project_id, estimate_usd = estimate, "Released queued run");
            released += 1;
            if critical {
                break;
            }
        }
        Ok(released)
    }

    /// Merge queues whose project was collapsed into another one.
    async fn rekey_collapsed_queues(&self) -> Result<()> {
        let keys: Vec<String> = self.lock_queues()?.keys().cloned().collect();
        for key in keys {
            let lookup = key.clone();
            let canonical = self
                .db
                .call(move |db| db.resolve_canonical(&lookup))
                .await?;
            let Some(canonical) = canonical else { continue };
            if canonical == key {
                continue;
            }
            let mut queues = self.lock_queues()?;
            if let Some(moved) = queues.remove(&key) {
                warn!(old_project_id = %key, project_id = %canonical, "Moving admission queue after project collapse");
                queues.entry(canonical).or_default().absorb(moved);
            }
        }
        Ok(())
    }

    /// Take a run out of the admission queue.
    pub fn withdraw(&self, run_id: &str) -> bool {
        match self.queues.lock() {
            Ok(mut queues) => queues.values_mut().any(|q| q.remove(run_id)),
            Err(_) => false,
        }
    }

    /// Return any unsettled reservation held by `run_id`.
    async fn release_reservation(&self, run_id: &str) -> Result<()> {
        let Some((_, reservation)) = self.reservations.remove(run_id) else {
            return Ok(());
        };
        if reservation.remaining_usd <= 0.0 {
            return Ok(());
        }
        let pid = self.canonical(&reservation.project_id).await?;
        let amount = reservation.remaining_usd;
        let funding = reservation.funding;
        self.db
            .call(move |db| {
                if let Some(mut alloc) = db.get_budget(&pid)? {
                    funding.unreserve(&mut alloc, amount);
                    alloc.updated_at = Utc::now();
                    db.save_budget(&alloc)?;
                }
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// A run ended: drop it from the queue, return its reservation and let
    /// the next queued run through.
    pub async fn finish_run(&self, project_id: &str, run_id: &str) -> Result<()> {
        self.withdraw(run_id);
        self.release_reservation(run_id).await?;
        self.pump(project_id).await?;
        Ok(())
    }

    /// Record spend. Replaying an event id is a no-op.
    pub async fn record_cost(
        &self,
        project_id: &str,
        run_id: Option<&str>,
        event_id: &str,
        amount_usd: f64,
    ) -> Result<BudgetAllocation> {
        if !amount_usd.is_finite() || amount_usd < 0.0 {
            return Err(BudgetError::InvalidAmount { amount: amount_usd });
        }
        let pid = self.canonical(project_id).await?;

        let (settle, funding) = run_id
            .and_then(|r| self.reservations.get_mut(r))
            .map(|mut res| {
                let settled = res.remaining_usd.min(amount_usd);
                res.remaining_usd -= settled;
                (settled, res.funding)
            })
            .unwrap_or((0.0, Funding::Monthly));

        let settings = self.settings.clone();
        let event = CostEvent {
            id: event_id.to_string(),
            project_id: pid.clone(),
            run_id: run_id.map(str::to_string),
            amount_usd,
            created_at: Utc::now(),
        };
        let (applied, fresh) = self
            .db
            .call(move |db| {
                let now = Utc::now();
                let mut applied = Self::load_current(db, &settings, &event.project_id, now)?;
                if !db.insert_cost_event(&event)? {
                    return Ok((applied, false));
                }
                let alloc = &mut applied.allocation;
                let from_drip = alloc.charge(event.amount_usd);
                if from_drip > 0.0 {
                    debug!(event_id = %event.id, from_drip, "Cost charged to daily drip");
                }
                funding.unreserve(alloc, settle);
                let burn = burn_rate_for(db, alloc, now)?;
                let derived = status::derive_status(alloc, burn, &settings.thresholds);
                alloc.status = status::after_spend(alloc.status, derived);
                alloc.updated_at = now;
                db.save_budget(alloc)
                    .context("Failed to apply cost event")?;
                Ok((applied, true))
            })
            .await?;

        if !fresh {
            // Undo the in-memory settlement; the event was already counted.
            if let Some(r) = run_id
                && let Some(mut res) = self.reservations.get_mut(r)
            {
                res.remaining_usd += settle;
            }
            debug!(event_id, "Duplicate cost event ignored");
            return Ok(applied.allocation);
        }
        debug!(event_id, project_id = %pid, amount_usd, "Cost recorded");
        self.after_update(&applied).await?;
        Ok(applied.allocation)
    }

    /// One-time increase of the monthly allocation; the rescue path for an
    /// exhausted project.
    pub async fn top_up(&self, project_id: &str, amount_usd: f64) -> Result<BudgetAllocation> {
        if !amount_usd.is_finite() || amount_usd <= 0.0 {
            return Err(BudgetError::InvalidAmount { amount: amount_usd });
        }
        let alloc = self
            .rewrite(project_id, move |alloc| {
                alloc.monthly_allocation_usd += amount_usd;
            })
            .await?;
        info!(project_id = %alloc.project_id, amount_usd, "Budget topped up");
        Ok(alloc)
    }

    pub async fn set_allocation(
        &self,
        project_id: &str,
        monthly_usd: f64,
        daily_drip_usd: Option<f64>,
    ) -> Result<BudgetAllocation> {
        for amount in std::iter::once(monthly_usd).chain(daily_drip_usd) {
            if !amount.is_finite() || amount < 0.0 {
                return Err(BudgetError::InvalidAmount { amount });
            }
        }
        self.rewrite(project_id, move |alloc| {
            alloc.monthly_allocation_usd = monthly_usd;
            if let Some(drip) = daily_drip_usd {
                alloc.daily_drip_usd = drip;
                alloc.drip_available_usd = alloc.drip_available_usd.min(drip);
            }
        })
        .await
    }

    /// Apply an allocation change and recompute the status from scratch.
    async fn rewrite<F>(&self, project_id: &str, change: F) -> Result<BudgetAllocation>
    where
        F: FnOnce(&mut BudgetAllocation) + Send + 'static,
    {
        let pid = self.canonical(project_id).await?;
        let settings = self.settings.clone();
        let p = pid.clone();
        let applied = self
            .db
            .call(move |db| {
                let now = Utc::now();
                let mut applied = Self::load_current(db, &settings, &p, now)?;
                let alloc = &mut applied.allocation;
                change(alloc);
                let burn = burn_rate_for(db, alloc, now)?;
                alloc.status = status::derive_status(alloc, burn, &settings.thresholds);
                alloc.updated_at = now;
                db.save_budget(alloc)?;
                Ok(applied)
            })
            .await?;
        self.after_update(&applied).await?;
        self.pump(&pid).await?;
        Ok(applied.allocation)
    }

    /// Credit today's drip for every project. Safe to call repeatedly.
    pub async fn apply_daily_drip(&self) -> Result<usize> {
        let projects = self.db.call(|db| db.list_projects()).await?;
        let mut credited = 0;
        for project in projects {
            let settings = self.settings.clone();
            let pid = project.id.clone();
            let applied = self
                .db
                .call(move |db| {
                    let before = db.get_budget(&pid)?.and_then(|a| a.drip_credited_on);
                    let applied = Self::load_current(db, &settings, &pid, Utc::now())?;
                    let changed = applied.allocation.drip_credited_on != before;
                    Ok((applied, changed))
                })
                .await?;
            if applied.1 {
                credited += 1;
            }
            self.after_update(&applied.0).await?;
            self.pump(&project.id).await?;
        }
        Ok(credited)
    }

    /// Periodic drip crediting until cancelled.
    pub async fn run_drip(self, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    match self.apply_daily_drip().await {
                        Ok(0) => {}
                        Ok(n) => info!(projects = n, "Credited daily drip"),
                        Err(e) => warn!(error = %e, "Daily drip failed"),
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::fixtures;

    fn settings(monthly: f64, drip: f64) -> BudgetSettings {
        BudgetSettings {
            default_monthly_usd: monthly,
            default_daily_drip_usd: drip,
            // Runway depends on the day of the month; keep tests on fractions.
            thresholds: BudgetThresholds {
                warning_runway_days: 0.0,
                critical_runway_days: 0.0,
                ..BudgetThresholds::default()
            },
        }
    }

    fn governor(monthly: f64, drip: f64) -> (DbHandle, BudgetGovernor) {
        let db = DbHandle::in_memory().unwrap();
        fixtures::project(&db.lock_sync().unwrap(), "p");
        let gov = BudgetGovernor::new(db.clone(), EventBus::new(), settings(monthly, drip));
        (db, gov)
    }

    #[tokio::test]
    async fn test_default_allocation_is_created() {
        let (_db, gov) = governor(50.0, 1.0);
        let alloc = gov.allocation("p").await.unwrap();
        assert_eq!(alloc.monthly_allocation_usd, 50.0);
        assert_eq!(alloc.drip_available_usd, 1.0);
        assert_eq!(alloc.remaining_usd(), 50.0);
        assert_eq!(alloc.status, BudgetStatus::Healthy);
    }

    #[tokio::test]
    async fn test_healthy_admits_and_reserves() {
        let (_db, gov) = governor(50.0, 0.0);
        let adm = gov.request_admission("p", "r1", 5.0, 3).await.unwrap();
        assert!(matches!(adm, Admission::Admitted { reserved_usd } if reserved_usd == 5.0));
        let alloc = gov.allocation("p").await.unwrap();
        assert_eq!(alloc.reserved_usd, 5.0);

        gov.record_cost("p", Some("r1"), "r1:1", 3.0).await.unwrap();
        let alloc = gov.allocation("p").await.unwrap();
        assert_eq!(alloc.spent_usd, 3.0);
        assert_eq!(alloc.reserved_usd, 2.0);

        gov.finish_run("p", "r1").await.unwrap();
        assert_eq!(gov.allocation("p").await.unwrap().reserved_usd, 0.0);
    }

    #[tokio::test]
    async fn test_cost_replay_is_idempotent() {
        let (_db, gov) = governor(50.0, 0.0);
        let first = gov.record_cost("p", None, "evt-1", 30.0).await.unwrap();
        let again = gov.record_cost("p", None, "evt-1", 30.0).await.unwrap();
        assert_eq!(first.spent_usd, 30.0);
        assert_eq!(again.spent_usd, 30.0);
        assert_eq!(again.status, first.status);
    }

    #[tokio::test]
    async fn test_exhausted_denies_with_one_escalation_per_request() {
        let (db, gov) = governor(10.0, 0.0);
        gov.record_cost("p", None, "evt-1", 10.0).await.unwrap();
        assert_eq!(gov.allocation("p").await.unwrap().status, BudgetStatus::Exhausted);

        let first = gov.request_admission("p", "r2", 1.0, 3).await.unwrap();
        let retry = gov.request_admission("p", "r2", 1.0, 3).await.unwrap();
        let (Admission::Denied { escalation: a, rescue }, Admission::Denied { escalation: b, .. }) =
            (first, retry)
        else {
            panic!("expected denials");
        };
        assert_eq!(a.id, b.id);
        assert_eq!(rescue.action, "top_up");
        let open = db
            .call(|db| db.list_escalations(Some("p"), true))
            .await
            .unwrap();
        assert_eq!(open.len(), 1);

        gov.request_admission("p", "r3", 1.0, 3).await.unwrap();
        let open = db
            .call(|db| db.list_escalations(Some("p"), true))
            .await
            .unwrap();
        assert_eq!(open.len(), 2);
    }

    #[tokio::test]
    async fn test_top_up_reopens_and_resolves_escalations() {
        let (db, gov) = governor(10.0, 0.0);
        gov.record_cost("p", None, "evt-1", 10.0).await.unwrap();
        gov.request_admission("p", "r1", 1.0, 3).await.unwrap();
        let alloc = gov.top_up("p", 40.0).await.unwrap();
        assert_eq!(alloc.status, BudgetStatus::Healthy);
        let open = db
            .call(|db| db.list_escalations(Some("p"), true))
            .await
            .unwrap();
        assert!(open.is_empty());
        assert!(matches!(
            gov.request_admission("p", "r1", 1.0, 3).await.unwrap(),
            Admission::Admitted { .. }
        ));
    }

    #[tokio::test]
    async fn test_critical_queues_and_releases_one_at_a_time() {
        let (_db, gov) = governor(100.0, 0.0);
        gov.record_cost("p", None, "evt-1", 85.0).await.unwrap();
        assert_eq!(gov.allocation("p").await.unwrap().status, BudgetStatus::Critical);

        let Admission::Queued { ticket: t1, .. } = gov.request_admission("p", "r1", 2.0, 3).await.unwrap() else {
            panic!("expected queue");
        };
        let Admission::Queued { ticket: mut t2, .. } = gov.request_admission("p", "r2", 2.0, 3).await.unwrap() else {
            panic!("expected queue");
        };
        // Head released immediately; the second waits for the first to settle.
        assert_eq!(t1.await.unwrap().reserved_usd, 2.0);
        assert!(t2.try_recv().is_err());
        assert_eq!(gov.queue_len("p"), 1);

        gov.record_cost("p", Some("r1"), "r1:1", 2.0).await.unwrap();
        gov.finish_run("p", "r1").await.unwrap();
        assert_eq!(t2.await.unwrap().reserved_usd, 2.0);
    }

    #[tokio::test]
    async fn test_queue_orders_by_priority() {
        let (_db, gov) = governor(100.0, 0.0);
        gov.record_cost("p", None, "evt-1", 85.0).await.unwrap();
        // Hold the budget so nothing is released yet.
        let Admission::Queued { ticket: hold, .. } = gov.request_admission("p", "hold", 1.0, 1).await.unwrap() else {
            panic!("expected queue");
        };
        hold.await.unwrap();
        let Admission::Queued { ticket: low, .. } = gov.request_admission("p", "low", 1.0, 5).await.unwrap() else {
            panic!("expected queue");
        };
        let Admission::Queued { ticket: mut high, position, .. } = gov.request_admission("p", "high", 1.0, 1).await.unwrap() else {
            panic!("expected queue");
        };
        assert_eq!(position, 1);
        gov.finish_run("p", "hold").await.unwrap();
        assert!(high.try_recv().is_ok());
        drop(low);
    }

    #[tokio::test]
    async fn test_remaining_below_estimate_never_admits() {
        let (_db, gov) = governor(10.0, 0.0);
        gov.record_cost("p", None, "evt-1", 8.5).await.unwrap();
        let adm = gov.request_admission("p", "r1", 5.0, 3).await.unwrap();
        match adm {
            Admission::Queued { mut ticket, .. } => assert!(ticket.try_recv().is_err()),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_drip_is_credited_once_per_day() {
        let (_db, gov) = governor(10.0, 2.0);
        gov.allocation("p").await.unwrap();
        assert_eq!(gov.apply_daily_drip().await.unwrap(), 0);
        let alloc = gov.allocation("p").await.unwrap();
        assert_eq!(alloc.drip_available_usd, 2.0);
    }

    /// Move the last drip credit to yesterday so the next load credits again.
    async fn start_new_day(db: &DbHandle) {
        db.call(|db| {
            let mut alloc = db.get_budget("p")?.unwrap();
            alloc.drip_credited_on = alloc.drip_credited_on.and_then(|d| d.pred_opt());
            db.save_budget(&alloc)
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_drip_admits_small_run_after_overspend() {
        let (db, gov) = governor(10.0, 1.0);
        gov.record_cost("p", None, "evt-1", 15.0).await.unwrap();
        start_new_day(&db).await;
        assert_eq!(gov.apply_daily_drip().await.unwrap(), 1);

        let alloc = gov.allocation("p").await.unwrap();
        assert_eq!(alloc.status, BudgetStatus::Exhausted);
        assert_eq!(alloc.drip_available_usd, 1.0);
        let overspent = alloc.remaining_usd();
        assert!(overspent < 0.0);

        let adm = gov.request_admission("p", "r1", 0.5, 3).await.unwrap();
        assert!(matches!(adm, Admission::Admitted { reserved_usd } if reserved_usd == 0.5));
        let alloc = gov.allocation("p").await.unwrap();
        assert_eq!(alloc.drip_reserved_usd, 0.5);
        assert_eq!(alloc.reserved_usd, 0.0);

        // Drip-funded spend leaves the monthly overspend where it was.
        gov.record_cost("p", Some("r1"), "r1:1", 0.5).await.unwrap();
        gov.finish_run("p", "r1").await.unwrap();
        let alloc = gov.allocation("p").await.unwrap();
        assert!((alloc.remaining_usd() - overspent).abs() < 1e-9);
        assert_eq!(alloc.drip_available_usd, 0.5);
        assert_eq!(alloc.drip_reserved_usd, 0.0);
        assert_eq!(alloc.spent_usd, 15.5);
    }

    #[tokio::test]
    async fn test_drip_allowance_is_used_up_for_the_day() {
        let (db, gov) = governor(10.0, 1.0);
        gov.record_cost("p", None, "evt-1", 25.0).await.unwrap();
        start_new_day(&db).await;

        assert!(matches!(
            gov.request_admission("p", "r1", 1.0, 3).await.unwrap(),
            Admission::Admitted { .. }
        ));
        gov.record_cost("p", Some("r1"), "r1:1", 1.0).await.unwrap();
        gov.finish_run("p", "r1").await.unwrap();

        let second = gov.request_admission("p", "r2", 0.5, 3).await.unwrap();
        assert!(matches!(second, Admission::Denied { .. }));

        // The next day's drip is a fresh allowance, not a carried balance.
        start_new_day(&db).await;
        assert!(matches!(
            gov.request_admission("p", "r3", 0.5, 3).await.unwrap(),
            Admission::Admitted { .. }
        ));
        assert_eq!(gov.allocation("p").await.unwrap().drip_available_usd, 1.0);
    }

    #[tokio::test]
    async fn test_unsettled_drip_reservation_blocks_second_run() {
        let (db, gov) = governor(10.0, 1.0);
        gov.record_cost("p", None, "evt-1", 12.0).await.unwrap();
        start_new_day(&db).await;
        assert!(matches!(
            gov.request_admission("p", "r1", 0.8, 3).await.unwrap(),
            Admission::Admitted { .. }
        ));
        assert!(matches!(
            gov.request_admission("p", "r2", 0.8, 3).await.unwrap(),
            Admission::Denied { .. }
        ));
        gov.finish_run("p", "r1").await.unwrap();
        assert!(matches!(
            gov.request_admission("p", "r2", 0.8, 3).await.unwrap(),
            Admission::Admitted { .. }
        ));
    }

    #[tokio::test]
    async fn test_invalid_amounts_rejected() {
        let (_db, gov) = governor(10.0, 0.0);
        assert!(matches!(
            gov.top_up("p", -1.0).await.unwrap_err(),
            BudgetError::InvalidAmount { .. }
        ));
        assert!(matches!(
            gov.record_cost("p", None, "e", f64::NAN).await.unwrap_err(),
            BudgetError::InvalidAmount { .. }
        ));
    }
}
