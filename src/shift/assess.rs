//! Pure candidate selection for a shift.
//!
//! Everything here works on an already gathered [`ShiftContext`], so the
//! precedence rules can be tested without a database.

use std::collections::HashMap;

use serde::Serialize;

use pcc_common::{
    BudgetSnapshot, BudgetStatus, Decision, EscalationRecord, FailureReason, Handoff, Project,
    Run, RunStatus, ShiftAction, WorkItem, WorkItemStatus,
};

/// Everything a shift knows about its project when it starts.
#[derive(Debug, Clone, Serialize)]
pub struct ShiftContext {
    pub project: Project,
    pub work_items: Vec<WorkItem>,
    /// Newest first.
    pub recent_runs: Vec<Run>,
    pub last_handoff: Option<Handoff>,
    pub budget: BudgetSnapshot,
    pub open_escalations: Vec<EscalationRecord>,
    pub goals: Vec<String>,
}

/// Something in the way of progress.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Blocker {
    pub work_item_id: String,
    pub description: String,
    /// Already escalated and waiting on a human; the shift cannot act on it.
    pub escalated: bool,
    /// The item is held back by its run history rather than its status.
    pub repeated_failure: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct Assessment {
    /// Ordered best first.
    pub candidates: Vec<ShiftAction>,
    pub blockers: Vec<Blocker>,
}

/// Prefix of the dedup keys of escalations raised about a blocked work item.
/// Each shift appends its own id.
pub fn blocker_key(work_item_id: &str) -> String {
    format!("blocker:{work_item_id}:")
}

/// Whether a work item serves one of the shift's goals. Without goals every
/// item does.
pub fn is_goal_aligned(item: &WorkItem, goals: &[String]) -> bool {
    if goals.is_empty() {
        return true;
    }
    let title = item.title.to_lowercase();
    let goal = item.goal.to_lowercase();
    goals.iter().any(|g| {
        let g = g.trim().to_lowercase();
        !g.is_empty()
            && (item.tags.iter().any(|t| t.to_lowercase() == g)
                || title.contains(&g)
                || goal.contains(&g))
    })
}

/// The last two finished runs of the item both ran out of iterations.
pub fn has_repeated_failure(work_item_id: &str, recent_runs: &[Run]) -> bool {
    let mut finished = recent_runs
        .iter()
        .filter(|r| r.work_item_id == work_item_id && r.status.is_terminal());
    let exhausted = |r: Option<&Run>| {
        r.is_some_and(|r| {
            r.status == RunStatus::Failed
                && r.failure_reason == Some(FailureReason::IterationBudgetExhausted)
        })
    };
    exhausted(finished.next()) && exhausted(finished.next())
}

fn blockers(ctx: &ShiftContext) -> Vec<Blocker> {
    let status: HashMap<&str, WorkItemStatus> = ctx
        .work_items
        .iter()
        .map(|w| (w.id.as_str(), w.status))
        .collect();
    let escalated = |id: &str| {
        let key = blocker_key(id);
        ctx.open_escalations.iter().any(|e| e.dedup_key.starts_with(&key))
    };

    let mut found = Vec::new();
    for item in &ctx.work_items {
        match item.status {
            WorkItemStatus::Blocked => {
                let pending: Vec<&str> = item
                    .depends_on
                    .iter()
                    .map(String::as_str)
                    .filter(|d| status.get(d) != Some(&WorkItemStatus::Done))
                    .collect();
                let description = if pending.is_empty() {
                    "blocked; all dependencies are done".to_string()
                } else {
                    format!("blocked on {}", pending.join(", "))
                };
                found.push(Blocker {
                    work_item_id: item.id.clone(),
                    description,
                    escalated: escalated(&item.id),
                    repeated_failure: false,
                });
            }
            WorkItemStatus::Ready if has_repeated_failure(&item.id, &ctx.recent_runs) => {
                found.push(Blocker {
                    work_item_id: item.id.clone(),
                    description: "last two runs exhausted the iteration budget".to_string(),
                    escalated: escalated(&item.id),
                    repeated_failure: true,
                });
            }
            _ => {}
        }
    }
    found
}

pub fn assess(ctx: &ShiftContext) -> Assessment {
    let blockers = blockers(ctx);
    let mut candidates: Vec<ShiftAction> = blockers
        .iter()
        .filter(|b| !b.escalated)
        .map(|b| ShiftAction::RemoveBlocker {
            work_item_id: b.work_item_id.clone(),
            blocker: b.description.clone(),
        })
        .collect();

    let held: Vec<&str> = blockers.iter().map(|b| b.work_item_id.as_str()).collect();
    let active_runs: Vec<&str> = ctx
        .recent_runs
        .iter()
        .filter(|r| r.status.is_active())
        .map(|r| r.work_item_id.as_str())
        .collect();
    let mut ready: Vec<&WorkItem> = ctx
        .work_items
        .iter()
        .filter(|w| w.status == WorkItemStatus::Ready)
        .filter(|w| !held.contains(&w.id.as_str()) && !active_runs.contains(&w.id.as_str()))
        .filter(|w| is_goal_aligned(w, &ctx.goals))
        .collect();
    if can_start_runs(&ctx.budget) {
        ready.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then(a.created_at.cmp(&b.created_at))
                .then(a.id.cmp(&b.id))
        });
        candidates.extend(ready.into_iter().map(|w| ShiftAction::ExecuteWorkItem {
            work_item_id: w.id.clone(),
        }));
    }

    // A goal nothing open covers needs a work order.
    let open: Vec<&WorkItem> = ctx
        .work_items
        .iter()
        .filter(|w| !matches!(w.status, WorkItemStatus::Done | WorkItemStatus::Parked))
        .collect();
    for goal in &ctx.goals {
        let goal = goal.trim();
        if goal.is_empty() {
            continue;
        }
        let covered = open
            .iter()
            .any(|w| is_goal_aligned(w, std::slice::from_ref(&goal.to_string())));
        if !covered {
            candidates.push(ShiftAction::CreateWorkItem {
                title: goal.to_string(),
                goal: format!("Deliver {goal} for {}", ctx.project.name),
            });
        }
    }

    candidates.push(ShiftAction::Research {
        topic: format!("next work for {}", ctx.project.name),
    });
    candidates.sort_by_key(ShiftAction::rank);
    Assessment {
        candidates,
        blockers,
    }
}

/// An exhausted project can still run on today's drip.
fn can_start_runs(budget: &BudgetSnapshot) -> bool {
    let alloc = &budget.allocation;
    alloc.status != BudgetStatus::Exhausted || alloc.drip_open_usd() > 0.0
}

fn rationale(action: &ShiftAction, ctx: &ShiftContext) -> String {
    match action {
        ShiftAction::RemoveBlocker { blocker, .. } => {
            format!("Blockers come first: {blocker}")
        }
        ShiftAction::ExecuteWorkItem { work_item_id } => {
            let item = ctx.work_items.iter().find(|w| &w.id == work_item_id);
            match item {
                Some(w) => format!(
                    "Highest priority ready work order (priority {}): {}",
                    w.priority, w.title
                ),
                None => "Highest priority ready work order".to_string(),
            }
        }
        ShiftAction::CreateWorkItem { title, .. } => {
            format!("No open work order covers the goal '{title}'")
        }
        ShiftAction::Research { .. } => {
            if !can_start_runs(&ctx.budget) {
                "Budget is exhausted; no run can start".to_string()
            } else {
                "Nothing is ready to execute".to_string()
            }
        }
    }
}

/// Commit to the best candidate.
pub fn decide(assessment: &Assessment, ctx: &ShiftContext) -> (ShiftAction, Decision) {
    let action = assessment
        .candidates
        .first()
        .cloned()
        .unwrap_or_else(|| ShiftAction::Research {
            topic: format!("next work for {}", ctx.project.name),
        });
    let decision = Decision {
        action: action.label(),
        rationale: rationale(&action, ctx),
    };
    (action, decision)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::fixtures;
    use chrono::Utc;
    use pcc_common::{BudgetAllocation, ProjectStatus, RunPhase};

    fn project() -> Project {
        Project {
            id: "p".into(),
            name: "shop".into(),
            path: "/repos/shop".into(),
            status: ProjectStatus::Active,
            priority: 3,
            trunk_branch: "main".into(),
            test_command: None,
            requires_vm: false,
            created_at: Utc::now(),
        }
    }

    fn budget(status: BudgetStatus) -> BudgetSnapshot {
        let mut allocation = BudgetAllocation::new("p", 50.0, 1.0);
        allocation.status = status;
        BudgetSnapshot {
            remaining_usd: allocation.remaining_usd(),
            available_usd: allocation.available_usd(),
            allocation,
            burn_rate_usd_per_day: 0.0,
            runway_days: None,
        }
    }

    fn ctx(items: Vec<WorkItem>) -> ShiftContext {
        ShiftContext {
            project: project(),
            work_items: items,
            recent_runs: Vec::new(),
            last_handoff: None,
            budget: budget(BudgetStatus::Healthy),
            open_escalations: Vec::new(),
            goals: Vec::new(),
        }
    }

    fn failed_run(id: &str, wi: &str, reason: FailureReason) -> Run {
        Run {
            id: id.into(),
            work_item_id: wi.into(),
            project_id: "p".into(),
            status: RunStatus::Failed,
            phase: RunPhase::Finished,
            builder_iteration: 10,
            log_path: None,
            branch_name: None,
            cost_usd: 0.0,
            error: Some(reason.describe().into()),
            failure_reason: Some(reason),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    #[test]
    fn test_blocker_outranks_ready_work() {
        let mut blocked = fixtures::work_item("WO-1", "p", WorkItemStatus::Blocked);
        blocked.depends_on = vec!["WO-9".into()];
        let ready = fixtures::work_item("WO-2", "p", WorkItemStatus::Ready);
        let c = ctx(vec![blocked, ready]);
        let a = assess(&c);
        assert!(matches!(
            &a.candidates[0],
            ShiftAction::RemoveBlocker { work_item_id, blocker } if work_item_id == "WO-1" && blocker.contains("WO-9")
        ));
        assert!(matches!(&a.candidates[1], ShiftAction::ExecuteWorkItem { work_item_id } if work_item_id == "WO-2"));
    }

    #[test]
    fn test_escalated_blocker_is_reported_not_chosen() {
        let blocked = fixtures::work_item("WO-1", "p", WorkItemStatus::Blocked);
        let ready = fixtures::work_item("WO-2", "p", WorkItemStatus::Ready);
        let mut c = ctx(vec![blocked, ready]);
        c.open_escalations.push(EscalationRecord {
            id: "e1".into(),
            project_id: "p".into(),
            run_id: None,
            shift_id: None,
            reason: pcc_common::EscalationReason::NeedInput,
            detail: "blocked".into(),
            payload: serde_json::Value::Null,
            dedup_key: blocker_key("WO-1"),
            created_at: Utc::now(),
            resolved_at: None,
        });
        let a = assess(&c);
        assert_eq!(a.blockers.len(), 1);
        assert!(a.blockers[0].escalated);
        assert!(matches!(&a.candidates[0], ShiftAction::ExecuteWorkItem { .. }));
    }

    #[test]
    fn test_ready_items_ordered_by_priority() {
        let mut low = fixtures::work_item("WO-1", "p", WorkItemStatus::Ready);
        low.priority = 4;
        let mut high = fixtures::work_item("WO-2", "p", WorkItemStatus::Ready);
        high.priority = 1;
        let a = assess(&ctx(vec![low, high]));
        let (action, decision) = decide(&a, &ctx(vec![]));
        assert_eq!(action, ShiftAction::ExecuteWorkItem { work_item_id: "WO-2".into() });
        assert_eq!(decision.action, "execute WO-2");
    }

    #[test]
    fn test_goals_filter_ready_items() {
        let mut login = fixtures::work_item("WO-1", "p", WorkItemStatus::Ready);
        login.title = "Add login".into();
        let mut billing = fixtures::work_item("WO-2", "p", WorkItemStatus::Ready);
        billing.title = "Billing page".into();
        billing.tags = vec!["payments".into()];
        let mut c = ctx(vec![login, billing]);
        c.goals = vec!["payments".into()];
        let a = assess(&c);
        let executes: Vec<_> = a
            .candidates
            .iter()
            .filter(|a| matches!(a, ShiftAction::ExecuteWorkItem { .. }))
            .collect();
        assert_eq!(executes.len(), 1);
        assert!(matches!(executes[0], ShiftAction::ExecuteWorkItem { work_item_id } if work_item_id == "WO-2"));
    }

    #[test]
    fn test_uncovered_goal_suggests_new_work_item() {
        let mut c = ctx(vec![]);
        c.goals = vec!["search".into()];
        let a = assess(&c);
        assert!(matches!(&a.candidates[0], ShiftAction::CreateWorkItem { title, .. } if title == "search"));
        assert!(matches!(a.candidates.last(), Some(ShiftAction::Research { .. })));
    }

    #[test]
    fn test_repeat_failures_are_not_reselected() {
        let item = fixtures::work_item("WO-1", "p", WorkItemStatus::Ready);
        let mut c = ctx(vec![item]);
        c.recent_runs = vec![
            failed_run("r2", "WO-1", FailureReason::IterationBudgetExhausted),
            failed_run("r1", "WO-1", FailureReason::IterationBudgetExhausted),
        ];
        let a = assess(&c);
        assert!(a.blockers[0].repeated_failure);
        assert!(!a
            .candidates
            .iter()
            .any(|a| matches!(a, ShiftAction::ExecuteWorkItem { .. })));

        // A different failure in between breaks the streak.
        c.recent_runs[1] = failed_run("r1", "WO-1", FailureReason::SetupFailed);
        assert!(!has_repeated_failure("WO-1", &c.recent_runs));
    }

    #[test]
    fn test_exhausted_budget_falls_back_to_research() {
        let mut c = ctx(vec![fixtures::work_item("WO-1", "p", WorkItemStatus::Ready)]);
        c.budget = budget(BudgetStatus::Exhausted);
        let a = assess(&c);
        let (action, decision) = decide(&a, &c);
        assert!(matches!(action, ShiftAction::Research { .. }));
        assert!(decision.rationale.contains("exhausted"));
    }

    #[test]
    fn test_exhausted_budget_with_drip_left_still_executes() {
        let mut c = ctx(vec![fixtures::work_item("WO-1", "p", WorkItemStatus::Ready)]);
        c.budget = budget(BudgetStatus::Exhausted);
        c.budget.allocation.drip_available_usd = 1.0;
        let a = assess(&c);
        let (action, _) = decide(&a, &c);
        assert_eq!(
            action,
            ShiftAction::ExecuteWorkItem {
                work_item_id: "WO-1".into()
            }
        );
    }
}
