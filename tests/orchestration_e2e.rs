//! End-to-end runs through the public orchestrator API.

mod common;

use std::sync::atomic::Ordering;

use common::{Env, Options, WAIT};
use pcc::agent::Verdict;
use pcc::budget::BudgetSettings;
use pcc::orchestrator::EnqueueOutcome;
use pcc_common::{ControlEvent, FailureReason, RunStatus, WorkItemStatus};

/// Drain whatever the bus has buffered for this receiver.
fn drain(rx: &mut tokio::sync::broadcast::Receiver<ControlEvent>) -> Vec<ControlEvent> {
    use tokio::sync::broadcast::error::TryRecvError;
    let mut events = Vec::new();
    loop {
        match rx.try_recv() {
            Ok(event) => events.push(event),
            Err(TryRecvError::Lagged(_)) => continue,
            Err(_) => return events,
        }
    }
}

#[tokio::test]
async fn test_ready_work_item_runs_to_done_with_one_merge() {
    let env = Env::new(Options::default()).await;
    env.project("shop").await;
    env.ready_item("shop", "WO-1").await;
    let mut rx = env.events.subscribe();

    let outcome = env.orchestrator.enqueue("WO-1").await.unwrap();
    let EnqueueOutcome::Started { run } = outcome else {
        panic!("expected the run to start");
    };
    let run = env.orchestrator.wait(&run.id, WAIT).await.unwrap();

    assert_eq!(run.status, RunStatus::Done);
    assert_eq!(run.failure_reason, None);
    assert!((run.cost_usd - 0.1).abs() < 1e-9);
    assert_eq!(
        env.work_items.get("WO-1").await.unwrap().status,
        WorkItemStatus::Done
    );
    assert_eq!(env.worktrees.merges.load(Ordering::SeqCst), 1);

    let events = drain(&mut rx);
    let acquired = events
        .iter()
        .filter(|e| matches!(e, ControlEvent::MergeLockAcquired { .. }))
        .count();
    let released = events
        .iter()
        .filter(|e| matches!(e, ControlEvent::MergeLockReleased { .. }))
        .count();
    assert_eq!(acquired, 1);
    assert_eq!(released, 1);
    assert!(env.merge.get("shop").await.unwrap().is_none());

    let alloc = env.budget.allocation("shop").await.unwrap();
    assert!(alloc.reserved_usd.abs() < 1e-9);
}

#[tokio::test]
async fn test_exhausted_budget_denies_without_building() {
    let env = Env::new(Options {
        budget: BudgetSettings {
            default_monthly_usd: 5.0,
            default_daily_drip_usd: 0.0,
            ..BudgetSettings::default()
        },
        ..Options::default()
    })
    .await;
    env.project("shop").await;
    env.ready_item("shop", "WO-1").await;
    env.budget
        .record_cost("shop", None, "seed-spend", 5.0)
        .await
        .unwrap();

    let outcome = env.orchestrator.enqueue("WO-1").await.unwrap();
    let EnqueueOutcome::Denied {
        run,
        escalation,
        rescue,
    } = outcome
    else {
        panic!("expected a denial");
    };
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.failure_reason, Some(FailureReason::BudgetExhausted));
    assert_eq!(escalation.project_id, "shop");
    assert_eq!(rescue.action, "top_up");
    assert!(rescue.suggested_top_up_usd > 0.0);
    assert_eq!(env.agent.builds.load(Ordering::SeqCst), 0);
    assert_eq!(env.worktrees.merges.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_reviewer_that_never_approves_stops_at_the_iteration_cap() {
    let env = Env::new(Options {
        verdict: Verdict::ChangesRequested,
        max_iterations: 2,
        ..Options::default()
    })
    .await;
    env.project("shop").await;
    env.ready_item("shop", "WO-1").await;

    let run = env
        .orchestrator
        .enqueue("WO-1")
        .await
        .unwrap()
        .run()
        .clone();
    let run = env.orchestrator.wait(&run.id, WAIT).await.unwrap();

    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(
        run.failure_reason,
        Some(FailureReason::IterationBudgetExhausted)
    );
    assert_eq!(run.builder_iteration, 2);
    assert_eq!(env.agent.builds.load(Ordering::SeqCst), 2);
    assert_eq!(env.worktrees.merges.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_identity_collapse_mid_run_merges_under_canonical_project() {
    let env = Env::new(Options {
        collapse_during_build: Some(("shop-dup".into(), "shop".into())),
        ..Options::default()
    })
    .await;
    env.project("shop").await;
    env.project("shop-dup").await;
    env.ready_item("shop-dup", "WO-1").await;
    let mut rx = env.events.subscribe();

    let run = env
        .orchestrator
        .enqueue("WO-1")
        .await
        .unwrap()
        .run()
        .clone();
    assert_eq!(run.project_id, "shop-dup");
    let run = env.orchestrator.wait(&run.id, WAIT).await.unwrap();

    assert_eq!(run.status, RunStatus::Done);
    assert_eq!(run.project_id, "shop");
    let item = env.work_items.get("WO-1").await.unwrap();
    assert_eq!(item.project_id, "shop");
    assert_eq!(item.status, WorkItemStatus::Done);

    let lock_projects: Vec<String> = drain(&mut rx)
        .into_iter()
        .filter_map(|e| match e {
            ControlEvent::MergeLockAcquired { project_id, .. } => Some(project_id),
            _ => None,
        })
        .collect();
    assert_eq!(lock_projects, vec!["shop".to_string()]);
    assert!(env.merge.get("shop").await.unwrap().is_none());
}
