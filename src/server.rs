//! Process wiring: build every service from config, recover after an unclean
//! shutdown, start the background loops and serve the HTTP API.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::Router;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use crate::agent::{AgentReviewer, ClaudeCli, ClaudeCliAgent, CommandTestSuite};
use crate::api::{self, AppState, SharedState};
use crate::budget::{BudgetGovernor, BudgetSettings};
use crate::config::{PccConfig, VmProviderKind};
use crate::events::EventBus;
use crate::merge::MergeCoordinator;
use crate::orchestrator::{
    Collaborators, OrchestratorDeps, OrchestratorSettings, Recovery, RunOrchestrator,
};
use crate::portfolio::Portfolio;
use crate::shift::{SessionCoordinator, ShiftScheduler, ShiftSettings};
use crate::store::{DbHandle, PccDb};
use crate::vm::provider::{ComputeProvider, GcloudProvider};
use crate::vm::reaper::{Reaper, ReaperSettings};
use crate::vm::VmManager;
use crate::work_items::WorkItemStore;
use crate::workspace::{GitWorktrees, WorkspaceProvider};

/// Everything `serve` runs: the shared API state plus the two loops that
/// live beside it.
pub struct Services {
    pub state: SharedState,
    pub reaper: Reaper,
}

/// Create the config file (when missing), database and artifact directories.
pub fn init(config: &PccConfig) -> Result<()> {
    if !config.config_path.exists() {
        config
            .toml
            .save(&config.config_path)
            .with_context(|| format!("Failed to write {}", config.config_path.display()))?;
    }
    let artifacts = config.artifacts_dir();
    for dir in ["runs", "worktrees", "work_orders"] {
        let path = artifacts.join(dir);
        std::fs::create_dir_all(&path)
            .with_context(|| format!("Failed to create {}", path.display()))?;
    }
    PccDb::new(config.db_path()).context("Failed to initialize database")?;
    Ok(())
}

pub fn open_db(config: &PccConfig) -> Result<DbHandle> {
    let db = PccDb::new(config.db_path()).context("Failed to initialize database")?;
    Ok(DbHandle::new(db))
}

pub fn build_services(config: &PccConfig) -> Result<Services> {
    let toml = &config.toml;
    let problems = toml.validate();
    if !problems.is_empty() {
        anyhow::bail!("Invalid configuration:\n  {}", problems.join("\n  "));
    }

    let db = open_db(config)?;
    let events = EventBus::new();
    let artifacts = config.artifacts_dir();

    let provider: Option<Arc<dyn ComputeProvider>> = match toml.vm.provider {
        VmProviderKind::None => None,
        VmProviderKind::Gcloud => Some(Arc::new(GcloudProvider::from_config(&toml.vm))),
    };
    let vm = VmManager::new(
        db.clone(),
        events.clone(),
        provider,
        toml.vm.retry_policy(),
        toml.vm.remote_root.clone(),
    );

    let budget = BudgetGovernor::new(
        db.clone(),
        events.clone(),
        BudgetSettings::from_config(&toml.budget),
    );
    let work_items =
        WorkItemStore::new(db.clone(), events.clone()).with_spec_dir(artifacts.join("work_orders"));
    let merge = MergeCoordinator::new(db.clone(), events.clone());

    let workspaces: Arc<dyn WorkspaceProvider> =
        Arc::new(GitWorktrees::new(artifacts.join("worktrees")));
    let cli = ClaudeCli::from_config(toml);
    let tests = CommandTestSuite::new(Duration::from_secs(toml.orchestrator.test_timeout_secs))
        .with_vm(vm.clone());
    let collaborators = Collaborators {
        agent: Arc::new(ClaudeCliAgent::new(cli.clone())),
        reviewer: Arc::new(AgentReviewer::new(cli)),
        tests: Arc::new(tests),
        workspaces: workspaces.clone(),
    };

    let orchestrator = RunOrchestrator::new(
        OrchestratorDeps {
            db: db.clone(),
            events: events.clone(),
            work_items: work_items.clone(),
            merge,
            vm: vm.clone(),
            budget: budget.clone(),
            collaborators,
        },
        OrchestratorSettings::from_config(toml),
    );
    let shifts = ShiftScheduler::new(
        db.clone(),
        events.clone(),
        work_items.clone(),
        budget.clone(),
        orchestrator.clone(),
        ShiftSettings::from_config(&toml.shift),
    );
    let sessions = SessionCoordinator::new(
        db.clone(),
        events.clone(),
        shifts.clone(),
        budget.clone(),
        toml.shift.session_max_iterations,
    );
    let portfolio = Portfolio::new(
        db.clone(),
        work_items.clone(),
        budget.clone(),
        sessions.clone(),
    );

    let reaper = Reaper::new(
        db.clone(),
        vm.clone(),
        workspaces,
        ReaperSettings::from_config(&toml.vm),
    );

    let state = Arc::new(AppState {
        db,
        events,
        work_items,
        orchestrator,
        vm,
        budget,
        shifts,
        sessions,
        portfolio,
    });
    Ok(Services { state, reaper })
}

pub fn build_router(state: SharedState) -> Router {
    api::router(state).layer(CorsLayer::permissive())
}

/// Run the control plane until Ctrl+C.
pub async fn serve(config: PccConfig) -> Result<()> {
    let Services { state, reaper } = build_services(&config)?;

    let Recovery {
        runs_failed,
        locks_released,
        work_items_reset,
    } = state
        .orchestrator
        .recover()
        .await
        .context("Startup recovery failed")?;
    if runs_failed + locks_released + work_items_reset > 0 {
        warn!(
            runs_failed,
            locks_released, work_items_reset, "Recovered from an unclean shutdown"
        );
    }

    let cancel = CancellationToken::new();
    let drip_interval = Duration::from_secs(config.toml.budget.drip_interval_secs);
    let drip = tokio::spawn(
        state
            .budget
            .clone()
            .run_drip(drip_interval, cancel.child_token()),
    );
    let reaping = tokio::spawn(reaper.run(cancel.child_token()));

    let app = build_router(state);
    let addr = format!("{}:{}", config.toml.server.host, config.toml.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    let local_addr = listener.local_addr()?;
    info!(%local_addr, db = %config.db_path().display(), "pcc listening");

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error");

    cancel.cancel();
    let _ = tokio::join!(drip, reaping);
    info!("Server shut down gracefully");
    served
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for Ctrl+C; shutting down");
        return;
    }
    info!("Shutting down...");
}
