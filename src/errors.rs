//! Typed error hierarchy for the control center.
//!
//! One enum per subsystem. Storage code stays on `anyhow::Result` with
//! `.context()`; those errors surface through each enum's transparent
//! `Other` variant.

use thiserror::Error;

use pcc_common::{RunStatus, SessionState, VmStatus, WorkItemStatus};

/// Errors from the work item store and its dependency graph.
#[derive(Debug, Error)]
pub enum WorkItemError {
    #[error("Work item {id} not found")]
    NotFound { id: String },

    #[error("Project {id} not found")]
    ProjectNotFound { id: String },

    #[error("Invalid transition for {id}: {from} -> {to}")]
    InvalidTransition {
        id: String,
        from: WorkItemStatus,
        to: WorkItemStatus,
    },

    #[error("Dependency cycle: {}", path.join(" -> "))]
    DependencyCycle { path: Vec<String> },

    #[error("Work item {id} depends on unknown work item {dependency}")]
    UnknownDependency { id: String, dependency: String },

    #[error("Work item {id} cannot be ready: dependencies not done: {}", pending.join(", "))]
    DependenciesNotDone { id: String, pending: Vec<String> },

    #[error("Work item {id} already exists")]
    DuplicateId { id: String },

    #[error("Invalid work order spec: {0}")]
    InvalidSpec(String),

    #[error("Work item {id} changed concurrently (expected {expected})")]
    Conflict {
        id: String,
        expected: WorkItemStatus,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors from the run orchestrator.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("Run {id} not found")]
    NotFound { id: String },

    #[error("Work item {id} is {status}, only ready work items can be enqueued")]
    NotReady { id: String, status: WorkItemStatus },

    #[error("Work item {work_item_id} already has an active run")]
    AlreadyActive { work_item_id: String },

    #[error("Run {id} is {status} and cannot be changed")]
    AlreadyFinished { id: String, status: RunStatus },

    #[error("Run {id} is not waiting for input")]
    NotWaitingForInput { id: String },

    #[error(transparent)]
    WorkItem(#[from] WorkItemError),

    #[error(transparent)]
    Budget(#[from] BudgetError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors from the merge coordinator.
#[derive(Debug, Error)]
pub enum MergeError {
    #[error("Merge lock for project {project_id} is held by run {holder}")]
    LockHeld { project_id: String, holder: String },

    #[error("Timed out after {waited_secs}s waiting for the merge lock of project {project_id}")]
    Timeout { project_id: String, waited_secs: u64 },

    #[error("Run {run_id} not found")]
    RunNotFound { run_id: String },

    #[error("Project {project_id} not found")]
    ProjectNotFound { project_id: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Failures reported by the compute provider, classified for retry.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("Transient provider failure: {0}")]
    Transient(String),

    #[error("Provider failure: {0}")]
    Permanent(String),

    #[error("Failed to launch provider command: {0}")]
    Spawn(#[source] std::io::Error),
}

impl ProviderError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Errors from the VM lifecycle manager.
#[derive(Debug, Error)]
pub enum VmError {
    #[error("Project {project_id} not found")]
    ProjectNotFound { project_id: String },

    #[error("Cannot {operation} VM for project {project_id} while it is {status}")]
    InvalidState {
        project_id: String,
        status: VmStatus,
        operation: &'static str,
    },

    #[error("VM {operation} for project {project_id} failed after {attempts} attempts: {source}")]
    OperationFailed {
        project_id: String,
        operation: &'static str,
        attempts: u32,
        #[source]
        source: ProviderError,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors from the budget governor.
#[derive(Debug, Error)]
pub enum BudgetError {
    #[error("Project {project_id} not found")]
    ProjectNotFound { project_id: String },

    #[error("Invalid amount {amount}: must be a non-negative number")]
    InvalidAmount { amount: f64 },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors from the shift scheduler and the session coordinator.
#[derive(Debug, Error)]
pub enum ShiftError {
    #[error("Project {project_id} not found")]
    ProjectNotFound { project_id: String },

    #[error("Project {project_id} already has an active shift")]
    AlreadyActive { project_id: String },

    #[error("No session exists")]
    NoSession,

    #[error("Cannot {operation} a session that is {state}")]
    InvalidSessionState {
        state: SessionState,
        operation: &'static str,
    },

    #[error(transparent)]
    Run(#[from] RunError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors from the portfolio layer: communications, escalations and action
/// items posted by outer surfaces.
#[derive(Debug, Error)]
pub enum PortfolioError {
    #[error("Invalid request: {0}")]
    Invalid(String),

    #[error("Project {project_id} not found")]
    ProjectNotFound { project_id: String },

    #[error("Communication {id} not found")]
    CommunicationNotFound { id: String },

    #[error("Escalation {id} not found")]
    EscalationNotFound { id: String },

    #[error(transparent)]
    WorkItem(#[from] WorkItemError),

    #[error(transparent)]
    Shift(#[from] ShiftError),

    #[error(transparent)]
    Budget(#[from] BudgetError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
