use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    Running,
    Done,
    Failed,
    Cancelled,
}

crate::str_enum!(RunStatus, "run status", {
    Queued => "queued",
    Running => "running",
    Done => "done",
    Failed => "failed",
    Cancelled => "cancelled",
});

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Cancelled)
    }

    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }
}

/// Where a run currently is in its pipeline.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Queued,
    Setup,
    Builder,
    WaitingForInput,
    Test,
    Review,
    Merge,
    Finished,
}

crate::str_enum!(RunPhase, "run phase", {
    Queued => "queued",
    Setup => "setup",
    Builder => "builder",
    WaitingForInput => "waiting_for_input",
    Test => "test",
    Review => "review",
    Merge => "merge",
    Finished => "finished",
});

/// Why a run ended `failed`. The display strings are stable: the shift
/// scheduler matches on them when deciding whether to retry a work order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    IterationBudgetExhausted,
    MergeConflictUnresolved,
    SetupFailed,
    BudgetExhausted,
    AgentEnvironmentFailure,
    InputWaitTimedOut,
    AdmissionWaitTimedOut,
    Internal,
}

crate::str_enum!(FailureReason, "failure reason", {
    IterationBudgetExhausted => "iteration_budget_exhausted",
    MergeConflictUnresolved => "merge_conflict_unresolved",
    SetupFailed => "setup_failed",
    BudgetExhausted => "budget_exhausted",
    AgentEnvironmentFailure => "agent_environment_failure",
    InputWaitTimedOut => "input_wait_timed_out",
    AdmissionWaitTimedOut => "admission_wait_timed_out",
    Internal => "internal",
});

impl FailureReason {
    /// Human-readable reason written into `Run::error`.
    pub fn describe(&self) -> &'static str {
        match self {
            Self::IterationBudgetExhausted => "iteration budget exhausted",
            Self::MergeConflictUnresolved => "merge conflict unresolved",
            Self::SetupFailed => "setup failed",
            Self::BudgetExhausted => "budget exhausted",
            Self::AgentEnvironmentFailure => "agent environment failure",
            Self::InputWaitTimedOut => "input wait timed out",
            Self::AdmissionWaitTimedOut => "admission wait timed out",
            Self::Internal => "internal error",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: String,
    pub work_item_id: String,
    /// Captured when the run is created. A project identity collapse rewrites
    /// this column, so the stored value is authoritative; in-memory copies go
    /// stale.
    pub project_id: String,
    pub status: RunStatus,
    pub phase: RunPhase,
    pub builder_iteration: u32,
    pub log_path: Option<String>,
    pub branch_name: Option<String>,
    pub cost_usd: f64,
    pub error: Option<String>,
    pub failure_reason: Option<FailureReason>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Append-only audit entry for a command executed on behalf of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunCommand {
    pub run_id: String,
    pub seq: i64,
    pub cwd: String,
    pub command: String,
    pub exit_code: Option<i32>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses() {
        assert!(RunStatus::Done.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
        assert!(RunStatus::Cancelled.is_terminal());
        assert!(RunStatus::Queued.is_active());
        assert!(RunStatus::Running.is_active());
    }

    #[test]
    fn iteration_exhaustion_reason_is_distinct() {
        let described: Vec<&str> = FailureReason::all().iter().map(|r| r.describe()).collect();
        assert_eq!(
            described.iter().filter(|d| **d == "iteration budget exhausted").count(),
            1
        );
        assert_eq!(
            "iteration_budget_exhausted".parse::<FailureReason>().unwrap(),
            FailureReason::IterationBudgetExhausted
        );
    }

    #[test]
    fn waiting_for_input_phase_name() {
        assert_eq!(RunPhase::WaitingForInput.as_str(), "waiting_for_input");
        assert_eq!(
            serde_json::to_string(&RunPhase::WaitingForInput).unwrap(),
            "\"waiting_for_input\""
        );
    }
}
