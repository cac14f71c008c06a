use serde::{Deserialize, Serialize};

use crate::budget::BudgetStatus;
use crate::run::{RunPhase, RunStatus};
use crate::shift::{SessionState, ShiftPhase};
use crate::vm::VmStatus;
use crate::work_item::WorkItemStatus;

/// Progress notifications pushed to subscribers of the event bus.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "data")]
pub enum ControlEvent {
    RunStarted {
        run_id: String,
        work_item_id: String,
        project_id: String,
    },
    RunPhaseChanged {
        run_id: String,
        phase: RunPhase,
    },
    RunIteration {
        run_id: String,
        iteration: u32,
    },
    RunWaitingForInput {
        run_id: String,
        escalation_id: String,
    },
    RunFinished {
        run_id: String,
        status: RunStatus,
        error: Option<String>,
    },
    WorkItemMoved {
        work_item_id: String,
        from: WorkItemStatus,
        to: WorkItemStatus,
    },
    MergeLockAcquired {
        project_id: String,
        run_id: String,
    },
    MergeLockReleased {
        project_id: String,
        run_id: String,
    },
    VmStatusChanged {
        project_id: String,
        status: VmStatus,
    },
    BudgetStatusChanged {
        project_id: String,
        status: BudgetStatus,
    },
    ShiftPhaseChanged {
        shift_id: String,
        project_id: String,
        phase: ShiftPhase,
    },
    SessionStateChanged {
        session_id: String,
        state: SessionState,
    },
    EscalationRaised {
        escalation_id: String,
        project_id: String,
        reason: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adjacent_tag_shape() {
        let event = ControlEvent::RunIteration {
            run_id: "r1".into(),
            iteration: 2,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "RunIteration");
        assert_eq!(json["data"]["iteration"], 2);
    }
}
