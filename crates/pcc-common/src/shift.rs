use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ShiftPhase {
    Context,
    Assess,
    Decide,
    Execute,
    Handoff,
}

crate::str_enum!(ShiftPhase, "shift phase", {
    Context => "context",
    Assess => "assess",
    Decide => "decide",
    Execute => "execute",
    Handoff => "handoff",
});

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Decision {
    pub action: String,
    pub rationale: String,
}

/// Written at the end of every shift, including no-op shifts.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Handoff {
    pub summary: String,
    #[serde(default)]
    pub work_completed: Vec<String>,
    #[serde(default)]
    pub blockers: Vec<String>,
    #[serde(default)]
    pub next_priorities: Vec<String>,
    pub recommended_next_action: String,
    #[serde(default)]
    pub decisions: Vec<Decision>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Shift {
    pub id: String,
    pub project_id: String,
    pub phase: ShiftPhase,
    pub started_at: DateTime<Utc>,
    pub timeout_minutes: u32,
    pub ended_at: Option<DateTime<Utc>>,
    pub handoff: Option<Handoff>,
}

impl Shift {
    pub fn is_active(&self) -> bool {
        self.ended_at.is_none()
    }
}

/// The candidate actions a shift can commit to, in descending precedence.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ShiftAction {
    RemoveBlocker {
        work_item_id: String,
        blocker: String,
    },
    ExecuteWorkItem {
        work_item_id: String,
    },
    CreateWorkItem {
        title: String,
        goal: String,
    },
    Research {
        topic: String,
    },
}

impl ShiftAction {
    /// Lower ranks win.
    pub fn rank(&self) -> u8 {
        match self {
            Self::RemoveBlocker { .. } => 0,
            Self::ExecuteWorkItem { .. } => 1,
            Self::CreateWorkItem { .. } => 2,
            Self::Research { .. } => 3,
        }
    }

    pub fn label(&self) -> String {
        match self {
            Self::RemoveBlocker { work_item_id, .. } => format!("remove blocker on {work_item_id}"),
            Self::ExecuteWorkItem { work_item_id } => format!("execute {work_item_id}"),
            Self::CreateWorkItem { title, .. } => format!("create work order '{title}'"),
            Self::Research { topic } => format!("research {topic}"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Briefing,
    Autonomous,
    Paused,
    Stopped,
    Completed,
}

crate::str_enum!(SessionState, "session state", {
    Briefing => "briefing",
    Autonomous => "autonomous",
    Paused => "paused",
    Stopped => "stopped",
    Completed => "completed",
});

impl SessionState {
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Stopped | Self::Completed)
    }
}

/// The cross-project session that drives shifts after a human briefing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalSession {
    pub id: String,
    pub state: SessionState,
    pub goals: Vec<String>,
    pub constraints: Vec<String>,
    pub iteration: u32,
    pub max_iterations: u32,
    pub paused_at: Option<DateTime<Utc>>,
    pub pause_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
