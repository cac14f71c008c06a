use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Why autonomous progress stopped.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EscalationReason {
    NeedInput,
    BudgetExhausted,
    IterationBudgetExhausted,
    MergeConflict,
    SetupFailed,
    ShiftTimeout,
    RepeatedFailure,
    /// The change merged but the work item could not advance.
    CompletionBlocked,
}

crate::str_enum!(EscalationReason, "escalation reason", {
    NeedInput => "need_input",
    BudgetExhausted => "budget_exhausted",
    IterationBudgetExhausted => "iteration_budget_exhausted",
    MergeConflict => "merge_conflict",
    SetupFailed => "setup_failed",
    ShiftTimeout => "shift_timeout",
    RepeatedFailure => "repeated_failure",
    CompletionBlocked => "completion_blocked",
});

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationRecord {
    pub id: String,
    pub project_id: String,
    pub run_id: Option<String>,
    pub shift_id: Option<String>,
    pub reason: EscalationReason,
    pub detail: String,
    pub payload: serde_json::Value,
    /// One escalation per logical request; retries reuse the key.
    pub dedup_key: String,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl EscalationRecord {
    pub fn is_open(&self) -> bool {
        self.resolved_at.is_none()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CommunicationIntent {
    Escalation,
    Request,
    Message,
    Suggestion,
    Status,
}

crate::str_enum!(CommunicationIntent, "communication intent", {
    Escalation => "escalation",
    Request => "request",
    Message => "message",
    Suggestion => "suggestion",
    Status => "status",
});

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CommunicationType {
    NeedInput,
    Blocked,
    DecisionRequired,
    Error,
    BudgetWarning,
    BudgetCritical,
    BudgetExhausted,
    RunBlocked,
}

crate::str_enum!(CommunicationType, "communication type", {
    NeedInput => "need_input",
    Blocked => "blocked",
    DecisionRequired => "decision_required",
    Error => "error",
    BudgetWarning => "budget_warning",
    BudgetCritical => "budget_critical",
    BudgetExhausted => "budget_exhausted",
    RunBlocked => "run_blocked",
});

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum CommunicationScope {
    #[default]
    Project,
    Global,
    User,
}

crate::str_enum!(CommunicationScope, "communication scope", {
    Project => "project",
    Global => "global",
    User => "user",
});

/// A message posted to the communications queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewCommunication {
    pub intent: CommunicationIntent,
    #[serde(rename = "type")]
    pub kind: CommunicationType,
    #[serde(default)]
    pub scope: CommunicationScope,
    pub summary: String,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub run_id: Option<String>,
    #[serde(default)]
    pub shift_id: Option<String>,
    #[serde(default)]
    pub payload: Option<serde_json::Value>,
}

impl NewCommunication {
    pub fn validate(&self) -> Result<(), String> {
        if self.summary.trim().is_empty() {
            return Err("summary is required".to_string());
        }
        if let Some(payload) = &self.payload
            && !payload.is_object()
        {
            return Err("payload must be a JSON object".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Communication {
    pub id: String,
    /// `None` for global and user scoped messages.
    pub project_id: Option<String>,
    pub intent: CommunicationIntent,
    #[serde(rename = "type")]
    pub kind: CommunicationType,
    pub scope: CommunicationScope,
    pub summary: String,
    pub body: Option<String>,
    pub run_id: Option<String>,
    pub shift_id: Option<String>,
    pub payload: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub acknowledged_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_wire_shape() {
        let raw = r#"{"intent":"request","type":"decision_required","summary":"pick a db"}"#;
        let comm: NewCommunication = serde_json::from_str(raw).unwrap();
        assert_eq!(comm.intent, CommunicationIntent::Request);
        assert_eq!(comm.kind, CommunicationType::DecisionRequired);
        assert_eq!(comm.scope, CommunicationScope::Project);
        assert!(comm.validate().is_ok());
    }

    #[test]
    fn rejects_non_object_payload() {
        let raw = r#"{"intent":"message","type":"error","summary":"x","payload":[1,2]}"#;
        let comm: NewCommunication = serde_json::from_str(raw).unwrap();
        assert!(comm.validate().is_err());
    }

    #[test]
    fn rejects_unknown_type() {
        let raw = r#"{"intent":"message","type":"shout","summary":"x"}"#;
        assert!(serde_json::from_str::<NewCommunication>(raw).is_err());
    }
}
