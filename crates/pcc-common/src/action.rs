use serde::{Deserialize, Serialize};

use crate::communication::NewCommunication;
use crate::work_item::WorkItemSpec;

/// An action proposed by an outer surface (chat, voice, dashboards).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ActionItem {
    WorkOrder {
        project_id: String,
        spec: WorkItemSpec,
    },
    Communication {
        project_id: Option<String>,
        communication: NewCommunication,
    },
}

impl ActionItem {
    pub fn validate(&self) -> Result<(), String> {
        match self {
            Self::WorkOrder { project_id, spec } => {
                if project_id.trim().is_empty() {
                    return Err("project_id is required".to_string());
                }
                spec.validate()
            }
            Self::Communication {
                project_id,
                communication,
            } => {
                if project_id.is_none()
                    && communication.scope == crate::CommunicationScope::Project
                {
                    return Err("project scoped communication needs a project_id".to_string());
                }
                communication.validate()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn work_order_action_parses_and_validates() {
        let raw = r#"{"kind":"work_order","project_id":"p1","spec":{"title":"Add login"}}"#;
        let action: ActionItem = serde_json::from_str(raw).unwrap();
        assert!(action.validate().is_ok());
        match action {
            ActionItem::WorkOrder { spec, .. } => assert_eq!(spec.priority, 3),
            _ => panic!("expected work order"),
        }
    }

    #[test]
    fn project_scoped_communication_needs_project() {
        let raw = r#"{"kind":"communication","project_id":null,
            "communication":{"intent":"message","type":"blocked","summary":"stuck"}}"#;
        let action: ActionItem = serde_json::from_str(raw).unwrap();
        assert!(action.validate().is_err());
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let raw = r#"{"kind":"launch_rocket"}"#;
        assert!(serde_json::from_str::<ActionItem>(raw).is_err());
    }
}
