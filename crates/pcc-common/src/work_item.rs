use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle of a work order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum WorkItemStatus {
    Backlog,
    Ready,
    Building,
    AiReview,
    YouReview,
    Done,
    Blocked,
    Parked,
}

crate::str_enum!(WorkItemStatus, "work item status", {
    Backlog => "backlog",
    Ready => "ready",
    Building => "building",
    AiReview => "ai_review",
    YouReview => "you_review",
    Done => "done",
    Blocked => "blocked",
    Parked => "parked",
});

impl WorkItemStatus {
    /// `done` and `parked` are archival states; nothing leaves them.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Parked)
    }
}

fn default_priority() -> u8 {
    3
}

/// Fields a work order is created from, as posted or parsed from markdown.
///
/// Accepted either as a JSON body or as YAML frontmatter on a markdown file;
/// `body` carries the markdown after the frontmatter.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct WorkItemSpec {
    #[serde(default)]
    pub id: Option<String>,
    pub title: String,
    #[serde(default)]
    pub goal: String,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    #[serde(default)]
    pub non_goals: Vec<String>,
    #[serde(default)]
    pub stop_conditions: Vec<String>,
    #[serde(default = "default_priority")]
    pub priority: u8,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub estimate_usd: Option<f64>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub body: String,
}

impl WorkItemSpec {
    pub fn validate(&self) -> Result<(), String> {
        if self.title.trim().is_empty() {
            return Err("title is required".to_string());
        }
        if !(1..=5).contains(&self.priority) {
            return Err(format!("priority must be between 1 and 5, got {}", self.priority));
        }
        if let Some(estimate) = self.estimate_usd
            && (estimate.is_nan() || estimate < 0.0)
        {
            return Err("estimate_usd must be a non-negative number".to_string());
        }
        if let Some(id) = &self.id
            && self.depends_on.iter().any(|d| d == id)
        {
            return Err(format!("{} cannot depend on itself", id));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: String,
    pub project_id: String,
    pub title: String,
    pub goal: String,
    pub acceptance_criteria: Vec<String>,
    pub non_goals: Vec<String>,
    pub stop_conditions: Vec<String>,
    pub priority: u8,
    pub tags: Vec<String>,
    pub depends_on: Vec<String>,
    pub status: WorkItemStatus,
    pub estimate_usd: Option<f64>,
    pub spec_path: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Field edits that leave status and dependencies alone.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkItemPatch {
    pub title: Option<String>,
    pub goal: Option<String>,
    pub acceptance_criteria: Option<Vec<String>>,
    pub non_goals: Option<Vec<String>>,
    pub stop_conditions: Option<Vec<String>>,
    pub priority: Option<u8>,
    pub tags: Option<Vec<String>>,
    pub estimate_usd: Option<f64>,
}

/// One row of a work order's transition history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItemEvent {
    pub work_item_id: String,
    pub from_status: WorkItemStatus,
    pub to_status: WorkItemStatus,
    pub cause: String,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_wire_names_match_serde() {
        for status in WorkItemStatus::all() {
            let json = serde_json::to_string(status).unwrap();
            assert_eq!(json, format!("\"{}\"", status.as_str()));
        }
    }

    #[test]
    fn spec_defaults_priority_to_three() {
        let spec: WorkItemSpec = serde_json::from_str(r#"{"title":"Add login"}"#).unwrap();
        assert_eq!(spec.priority, 3);
        assert!(spec.depends_on.is_empty());
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn spec_validation_rejects_bad_priority_and_self_dependency() {
        let mut spec = WorkItemSpec {
            title: "x".into(),
            priority: 9,
            ..Default::default()
        };
        assert!(spec.validate().unwrap_err().contains("priority"));

        spec.priority = 2;
        spec.id = Some("WO-7".into());
        spec.depends_on = vec!["WO-7".into()];
        assert!(spec.validate().unwrap_err().contains("itself"));
    }

    #[test]
    fn terminal_states() {
        assert!(WorkItemStatus::Done.is_terminal());
        assert!(WorkItemStatus::Parked.is_terminal());
        assert!(!WorkItemStatus::YouReview.is_terminal());
    }
}
