use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The single live trunk-write lock of a project.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MergeLock {
    pub id: String,
    pub project_id: String,
    pub run_id: String,
    pub acquired_at: DateTime<Utc>,
}
