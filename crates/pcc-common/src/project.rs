use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ProjectStatus {
    Active,
    Blocked,
    Parked,
}

crate::str_enum!(ProjectStatus, "project status", {
    Active => "active",
    Blocked => "blocked",
    Parked => "parked",
});

/// A repository under management.
///
/// `id` is the canonical identity. A background discovery pass may collapse a
/// duplicate record into another one, after which the old id only survives as
/// an alias; anything holding an id across an await point must re-resolve it
/// before writing rows that reference the project.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    pub name: String,
    pub path: String,
    pub status: ProjectStatus,
    /// 1 is the most urgent, 5 the least.
    pub priority: u8,
    pub trunk_branch: String,
    pub test_command: Option<String>,
    pub requires_vm: bool,
    pub created_at: DateTime<Utc>,
}
