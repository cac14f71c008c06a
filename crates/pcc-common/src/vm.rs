use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum VmStatus {
    NotProvisioned,
    Running,
    Stopped,
    Error,
    Deleted,
}

crate::str_enum!(VmStatus, "vm status", {
    NotProvisioned => "not_provisioned",
    Running => "running",
    Stopped => "stopped",
    Error => "error",
    Deleted => "deleted",
});

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum SizeClass {
    Small,
    #[default]
    Medium,
    Large,
    Xlarge,
}

crate::str_enum!(SizeClass, "size class", {
    Small => "small",
    Medium => "medium",
    Large => "large",
    Xlarge => "xlarge",
});

/// Compute instance bound to a project. There is at most one per project.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmRecord {
    pub project_id: String,
    pub status: VmStatus,
    pub instance_name: Option<String>,
    pub external_ip: Option<String>,
    pub internal_ip: Option<String>,
    pub size: SizeClass,
    pub last_started_at: Option<DateTime<Utc>>,
    pub last_activity_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl VmRecord {
    pub fn not_provisioned(project_id: &str) -> Self {
        Self {
            project_id: project_id.to_string(),
            status: VmStatus::NotProvisioned,
            instance_name: None,
            external_ip: None,
            internal_ip: None,
            size: SizeClass::default(),
            last_started_at: None,
            last_activity_at: None,
            last_error: None,
            updated_at: Utc::now(),
        }
    }

    /// True when an instance exists remotely (possibly broken).
    pub fn has_instance(&self) -> bool {
        self.instance_name.is_some()
            && !matches!(self.status, VmStatus::NotProvisioned | VmStatus::Deleted)
    }
}
