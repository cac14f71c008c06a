//! Layered configuration for the control center.
//!
//! Values resolve in order: built-in defaults, then `.pcc/pcc.toml`, then
//! environment variables, then CLI flags.
//!
//! ```toml
//! [server]
//! host = "127.0.0.1"
//! port = 3141
//!
//! [store]
//! db_path = ".pcc/pcc.db"
//! artifacts_dir = ".pcc/artifacts"
//!
//! [orchestrator]
//! max_iterations = 10
//! max_blocking_retries = 3
//! completion_policy = "done"
//! agent_cmd = "claude"
//!
//! [budget]
//! default_monthly_usd = 50.0
//! default_daily_drip_usd = 1.0
//!
//! [vm]
//! provider = "gcloud"
//! gcloud_project = "my-gcp-project"
//! zone = "us-central1-a"
//!
//! [shift]
//! timeout_minutes = 120
//!
//! [logging]
//! format = "json"
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::budget::BudgetThresholds;
use crate::vm::retry::RetryPolicy;

pub const DEFAULT_CONFIG_PATH: &str = ".pcc/pcc.toml";

/// How far a merged work item is walked after its run lands on trunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionPolicy {
    AiReview,
    YouReview,
    #[default]
    Done,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    3141
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreSection {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    #[serde(default = "default_artifacts_dir")]
    pub artifacts_dir: PathBuf,
}

fn default_db_path() -> PathBuf {
    PathBuf::from(".pcc/pcc.db")
}

fn default_artifacts_dir() -> PathBuf {
    PathBuf::from(".pcc/artifacts")
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            artifacts_dir: default_artifacts_dir(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorSection {
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    #[serde(default = "default_max_blocking_retries")]
    pub max_blocking_retries: u32,
    #[serde(default = "default_blocking_backoff_ms")]
    pub blocking_retry_backoff_ms: u64,
    #[serde(default)]
    pub completion_policy: CompletionPolicy,
    /// Coding agent CLI (default: "claude")
    #[serde(default)]
    pub agent_cmd: Option<String>,
    #[serde(default = "default_true")]
    pub skip_permissions: bool,
    #[serde(default = "default_agent_timeout_secs")]
    pub agent_timeout_secs: u64,
    #[serde(default = "default_test_timeout_secs")]
    pub test_timeout_secs: u64,
    #[serde(default = "default_wait_timeout_secs")]
    pub input_wait_timeout_secs: u64,
    #[serde(default = "default_wait_timeout_secs")]
    pub admission_wait_timeout_secs: u64,
    #[serde(default = "default_merge_lock_timeout_secs")]
    pub merge_lock_timeout_secs: u64,
    #[serde(default = "default_estimate_usd")]
    pub default_estimate_usd: f64,
}

fn default_max_iterations() -> u32 {
    10
}

fn default_max_blocking_retries() -> u32 {
    3
}

fn default_blocking_backoff_ms() -> u64 {
    2_000
}

fn default_true() -> bool {
    true
}

fn default_agent_timeout_secs() -> u64 {
    1_800
}

fn default_test_timeout_secs() -> u64 {
    600
}

fn default_wait_timeout_secs() -> u64 {
    3_600
}

fn default_merge_lock_timeout_secs() -> u64 {
    600
}

fn default_estimate_usd() -> f64 {
    1.0
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            max_blocking_retries: default_max_blocking_retries(),
            blocking_retry_backoff_ms: default_blocking_backoff_ms(),
            completion_policy: CompletionPolicy::default(),
            agent_cmd: None,
            skip_permissions: true,
            agent_timeout_secs: default_agent_timeout_secs(),
            test_timeout_secs: default_test_timeout_secs(),
            input_wait_timeout_secs: default_wait_timeout_secs(),
            admission_wait_timeout_secs: default_wait_timeout_secs(),
            merge_lock_timeout_secs: default_merge_lock_timeout_secs(),
            default_estimate_usd: default_estimate_usd(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetSection {
    #[serde(default = "default_monthly_usd")]
    pub default_monthly_usd: f64,
    #[serde(default = "default_daily_drip_usd")]
    pub default_daily_drip_usd: f64,
    /// Remaining fraction of the monthly allocation below which status is warning.
    #[serde(default = "default_warning_fraction")]
    pub warning_fraction: f64,
    #[serde(default = "default_critical_fraction")]
    pub critical_fraction: f64,
    #[serde(default = "default_warning_runway_days")]
    pub warning_runway_days: f64,
    #[serde(default = "default_critical_runway_days")]
    pub critical_runway_days: f64,
    /// How often the drip task checks for a new UTC day.
    #[serde(default = "default_drip_interval_secs")]
    pub drip_interval_secs: u64,
}

fn default_monthly_usd() -> f64 {
    50.0
}

fn default_daily_drip_usd() -> f64 {
    1.0
}

fn default_warning_fraction() -> f64 {
    0.5
}

fn default_critical_fraction() -> f64 {
    0.2
}

fn default_warning_runway_days() -> f64 {
    14.0
}

fn default_critical_runway_days() -> f64 {
    5.0
}

fn default_drip_interval_secs() -> u64 {
    3_600
}

impl Default for BudgetSection {
    fn default() -> Self {
        Self {
            default_monthly_usd: default_monthly_usd(),
            default_daily_drip_usd: default_daily_drip_usd(),
            warning_fraction: default_warning_fraction(),
            critical_fraction: default_critical_fraction(),
            warning_runway_days: default_warning_runway_days(),
            critical_runway_days: default_critical_runway_days(),
            drip_interval_secs: default_drip_interval_secs(),
        }
    }
}

impl BudgetSection {
    pub fn thresholds(&self) -> BudgetThresholds {
        BudgetThresholds {
            warning_fraction: self.warning_fraction,
            critical_fraction: self.critical_fraction,
            warning_runway_days: self.warning_runway_days,
            critical_runway_days: self.critical_runway_days,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VmProviderKind {
    /// No remote compute; projects that require a VM fail setup.
    #[default]
    None,
    Gcloud,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmSection {
    #[serde(default)]
    pub provider: VmProviderKind,
    #[serde(default = "default_gcloud_cmd")]
    pub gcloud_cmd: String,
    #[serde(default)]
    pub gcloud_project: Option<String>,
    #[serde(default = "default_zone")]
    pub zone: String,
    #[serde(default = "default_image_family")]
    pub image_family: String,
    #[serde(default = "default_image_project")]
    pub image_project: String,
    #[serde(default = "default_ssh_user")]
    pub ssh_user: String,
    #[serde(default = "default_remote_root")]
    pub remote_root: String,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_idle_stop_minutes")]
    pub idle_stop_after_minutes: u64,
    #[serde(default = "default_retention_hours")]
    pub retention_hours: u64,
    #[serde(default = "default_reaper_interval_secs")]
    pub reaper_interval_secs: u64,
}

fn default_gcloud_cmd() -> String {
    "gcloud".to_string()
}

fn default_zone() -> String {
    "us-central1-a".to_string()
}

fn default_image_family() -> String {
    "debian-12".to_string()
}

fn default_image_project() -> String {
    "debian-cloud".to_string()
}

fn default_ssh_user() -> String {
    "pcc".to_string()
}

fn default_remote_root() -> String {
    "/home/pcc/work".to_string()
}

fn default_max_attempts() -> u32 {
    4
}

fn default_initial_backoff_ms() -> u64 {
    1_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_max_backoff_ms() -> u64 {
    30_000
}

fn default_idle_stop_minutes() -> u64 {
    30
}

fn default_retention_hours() -> u64 {
    72
}

fn default_reaper_interval_secs() -> u64 {
    300
}

impl Default for VmSection {
    fn default() -> Self {
        Self {
            provider: VmProviderKind::default(),
            gcloud_cmd: default_gcloud_cmd(),
            gcloud_project: None,
            zone: default_zone(),
            image_family: default_image_family(),
            image_project: default_image_project(),
            ssh_user: default_ssh_user(),
            remote_root: default_remote_root(),
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            max_backoff_ms: default_max_backoff_ms(),
            idle_stop_after_minutes: default_idle_stop_minutes(),
            retention_hours: default_retention_hours(),
            reaper_interval_secs: default_reaper_interval_secs(),
        }
    }
}

impl VmSection {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts.max(1),
            initial_backoff: Duration::from_millis(self.initial_backoff_ms),
            multiplier: self.backoff_multiplier,
            max_backoff: Duration::from_millis(self.max_backoff_ms),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShiftSection {
    #[serde(default = "default_shift_timeout_minutes")]
    pub timeout_minutes: u32,
    #[serde(default = "default_session_max_iterations")]
    pub session_max_iterations: u32,
}

fn default_shift_timeout_minutes() -> u32 {
    120
}

fn default_session_max_iterations() -> u32 {
    10
}

impl Default for ShiftSection {
    fn default() -> Self {
        Self {
            timeout_minutes: default_shift_timeout_minutes(),
            session_max_iterations: default_session_max_iterations(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSection {
    #[serde(default)]
    pub format: LogFormat,
    /// Filter directive used when neither PCC_LOG nor RUST_LOG is set.
    #[serde(default = "default_log_filter")]
    pub filter: String,
    /// Directory for daily rolling log files; stderr only when unset.
    #[serde(default)]
    pub file_dir: Option<PathBuf>,
}

fn default_log_filter() -> String {
    "pcc=info,tower_http=warn".to_string()
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            format: LogFormat::default(),
            filter: default_log_filter(),
            file_dir: None,
        }
    }
}

/// Contents of `pcc.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PccToml {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub store: StoreSection,
    #[serde(default)]
    pub orchestrator: OrchestratorSection,
    #[serde(default)]
    pub budget: BudgetSection,
    #[serde(default)]
    pub vm: VmSection,
    #[serde(default)]
    pub shift: ShiftSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

impl PccToml {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse pcc.toml")
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize pcc.toml")?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Apply environment overrides. `lookup` is `std::env::var` outside tests.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = lookup("PCC_DB_PATH") {
            self.store.db_path = PathBuf::from(path);
        }
        if let Some(port) = lookup("PCC_PORT") {
            self.server.port = port
                .parse()
                .with_context(|| format!("Invalid PCC_PORT: {}", port))?;
        }
        if let Some(cmd) = lookup("PCC_AGENT_CMD").or_else(|| lookup("CLAUDE_CMD")) {
            self.orchestrator.agent_cmd = Some(cmd);
        }
        if let Some(filter) = lookup("PCC_LOG") {
            self.logging.filter = filter;
        }
        Ok(())
    }

    /// Agent command with fallback to the default CLI name.
    pub fn agent_cmd(&self) -> String {
        self.orchestrator
            .agent_cmd
            .clone()
            .unwrap_or_else(|| "claude".to_string())
    }

    /// Human-readable problems with the configuration; empty when valid.
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if self.orchestrator.max_iterations == 0 {
            problems.push("orchestrator.max_iterations must be at least 1".to_string());
        }
        if self.orchestrator.default_estimate_usd < 0.0 {
            problems.push("orchestrator.default_estimate_usd must be non-negative".to_string());
        }
        let b = &self.budget;
        if !(0.0..=1.0).contains(&b.warning_fraction) || !(0.0..=1.0).contains(&b.critical_fraction)
        {
            problems.push("budget fractions must be between 0 and 1".to_string());
        }
        if b.critical_fraction > b.warning_fraction {
            problems.push("budget.critical_fraction must not exceed warning_fraction".to_string());
        }
        if b.critical_runway_days > b.warning_runway_days {
            problems
                .push("budget.critical_runway_days must not exceed warning_runway_days".to_string());
        }
        if self.vm.backoff_multiplier < 1.0 {
            problems.push("vm.backoff_multiplier must be at least 1.0".to_string());
        }
        if self.vm.provider == VmProviderKind::Gcloud && self.vm.gcloud_project.is_none() {
            problems.push("vm.gcloud_project is required for the gcloud provider".to_string());
        }
        problems
    }
}

/// Resolved configuration: file and environment merged, CLI overrides applied.
#[derive(Debug, Clone)]
pub struct PccConfig {
    pub toml: PccToml,
    pub config_path: PathBuf,
    pub verbose: bool,
}

impl PccConfig {
    /// Load from `config_path` (or the default location), then the environment.
    /// A missing file yields defaults.
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        let config_path = config_path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
        let mut toml = if config_path.exists() {
            PccToml::load(&config_path)?
        } else {
            PccToml::default()
        };
        toml.apply_env(|key| std::env::var(key).ok())?;
        Ok(Self {
            toml,
            config_path,
            verbose: false,
        })
    }

    pub fn with_cli_args(mut self, db_path: Option<PathBuf>, verbose: bool) -> Self {
        if let Some(db_path) = db_path {
            self.toml.store.db_path = db_path;
        }
        self.verbose = verbose;
        self
    }

    pub fn db_path(&self) -> &Path {
        &self.toml.store.db_path
    }

    pub fn artifacts_dir(&self) -> &Path {
        &self.toml.store.artifacts_dir
    }

    pub fn log_filter(&self) -> String {
        if self.verbose {
            "pcc=debug,tower_http=info".to_string()
        } else {
            self.toml.logging.filter.clone()
        }
    }
}
