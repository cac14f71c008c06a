//! Compute provisioning backends.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use pcc_common::SizeClass;

use crate::config::VmSection;
use crate::errors::ProviderError;
use crate::exec::{CommandAudit, NoAudit, display_command};

/// Addresses assigned to a running instance.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InstanceAddresses {
    pub external_ip: Option<String>,
    pub internal_ip: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RemoteOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl RemoteOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Cloud compute operations. Implementations must treat "already in the
/// requested state" as success so callers can retry freely.
#[async_trait]
pub trait ComputeProvider: Send + Sync {
    async fn create_instance(
        &self,
        name: &str,
        size: SizeClass,
    ) -> Result<InstanceAddresses, ProviderError>;

    async fn start_instance(&self, name: &str) -> Result<InstanceAddresses, ProviderError>;

    async fn stop_instance(&self, name: &str) -> Result<(), ProviderError>;

    async fn resize_instance(&self, name: &str, size: SizeClass) -> Result<(), ProviderError>;

    async fn delete_instance(&self, name: &str) -> Result<(), ProviderError>;

    /// Copy a local checkout to `remote_path` on the instance.
    async fn sync_repo(
        &self,
        name: &str,
        local: &Path,
        remote_path: &str,
        audit: &dyn CommandAudit,
    ) -> Result<(), ProviderError>;

    /// Run a shell command on the instance.
    async fn exec(
        &self,
        name: &str,
        cwd: &str,
        command: &str,
        timeout: Duration,
        audit: &dyn CommandAudit,
    ) -> Result<RemoteOutput, ProviderError>;
}

const TRANSIENT_MARKERS: &[&str] = &[
    "timed out",
    "timeout",
    "connection reset",
    "connection refused",
    "connection closed",
    "try again",
    "temporarily unavailable",
    "unavailable",
    "ratelimitexceeded",
    "rate limit",
    "internal error",
    "backenderror",
    "503",
    "502",
    "resource_exhausted",
    "zone_resources_pool_exhausted",
];

const NOT_FOUND_MARKERS: &[&str] = &["was not found", "not found", "notfound"];

const ALREADY_MARKERS: &[&str] = &["already exists", "alreadyexists"];

/// Classify a failed command from its stderr.
pub fn classify_failure(stderr: &str) -> ProviderError {
    let lower = stderr.to_lowercase();
    let message = stderr.trim().to_string();
    if TRANSIENT_MARKERS.iter().any(|m| lower.contains(m)) {
        ProviderError::Transient(message)
    } else {
        ProviderError::Permanent(message)
    }
}

fn mentions(stderr: &str, markers: &[&str]) -> bool {
    let lower = stderr.to_lowercase();
    markers.iter().any(|m| lower.contains(m))
}

pub fn machine_type(size: SizeClass) -> &'static str {
    match size {
        SizeClass::Small => "e2-small",
        SizeClass::Medium => "e2-standard-2",
        SizeClass::Large => "e2-standard-4",
        SizeClass::Xlarge => "e2-standard-8",
    }
}

/// Shells out to the `gcloud` CLI, and to `rsync` over `gcloud compute ssh`.
pub struct GcloudProvider {
    cmd: String,
    project: Option<String>,
    zone: String,
    image_family: String,
    image_project: String,
    ssh_user: String,
}

impl GcloudProvider {
    pub fn from_config(vm: &VmSection) -> Self {
        Self {
            cmd: vm.gcloud_cmd.clone(),
            project: vm.gcloud_project.clone(),
            zone: vm.zone.clone(),
            image_family: vm.image_family.clone(),
            image_project: vm.image_project.clone(),
            ssh_user: vm.ssh_user.clone(),
        }
    }

    fn scope_args(&self) -> Vec<String> {
        let mut args = vec![format!("--zone={}", self.zone)];
        if let Some(project) = &self.project {
            args.push(format!("--project={project}"));
        }
        args
    }

    async fn invoke(
        &self,
        program: &str,
        args: &[String],
        timeout: Option<Duration>,
        audit: &dyn CommandAudit,
    ) -> Result<RemoteOutput, ProviderError> {
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let text = display_command(program, &arg_refs);
        debug!(command = %text, "Running provider command");
        let cwd = std::env::temp_dir();
        let mut cmd = Command::new(program);
        cmd.args(args).current_dir(&cwd).kill_on_drop(true);
        let fut = cmd.output();
        let output = match timeout {
            Some(limit) => match tokio::time::timeout(limit, fut).await {
                Ok(res) => res,
                Err(_) => {
                    audit.record(&cwd, &text, None).await;
                    return Err(ProviderError::Transient(format!(
                        "timed out after {}s: {}",
                        limit.as_secs(),
                        text
                    )));
                }
            },
            None => fut.await,
        };
        let output = match output {
            Ok(output) => output,
            Err(e) => {
                audit.record(&cwd, &text, None).await;
                return Err(ProviderError::Spawn(e));
            }
        };
        audit.record(&cwd, &text, output.status.code()).await;
        Ok(RemoteOutput {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    async fn gcloud(&self, args: Vec<String>) -> Result<RemoteOutput, ProviderError> {
        let mut full = vec!["compute".to_string(), "instances".to_string()];
        full.extend(args);
        full.extend(self.scope_args());
        self.invoke(&self.cmd, &full, Some(Duration::from_secs(600)), &NoAudit)
            .await
    }

    async fn addresses(&self, name: &str) -> Result<InstanceAddresses, ProviderError> {
        let out = self
            .gcloud(vec![
                "describe".into(),
                name.into(),
                "--format=json(networkInterfaces)".into(),
            ])
            .await?;
        if !out.success() {
            return Err(classify_failure(&out.stderr));
        }
        Ok(parse_addresses(&out.stdout))
    }

    fn ssh_target(&self, name: &str) -> String {
        format!("{}@{}", self.ssh_user, name)
    }
}

/// Pull the first NIC's internal and NAT addresses out of `describe` JSON.
pub fn parse_addresses(json: &str) -> InstanceAddresses {
    let Ok(value) = serde_json::from_str::<serde_json::Value>(json) else {
        return InstanceAddresses::default();
    };
    let nic = &value["networkInterfaces"][0];
    InstanceAddresses {
        internal_ip: nic["networkIP"].as_str().map(str::to_string),
        external_ip: nic["accessConfigs"][0]["natIP"].as_str().map(str::to_string),
    }
}

#[async_trait]
impl ComputeProvider for GcloudProvider {
    async fn create_instance(
        &self,
        name: &str,
        size: SizeClass,
    ) -> Result<InstanceAddresses, ProviderError> {
        let out = self
            .gcloud(vec![
                "create".into(),
                name.into(),
                format!("--machine-type={}", machine_type(size)),
                format!("--image-family={}", self.image_family),
                format!("--image-project={}", self.image_project),
            ])
            .await?;
        if !out.success() && !mentions(&out.stderr, ALREADY_MARKERS) {
            return Err(classify_failure(&out.stderr));
        }
        self.addresses(name).await
    }

    async fn start_instance(&self, name: &str) -> Result<InstanceAddresses, ProviderError> {
        let out = self.gcloud(vec!["start".into(), name.into()]).await?;
        if !out.success() {
            return Err(classify_failure(&out.stderr));
        }
        self.addresses(name).await
    }

    async fn stop_instance(&self, name: &str) -> Result<(), ProviderError> {
        let out = self.gcloud(vec!["stop".into(), name.into()]).await?;
        if out.success() {
            Ok(())
        } else {
            Err(classify_failure(&out.stderr))
        }
    }

    async fn resize_instance(&self, name: &str, size: SizeClass) -> Result<(), ProviderError> {
        let out = self
            .gcloud(vec![
                "set-machine-type".into(),
                name.into(),
                format!("--machine-type={}", machine_type(size)),
            ])
            .await?;
        if out.success() {
            Ok(())
        } else {
            Err(classify_failure(&out.stderr))
        }
    }

    async fn delete_instance(&self, name: &str) -> Result<(), ProviderError> {
        let out = self
            .gcloud(vec!["delete".into(), name.into(), "--quiet".into()])
            .await?;
        if out.success() || mentions(&out.stderr, NOT_FOUND_MARKERS) {
            Ok(())
        } else {
            Err(classify_failure(&out.stderr))
        }
    }

    async fn sync_repo(
        &self,
        name: &str,
        local: &Path,
        remote_path: &str,
        audit: &dyn CommandAudit,
    ) -> Result<(), ProviderError> {
        let ssh = format!(
            "{} compute ssh {} --",
            self.cmd,
            self.scope_args().join(" ")
        );
        let source = format!("{}/", local.display());
        let dest = format!("{}:{}/", self.ssh_target(name), remote_path);
        let args = vec![
            "-az".to_string(),
            "--delete".to_string(),
            "--exclude=.git".to_string(),
            "-e".to_string(),
            ssh,
            source,
            dest,
        ];
        let out = self
            .invoke("rsync", &args, Some(Duration::from_secs(900)), audit)
            .await?;
        if out.success() {
            Ok(())
        } else {
            Err(classify_failure(&out.stderr))
        }
    }

    async fn exec(
        &self,
        name: &str,
        cwd: &str,
        command: &str,
        timeout: Duration,
        audit: &dyn CommandAudit,
    ) -> Result<RemoteOutput, ProviderError> {
        let mut args = vec![
            "compute".to_string(),
            "ssh".to_string(),
            self.ssh_target(name),
        ];
        args.extend(self.scope_args());
        args.push("--command".to_string());
        args.push(format!("cd {cwd} && {command}"));
        self.invoke(&self.cmd, &args, Some(timeout), audit).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_failure() {
        assert!(classify_failure("ERROR: (gcloud) Connection reset by peer").is_transient());
        assert!(classify_failure("The zone does not have enough resources: ZONE_RESOURCES_POOL_EXHAUSTED").is_transient());
        assert!(!classify_failure("ERROR: Invalid value for field 'machineType'").is_transient());
    }

    #[test]
    fn test_parse_addresses() {
        let json = r#"{"networkInterfaces":[{"networkIP":"10.0.0.4","accessConfigs":[{"natIP":"34.1.2.3"}]}]}"#;
        let addrs = parse_addresses(json);
        assert_eq!(addrs.internal_ip.as_deref(), Some("10.0.0.4"));
        assert_eq!(addrs.external_ip.as_deref(), Some("34.1.2.3"));
        assert_eq!(parse_addresses("not json"), InstanceAddresses::default());
    }

    #[test]
    fn test_machine_types_are_distinct() {
        let mut types: Vec<_> = SizeClass::all().iter().map(|s| machine_type(*s)).collect();
        types.dedup();
        assert_eq!(types.len(), SizeClass::all().len());
    }

    #[tokio::test]
    async fn test_spawn_failure_is_reported() {
        let mut vm = VmSection::default();
        vm.gcloud_cmd = "definitely-not-gcloud-pcc".into();
        let provider = GcloudProvider::from_config(&vm);
        let err = provider.stop_instance("pcc-demo").await.unwrap_err();
        assert!(matches!(err, ProviderError::Spawn(_)));
    }
}
