//! Running external commands with an audit trail.
//!
//! Every command the control center runs on behalf of a run (git, the coding
//! agent, test suites, the cloud CLI) goes through [`run_audited`] so it lands
//! in the run's command history.

use std::path::Path;
use std::process::Output;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::process::Command;

/// Sink for executed commands.
#[async_trait]
pub trait CommandAudit: Send + Sync {
    async fn record(&self, cwd: &Path, command: &str, exit_code: Option<i32>);
}

/// Audit sink that drops everything; for calls made outside a run.
pub struct NoAudit;

#[async_trait]
impl CommandAudit for NoAudit {
    async fn record(&self, _cwd: &Path, _command: &str, _exit_code: Option<i32>) {}
}

/// Render a program and its arguments the way a shell user would type them.
pub fn display_command(program: &str, args: &[&str]) -> String {
    std::iter::once(program)
        .chain(args.iter().copied())
        .map(|part| {
            if part.is_empty() || part.contains(char::is_whitespace) {
                format!("'{}'", part.replace('\'', r"'\''"))
            } else {
                part.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Run `program args...` in `cwd`, wait for it, and record it.
///
/// A non-zero exit is *not* an error; callers inspect `status`. Spawn
/// failures and timeouts are errors.
pub async fn run_audited(
    program: &str,
    args: &[&str],
    cwd: &Path,
    timeout: Option<Duration>,
    audit: &dyn CommandAudit,
) -> Result<Output> {
    let text = display_command(program, args);
    let mut cmd = Command::new(program);
    cmd.args(args).current_dir(cwd).kill_on_drop(true);
    let fut = cmd.output();
    let result = match timeout {
        Some(limit) => match tokio::time::timeout(limit, fut).await {
            Ok(res) => res,
            Err(_) => {
                audit.record(cwd, &text, None).await;
                anyhow::bail!("Command timed out after {}s: {}", limit.as_secs(), text);
            }
        },
        None => fut.await,
    };
    match result {
        Ok(output) => {
            audit.record(cwd, &text, output.status.code()).await;
            Ok(output)
        }
        Err(e) => {
            audit.record(cwd, &text, None).await;
            Err(e).with_context(|| format!("Failed to run {}", text))
        }
    }
}
