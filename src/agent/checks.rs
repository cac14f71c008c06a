//! The project's automated checks, run after each builder iteration.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

use pcc_common::Project;

use super::{CheckOutcome, TestSuite};
use crate::exec::run_audited;
use crate::orchestrator::run_log::RunLog;
use crate::util::tail_chars;
use crate::vm::VmManager;
use crate::workspace::Workspace;

const MAX_OUTPUT_CHARS: usize = 8_000;

/// Runs `sh -c <test_command>` in the worktree, or on the project's VM when
/// the workspace has a remote context.
pub struct CommandTestSuite {
    timeout: Duration,
    vm: Option<VmManager>,
}

impl CommandTestSuite {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout, vm: None }
    }

    pub fn with_vm(mut self, vm: VmManager) -> Self {
        self.vm = Some(vm);
        self
    }
}

fn combined(stdout: &[u8], stderr: &[u8]) -> String {
    let mut out = String::from_utf8_lossy(stdout).into_owned();
    let err = String::from_utf8_lossy(stderr);
    if !err.trim().is_empty() {
        out.push_str("\n--- stderr ---\n");
        out.push_str(&err);
    }
    tail_chars(&out, MAX_OUTPUT_CHARS).to_string()
}

#[async_trait]
impl TestSuite for CommandTestSuite {
    async fn run(
        &self,
        project: &Project,
        workspace: &Workspace,
        log: &RunLog,
    ) -> Result<CheckOutcome> {
        let Some(command) = project.test_command.as_deref().filter(|c| !c.trim().is_empty())
        else {
            log.line("[checks] no test command configured").await;
            return Ok(CheckOutcome {
                passed: true,
                exit_code: None,
                output: String::new(),
            });
        };

        if let (Some(remote), Some(vm)) = (&workspace.remote, &self.vm) {
            let out = vm
                .exec(&workspace.project_id, remote, command, self.timeout, log)
                .await?;
            let output = tail_chars(
                &format!("{}\n{}", out.stdout, out.stderr),
                MAX_OUTPUT_CHARS,
            )
            .to_string();
            log.line(&format!("[checks] remote exit {:?}", out.exit_code)).await;
            return Ok(CheckOutcome {
                passed: out.success(),
                exit_code: out.exit_code,
                output,
            });
        }

        let started = std::time::Instant::now();
        match run_audited("sh", &["-c", command], &workspace.path, Some(self.timeout), log).await {
            Ok(out) => {
                let output = combined(&out.stdout, &out.stderr);
                log.line(&format!("[checks] exit {:?}\n{}", out.status.code(), output))
                    .await;
                Ok(CheckOutcome {
                    passed: out.status.success(),
                    exit_code: out.status.code(),
                    output,
                })
            }
            // A hung suite is a failing suite the agent has to fix.
            Err(_) if started.elapsed() >= self.timeout => Ok(CheckOutcome {
                passed: false,
                exit_code: None,
                output: format!("Test command timed out after {}s", self.timeout.as_secs()),
            }),
            Err(e) => Err(e),
        }
    }
}
