//! Collaborators a run drives: the coding agent, the reviewer and the test
//! suite.
//!
//! The orchestrator only sees the traits here. The shipped implementations
//! shell out to the Claude CLI ([`claude`]) and to the project's test command
//! ([`checks`]); tests substitute scripted fakes.

pub mod checks;
pub mod claude;
pub mod review;
pub mod signals;

use anyhow::Result;
use async_trait::async_trait;

use pcc_common::{Project, WorkItem};

use crate::orchestrator::run_log::RunLog;
use crate::workspace::Workspace;

pub use checks::CommandTestSuite;
pub use claude::{ClaudeCli, ClaudeCliAgent};
pub use review::AgentReviewer;
pub use signals::AgentSignals;

#[derive(Debug, Clone, PartialEq)]
pub enum BuildMode {
    Implement,
    /// The run branch no longer merges cleanly into trunk.
    ResolveConflict { detail: String },
}

pub struct BuildRequest<'a> {
    pub run_id: &'a str,
    pub iteration: u32,
    pub work_item: &'a WorkItem,
    pub workspace: &'a Workspace,
    /// Test failures and review comments from earlier iterations.
    pub feedback: &'a [String],
    pub human_input: Option<&'a str>,
    pub mode: BuildMode,
}

/// How an agent invocation went wrong.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentFailure {
    /// Tooling or environment trouble; retrying may help and should not cost
    /// the run an iteration.
    Blocking(String),
    /// The agent ran but did not get the work right.
    NonBlocking(String),
}

#[derive(Debug, Clone, Default)]
pub struct AgentOutcome {
    pub output: String,
    pub cost_usd: f64,
    pub signals: AgentSignals,
    pub failure: Option<AgentFailure>,
}

#[async_trait]
pub trait CodingAgent: Send + Sync {
    async fn build(&self, request: &BuildRequest<'_>, log: &RunLog) -> Result<AgentOutcome>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Approved,
    ChangesRequested,
}

#[derive(Debug, Clone)]
pub struct ReviewOutcome {
    pub verdict: Verdict,
    pub feedback: String,
    pub cost_usd: f64,
}

/// Independent evaluation of a run's change against the acceptance criteria.
///
/// An `Err` means the review could not be carried out at all.
#[async_trait]
pub trait Reviewer: Send + Sync {
    async fn review(
        &self,
        work_item: &WorkItem,
        workspace: &Workspace,
        log: &RunLog,
    ) -> Result<ReviewOutcome>;
}

#[derive(Debug, Clone)]
pub struct CheckOutcome {
    pub passed: bool,
    pub exit_code: Option<i32>,
    pub output: String,
}

#[async_trait]
pub trait TestSuite: Send + Sync {
    async fn run(&self, project: &Project, workspace: &Workspace, log: &RunLog)
    -> Result<CheckOutcome>;
}

fn bullet_list(title: &str, items: &[String], out: &mut String) {
    if items.is_empty() {
        return;
    }
    out.push_str(&format!("\n## {title}\n"));
    for item in items {
        out.push_str(&format!("- {item}\n"));
    }
}

/// Prompt for one builder iteration.
pub fn build_prompt(request: &BuildRequest<'_>) -> String {
    let wi = request.work_item;
    let mut prompt = format!("# {} ({})\n\n## Goal\n{}\n", wi.title, wi.id, wi.goal);
    bullet_list("Acceptance criteria", &wi.acceptance_criteria, &mut prompt);
    bullet_list("Non-goals", &wi.non_goals, &mut prompt);
    bullet_list("Stop conditions", &wi.stop_conditions, &mut prompt);

    match &request.mode {
        BuildMode::Implement => {
            prompt.push_str(&format!(
                "\nYou are working on branch `{}` (iteration {}). Implement the goal and \
                 commit your changes.\n",
                request.workspace.branch, request.iteration
            ));
        }
        BuildMode::ResolveConflict { detail } => {
            prompt.push_str(&format!(
                "\nBranch `{}` conflicts with `{}`. Merge `{}` into your branch, resolve \
                 the conflicts keeping both intents, run the tests, and commit.\n\nConflict:\n{}\n",
                request.workspace.branch,
                request.workspace.trunk_branch,
                request.workspace.trunk_branch,
                detail
            ));
        }
    }

    if !request.feedback.is_empty() {
        prompt.push_str("\n## Feedback from the previous iteration\n");
        for entry in request.feedback {
            prompt.push_str(entry);
            prompt.push('\n');
        }
    }
    if let Some(input) = request.human_input {
        prompt.push_str(&format!("\n## Answer from a human\n{input}\n"));
    }

    prompt.push_str(
        "\n## Signals\n\
         Report progress with <progress>N%</progress>. Report obstacles with \
         <blocker>description</blocker>. If you cannot continue without a human \
         decision, ask with <escalate>your question</escalate> and stop.\n",
    );
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::fixtures;
    use pcc_common::WorkItemStatus;
    use std::path::PathBuf;

    fn workspace() -> Workspace {
        Workspace {
            run_id: "r1".into(),
            project_id: "p".into(),
            repo_path: PathBuf::from("/repo"),
            path: PathBuf::from("/wt/r1"),
            branch: "pcc/wo-1-login".into(),
            trunk_branch: "main".into(),
            remote: None,
        }
    }

    #[test]
    fn test_prompt_carries_criteria_feedback_and_input() {
        let wi = fixtures::work_item("WO-1", "p", WorkItemStatus::Building);
        let ws = workspace();
        let feedback = vec!["tests failed: login_test".to_string()];
        let request = BuildRequest {
            run_id: "r1",
            iteration: 2,
            work_item: &wi,
            workspace: &ws,
            feedback: &feedback,
            human_input: Some("use GitHub"),
            mode: BuildMode::Implement,
        };
        let prompt = build_prompt(&request);
        assert!(prompt.contains("- it works"));
        assert!(prompt.contains("iteration 2"));
        assert!(prompt.contains("tests failed: login_test"));
        assert!(prompt.contains("use GitHub"));
        assert!(prompt.contains("<escalate>"));
    }

    #[test]
    fn test_conflict_prompt_names_trunk() {
        let wi = fixtures::work_item("WO-1", "p", WorkItemStatus::Building);
        let ws = workspace();
        let request = BuildRequest {
            run_id: "r1",
            iteration: 4,
            work_item: &wi,
            workspace: &ws,
            feedback: &[],
            human_input: None,
            mode: BuildMode::ResolveConflict {
                detail: "CONFLICT (content): src/lib.rs".into(),
            },
        };
        let prompt = build_prompt(&request);
        assert!(prompt.contains("conflicts with `main`"));
        assert!(prompt.contains("src/lib.rs"));
    }
}
