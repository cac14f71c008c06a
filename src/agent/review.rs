//! Second-pass review of a run's change by a fresh agent session.

use anyhow::{Result, bail};
use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use std::sync::LazyLock;

use pcc_common::WorkItem;

use super::claude::{ClaudeCli, InvocationProblem};
use super::{ReviewOutcome, Reviewer, Verdict};
use crate::exec::run_audited;
use crate::orchestrator::run_log::RunLog;
use crate::util::{extract_json_object, tail_chars};
use crate::workspace::Workspace;

const MAX_DIFF_CHARS: usize = 60_000;

static VERDICT_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<verdict>\s*(approved|changes_requested)\s*</verdict>").unwrap()
});

static FEEDBACK_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<feedback>\s*(.*?)\s*</feedback>").unwrap());

#[derive(Deserialize)]
struct JsonVerdict {
    verdict: String,
    #[serde(default)]
    feedback: String,
}

/// Read a verdict from reviewer output. Tags win; a JSON object with a
/// `verdict` field is accepted as a fallback. No verdict at all counts as
/// changes requested.
pub fn parse_verdict(text: &str) -> (Verdict, String) {
    let feedback = FEEDBACK_REGEX
        .captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string());

    if let Some(cap) = VERDICT_REGEX.captures_iter(text).last()
        && let Some(m) = cap.get(1)
    {
        let verdict = if m.as_str() == "approved" {
            Verdict::Approved
        } else {
            Verdict::ChangesRequested
        };
        return (verdict, feedback.unwrap_or_default());
    }

    if let Some(raw) = extract_json_object(text)
        && let Ok(parsed) = serde_json::from_str::<JsonVerdict>(raw)
    {
        let verdict = match parsed.verdict.as_str() {
            "approved" | "approve" => Verdict::Approved,
            _ => Verdict::ChangesRequested,
        };
        return (verdict, feedback.unwrap_or(parsed.feedback));
    }

    (
        Verdict::ChangesRequested,
        feedback.unwrap_or_else(|| "Reviewer gave no verdict".to_string()),
    )
}

pub fn review_prompt(work_item: &WorkItem, diff: &str) -> String {
    let mut prompt = format!(
        "Review this change for work order {} \"{}\".\n\nGoal: {}\n\nAcceptance criteria:\n",
        work_item.id, work_item.title, work_item.goal
    );
    for c in &work_item.acceptance_criteria {
        prompt.push_str(&format!("- {c}\n"));
    }
    if !work_item.non_goals.is_empty() {
        prompt.push_str("\nOut of scope (do not request these):\n");
        for n in &work_item.non_goals {
            prompt.push_str(&format!("- {n}\n"));
        }
    }
    prompt.push_str(&format!(
        "\nDiff:\n```diff\n{diff}\n```\n\n\
         Do not modify any files. Answer with <verdict>approved</verdict> or \
         <verdict>changes_requested</verdict>, followed by <feedback>...</feedback> \
         listing what must change.\n"
    ));
    prompt
}

pub struct AgentReviewer {
    cli: ClaudeCli,
}

impl AgentReviewer {
    pub fn new(cli: ClaudeCli) -> Self {
        Self { cli }
    }
}

#[async_trait]
impl Reviewer for AgentReviewer {
    async fn review(
        &self,
        work_item: &WorkItem,
        workspace: &Workspace,
        log: &RunLog,
    ) -> Result<ReviewOutcome> {
        let range = format!("{}...HEAD", workspace.trunk_branch);
        let diff = run_audited("git", &["diff", &range], &workspace.path, None, log).await?;
        let diff = String::from_utf8_lossy(&diff.stdout);
        let prompt = review_prompt(work_item, tail_chars(&diff, MAX_DIFF_CHARS));

        log.line("--- review ---").await;
        let inv = self.cli.invoke(&prompt, &workspace.path, log).await;
        match &inv.problem {
            Some(InvocationProblem::Spawn(e)) => bail!("Failed to launch reviewer: {e}"),
            Some(InvocationProblem::TimedOut(limit)) => {
                bail!("Reviewer timed out after {}s", limit.as_secs())
            }
            None => {}
        }
        let (verdict, feedback) = parse_verdict(&inv.full_text());
        log.line(&format!("[review] {verdict:?}")).await;
        Ok(ReviewOutcome {
            verdict,
            feedback,
            cost_usd: inv.cost_usd,
        })
    }
}
