//! Tags the coding agent writes into its output.
//!
//! - `<progress>X%</progress>`
//! - `<blocker>description</blocker>`
//! - `<escalate>question for a human</escalate>`: the agent is stuck until
//!   someone answers.

use regex::Regex;
use serde::Serialize;
use std::sync::LazyLock;

static PROGRESS_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<progress>\s*(\d{1,3})%?\s*</progress>").unwrap());

static BLOCKER_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<blocker>(.*?)</blocker>").unwrap());

static ESCALATE_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<escalate>\s*(.*?)\s*</escalate>").unwrap());

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AgentSignals {
    /// Last reported progress, clamped to 100.
    pub progress: Option<u8>,
    pub blockers: Vec<String>,
    /// Set when the agent asked for human input.
    pub escalation: Option<String>,
}

impl AgentSignals {
    pub fn parse(text: &str) -> Self {
        let progress = PROGRESS_REGEX
            .captures_iter(text)
            .filter_map(|cap| cap.get(1)?.as_str().parse::<u16>().ok())
            .map(|p| p.min(100) as u8)
            .last();

        let blockers = BLOCKER_REGEX
            .captures_iter(text)
            .filter_map(|cap| {
                let desc = cap.get(1)?.as_str().trim();
                (!desc.is_empty()).then(|| desc.to_string())
            })
            .collect();

        let escalation = ESCALATE_REGEX
            .captures_iter(text)
            .filter_map(|cap| {
                let question = cap.get(1)?.as_str().trim();
                (!question.is_empty()).then(|| question.to_string())
            })
            .last();

        Self {
            progress,
            blockers,
            escalation,
        }
    }

    pub fn wants_input(&self) -> bool {
        self.escalation.is_some()
    }
}
