//! The Claude CLI as a coding agent.
//!
//! Runs `claude --print --output-format stream-json -p <prompt>` in the run's
//! worktree and follows its stdout line by line. Assistant text and tool use
//! go to the run log, the final `result` event carries the cost.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, warn};

use super::{AgentFailure, AgentOutcome, AgentSignals, BuildRequest, CodingAgent, build_prompt};
use crate::config::PccToml;
use crate::exec::{CommandAudit, display_command};
use crate::orchestrator::run_log::RunLog;
use crate::util::tail_chars;

/// Substrings in stderr or the result text that point at the environment
/// rather than the agent's work.
const ENVIRONMENT_MARKERS: &[&str] = &[
    "command not found",
    "permission denied",
    "no such file or directory",
    "rate limit",
    "overloaded",
    "connection refused",
    "connection reset",
    "network error",
    "authentication",
    "credit balance",
    "api error",
];

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum StreamEvent {
    #[serde(rename = "assistant")]
    Assistant { message: AssistantMessage },

    #[serde(rename = "result")]
    Result {
        #[serde(default)]
        subtype: String,
        #[serde(default)]
        result: Option<String>,
        #[serde(default)]
        is_error: bool,
        #[serde(default)]
        total_cost_usd: Option<f64>,
    },

    #[serde(rename = "system")]
    System {
        #[serde(default)]
        subtype: String,
    },

    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct AssistantMessage {
    #[serde(default)]
    content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ContentBlock {
    #[serde(rename = "tool_use")]
    ToolUse {
        name: String,
        #[serde(default)]
        input: Value,
    },

    #[serde(rename = "text")]
    Text { text: String },

    #[serde(other)]
    Other,
}

fn describe_tool_use(name: &str, input: &Value) -> String {
    let field = match name {
        "Read" | "Write" | "Edit" => "file_path",
        "Bash" => "command",
        "Glob" | "Grep" => "pattern",
        _ => return name.to_string(),
    };
    match input.get(field).and_then(Value::as_str) {
        Some(arg) => format!("{name}: {}", tail_chars(arg, 80)),
        None => name.to_string(),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum InvocationProblem {
    Spawn(String),
    TimedOut(Duration),
}

/// Everything observed from one CLI invocation.
#[derive(Debug, Clone, Default)]
pub struct Invocation {
    /// Assistant text, plus any non-JSON stdout.
    pub text: String,
    pub result: Option<String>,
    pub is_error: bool,
    pub cost_usd: f64,
    pub exit_code: Option<i32>,
    pub stderr: String,
    pub problem: Option<InvocationProblem>,
}

impl Invocation {
    /// Assistant text and the final result, without repeating the result
    /// when the stream already carried it.
    pub fn full_text(&self) -> String {
        match &self.result {
            Some(result) if !self.text.contains(result.trim()) => {
                format!("{}\n{}", self.text, result)
            }
            _ => self.text.clone(),
        }
    }

    fn succeeded(&self) -> bool {
        self.problem.is_none() && self.exit_code == Some(0) && !self.is_error
    }

    /// `None` when the invocation succeeded.
    pub fn failure(&self) -> Option<AgentFailure> {
        match &self.problem {
            Some(InvocationProblem::Spawn(e)) => {
                return Some(AgentFailure::Blocking(format!("Failed to launch agent: {e}")));
            }
            Some(InvocationProblem::TimedOut(limit)) => {
                return Some(AgentFailure::Blocking(format!(
                    "Agent timed out after {}s",
                    limit.as_secs()
                )));
            }
            None => {}
        }
        if self.succeeded() {
            return None;
        }
        let detail = [self.stderr.trim(), self.result.as_deref().unwrap_or("").trim()]
            .into_iter()
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join("\n");
        let lowered = detail.to_lowercase();
        let summary = match self.exit_code {
            Some(code) if detail.is_empty() => format!("Agent exited with status {code}"),
            _ if detail.is_empty() => "Agent reported an error".to_string(),
            _ => tail_chars(&detail, 500).to_string(),
        };
        if ENVIRONMENT_MARKERS.iter().any(|m| lowered.contains(m)) {
            Some(AgentFailure::Blocking(summary))
        } else {
            Some(AgentFailure::NonBlocking(summary))
        }
    }
}

/// Launcher for the Claude CLI, shared by the builder and the reviewer.
#[derive(Debug, Clone)]
pub struct ClaudeCli {
    program: String,
    skip_permissions: bool,
    timeout: Duration,
}

impl ClaudeCli {
    pub fn new(program: impl Into<String>, skip_permissions: bool, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            skip_permissions,
            timeout,
        }
    }

    pub fn from_config(config: &PccToml) -> Self {
        Self::new(
            config.agent_cmd(),
            config.orchestrator.skip_permissions,
            Duration::from_secs(config.orchestrator.agent_timeout_secs),
        )
    }

    fn flags(&self) -> Vec<&str> {
        let mut flags = vec!["--print"];
        if self.skip_permissions {
            flags.push("--dangerously-skip-permissions");
        }
        flags.extend(["--output-format", "stream-json", "--verbose"]);
        flags
    }

    pub async fn invoke(&self, prompt: &str, cwd: &Path, log: &RunLog) -> Invocation {
        let mut flags = self.flags();
        // The prompt itself is in the run log header, not the command history.
        let shown = {
            let mut shown = flags.clone();
            shown.extend(["-p", "<prompt>"]);
            display_command(&self.program, &shown)
        };
        flags.extend(["-p", prompt]);

        let mut cmd = Command::new(&self.program);
        cmd.args(&flags)
            .current_dir(cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut inv = Invocation::default();
        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                warn!(run_id = %log.run_id(), program = %self.program, error = %e, "Failed to spawn agent");
                log.record(cwd, &shown, None).await;
                inv.problem = Some(InvocationProblem::Spawn(e.to_string()));
                return inv;
            }
        };

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let stderr_task = tokio::spawn(async move {
            let mut buf = String::new();
            if let Some(mut stderr) = stderr {
                let _ = stderr.read_to_string(&mut buf).await;
            }
            buf
        });

        let streamed = tokio::time::timeout(self.timeout, async {
            if let Some(stdout) = stdout {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    handle_line(&line, &mut inv, log).await;
                }
            }
            child.wait().await
        })
        .await;

        match streamed {
            Ok(Ok(status)) => inv.exit_code = status.code(),
            Ok(Err(e)) => inv.problem = Some(InvocationProblem::Spawn(e.to_string())),
            Err(_) => {
                let _ = child.kill().await;
                inv.problem = Some(InvocationProblem::TimedOut(self.timeout));
            }
        }
        inv.stderr = stderr_task.await.unwrap_or_default();
        if !inv.stderr.trim().is_empty() {
            log.line(&format!("[stderr] {}", tail_chars(inv.stderr.trim(), 2_000)))
                .await;
        }
        log.record(cwd, &shown, inv.exit_code).await;
        debug!(
            run_id = %log.run_id(),
            exit_code = ?inv.exit_code,
            cost_usd = inv.cost_usd,
            "Agent invocation finished"
        );
        inv
    }
}

async fn handle_line(line: &str, inv: &mut Invocation, log: &RunLog) {
    if line.trim().is_empty() {
        return;
    }
    match serde_json::from_str::<StreamEvent>(line) {
        Ok(StreamEvent::Assistant { message }) => {
            for block in message.content {
                match block {
                    ContentBlock::Text { text } => {
                        log.line(&text).await;
                        inv.text.push_str(&text);
                        inv.text.push('\n');
                    }
                    ContentBlock::ToolUse { name, input } => {
                        log.line(&format!("[tool] {}", describe_tool_use(&name, &input)))
                            .await;
                    }
                    ContentBlock::Other => {}
                }
            }
        }
        Ok(StreamEvent::Result {
            subtype,
            result,
            is_error,
            total_cost_usd,
        }) => {
            inv.is_error = is_error || subtype.starts_with("error");
            inv.cost_usd = total_cost_usd.unwrap_or(0.0);
            inv.result = result;
            log.line(&format!("[result] {subtype} cost=${:.4}", inv.cost_usd))
                .await;
        }
        Ok(StreamEvent::System { subtype }) => {
            debug!(run_id = %log.run_id(), subtype = %subtype, "Agent system event");
        }
        Ok(StreamEvent::Other) => {}
        Err(_) => {
            log.line(line).await;
            inv.text.push_str(line);
            inv.text.push('\n');
        }
    }
}

/// [`CodingAgent`] backed by the Claude CLI.
pub struct ClaudeCliAgent {
    cli: ClaudeCli,
}

impl ClaudeCliAgent {
    pub fn new(cli: ClaudeCli) -> Self {
        Self { cli }
    }
}

#[async_trait]
impl CodingAgent for ClaudeCliAgent {
    async fn build(&self, request: &BuildRequest<'_>, log: &RunLog) -> Result<AgentOutcome> {
        let prompt = build_prompt(request);
        log.line(&format!(
            "--- builder iteration {} ({:?}) ---\n{}",
            request.iteration, request.mode, prompt
        ))
        .await;
        let inv = self.cli.invoke(&prompt, &request.workspace.path, log).await;
        let output = inv.full_text();
        Ok(AgentOutcome {
            signals: AgentSignals::parse(&output),
            cost_usd: inv.cost_usd,
            failure: inv.failure(),
            output,
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use std::path::PathBuf;

    /// Write an executable shell script standing in for the CLI.
    pub(crate) fn fake_cli(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("fake-claude");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn cli(program: &Path, timeout: Duration) -> ClaudeCli {
        ClaudeCli::new(program.display().to_string(), true, timeout)
    }

    #[tokio::test]
    async fn test_stream_json_is_collected() {
        let dir = tempfile::tempdir().unwrap();
        let program = fake_cli(
            dir.path(),
            r#"echo '{"type":"system","subtype":"init"}'
echo '{"type":"assistant","message":{"content":[{"type":"tool_use","name":"Bash","input":{"command":"cargo test"}}]}}'
echo '{"type":"assistant","message":{"content":[{"type":"text","text":"Done <progress>100%</progress>"}]}}'
echo '{"type":"result","subtype":"success","result":"Done","is_error":false,"total_cost_usd":0.42}'"#,
        );
        let log = RunLog::detached("r");
        let inv = cli(&program, Duration::from_secs(10))
            .invoke("do it", dir.path(), &log)
            .await;
        assert_eq!(inv.exit_code, Some(0));
        assert_eq!(inv.cost_usd, 0.42);
        assert!(inv.failure().is_none());
        assert_eq!(AgentSignals::parse(&inv.full_text()).progress, Some(100));
    }

    #[tokio::test]
    async fn test_environment_failure_is_blocking() {
        let dir = tempfile::tempdir().unwrap();
        let program = fake_cli(dir.path(), "echo 'API Error: Overloaded' >&2\nexit 1");
        let inv = cli(&program, Duration::from_secs(10))
            .invoke("x", dir.path(), &RunLog::detached("r"))
            .await;
        assert!(matches!(inv.failure(), Some(AgentFailure::Blocking(_))));
    }

    #[tokio::test]
    async fn test_plain_error_is_non_blocking() {
        let dir = tempfile::tempdir().unwrap();
        let program = fake_cli(
            dir.path(),
            r#"echo '{"type":"result","subtype":"error_max_turns","result":"gave up","is_error":true}'"#,
        );
        let inv = cli(&program, Duration::from_secs(10))
            .invoke("x", dir.path(), &RunLog::detached("r"))
            .await;
        match inv.failure() {
            Some(AgentFailure::NonBlocking(msg)) => assert!(msg.contains("gave up")),
            other => panic!("expected non-blocking failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_missing_binary_and_timeout_are_blocking() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("no-such-claude");
        let inv = cli(&missing, Duration::from_secs(10))
            .invoke("x", dir.path(), &RunLog::detached("r"))
            .await;
        assert!(matches!(inv.problem, Some(InvocationProblem::Spawn(_))));
        assert!(matches!(inv.failure(), Some(AgentFailure::Blocking(_))));

        let slow = fake_cli(dir.path(), "exec sleep 5");
        let inv = cli(&slow, Duration::from_millis(200))
            .invoke("x", dir.path(), &RunLog::detached("r"))
            .await;
        assert!(matches!(inv.problem, Some(InvocationProblem::TimedOut(_))));
    }

    #[test]
    fn test_describe_tool_use() {
        let input = serde_json::json!({"file_path": "src/main.rs"});
        assert_eq!(describe_tool_use("Edit", &input), "Edit: src/main.rs");
        assert_eq!(describe_tool_use("WebSearch", &input), "WebSearch");
    }
}
