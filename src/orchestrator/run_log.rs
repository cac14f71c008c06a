//! Per-run log file and command audit.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use tokio::io::AsyncWriteExt;
use tracing::warn;

use crate::exec::CommandAudit;
use crate::store::DbHandle;

/// Everything a run writes goes through here: agent output and phase notes
/// to `runs/<run_id>/run.log`, executed commands to `run_commands` as well.
pub struct RunLog {
    run_id: String,
    db: Option<DbHandle>,
    path: Option<PathBuf>,
    file: tokio::sync::Mutex<Option<tokio::fs::File>>,
}

impl RunLog {
    pub async fn open(run_id: &str, db: DbHandle, path: PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .with_context(|| format!("Failed to open run log {}", path.display()))?;
        Ok(Self {
            run_id: run_id.to_string(),
            db: Some(db),
            path: Some(path),
            file: tokio::sync::Mutex::new(Some(file)),
        })
    }

    /// A log that records nothing, for work done outside a persisted run.
    pub fn detached(run_id: &str) -> Self {
        Self {
            run_id: run_id.to_string(),
            db: None,
            path: None,
            file: tokio::sync::Mutex::new(None),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub async fn line(&self, text: &str) {
        let mut guard = self.file.lock().await;
        let Some(file) = guard.as_mut() else { return };
        let stamp = Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ");
        let mut buf = String::with_capacity(text.len() + 32);
        for line in text.lines() {
            buf.push_str(&format!("{stamp} {line}\n"));
        }
        if buf.is_empty() {
            return;
        }
        if let Err(e) = file.write_all(buf.as_bytes()).await {
            warn!(run_id = %self.run_id, error = %e, "Failed to write run log");
        }
    }

    pub async fn flush(&self) {
        let mut guard = self.file.lock().await;
        if let Some(file) = guard.as_mut()
            && let Err(e) = file.flush().await
        {
            warn!(run_id = %self.run_id, error = %e, "Failed to flush run log");
        }
    }
}

#[async_trait]
impl CommandAudit for RunLog {
    async fn record(&self, cwd: &Path, command: &str, exit_code: Option<i32>) {
        let exit = exit_code.map_or("none".to_string(), |c| c.to_string());
        self.line(&format!("$ {command} (exit {exit})")).await;
        let Some(db) = &self.db else { return };
        let (run_id, cwd, command) = (
            self.run_id.clone(),
            cwd.display().to_string(),
            command.to_string(),
        );
        if let Err(e) = db
            .call(move |db| db.append_run_command(&run_id, &cwd, &command, exit_code))
            .await
        {
            warn!(run_id = %self.run_id, error = %e, "Failed to record run command");
        }
    }
}

/// Last `n` lines of a log file. A missing file reads as empty.
pub async fn tail_lines(path: &Path, n: usize) -> Result<Vec<String>> {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e).with_context(|| format!("Failed to read {}", path.display())),
    };
    let lines: Vec<&str> = content.lines().collect();
    let start = lines.len().saturating_sub(n);
    Ok(lines[start..].iter().map(|l| l.to_string()).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::fixtures;
    use pcc_common::WorkItemStatus;

    #[tokio::test]
    async fn test_lines_and_commands_are_recorded() {
        let db = DbHandle::in_memory().unwrap();
        {
            let guard = db.lock_sync().unwrap();
            fixtures::seeded(&guard, "p", "WO-1", WorkItemStatus::Building);
            guard.create_run("r1", "WO-1", "p").unwrap();
        }
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runs").join("r1").join("run.log");
        let log = RunLog::open("r1", db.clone(), path.clone()).await.unwrap();

        log.line("starting\nsecond line").await;
        log.record(Path::new("/tmp"), "git status", Some(0)).await;
        log.record(Path::new("/tmp"), "cargo test", Some(101)).await;
        log.flush().await;

        let tail = tail_lines(&path, 2).await.unwrap();
        assert_eq!(tail.len(), 2);
        assert!(tail[1].ends_with("$ cargo test (exit 101)"));

        let commands = db.call(|db| db.list_run_commands("r1")).await.unwrap();
        assert_eq!(commands.len(), 2);
        assert_eq!(commands[0].seq, 1);
        assert_eq!(commands[1].exit_code, Some(101));
    }

    #[tokio::test]
    async fn test_missing_log_tails_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(tail_lines(&dir.path().join("nope.log"), 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_detached_log_is_silent() {
        let log = RunLog::detached("r");
        log.line("ignored").await;
        log.record(Path::new("/"), "true", Some(0)).await;
        assert!(log.path().is_none());
    }
}
