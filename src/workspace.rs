//! Per-run isolated working copies.
//!
//! Each run builds on its own branch in its own git worktree, so concurrent
//! runs on one project never share a checkout. Only the final merge into
//! trunk touches the project's main checkout, and the merge coordinator
//! serializes that step.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use tracing::{debug, info, warn};

use pcc_common::{Project, WorkItem};

use crate::exec::{CommandAudit, run_audited};
use crate::util::slugify;

/// Where a run's test suite executes when the project requires a VM.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteContext {
    pub instance_name: String,
    pub remote_path: String,
}

#[derive(Debug, Clone)]
pub struct Workspace {
    pub run_id: String,
    pub project_id: String,
    /// The project's main checkout.
    pub repo_path: PathBuf,
    /// The run's worktree.
    pub path: PathBuf,
    pub branch: String,
    pub trunk_branch: String,
    pub remote: Option<RemoteContext>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MergeOutcome {
    Merged,
    /// The merge was aborted; trunk is unchanged.
    Conflict { detail: String },
}

#[async_trait]
pub trait WorkspaceProvider: Send + Sync {
    async fn create(
        &self,
        project: &Project,
        work_item: &WorkItem,
        run_id: &str,
        audit: &dyn CommandAudit,
    ) -> Result<Workspace>;

    /// Commit whatever the agent left uncommitted. Returns whether a commit
    /// was made.
    async fn commit_pending(
        &self,
        workspace: &Workspace,
        message: &str,
        audit: &dyn CommandAudit,
    ) -> Result<bool>;

    /// Merge the run branch into trunk with a merge commit.
    async fn merge_into_trunk(
        &self,
        workspace: &Workspace,
        audit: &dyn CommandAudit,
    ) -> Result<MergeOutcome>;

    /// Replay the run branch onto the current trunk. Returns `false` when the
    /// rebase hit conflicts and was aborted.
    async fn rebase_onto_trunk(&self, workspace: &Workspace, audit: &dyn CommandAudit)
    -> Result<bool>;

    async fn remove(&self, workspace: &Workspace, audit: &dyn CommandAudit) -> Result<()>;

    /// Run ids that still have a worktree on disk.
    async fn list_worktrees(&self) -> Result<Vec<String>>;

    /// Remove the worktree left behind by `run_id`, if any.
    async fn remove_stale(&self, project: &Project, run_id: &str) -> Result<()>;
}

/// Git worktrees under `<artifacts>/worktrees/<run_id>`.
pub struct GitWorktrees {
    root: PathBuf,
}

impl GitWorktrees {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn branch_name(work_item: &WorkItem) -> String {
        let slug = slugify(&work_item.title, 40);
        let id = work_item.id.to_lowercase();
        if slug.is_empty() {
            format!("pcc/{id}")
        } else {
            format!("pcc/{id}-{slug}")
        }
    }

    fn worktree_path(&self, run_id: &str) -> PathBuf {
        self.root.join(run_id)
    }
}

async fn git(args: &[&str], cwd: &Path, audit: &dyn CommandAudit) -> Result<std::process::Output> {
    run_audited("git", args, cwd, None, audit).await
}

async fn git_ok(args: &[&str], cwd: &Path, audit: &dyn CommandAudit) -> Result<String> {
    let output = git(args, cwd, audit).await?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!("git {} failed: {}", args.join(" "), stderr.trim());
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

fn path_str(path: &Path) -> Result<&str> {
    path.to_str()
        .with_context(|| format!("Path is not valid UTF-8: {}", path.display()))
}

#[async_trait]
impl WorkspaceProvider for GitWorktrees {
    async fn create(
        &self,
        project: &Project,
        work_item: &WorkItem,
        run_id: &str,
        audit: &dyn CommandAudit,
    ) -> Result<Workspace> {
        let repo_path = PathBuf::from(&project.path);
        let path = self.worktree_path(run_id);
        let branch = Self::branch_name(work_item);
        tokio::fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("Failed to create {}", self.root.display()))?;

        // -B resets a branch left behind by an earlier run of the same item.
        git_ok(
            &[
                "worktree",
                "add",
                "-B",
                &branch,
                path_str(&path)?,
                &project.trunk_branch,
            ],
            &repo_path,
            audit,
        )
        .await
        .context("Failed to create worktree")?;

        info!(run_id, branch = %branch, path = %path.display(), "Created worktree");
        Ok(Workspace {
            run_id: run_id.to_string(),
            project_id: project.id.clone(),
            repo_path,
            path,
            branch,
            trunk_branch: project.trunk_branch.clone(),
            remote: None,
        })
    }

    async fn commit_pending(
        &self,
        workspace: &Workspace,
        message: &str,
        audit: &dyn CommandAudit,
    ) -> Result<bool> {
        let status = git_ok(&["status", "--porcelain"], &workspace.path, audit).await?;
        if status.is_empty() {
            return Ok(false);
        }
        git_ok(&["add", "-A"], &workspace.path, audit).await?;
        git_ok(&["commit", "-m", message], &workspace.path, audit).await?;
        debug!(run_id = %workspace.run_id, "Committed pending changes");
        Ok(true)
    }

    async fn merge_into_trunk(
        &self,
        workspace: &Workspace,
        audit: &dyn CommandAudit,
    ) -> Result<MergeOutcome> {
        let repo = &workspace.repo_path;
        let original = git_ok(&["rev-parse", "--abbrev-ref", "HEAD"], repo, audit).await?;

        git_ok(&["checkout", &workspace.trunk_branch], repo, audit)
            .await
            .with_context(|| format!("Failed to checkout {}", workspace.trunk_branch))?;

        let message = format!("Merge {}", workspace.branch);
        let merge = git(
            &["merge", "--no-ff", "-m", &message, &workspace.branch],
            repo,
            audit,
        )
        .await?;

        if merge.status.success() {
            info!(
                run_id = %workspace.run_id,
                branch = %workspace.branch,
                trunk = %workspace.trunk_branch,
                "Merged into trunk"
            );
            if original != workspace.trunk_branch && original != "HEAD" {
                git(&["checkout", &original], repo, audit).await?;
            }
            return Ok(MergeOutcome::Merged);
        }

        let detail = format!(
            "{}{}",
            String::from_utf8_lossy(&merge.stdout),
            String::from_utf8_lossy(&merge.stderr)
        )
        .trim()
        .to_string();
        warn!(run_id = %workspace.run_id, branch = %workspace.branch, "Merge conflict, aborting merge");
        let abort = git(&["merge", "--abort"], repo, audit).await?;
        if !abort.status.success() {
            warn!(run_id = %workspace.run_id, "git merge --abort failed");
        }
        if original != workspace.trunk_branch && original != "HEAD" {
            git(&["checkout", &original], repo, audit).await?;
        }
        Ok(MergeOutcome::Conflict { detail })
    }

    async fn rebase_onto_trunk(
        &self,
        workspace: &Workspace,
        audit: &dyn CommandAudit,
    ) -> Result<bool> {
        let rebase = git(&["rebase", &workspace.trunk_branch], &workspace.path, audit).await?;
        if rebase.status.success() {
            return Ok(true);
        }
        git(&["rebase", "--abort"], &workspace.path, audit).await?;
        Ok(false)
    }

    async fn remove(&self, workspace: &Workspace, audit: &dyn CommandAudit) -> Result<()> {
        if !workspace.path.exists() {
            return Ok(());
        }
        let output = git(
            &["worktree", "remove", "--force", path_str(&workspace.path)?],
            &workspace.repo_path,
            audit,
        )
        .await?;
        if !output.status.success() {
            warn!(
                run_id = %workspace.run_id,
                stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                "git worktree remove failed, deleting directory"
            );
            tokio::fs::remove_dir_all(&workspace.path)
                .await
                .with_context(|| format!("Failed to delete {}", workspace.path.display()))?;
            git(&["worktree", "prune"], &workspace.repo_path, audit).await?;
        }
        Ok(())
    }

    async fn list_worktrees(&self) -> Result<Vec<String>> {
        let mut out = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read {}", self.root.display()));
            }
        };
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                out.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        out.sort();
        Ok(out)
    }

    async fn remove_stale(&self, project: &Project, run_id: &str) -> Result<()> {
        let workspace = Workspace {
            run_id: run_id.to_string(),
            project_id: project.id.clone(),
            repo_path: PathBuf::from(&project.path),
            path: self.worktree_path(run_id),
            branch: String::new(),
            trunk_branch: project.trunk_branch.clone(),
            remote: None,
        };
        self.remove(&workspace, &crate::exec::NoAudit).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::NoAudit;
    use chrono::Utc;
    use pcc_common::{ProjectStatus, WorkItemStatus};

    fn work_item(id: &str, title: &str) -> WorkItem {
        let now = Utc::now();
        WorkItem {
            id: id.into(),
            project_id: "demo".into(),
            title: title.into(),
            goal: String::new(),
            acceptance_criteria: vec![],
            non_goals: vec![],
            stop_conditions: vec![],
            priority: 3,
            tags: vec![],
            depends_on: vec![],
            status: WorkItemStatus::Building,
            estimate_usd: None,
            spec_path: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn sh(repo: &Path, script: &str) {
        let status = std::process::Command::new("sh")
            .args(["-c", script])
            .current_dir(repo)
            .status()
            .unwrap();
        assert!(status.success(), "script failed: {script}");
    }

    fn init_repo(dir: &Path) -> Project {
        sh(
            dir,
            "git init -q -b main && git config user.email pcc@test && git config user.name pcc \
             && echo base > file.txt && git add . && git commit -qm init",
        );
        Project {
            id: "demo".into(),
            name: "demo".into(),
            path: dir.display().to_string(),
            status: ProjectStatus::Active,
            priority: 3,
            trunk_branch: "main".into(),
            test_command: None,
            requires_vm: false,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_branch_name() {
        assert_eq!(
            GitWorktrees::branch_name(&work_item("WO-7", "Add OAuth login")),
            "pcc/wo-7-add-oauth-login"
        );
        assert_eq!(GitWorktrees::branch_name(&work_item("WO-7", "!!")), "pcc/wo-7");
    }

    #[tokio::test]
    async fn test_create_commit_merge_remove() {
        let repo = tempfile::tempdir().unwrap();
        let artifacts = tempfile::tempdir().unwrap();
        let project = init_repo(repo.path());
        let provider = GitWorktrees::new(artifacts.path().join("worktrees"));

        let ws = provider
            .create(&project, &work_item("WO-1", "First"), "run-1", &NoAudit)
            .await
            .unwrap();
        assert!(ws.path.join("file.txt").exists());
        assert_eq!(provider.list_worktrees().await.unwrap(), vec!["run-1"]);

        std::fs::write(ws.path.join("new.txt"), "hello").unwrap();
        assert!(provider.commit_pending(&ws, "WO-1: First", &NoAudit).await.unwrap());
        assert!(!provider.commit_pending(&ws, "again", &NoAudit).await.unwrap());

        let outcome = provider.merge_into_trunk(&ws, &NoAudit).await.unwrap();
        assert_eq!(outcome, MergeOutcome::Merged);
        assert!(repo.path().join("new.txt").exists());

        provider.remove(&ws, &NoAudit).await.unwrap();
        assert!(!ws.path.exists());
        assert!(provider.list_worktrees().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_conflict_is_aborted_and_rebase_reports_it() {
        let repo = tempfile::tempdir().unwrap();
        let artifacts = tempfile::tempdir().unwrap();
        let project = init_repo(repo.path());
        let provider = GitWorktrees::new(artifacts.path().join("worktrees"));

        let ws = provider
            .create(&project, &work_item("WO-2", "Edit"), "run-2", &NoAudit)
            .await
            .unwrap();
        std::fs::write(ws.path.join("file.txt"), "from branch").unwrap();
        provider.commit_pending(&ws, "branch edit", &NoAudit).await.unwrap();

        sh(repo.path(), "echo from-trunk > file.txt && git commit -qam trunk-edit");

        let outcome = provider.merge_into_trunk(&ws, &NoAudit).await.unwrap();
        assert!(matches!(outcome, MergeOutcome::Conflict { .. }));
        let content = std::fs::read_to_string(repo.path().join("file.txt")).unwrap();
        assert_eq!(content.trim(), "from-trunk");

        assert!(!provider.rebase_onto_trunk(&ws, &NoAudit).await.unwrap());
    }
}
