//! Per-issue git worktrees and their branches.

use anyhow::{Context, Result};
use chrono::Utc;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};
use tracing::{debug, info, warn};

use super::git::{DEFAULT_GIT_TIMEOUT, run_git_checked};
use super::repo_lock::RepoMutex;

/// Every branch created for a worker starts with this prefix.
pub const BRANCH_PREFIX: &str = "parallel/";

static BRANCH_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^parallel/([a-z0-9]+-\d+)-\d{14}-[0-9a-f]{8}$").expect("Invalid regex pattern")
});

/// An isolated checkout created for one issue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Worktree {
    pub issue_id: String,
    pub path: PathBuf,
    pub branch: String,
    /// Commit the branch was created from.
    pub base_commit: String,
}

/// Outcome of a best-effort sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub removed_worktrees: usize,
    pub deleted_branches: usize,
    pub errors: Vec<String>,
}

#[derive(Debug)]
pub struct WorktreeManager {
    repo: Arc<RepoMutex>,
    base_dir: PathBuf,
    copy_files: Vec<String>,
}

impl WorktreeManager {
    /// `base_dir` may be relative to the repository root.
    pub fn new(repo: Arc<RepoMutex>, base_dir: &Path, copy_files: Vec<String>) -> Self {
        let base_dir = if base_dir.is_absolute() {
            base_dir.to_path_buf()
        } else {
            repo.root().join(base_dir)
        };
        Self {
            repo,
            base_dir,
            copy_files,
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub async fn ensure_base_dir(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.base_dir)
            .await
            .with_context(|| format!("Failed to create {}", self.base_dir.display()))
    }

    /// Directory name and branch for a new worktree, unique per call.
    pub fn names_for(issue_id: &str) -> (String, String) {
        let stamp = Utc::now().format("%Y%m%d%H%M%S");
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        let slug = issue_id.to_lowercase();
        (
            format!("worker-{}-{}-{}", slug, stamp, &suffix[..8]),
            format!("{}{}-{}-{}", BRANCH_PREFIX, slug, stamp, &suffix[..8]),
        )
    }

    /// Recover the issue id from a worker branch name.
    pub fn issue_id_from_branch(branch: &str) -> Option<String> {
        BRANCH_REGEX
            .captures(branch)
            .map(|caps| caps[1].to_uppercase())
    }

    /// Create a worktree on a fresh branch from the main checkout's HEAD and
    /// copy local-only files into it.
    pub async fn create(&self, issue_id: &str) -> Result<Worktree> {
        self.ensure_base_dir().await?;
        let (dir_name, branch) = Self::names_for(issue_id);
        let path = self.base_dir.join(dir_name);
        let path_str = path
            .to_str()
            .context("Worktree path contains invalid UTF-8")?
            .to_string();

        {
            let guard = self.repo.lock().await;
            guard
                .run_checked(&["worktree", "add", "-b", &branch, &path_str, "HEAD"])
                .await
                .context("Git worktree creation failed")?;
        }

        let head = run_git_checked(&["rev-parse", "HEAD"], &path, DEFAULT_GIT_TIMEOUT).await?;
        self.copy_local_files(&path).await;
        info!(issue = issue_id, branch = %branch, "created worktree");

        Ok(Worktree {
            issue_id: issue_id.to_string(),
            path,
            branch,
            base_commit: head.stdout.trim().to_string(),
        })
    }

    async fn copy_local_files(&self, worktree: &Path) {
        for rel in &self.copy_files {
            let src = self.repo.root().join(rel);
            if !src.is_file() {
                continue;
            }
            let dest = worktree.join(rel);
            if let Some(parent) = dest.parent()
                && let Err(e) = tokio::fs::create_dir_all(parent).await
            {
                warn!(file = %rel, error = %e, "could not create directory for copied file");
                continue;
            }
            if let Err(e) = tokio::fs::copy(&src, &dest).await {
                warn!(file = %rel, error = %e, "could not copy file into worktree");
            }
        }
    }

    /// Remove a worktree and delete its branch. Missing pieces are not errors.
    pub async fn remove(&self, path: &Path, branch: &str) -> Result<()> {
        let path_str = path.to_string_lossy().to_string();
        let guard = self.repo.lock().await;
        let removed = guard
            .run(&["worktree", "remove", "--force", &path_str])
            .await?;
        if !removed.success() {
            debug!(path = %path_str, stderr = %removed.stderr.trim(), "worktree remove failed; deleting directory");
            if path.exists() {
                tokio::fs::remove_dir_all(path)
                    .await
                    .with_context(|| format!("Failed to delete {}", path.display()))?;
            }
            guard.run(&["worktree", "prune"]).await?;
        }
        if !branch.is_empty() {
            let deleted = guard.run(&["branch", "-D", branch]).await?;
            if !deleted.success() {
                debug!(branch, stderr = %deleted.stderr.trim(), "branch delete failed");
            }
        }
        Ok(())
    }

    /// Worktree directories currently under the base directory.
    pub async fn list_on_disk(&self) -> Result<Vec<PathBuf>> {
        if !self.base_dir.exists() {
            return Ok(Vec::new());
        }
        let mut dirs = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.base_dir)
            .await
            .with_context(|| format!("Failed to read {}", self.base_dir.display()))?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                dirs.push(entry.path());
            }
        }
        dirs.sort();
        Ok(dirs)
    }

    /// Branches carrying the worker prefix.
    pub async fn list_branches(&self) -> Result<Vec<String>> {
        let pattern = format!("{}*", BRANCH_PREFIX);
        let output = self
            .repo
            .run(&["branch", "--list", &pattern, "--format=%(refname:short)"])
            .await?
            .check(&["branch", "--list"])?;
        Ok(output.lines().map(|l| l.trim().to_string()).collect())
    }

    /// Remove every worktree under the base and every worker branch,
    /// tracked or not. Failures are collected, not raised.
    pub async fn cleanup_all(&self) -> Result<CleanupReport> {
        let mut report = CleanupReport::default();

        for dir in self.list_on_disk().await? {
            match self.remove(&dir, "").await {
                Ok(()) => report.removed_worktrees += 1,
                Err(e) => report.errors.push(format!("{}: {:#}", dir.display(), e)),
            }
        }
        if let Err(e) = self.repo.run(&["worktree", "prune"]).await {
            report.errors.push(format!("worktree prune: {}", e));
        }

        for branch in self.list_branches().await? {
            match self.repo.run(&["branch", "-D", &branch]).await {
                Ok(out) if out.success() => report.deleted_branches += 1,
                Ok(out) => report
                    .errors
                    .push(format!("{}: {}", branch, out.stderr.trim())),
                Err(e) => report.errors.push(format!("{}: {}", branch, e)),
            }
        }

        if report.removed_worktrees + report.deleted_branches > 0 {
            info!(
                worktrees = report.removed_worktrees,
                branches = report.deleted_branches,
                "cleaned up worker worktrees"
            );
        }
        for error in &report.errors {
            warn!("cleanup: {}", error);
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::init_repo;

    fn manager(root: &Path, copy: Vec<String>) -> WorktreeManager {
        WorktreeManager::new(Arc::new(RepoMutex::new(root)), Path::new(".worktrees"), copy)
    }

    #[test]
    fn test_names_are_unique_and_parseable() {
        let (dir_a, branch_a) = WorktreeManager::names_for("BUG-012");
        let (dir_b, branch_b) = WorktreeManager::names_for("BUG-012");
        assert_ne!(branch_a, branch_b);
        assert_ne!(dir_a, dir_b);
        assert!(dir_a.starts_with("worker-bug-012-"));
        assert!(branch_a.starts_with("parallel/bug-012-"));
        assert_eq!(
            WorktreeManager::issue_id_from_branch(&branch_a).as_deref(),
            Some("BUG-012")
        );
        assert!(WorktreeManager::issue_id_from_branch("main").is_none());
    }

    #[tokio::test]
    async fn test_create_and_remove() {
        let dir = init_repo();
        std::fs::write(dir.path().join(".env"), "SECRET=1").unwrap();
        let manager = manager(dir.path(), vec![".env".into(), "missing.json".into()]);

        let wt = manager.create("FEAT-001").await.unwrap();
        assert!(wt.path.join("README.md").exists());
        assert_eq!(
            std::fs::read_to_string(wt.path.join(".env")).unwrap(),
            "SECRET=1"
        );
        assert_eq!(wt.base_commit.len(), 40);
        assert_eq!(manager.list_branches().await.unwrap(), vec![wt.branch.clone()]);

        manager.remove(&wt.path, &wt.branch).await.unwrap();
        assert!(!wt.path.exists());
        assert!(manager.list_branches().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cleanup_all_removes_untracked_leftovers() {
        let dir = init_repo();
        let manager = manager(dir.path(), vec![]);
        manager.create("BUG-001").await.unwrap();
        manager.create("BUG-002").await.unwrap();
        std::fs::create_dir_all(manager.base_dir().join("stray")).unwrap();

        let report = manager.cleanup_all().await.unwrap();
        assert_eq!(report.removed_worktrees, 3);
        assert!(manager.list_on_disk().await.unwrap().is_empty());
        assert!(manager.list_branches().await.unwrap().is_empty());
    }
}
