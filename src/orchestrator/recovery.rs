//! Inspection of worktrees left behind by an interrupted run.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::pool::WorkerResult;
use crate::tracker::git::{DEFAULT_GIT_TIMEOUT, parse_name_only, parse_porcelain, run_git};
use crate::tracker::{RepoMutex, WorktreeManager};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingWorktreeInfo {
    pub worktree_path: PathBuf,
    pub branch_name: String,
    pub issue_id: Option<String>,
    pub commits_ahead: usize,
    pub has_uncommitted_changes: bool,
    pub changed_files: Vec<String>,
}

impl PendingWorktreeInfo {
    pub fn has_work(&self) -> bool {
        self.commits_ahead > 0 || self.has_uncommitted_changes
    }

    /// A mergeable result for the coordinator. `issue_path` is where the
    /// issue file lives in the main checkout, if it is still active.
    pub fn to_worker_result(&self, issue_path: Option<PathBuf>) -> Option<WorkerResult> {
        let issue_id = self.issue_id.clone()?;
        Some(WorkerResult {
            issue_id,
            issue_path: issue_path.unwrap_or_default(),
            success: true,
            branch_name: self.branch_name.clone(),
            worktree_path: self.worktree_path.clone(),
            changed_files: self.changed_files.clone(),
            ..Default::default()
        })
    }
}

/// Describe every worktree directory under the manager's base directory.
pub async fn inspect_pending(repo: &RepoMutex, worktrees: &WorktreeManager) -> Result<Vec<PendingWorktreeInfo>> {
    let dirs = worktrees.list_on_disk().await?;
    if dirs.is_empty() {
        return Ok(Vec::new());
    }
    let base = repo
        .run(&["rev-parse", "--abbrev-ref", "HEAD"])
        .await?
        .check(&["rev-parse", "--abbrev-ref", "HEAD"])?
        .stdout
        .trim()
        .to_string();

    let mut pending = Vec::with_capacity(dirs.len());
    for dir in dirs {
        match inspect_one(repo, &dir, &base).await {
            Ok(info) => pending.push(info),
            Err(e) => warn!(path = %dir.display(), error = %format!("{:#}", e), "cannot inspect leftover worktree"),
        }
    }
    Ok(pending)
}

async fn inspect_one(repo: &RepoMutex, dir: &Path, base: &str) -> Result<PendingWorktreeInfo> {
    let branch = run_git(&["rev-parse", "--abbrev-ref", "HEAD"], dir, DEFAULT_GIT_TIMEOUT)
        .await?
        .check(&["rev-parse", "--abbrev-ref", "HEAD"])
        .context("Not a git worktree")?
        .stdout
        .trim()
        .to_string();
    let issue_id = WorktreeManager::issue_id_from_branch(&branch);

    let range = format!("{}..{}", base, branch);
    let commits_ahead = repo
        .run(&["rev-list", "--count", &range])
        .await?
        .check(&["rev-list", "--count"])?
        .stdout
        .trim()
        .parse::<usize>()
        .unwrap_or(0);

    let status = run_git(&["status", "--porcelain", "--untracked-files=all"], dir, DEFAULT_GIT_TIMEOUT).await?;
    let dirty = parse_porcelain(&status.stdout);

    let mut changed_files = if commits_ahead > 0 {
        let three_dot = format!("{}...{}", base, branch);
        parse_name_only(&repo.run(&["diff", "--name-only", &three_dot]).await?.stdout)
    } else {
        Vec::new()
    };
    for entry in &dirty {
        if !changed_files.contains(&entry.path) {
            changed_files.push(entry.path.clone());
        }
    }
    changed_files.sort();

    debug!(branch = %branch, commits_ahead, dirty = dirty.len(), "inspected leftover worktree");
    Ok(PendingWorktreeInfo {
        worktree_path: dir.to_path_buf(),
        branch_name: branch,
        issue_id,
        commits_ahead,
        has_uncommitted_changes: !dirty.is_empty(),
        changed_files,
    })
}

/// Commit whatever the interrupted agent left uncommitted so it can be merged.
pub async fn commit_leftovers(info: &PendingWorktreeInfo) -> Result<bool> {
    if !info.has_uncommitted_changes {
        return Ok(false);
    }
    let dir = info.worktree_path.as_path();
    run_git(&["add", "-A"], dir, DEFAULT_GIT_TIMEOUT)
        .await?
        .check(&["add", "-A"])?;
    let message = format!(
        "wip: recover interrupted work on {}",
        info.issue_id.as_deref().unwrap_or(&info.branch_name)
    );
    let commit = run_git(&["commit", "-m", &message], dir, DEFAULT_GIT_TIMEOUT).await?;
    if !commit.success() {
        warn!(branch = %info.branch_name, stderr = %commit.stderr.trim(), "could not commit leftover changes");
        return Ok(false);
    }
    info!(branch = %info.branch_name, "committed leftover changes");
    Ok(true)
}
