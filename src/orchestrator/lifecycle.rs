//! Filing issues once they are done: append a resolution section, move the
//! file into the completed directory and commit, all under the repo lock.

use anyhow::{Context, Result, bail};
use chrono::Utc;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::tracker::RepoMutex;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub status: String,
    pub reason: Option<String>,
    pub branch: Option<String>,
    pub changed_files: Vec<String>,
}

impl Resolution {
    pub fn completed(branch: &str, changed_files: &[String]) -> Self {
        Self {
            status: "Completed".into(),
            reason: None,
            branch: Some(branch.to_string()),
            changed_files: changed_files.to_vec(),
        }
    }

    pub fn closed(status: &str, reason: &str) -> Self {
        Self {
            status: status.to_string(),
            reason: Some(reason.to_string()),
            branch: None,
            changed_files: Vec::new(),
        }
    }

    fn render(&self) -> String {
        let mut out = String::from("\n\n---\n\n## Resolution\n\n");
        let _ = writeln!(out, "- **Status**: {}", self.status);
        let _ = writeln!(out, "- **Date**: {}", Utc::now().format("%Y-%m-%d"));
        if let Some(branch) = &self.branch {
            let _ = writeln!(out, "- **Branch**: `{}`", branch);
        }
        if let Some(reason) = &self.reason {
            let _ = writeln!(out, "- **Reason**: {}", reason);
        }
        if !self.changed_files.is_empty() {
            out.push_str("\n### Changed Files\n\n");
            for file in &self.changed_files {
                let _ = writeln!(out, "- `{}`", file);
            }
        }
        out
    }
}

#[derive(Debug)]
pub struct IssueLifecycle {
    repo: Arc<RepoMutex>,
    completed_dir: PathBuf,
}

impl IssueLifecycle {
    /// `completed_dir` is relative to the repository root.
    pub fn new(repo: Arc<RepoMutex>, completed_dir: &Path) -> Self {
        Self {
            repo,
            completed_dir: completed_dir.to_path_buf(),
        }
    }

    /// Where `issue_path` ends up once filed.
    pub fn completed_path(&self, issue_path: &Path) -> Option<PathBuf> {
        issue_path
            .file_name()
            .map(|name| self.completed_dir.join(name))
    }

    /// True once the issue file has left its active location.
    pub fn is_filed(&self, issue_path: &Path) -> bool {
        let root = self.repo.root();
        if root.join(issue_path).exists() {
            return false;
        }
        self.completed_path(issue_path)
            .is_some_and(|dest| root.join(dest).exists())
    }

    /// File a successfully merged issue.
    pub async fn complete(&self, issue_id: &str, issue_path: &Path, resolution: Resolution) -> Result<PathBuf> {
        let message = format!("chore(issues): complete {}", issue_id);
        self.file_issue(issue_id, issue_path, &resolution, &message).await
    }

    /// File an issue the readiness check decided to close.
    pub async fn close(&self, issue_id: &str, issue_path: &Path, status: &str, reason: &str) -> Result<PathBuf> {
        let message = format!("chore(issues): close {} ({})", issue_id, status);
        self.file_issue(issue_id, issue_path, &Resolution::closed(status, reason), &message)
            .await
    }

    async fn file_issue(
        &self,
        issue_id: &str,
        issue_path: &Path,
        resolution: &Resolution,
        message: &str,
    ) -> Result<PathBuf> {
        let dest_rel = self
            .completed_path(issue_path)
            .with_context(|| format!("Issue path {} has no file name", issue_path.display()))?;

        let guard = self.repo.lock().await;
        let root = guard.root().to_path_buf();
        let src = root.join(issue_path);
        let dest = root.join(&dest_rel);

        if !src.exists() {
            if dest.exists() {
                debug!(issue = issue_id, "issue already filed");
                return Ok(dest_rel);
            }
            bail!("Issue file {} not found", issue_path.display());
        }

        let original = tokio::fs::read_to_string(&src)
            .await
            .with_context(|| format!("Failed to read {}", src.display()))?;
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let src_str = issue_path.to_string_lossy().to_string();
        let dest_str = dest_rel.to_string_lossy().to_string();
        // `git mv` stages both sides of the rename; an untracked file is moved by hand.
        let tracked = guard.run(&["mv", &src_str, &dest_str]).await?.success();
        if !tracked {
            debug!(issue = issue_id, "issue file not tracked; moving it directly");
            tokio::fs::rename(&src, &dest)
                .await
                .with_context(|| format!("Failed to move {} to {}", src.display(), dest.display()))?;
        }

        let mut content = original.clone();
        content.push_str(&resolution.render());
        let committed = async {
            tokio::fs::write(&dest, content)
                .await
                .with_context(|| format!("Failed to write {}", dest.display()))?;
            guard.run_checked(&["add", "--", &dest_str]).await?;
            let mut commit: Vec<&str> = vec!["commit", "-m", message, "--", dest_str.as_str()];
            if tracked {
                commit.push(src_str.as_str());
            }
            guard.run_checked(&commit).await?;
            anyhow::Ok(())
        }
        .await;

        if let Err(e) = committed {
            warn!(issue = issue_id, error = %format!("{:#}", e), "filing failed; restoring issue file");
            if tracked {
                let _ = guard.run(&["reset", "-q", "HEAD", "--", &src_str, &dest_str]).await;
            } else {
                let _ = guard.run(&["reset", "-q", "--", &dest_str]).await;
            }
            let _ = tokio::fs::remove_file(&dest).await;
            let _ = tokio::fs::write(&src, &original).await;
            return Err(e);
        }

        info!(issue = issue_id, status = %resolution.status, "filed issue to {}", dest_str);
        Ok(dest_rel)
    }
}
