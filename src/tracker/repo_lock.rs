//! Process-wide serialization of git commands against the main checkout.
//!
//! Workers, the merge coordinator and the orchestrator all touch the main
//! repository's index and working tree. Every such command goes through one
//! [`RepoMutex`]; multi-step sequences (stash, merge, pop) hold a
//! [`RepoGuard`] for their whole duration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::sync::{Mutex, MutexGuard};

use super::git::{DEFAULT_GIT_TIMEOUT, GitOutput, StatusEntry, parse_porcelain, run_git};
use crate::errors::GitError;

#[derive(Debug)]
pub struct RepoMutex {
    root: PathBuf,
    lock: Mutex<()>,
    timeout: Duration,
}

impl RepoMutex {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            lock: Mutex::new(()),
            timeout: DEFAULT_GIT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Run one git command in the main checkout under the lock.
    pub async fn run(&self, args: &[&str]) -> Result<GitOutput, GitError> {
        self.run_with(args, None, None).await
    }

    /// Run under the lock with an explicit working directory and timeout.
    pub async fn run_with(
        &self,
        args: &[&str],
        cwd: Option<&Path>,
        timeout: Option<Duration>,
    ) -> Result<GitOutput, GitError> {
        let _guard = self.lock.lock().await;
        run_git(
            args,
            cwd.unwrap_or(&self.root),
            timeout.unwrap_or(self.timeout),
        )
        .await
    }

    /// Hold the lock across several commands.
    pub async fn lock(&self) -> RepoGuard<'_> {
        RepoGuard {
            _guard: self.lock.lock().await,
            root: &self.root,
            timeout: self.timeout,
        }
    }
}

/// Exclusive access to the main checkout until dropped.
pub struct RepoGuard<'a> {
    _guard: MutexGuard<'a, ()>,
    root: &'a Path,
    timeout: Duration,
}

impl RepoGuard<'_> {
    pub fn root(&self) -> &Path {
        self.root
    }

    pub async fn run(&self, args: &[&str]) -> Result<GitOutput, GitError> {
        run_git(args, self.root, self.timeout).await
    }

    pub async fn run_checked(&self, args: &[&str]) -> Result<GitOutput, GitError> {
        self.run(args).await?.check(args)
    }

    /// Uncommitted entries in the main checkout, listing untracked files individually.
    pub async fn status(&self) -> Result<Vec<StatusEntry>, GitError> {
        let args = ["status", "--porcelain", "--untracked-files=all"];
        let output = self.run_checked(&args).await?;
        Ok(parse_porcelain(&output.stdout))
    }
}
