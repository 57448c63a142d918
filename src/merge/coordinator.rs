//! Serialized integration of worker branches into the main checkout.
//!
//! A single consumer task drains a queue of successful [`WorkerResult`]s.
//! Each merge runs under the repo lock: stash local changes, merge with
//! `--no-ff`, abort on conflict, restore the stash. Conflicting branches are
//! rebased inside their worktree and retried a bounded number of times
//! before being recorded as a merge failure.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::{Result, anyhow};
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::orchestrator::lifecycle::IssueLifecycle;
use crate::pool::WorkerResult;
use crate::tracker::git::{DEFAULT_GIT_TIMEOUT, run_git};
use crate::tracker::{RepoGuard, RepoMutex, WorktreeManager};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeStatus {
    Queued,
    Merging,
    Merged,
    Failed,
}

/// Whether the merge also moved the issue file into the completed directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    MergedAndFiled,
    /// Merged, but the issue file is still active; the caller must file it.
    MergedButUnfiled,
}

#[derive(Debug, Clone)]
pub struct MergeSettings {
    /// Additional attempts after the first conflict.
    pub max_retries: u32,
    pub retry_delay: Duration,
    /// Paths in the main checkout ignored by the dirty check and never stashed.
    pub stash_exclusions: Vec<PathBuf>,
}

impl Default for MergeSettings {
    fn default() -> Self {
        Self {
            max_retries: 2,
            retry_delay: Duration::from_secs(1),
            stash_exclusions: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
struct MergeRecord {
    result: WorkerResult,
    status: MergeStatus,
    outcome: Option<MergeOutcome>,
}

#[derive(Debug, Default)]
struct Ledger {
    records: HashMap<String, MergeRecord>,
    merged: Vec<String>,
    failed: BTreeMap<String, String>,
    stash_pop_failures: BTreeMap<String, String>,
}

struct Core {
    repo: Arc<RepoMutex>,
    worktrees: Arc<WorktreeManager>,
    lifecycle: Arc<IssueLifecycle>,
    settings: MergeSettings,
    ledger: Mutex<Ledger>,
    pending: AtomicUsize,
    idle: Notify,
}

pub struct MergeCoordinator {
    core: Arc<Core>,
    tx: Mutex<Option<mpsc::UnboundedSender<WorkerResult>>>,
    consumer: Mutex<Option<JoinHandle<()>>>,
}

enum Attempt {
    Merged,
    Conflict(String),
    /// Merge refused for a reason other than conflicting content.
    Rejected(String),
}

impl MergeCoordinator {
    pub fn new(
        repo: Arc<RepoMutex>,
        worktrees: Arc<WorktreeManager>,
        lifecycle: Arc<IssueLifecycle>,
        settings: MergeSettings,
    ) -> Self {
        Self {
            core: Arc::new(Core {
                repo,
                worktrees,
                lifecycle,
                settings,
                ledger: Mutex::new(Ledger::default()),
                pending: AtomicUsize::new(0),
                idle: Notify::new(),
            }),
            tx: Mutex::new(None),
            consumer: Mutex::new(None),
        }
    }

    /// Spawn the consumer task. Idempotent.
    pub fn start(&self) {
        let mut tx_slot = lock(&self.tx);
        if tx_slot.is_some() {
            return;
        }
        let (tx, mut rx) = mpsc::unbounded_channel::<WorkerResult>();
        let core = Arc::clone(&self.core);
        let handle = tokio::spawn(async move {
            while let Some(result) = rx.recv().await {
                core.process(result).await;
                core.pending.fetch_sub(1, Ordering::SeqCst);
                core.idle.notify_waiters();
            }
            debug!("merge consumer stopped");
        });
        *tx_slot = Some(tx);
        *lock(&self.consumer) = Some(handle);
    }

    /// Queue a successful result for merging. Results that should be closed,
    /// failed results, and calls before `start()` are ignored (`false`).
    pub fn queue_merge(&self, result: WorkerResult) -> bool {
        if !result.is_mergeable() {
            return false;
        }
        let tx_slot = lock(&self.tx);
        let Some(tx) = tx_slot.as_ref() else {
            warn!(issue = %result.issue_id, "merge coordinator not started; result not queued");
            return false;
        };

        let id = result.issue_id.clone();
        lock(&self.core.ledger).records.insert(
            id.clone(),
            MergeRecord {
                result: result.clone(),
                status: MergeStatus::Queued,
                outcome: None,
            },
        );
        self.core.pending.fetch_add(1, Ordering::SeqCst);
        if tx.send(result).is_err() {
            self.core.pending.fetch_sub(1, Ordering::SeqCst);
            self.core.fail(&id, "merge queue closed".into());
            return false;
        }
        info!(issue = %id, "queued for merge");
        true
    }

    /// Block until the queue drains. Returns `false` on timeout.
    pub async fn wait_for_completion(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.core.idle.notified();
            if self.pending() == 0 {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.pending() == 0;
            }
        }
    }

    pub fn pending(&self) -> usize {
        self.core.pending.load(Ordering::SeqCst)
    }

    pub fn status(&self, issue_id: &str) -> Option<MergeStatus> {
        lock(&self.core.ledger)
            .records
            .get(issue_id)
            .map(|record| record.status)
    }

    pub fn outcome(&self, issue_id: &str) -> Option<MergeOutcome> {
        lock(&self.core.ledger)
            .records
            .get(issue_id)
            .and_then(|record| record.outcome)
    }

    /// Ids merged so far, in merge order.
    pub fn merged_ids(&self) -> Vec<String> {
        lock(&self.core.ledger).merged.clone()
    }

    /// Merged results with their filing outcome, in merge order.
    pub fn merged_results(&self) -> Vec<(WorkerResult, MergeOutcome)> {
        let ledger = lock(&self.core.ledger);
        ledger
            .merged
            .iter()
            .filter_map(|id| ledger.records.get(id))
            .filter_map(|record| record.outcome.map(|o| (record.result.clone(), o)))
            .collect()
    }

    pub fn failed_merges(&self) -> BTreeMap<String, String> {
        lock(&self.core.ledger).failed.clone()
    }

    /// Local changes that were stashed for a merge and could not be restored.
    /// They remain in `git stash list`.
    pub fn stash_pop_failures(&self) -> BTreeMap<String, String> {
        lock(&self.core.ledger).stash_pop_failures.clone()
    }

    /// Stop accepting work, let the consumer drain for up to `timeout`, then stop it.
    pub async fn shutdown(&self, timeout: Duration) {
        lock(&self.tx).take();
        let handle = lock(&self.consumer).take();
        if let Some(mut handle) = handle
            && tokio::time::timeout(timeout, &mut handle).await.is_err()
        {
            warn!(pending = self.pending(), "merge queue did not drain before shutdown");
            handle.abort();
        }
    }
}

impl Core {
    async fn process(&self, result: WorkerResult) {
        let id = result.issue_id.clone();
        self.set_status(&id, MergeStatus::Merging);
        info!(issue = %id, branch = %result.branch_name, "merging");

        let mut last_error = String::new();
        let mut conflicted = false;
        let mut merged = false;
        for attempt in 0..=self.settings.max_retries {
            if attempt > 0 {
                tokio::time::sleep(self.settings.retry_delay * attempt).await;
                self.rebase_branch(&result).await;
            }
            match self.attempt_merge(&result).await {
                Ok(Attempt::Merged) => {
                    merged = true;
                    break;
                }
                Ok(Attempt::Conflict(detail)) => {
                    warn!(issue = %id, attempt = attempt + 1, "merge conflict");
                    conflicted = true;
                    last_error = detail;
                }
                Ok(Attempt::Rejected(detail)) => {
                    warn!(issue = %id, attempt = attempt + 1, %detail, "merge rejected");
                    conflicted = false;
                    last_error = detail;
                }
                Err(e) => {
                    warn!(issue = %id, attempt = attempt + 1, error = %format!("{:#}", e), "merge attempt failed");
                    conflicted = false;
                    last_error = format!("{:#}", e);
                }
            }
        }

        if merged {
            let outcome = if self.lifecycle.is_filed(&result.issue_path) {
                MergeOutcome::MergedAndFiled
            } else {
                MergeOutcome::MergedButUnfiled
            };
            {
                let mut ledger = lock(&self.ledger);
                if let Some(record) = ledger.records.get_mut(&id) {
                    record.status = MergeStatus::Merged;
                    record.outcome = Some(outcome);
                }
                ledger.merged.push(id.clone());
            }
            info!(issue = %id, ?outcome, "merged");
        } else {
            let attempts = self.settings.max_retries + 1;
            let kind = if conflicted { "conflict" } else { "merge failed" };
            self.fail(&id, format!("{} after {} attempt(s): {}", kind, attempts, last_error));
        }

        if let Err(e) = self
            .worktrees
            .remove(&result.worktree_path, &result.branch_name)
            .await
        {
            warn!(issue = %id, error = %e, "failed to remove worktree after merge");
        }
    }

    async fn attempt_merge(&self, result: &WorkerResult) -> Result<Attempt> {
        let guard = self.repo.lock().await;

        let dirty = guard
            .status()
            .await?
            .iter()
            .any(|entry| !self.is_excluded(&entry.path));
        let stashed = if dirty { self.stash(&guard, &result.issue_id).await? } else { false };

        let message = format!("Merge {} ({})", result.branch_name, result.issue_id);
        let merge = guard
            .run(&["merge", "--no-ff", "-m", &message, &result.branch_name])
            .await?;
        let attempt = if merge.success() {
            Attempt::Merged
        } else {
            let abort = guard.run(&["merge", "--abort"]).await?;
            if !abort.success() {
                debug!(stderr = %abort.stderr.trim(), "merge --abort failed");
            }
            if merge.stdout.contains("CONFLICT") {
                let detail = merge
                    .stdout
                    .lines()
                    .filter(|l| l.contains("CONFLICT"))
                    .collect::<Vec<_>>()
                    .join("; ");
                Attempt::Conflict(detail)
            } else {
                let detail = format!("{} {}", merge.stdout.trim(), merge.stderr.trim());
                Attempt::Rejected(detail.trim().to_string())
            }
        };

        if stashed {
            self.restore_stash(&guard, &result.issue_id).await?;
        }
        Ok(attempt)
    }

    /// Stash dirty main-checkout changes. Returns whether anything was stashed.
    async fn stash(&self, guard: &RepoGuard<'_>, issue_id: &str) -> Result<bool> {
        let message = format!("forge-parallel: before merging {}", issue_id);
        // Ignored paths are never stashed, and git rejects pathspecs naming them.
        let mut excludes = Vec::new();
        for path in &self.settings.stash_exclusions {
            let path = path.to_string_lossy();
            let ignored = guard.run(&["check-ignore", "-q", &*path]).await?;
            if !ignored.success() {
                excludes.push(format!(":(exclude){}", path));
            }
        }
        let mut args = vec!["stash", "push", "--include-untracked", "-m", &message, "--", "."];
        args.extend(excludes.iter().map(String::as_str));

        let out = guard.run(&args).await?;
        if !out.success() {
            return Err(anyhow!("git stash failed: {}", out.stderr.trim()));
        }
        Ok(!out.stdout.contains("No local changes to save"))
    }

    async fn restore_stash(&self, guard: &RepoGuard<'_>, issue_id: &str) -> Result<()> {
        let pop = guard.run(&["stash", "pop"]).await?;
        if pop.success() {
            return Ok(());
        }
        let detail = format!("{} {}", pop.stdout.trim(), pop.stderr.trim()).trim().to_string();
        error!(
            issue = issue_id,
            "could not restore stashed local changes; they remain in `git stash list`"
        );
        // The stash entry survives a failed pop; reset the half-applied tree.
        guard.run(&["reset", "--hard", "HEAD"]).await?;
        lock(&self.ledger)
            .stash_pop_failures
            .insert(issue_id.to_string(), detail);
        Ok(())
    }

    /// Rebase the issue branch onto the main checkout's branch, inside its worktree.
    async fn rebase_branch(&self, result: &WorkerResult) {
        if !result.worktree_path.is_dir() {
            return;
        }
        let base = match self.repo.run(&["rev-parse", "--abbrev-ref", "HEAD"]).await {
            Ok(out) if out.success() => out.stdout.trim().to_string(),
            _ => return,
        };
        let cwd = result.worktree_path.as_path();
        match run_git(&["rebase", &base], cwd, DEFAULT_GIT_TIMEOUT).await {
            Ok(out) if out.success() => {
                debug!(issue = %result.issue_id, onto = %base, "rebased branch before retry");
            }
            _ => {
                let _ = run_git(&["rebase", "--abort"], cwd, DEFAULT_GIT_TIMEOUT).await;
            }
        }
    }

    fn is_excluded(&self, path: &str) -> bool {
        self.settings
            .stash_exclusions
            .iter()
            .any(|excluded| Path::new(path).starts_with(excluded))
    }

    fn set_status(&self, issue_id: &str, status: MergeStatus) {
        if let Some(record) = lock(&self.ledger).records.get_mut(issue_id) {
            record.status = status;
        }
    }

    fn fail(&self, issue_id: &str, reason: String) {
        error!(issue = issue_id, %reason, "merge failed");
        let mut ledger = lock(&self.ledger);
        if let Some(record) = ledger.records.get_mut(issue_id) {
            record.status = MergeStatus::Failed;
        }
        ledger.failed.insert(issue_id.to_string(), reason);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{commit_file, init_repo};
    use crate::tracker::Worktree;
    use tempfile::TempDir;

    struct Fixture {
        dir: TempDir,
        repo: Arc<RepoMutex>,
        worktrees: Arc<WorktreeManager>,
        coordinator: MergeCoordinator,
    }

    fn fixture(max_retries: u32) -> Fixture {
        let dir = init_repo();
        let repo = Arc::new(RepoMutex::new(dir.path()));
        let worktrees = Arc::new(WorktreeManager::new(
            Arc::clone(&repo),
            Path::new(".worktrees"),
            vec![],
        ));
        let lifecycle = Arc::new(IssueLifecycle::new(
            Arc::clone(&repo),
            Path::new(".issues/completed"),
        ));
        let coordinator = MergeCoordinator::new(
            Arc::clone(&repo),
            Arc::clone(&worktrees),
            lifecycle,
            MergeSettings {
                max_retries,
                retry_delay: Duration::from_millis(10),
                stash_exclusions: vec![PathBuf::from(".worktrees"), PathBuf::from(".parallel-state.json")],
            },
        );
        coordinator.start();
        Fixture {
            dir,
            repo,
            worktrees,
            coordinator,
        }
    }

    /// Create a worktree for `id` and commit `files` on its branch.
    async fn branch_with(fx: &Fixture, id: &str, files: &[(&str, &str)]) -> (Worktree, WorkerResult) {
        let wt = fx.worktrees.create(id).await.unwrap();
        for (name, content) in files {
            commit_file(&wt.path, name, content, &format!("{} work", id));
        }
        let result = WorkerResult {
            issue_id: id.to_string(),
            issue_path: PathBuf::from(format!(".issues/bugs/P2-{}-x.md", id)),
            success: true,
            branch_name: wt.branch.clone(),
            worktree_path: wt.path.clone(),
            changed_files: files.iter().map(|(n, _)| n.to_string()).collect(),
            ..Default::default()
        };
        (wt, result)
    }

    #[tokio::test]
    async fn test_merges_branch_and_cleans_up() {
        let fx = fixture(0);
        let (wt, result) = branch_with(&fx, "BUG-001", &[("src/a.rs", "a\n")]).await;

        assert!(fx.coordinator.queue_merge(result));
        assert!(fx.coordinator.wait_for_completion(Duration::from_secs(30)).await);

        assert_eq!(fx.coordinator.merged_ids(), vec!["BUG-001"]);
        assert_eq!(fx.coordinator.status("BUG-001"), Some(MergeStatus::Merged));
        assert_eq!(
            fx.coordinator.outcome("BUG-001"),
            Some(MergeOutcome::MergedButUnfiled)
        );
        assert!(fx.dir.path().join("src/a.rs").exists());
        assert!(!wt.path.exists());
        assert!(fx.worktrees.list_branches().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_merge_that_files_issue_is_merged_and_filed() {
        let fx = fixture(0);
        let issue_rel = ".issues/bugs/P2-BUG-002-x.md";
        commit_file(fx.dir.path(), issue_rel, "# BUG-002\n", "add issue");
        let wt = fx.worktrees.create("BUG-002").await.unwrap();
        std::fs::create_dir_all(wt.path.join(".issues/completed")).unwrap();
        run_git(
            &["mv", issue_rel, ".issues/completed/P2-BUG-002-x.md"],
            &wt.path,
            DEFAULT_GIT_TIMEOUT,
        )
        .await
        .unwrap();
        commit_file(&wt.path, "src/b.rs", "b\n", "fix");

        let result = WorkerResult {
            issue_id: "BUG-002".into(),
            issue_path: PathBuf::from(issue_rel),
            success: true,
            branch_name: wt.branch.clone(),
            worktree_path: wt.path.clone(),
            ..Default::default()
        };
        assert!(fx.coordinator.queue_merge(result));
        assert!(fx.coordinator.wait_for_completion(Duration::from_secs(30)).await);
        assert_eq!(
            fx.coordinator.outcome("BUG-002"),
            Some(MergeOutcome::MergedAndFiled)
        );
    }

    #[tokio::test]
    async fn test_close_and_failed_results_not_queued() {
        let fx = fixture(0);
        let close = WorkerResult {
            issue_id: "BUG-003".into(),
            success: true,
            should_close: true,
            ..Default::default()
        };
        let failed = WorkerResult {
            issue_id: "BUG-004".into(),
            success: false,
            ..Default::default()
        };
        assert!(!fx.coordinator.queue_merge(close));
        assert!(!fx.coordinator.queue_merge(failed));
        assert_eq!(fx.coordinator.pending(), 0);
        assert!(fx.coordinator.status("BUG-003").is_none());
    }

    #[tokio::test]
    async fn test_conflict_recorded_as_merge_failure() {
        let fx = fixture(1);
        let (_, first) = branch_with(&fx, "BUG-005", &[("shared.txt", "from first\n")]).await;
        let (_, second) = branch_with(&fx, "BUG-006", &[("shared.txt", "from second\n")]).await;

        fx.coordinator.queue_merge(first);
        fx.coordinator.queue_merge(second);
        assert!(fx.coordinator.wait_for_completion(Duration::from_secs(60)).await);

        assert_eq!(fx.coordinator.merged_ids(), vec!["BUG-005"]);
        let failed = fx.coordinator.failed_merges();
        assert!(failed["BUG-006"].contains("conflict after 2 attempt(s)"));
        assert_eq!(fx.coordinator.status("BUG-006"), Some(MergeStatus::Failed));

        let status = fx.repo.run(&["status", "--porcelain"]).await.unwrap();
        assert!(status.stdout.trim().is_empty(), "tree left dirty: {}", status.stdout);
        assert!(fx.worktrees.list_branches().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_dirty_main_checkout_stashed_and_restored() {
        let fx = fixture(0);
        let (_, result) = branch_with(&fx, "FEAT-007", &[("src/new.rs", "new\n")]).await;
        std::fs::write(fx.dir.path().join("README.md"), "local edit\n").unwrap();
        std::fs::write(fx.dir.path().join("scratch.txt"), "untracked\n").unwrap();

        fx.coordinator.queue_merge(result);
        assert!(fx.coordinator.wait_for_completion(Duration::from_secs(30)).await);

        assert_eq!(fx.coordinator.merged_ids(), vec!["FEAT-007"]);
        assert!(fx.coordinator.stash_pop_failures().is_empty());
        assert_eq!(
            std::fs::read_to_string(fx.dir.path().join("README.md")).unwrap(),
            "local edit\n"
        );
        assert!(fx.dir.path().join("scratch.txt").exists());
        assert!(fx.dir.path().join("src/new.rs").exists());
    }

    #[tokio::test]
    async fn test_failed_stash_pop_is_recorded_and_kept() {
        let fx = fixture(0);
        let (_, result) = branch_with(&fx, "BUG-008", &[("README.md", "# from branch\n")]).await;
        std::fs::write(fx.dir.path().join("README.md"), "# local edit\n").unwrap();

        fx.coordinator.queue_merge(result);
        assert!(fx.coordinator.wait_for_completion(Duration::from_secs(30)).await);

        assert_eq!(fx.coordinator.merged_ids(), vec!["BUG-008"]);
        assert!(fx.coordinator.stash_pop_failures().contains_key("BUG-008"));
        assert_eq!(
            std::fs::read_to_string(fx.dir.path().join("README.md")).unwrap(),
            "# from branch\n"
        );
        let status = fx.repo.run(&["status", "--porcelain"]).await.unwrap();
        assert!(status.stdout.trim().is_empty(), "tree left dirty: {}", status.stdout);
        let stashes = fx.repo.run(&["stash", "list"]).await.unwrap();
        assert!(stashes.stdout.contains("before merging BUG-008"));
    }

    #[tokio::test]
    async fn test_conflict_resolved_by_rebase_on_retry() {
        let fx = fixture(1);
        commit_file(fx.dir.path(), "shared.txt", "a\n", "add shared");
        let wt = fx.worktrees.create("BUG-009").await.unwrap();
        commit_file(&wt.path, "shared.txt", "b\n", "step one");
        commit_file(&wt.path, "shared.txt", "c\n", "step two");
        // Main picks up step one on its own; a plain merge now conflicts,
        // while a rebase drops the duplicate commit and applies cleanly.
        commit_file(fx.dir.path(), "shared.txt", "b\n", "step one");

        let result = WorkerResult {
            issue_id: "BUG-009".into(),
            issue_path: PathBuf::from(".issues/bugs/P2-BUG-009-x.md"),
            success: true,
            branch_name: wt.branch.clone(),
            worktree_path: wt.path.clone(),
            ..Default::default()
        };
        fx.coordinator.queue_merge(result);
        assert!(fx.coordinator.wait_for_completion(Duration::from_secs(60)).await);

        assert_eq!(fx.coordinator.merged_ids(), vec!["BUG-009"]);
        assert!(fx.coordinator.failed_merges().is_empty());
        assert_eq!(
            std::fs::read_to_string(fx.dir.path().join("shared.txt")).unwrap(),
            "c\n"
        );
    }

    #[tokio::test]
    async fn test_unmergeable_branch_is_not_reported_as_conflict() {
        let fx = fixture(0);
        let result = WorkerResult {
            issue_id: "BUG-010".into(),
            success: true,
            branch_name: "parallel/does-not-exist".into(),
            worktree_path: fx.dir.path().join(".worktrees/missing"),
            ..Default::default()
        };
        fx.coordinator.queue_merge(result);
        assert!(fx.coordinator.wait_for_completion(Duration::from_secs(30)).await);

        let failed = fx.coordinator.failed_merges();
        assert!(failed["BUG-010"].starts_with("merge failed after 1 attempt(s)"));
        assert!(!failed["BUG-010"].contains("conflict"));
    }

    #[tokio::test]
    async fn test_wait_for_completion_with_empty_queue() {
        let fx = fixture(0);
        assert!(fx.coordinator.wait_for_completion(Duration::from_millis(10)).await);
        fx.coordinator.shutdown(Duration::from_secs(1)).await;
    }
}
