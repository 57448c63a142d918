//! Per-issue workflow executed inside a worker.
//!
//! 1. Snapshot the main checkout's status (leak baseline)
//! 2. Create an isolated worktree and branch
//! 3. Ready phase: ask the agent for a verdict
//! 4. Implement phase: let the agent make the change
//! 5. Commit leftovers in the worktree and verify real work was done
//! 6. Revert anything the agent wrote into the main checkout by mistake
//!
//! Leaks are detected against a per-worker baseline, so with several workers
//! running a reverted path is only attributed to this issue when it is one of
//! the issue's own changed files; anything else is reported as unattributed.
//!
//! Every failure ends up in the returned [`WorkerResult`]; nothing escapes.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::agent::{
    AgentCommands, AgentInvoker, AgentPhase, AgentRequest, Verdict, ensure_cwd, parse_verdict,
};
use crate::errors::WorkerError;
use crate::issue::Issue;
use crate::tracker::git::{DEFAULT_GIT_TIMEOUT, StatusEntry, parse_name_only, run_git, run_git_checked};
use crate::tracker::{RepoMutex, Worktree, WorktreeManager};

/// Extensions that never count as a code change on their own.
const NON_CODE_EXTENSIONS: &[&str] = &["md", "markdown", "txt", "rst", "adoc"];

/// Outcome of one issue attempt.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorkerResult {
    pub issue_id: String,
    /// Issue file path relative to the repository root.
    pub issue_path: PathBuf,
    pub success: bool,
    pub branch_name: String,
    pub worktree_path: PathBuf,
    pub changed_files: Vec<String>,
    pub should_close: bool,
    pub close_reason: Option<String>,
    pub close_status: Option<String>,
    pub was_corrected: bool,
    pub corrections: Vec<String>,
    pub error: Option<String>,
    pub interrupted: bool,
    pub leaked_files: Vec<String>,
    /// Reverted main-checkout changes that may belong to a concurrent worker.
    pub unattributed_leaks: Vec<String>,
    pub duration: Duration,
    /// Seconds per phase: `ready`, `implement`, `total`.
    pub phase_timings: BTreeMap<String, f64>,
}

impl WorkerResult {
    pub fn new(issue: &Issue) -> Self {
        Self {
            issue_id: issue.id.clone(),
            issue_path: issue.path.clone(),
            ..Default::default()
        }
    }

    /// A failed result for work that never reached the workflow.
    pub fn failure(issue: &Issue, error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::new(issue)
        }
    }

    /// Successful and should be merged (not closed).
    pub fn is_mergeable(&self) -> bool {
        self.success && !self.should_close
    }
}

/// Fixed settings for every worker of a run.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub commands: AgentCommands,
    pub timeout: Duration,
    pub require_code_changes: bool,
    /// Issues directory relative to the repository root.
    pub issues_dir: PathBuf,
    /// Paths in the main checkout that workers may legitimately change,
    /// relative to the repository root (state file, worktree base).
    pub leak_exclusions: Vec<PathBuf>,
}

/// Shared handles every worker needs.
pub struct WorkerContext {
    pub repo: Arc<RepoMutex>,
    pub worktrees: Arc<WorktreeManager>,
    pub agent: Arc<dyn AgentInvoker>,
    pub settings: WorkerSettings,
    /// Cancelled when in-flight agents are being terminated.
    pub terminating: CancellationToken,
    pub activity: WorkerActivity,
}

/// Tracks which workers overlapped in time.
#[derive(Debug, Default)]
pub struct WorkerActivity {
    running: AtomicUsize,
    started: AtomicU64,
}

impl WorkerActivity {
    fn enter(&self) -> Presence<'_> {
        let others_at_start = self.running.fetch_add(1, Ordering::SeqCst);
        let seq = self.started.fetch_add(1, Ordering::SeqCst) + 1;
        Presence {
            activity: self,
            others_at_start,
            seq,
        }
    }
}

/// One worker's registration in [`WorkerActivity`]; leaves on drop.
struct Presence<'a> {
    activity: &'a WorkerActivity,
    others_at_start: usize,
    seq: u64,
}

impl Presence<'_> {
    /// No other worker was running at start, and none has started since.
    fn ran_alone(&self) -> bool {
        self.others_at_start == 0 && self.activity.started.load(Ordering::SeqCst) == self.seq
    }
}

impl Drop for Presence<'_> {
    fn drop(&mut self) {
        self.activity.running.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct Worker {
    ctx: Arc<WorkerContext>,
}

impl Worker {
    pub fn new(ctx: Arc<WorkerContext>) -> Self {
        Self { ctx }
    }

    pub async fn process(&self, issue: &Issue) -> WorkerResult {
        let started = Instant::now();
        let mut result = WorkerResult::new(issue);
        info!(issue = %issue.id, "worker started");
        let presence = self.ctx.activity.enter();

        let baseline = match self.snapshot_main().await {
            Ok(entries) => Some(entries),
            Err(e) => {
                warn!(issue = %issue.id, error = %e, "could not snapshot main checkout; leak detection disabled");
                None
            }
        };

        let outcome = self.run_workflow(issue, &mut result).await;

        if let Some(baseline) = baseline {
            match self.remediate_leaks(&baseline).await {
                Ok(leaked) => {
                    let alone = presence.ran_alone();
                    let (own, foreign): (Vec<String>, Vec<String>) = leaked
                        .into_iter()
                        .partition(|path| alone || result.changed_files.contains(path));
                    if !own.is_empty() {
                        warn!(issue = %issue.id, files = ?own, "agent wrote to the main checkout; changes reverted");
                    }
                    if !foreign.is_empty() {
                        warn!(issue = %issue.id, files = ?foreign, "reverted main-checkout changes of unknown origin");
                    }
                    result.leaked_files = own;
                    result.unattributed_leaks = foreign;
                }
                Err(e) => warn!(issue = %issue.id, error = %e, "leak check failed"),
            }
        }

        match outcome {
            Ok(()) => result.success = true,
            Err(e) => {
                result.success = false;
                result.interrupted = matches!(e, WorkerError::Interrupted)
                    || self.ctx.terminating.is_cancelled();
                result.error = Some(e.to_string());
            }
        }

        result.duration = started.elapsed();
        result
            .phase_timings
            .insert("total".into(), result.duration.as_secs_f64());
        info!(
            issue = %issue.id,
            success = result.success,
            close = result.should_close,
            secs = result.duration.as_secs(),
            "worker finished"
        );
        result
    }

    async fn run_workflow(&self, issue: &Issue, result: &mut WorkerResult) -> Result<(), WorkerError> {
        if self.ctx.terminating.is_cancelled() {
            return Err(WorkerError::Interrupted);
        }

        let worktree = self
            .ctx
            .worktrees
            .create(&issue.id)
            .await
            .map_err(|source| WorkerError::WorktreeSetup {
                path: self.ctx.worktrees.base_dir().to_path_buf(),
                source,
            })?;
        result.branch_name = worktree.branch.clone();
        result.worktree_path = worktree.path.clone();

        // Ready phase
        let phase_start = Instant::now();
        let ready = self.invoke(issue, AgentPhase::Ready, &worktree.path).await;
        result
            .phase_timings
            .insert("ready".into(), phase_start.elapsed().as_secs_f64());
        match parse_verdict(&ready?) {
            Verdict::Close { reason, status } => {
                info!(issue = %issue.id, %status, "readiness check closed the issue");
                result.should_close = true;
                result.close_reason = Some(reason);
                result.close_status = Some(status);
                return Ok(());
            }
            Verdict::NotReady { reason } => return Err(WorkerError::NotReady { reason }),
            Verdict::Ready {
                was_corrected,
                corrections,
            } => {
                result.was_corrected = was_corrected;
                result.corrections = corrections;
            }
        }

        // Implement phase
        let phase_start = Instant::now();
        let implemented = self.invoke(issue, AgentPhase::Implement, &worktree.path).await;
        result
            .phase_timings
            .insert("implement".into(), phase_start.elapsed().as_secs_f64());
        implemented?;

        self.commit_leftovers(issue, &worktree.path).await?;
        result.changed_files = self.changed_files(&worktree).await?;
        self.verify_work(&result.changed_files)?;
        Ok(())
    }

    /// Run one agent phase; non-zero exit or timeout is an error.
    async fn invoke(&self, issue: &Issue, phase: AgentPhase, cwd: &Path) -> Result<String, WorkerError> {
        ensure_cwd(cwd)?;
        let request = AgentRequest {
            issue_id: issue.id.clone(),
            phase,
            command: self.ctx.settings.commands.render(phase, issue),
            cwd: cwd.to_path_buf(),
            timeout: self.ctx.settings.timeout,
        };
        let output = self.ctx.agent.invoke(&request).await?;
        if output.timed_out {
            return Err(WorkerError::AgentTimedOut {
                phase: phase.to_string(),
                secs: self.ctx.settings.timeout.as_secs(),
            });
        }
        if !output.success() {
            return Err(WorkerError::AgentFailed {
                phase: phase.to_string(),
                exit_code: output.exit_code,
                detail: output.failure_detail(),
            });
        }
        Ok(output.stdout)
    }

    /// Commit anything the agent left uncommitted in its worktree.
    async fn commit_leftovers(&self, issue: &Issue, worktree: &Path) -> Result<(), WorkerError> {
        let status = run_git_checked(&["status", "--porcelain"], worktree, DEFAULT_GIT_TIMEOUT).await?;
        if status.stdout.trim().is_empty() {
            return Ok(());
        }
        run_git_checked(&["add", "-A"], worktree, DEFAULT_GIT_TIMEOUT).await?;
        let message = format!("{}: {}\n\nCommitted uncommitted agent changes.", issue.id, issue.title);
        let commit = run_git(&["commit", "-m", &message], worktree, DEFAULT_GIT_TIMEOUT).await?;
        if !commit.success() && !commit.stdout.contains("nothing to commit") {
            commit.check(&["commit", "-m"])?;
        }
        Ok(())
    }

    async fn changed_files(&self, worktree: &Worktree) -> Result<Vec<String>, WorkerError> {
        let range = format!("{}..HEAD", worktree.base_commit);
        let diff = run_git_checked(&["diff", "--name-only", &range], &worktree.path, DEFAULT_GIT_TIMEOUT).await?;
        Ok(parse_name_only(&diff.stdout))
    }

    fn verify_work(&self, changed: &[String]) -> Result<(), WorkerError> {
        if changed.is_empty() {
            return Err(WorkerError::NoWorkDone(
                "agent reported success but the branch has no changes".into(),
            ));
        }
        if self.ctx.settings.require_code_changes
            && changed.iter().all(|f| is_non_code(f, &self.ctx.settings.issues_dir))
        {
            return Err(WorkerError::NoWorkDone(format!(
                "only documentation or issue files changed ({})",
                changed.join(", ")
            )));
        }
        Ok(())
    }

    async fn snapshot_main(&self) -> Result<BTreeSet<StatusEntry>, WorkerError> {
        let guard = self.ctx.repo.lock().await;
        Ok(guard.status().await?.into_iter().collect())
    }

    /// Revert main-checkout changes that appeared since `baseline`.
    /// Detection and remediation happen under one lock acquisition.
    async fn remediate_leaks(&self, baseline: &BTreeSet<StatusEntry>) -> Result<Vec<String>, WorkerError> {
        let guard = self.ctx.repo.lock().await;
        let leaked: Vec<StatusEntry> = guard
            .status()
            .await?
            .into_iter()
            .filter(|entry| !baseline.contains(entry))
            .filter(|entry| !self.is_excluded(&entry.path))
            .collect();

        for entry in &leaked {
            if entry.is_untracked() || entry.is_added() {
                if entry.is_added() {
                    guard.run(&["reset", "-q", "--", &entry.path]).await?;
                }
                let path = guard.root().join(&entry.path);
                if path.is_file()
                    && let Err(e) = tokio::fs::remove_file(&path).await
                {
                    warn!(path = %entry.path, error = %e, "could not delete leaked file");
                }
            } else {
                let restored = guard.run(&["checkout", "HEAD", "--", &entry.path]).await?;
                if !restored.success() {
                    warn!(path = %entry.path, stderr = %restored.stderr.trim(), "could not restore leaked change");
                }
            }
        }

        Ok(leaked.into_iter().map(|entry| entry.path).collect())
    }

    fn is_excluded(&self, path: &str) -> bool {
        let path = Path::new(path);
        self.ctx.settings.leak_exclusions.iter().any(|excluded| {
            path.starts_with(excluded)
                || path
                    .to_str()
                    .zip(excluded.to_str())
                    .is_some_and(|(p, e)| p.starts_with(e))
        })
    }
}

/// Docs, plain text and anything under the issues directory.
pub fn is_non_code(path: &str, issues_dir: &Path) -> bool {
    if Path::new(path).starts_with(issues_dir) {
        return true;
    }
    Path::new(path)
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| NON_CODE_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
}
