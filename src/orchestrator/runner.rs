//! The top-level run loop: recover leftovers, plan waves, dispatch issues
//! wave by wave into the worker pool, fold merge results into persisted state.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use anyhow::Context;
use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::lifecycle::{IssueLifecycle, Resolution};
use super::recovery::{PendingWorktreeInfo, commit_leftovers, inspect_pending};
use super::shutdown::{INTERRUPTED_EXIT_CODE, install_signal_handlers};
use super::state::{OrchestratorState, StateManager};
use crate::agent::verdict::DEFAULT_CLOSE_STATUS;
use crate::agent::{AgentCommands, AgentInvoker, ProcessRegistry};
use crate::config::{ParallelConfig, PendingMode};
use crate::dag::{IssueGraph, PlannedWave, UnknownBlockerPolicy, WaveRefiner, plain_waves};
use crate::errors::OrchestratorError;
use crate::issue::{Issue, IssueStore, sort_issues};
use crate::merge::{MergeCoordinator, MergeOutcome, MergeSettings};
use crate::pool::{
    CompletionCallback, TERMINATE_GRACE, WorkerActivity, WorkerContext, WorkerPool, WorkerResult, WorkerSettings,
};
use crate::tracker::{RepoMutex, WorktreeManager};

const POLL_INTERVAL: Duration = Duration::from_millis(200);
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Effective in-batch blockers per issue id.
type Blockers = HashMap<String, BTreeSet<String>>;

/// Everything a run produced, for the summary and the exit code.
#[derive(Debug, Default)]
pub struct RunReport {
    pub dry_run: bool,
    pub plan: Vec<PlannedWave>,
    pub graph_warnings: Vec<String>,
    pub pending_worktrees: Vec<PendingWorktreeInfo>,
    pub dispatched: usize,
    pub merged: Vec<String>,
    /// Issue id and close status.
    pub closed: Vec<(String, String)>,
    pub failed: BTreeMap<String, String>,
    pub interrupted: bool,
    pub interrupted_issues: Vec<String>,
    /// Issues held back because a blocker did not complete, with those blockers.
    pub blocked: BTreeMap<String, Vec<String>>,
    pub leaked_files: BTreeMap<String, Vec<String>>,
    /// Reverted main-checkout changes no single issue could be blamed for.
    pub unattributed_leaks: BTreeSet<String>,
    pub corrections: BTreeMap<String, Vec<String>>,
    pub stash_pop_failures: BTreeMap<String, String>,
    /// Sum of per-issue wall time, in seconds.
    pub issue_seconds: f64,
    pub wall_time: Duration,
}

impl RunReport {
    pub fn completed_count(&self) -> usize {
        self.merged.len() + self.closed.len()
    }

    /// Sequential time over parallel wall time.
    pub fn speedup(&self) -> Option<f64> {
        let wall = self.wall_time.as_secs_f64();
        (wall > 0.0 && self.issue_seconds > 0.0).then(|| self.issue_seconds / wall)
    }

    pub fn is_success(&self) -> bool {
        !self.interrupted && self.failed.is_empty() && self.blocked.is_empty()
    }

    pub fn exit_code(&self) -> i32 {
        if self.interrupted {
            INTERRUPTED_EXIT_CODE
        } else if self.failed.is_empty() && self.blocked.is_empty() {
            0
        } else {
            1
        }
    }
}

#[derive(Debug, Default)]
struct Tally {
    dispatched: BTreeSet<String>,
    merged: Vec<String>,
    closed: Vec<(String, String)>,
    interrupted: Vec<String>,
    blocked: BTreeMap<String, Vec<String>>,
    leaked: BTreeMap<String, Vec<String>>,
    unattributed_leaks: BTreeSet<String>,
}

/// Folds worker and merge outcomes into the run state. Shared with
/// completion callbacks, so every lock is released before any await.
struct Recorder {
    state: Mutex<OrchestratorState>,
    tally: Mutex<Tally>,
    dirty: AtomicBool,
    lifecycle: Arc<IssueLifecycle>,
    worktrees: Arc<WorktreeManager>,
    merger: Arc<MergeCoordinator>,
}

impl Recorder {
    fn mark_dispatched(&self, issue_id: &str) {
        lock(&self.state).mark_in_progress(issue_id);
        lock(&self.tally).dispatched.insert(issue_id.to_string());
        self.dirty.store(true, Ordering::SeqCst);
    }

    /// Blockers of `issue` that did not complete: in-batch blockers not yet
    /// completed, and any declared blocker recorded as failed.
    fn unmet_blockers(&self, issue: &Issue, in_batch: Option<&BTreeSet<String>>) -> Vec<String> {
        let state = lock(&self.state);
        let mut unmet: BTreeSet<String> = in_batch
            .into_iter()
            .flatten()
            .filter(|id| !state.completed_issues.contains(*id))
            .cloned()
            .collect();
        unmet.extend(
            issue
                .blocked_by
                .iter()
                .filter(|id| state.failed_issues.contains_key(*id))
                .cloned(),
        );
        unmet.into_iter().collect()
    }

    /// Hold an issue back for the next run without marking it failed.
    fn mark_blocked(&self, issue_id: &str, blockers: Vec<String>) {
        warn!(issue = issue_id, ?blockers, "blocker did not complete; skipping issue this run");
        lock(&self.tally).blocked.insert(issue_id.to_string(), blockers);
    }

    async fn record(&self, result: WorkerResult) {
        let id = result.issue_id.clone();
        {
            let mut state = lock(&self.state);
            if !result.phase_timings.is_empty() {
                state.timing.insert(id.clone(), result.phase_timings.clone());
            }
            if result.was_corrected && !result.corrections.is_empty() {
                state.corrections.insert(id.clone(), result.corrections.clone());
            }
        }
        if !result.leaked_files.is_empty() {
            lock(&self.tally)
                .leaked
                .insert(id.clone(), result.leaked_files.clone());
        }
        if !result.unattributed_leaks.is_empty() {
            lock(&self.tally)
                .unattributed_leaks
                .extend(result.unattributed_leaks.iter().cloned());
        }

        if result.interrupted {
            // Worktree is kept for pending recovery on the next run.
            lock(&self.state).clear_in_progress(&id);
            lock(&self.tally).interrupted.push(id.clone());
            info!(issue = %id, "issue interrupted; will be retried next run");
        } else if !result.success {
            let reason = result
                .error
                .clone()
                .unwrap_or_else(|| "unknown error".to_string());
            warn!(issue = %id, %reason, "issue failed");
            lock(&self.state).mark_failed(&id, reason);
            self.discard_worktree(&result).await;
        } else if result.should_close {
            let status = result
                .close_status
                .clone()
                .unwrap_or_else(|| DEFAULT_CLOSE_STATUS.to_string());
            let reason = result.close_reason.clone().unwrap_or_default();
            match self
                .lifecycle
                .close(&id, &result.issue_path, &status, &reason)
                .await
            {
                Ok(_) => {
                    lock(&self.state).mark_completed(&id);
                    lock(&self.tally).closed.push((id.clone(), status));
                }
                Err(e) => {
                    lock(&self.state).mark_failed(&id, format!("close failed: {:#}", e));
                }
            }
            self.discard_worktree(&result).await;
        } else if !self.merger.queue_merge(result.clone()) {
            lock(&self.state).mark_failed(&id, "merge could not be queued");
            self.discard_worktree(&result).await;
        }
        self.dirty.store(true, Ordering::SeqCst);
    }

    async fn discard_worktree(&self, result: &WorkerResult) {
        if result.worktree_path.as_os_str().is_empty() {
            return;
        }
        if let Err(e) = self
            .worktrees
            .remove(&result.worktree_path, &result.branch_name)
            .await
        {
            warn!(issue = %result.issue_id, error = %e, "failed to remove worktree");
        }
    }

    /// Mark merged issues completed, filing those the merge left active,
    /// and record merge failures.
    async fn sync_merges(&self) {
        for (result, outcome) in self.merger.merged_results() {
            let id = result.issue_id.clone();
            let already = lock(&self.state).completed_issues.contains(&id);
            if already {
                continue;
            }
            if outcome == MergeOutcome::MergedButUnfiled && !result.issue_path.as_os_str().is_empty() {
                let resolution = Resolution::completed(&result.branch_name, &result.changed_files);
                if let Err(e) = self.lifecycle.complete(&id, &result.issue_path, resolution).await {
                    warn!(issue = %id, error = %format!("{:#}", e), "merged but could not file issue");
                }
            }
            lock(&self.state).mark_completed(&id);
            lock(&self.tally).merged.push(id);
            self.dirty.store(true, Ordering::SeqCst);
        }

        for (id, reason) in self.merger.failed_merges() {
            let mut state = lock(&self.state);
            if state.failed_issues.contains_key(&id) || state.completed_issues.contains(&id) {
                continue;
            }
            state.mark_failed(&id, format!("merge failed: {}", reason));
            self.dirty.store(true, Ordering::SeqCst);
        }
    }

    /// Save if anything changed since the last save. Failures are logged.
    fn persist(&self, manager: &StateManager) {
        if !self.dirty.swap(false, Ordering::SeqCst) {
            return;
        }
        let mut state = lock(&self.state);
        if let Err(e) = manager.save(&mut state) {
            error!(error = %e, "failed to persist state");
            self.dirty.store(true, Ordering::SeqCst);
        }
    }
}

/// Per-run collaborators.
struct RunContext {
    repo: Arc<RepoMutex>,
    worktrees: Arc<WorktreeManager>,
    store: IssueStore,
    state_manager: StateManager,
    pool: WorkerPool,
    merger: Arc<MergeCoordinator>,
    recorder: Arc<Recorder>,
}

pub struct Orchestrator {
    config: ParallelConfig,
    repo_root: PathBuf,
    agent: Arc<dyn AgentInvoker>,
    registry: Arc<ProcessRegistry>,
    cancel: CancellationToken,
    handle_signals: bool,
}

impl Orchestrator {
    pub fn new(
        config: ParallelConfig,
        repo_root: impl Into<PathBuf>,
        agent: Arc<dyn AgentInvoker>,
        registry: Arc<ProcessRegistry>,
    ) -> Self {
        Self {
            config,
            repo_root: repo_root.into(),
            agent,
            registry,
            cancel: CancellationToken::new(),
            handle_signals: false,
        }
    }

    /// Use an externally owned token; cancelling it stops dispatch.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Install Ctrl-C / SIGTERM handlers for the duration of `run`.
    pub fn handle_signals(mut self, enabled: bool) -> Self {
        self.handle_signals = enabled;
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn run(&self) -> Result<RunReport, OrchestratorError> {
        self.config.validate()?;
        if !self.repo_root.join(".git").exists() {
            return Err(OrchestratorError::NotARepository(self.repo_root.clone()));
        }

        let signals = self
            .handle_signals
            .then(|| install_signal_handlers(self.cancel.clone(), Arc::clone(&self.registry)));
        let outcome = self.run_inner().await;
        if let Some(handle) = signals {
            handle.abort();
        }
        outcome
    }

    async fn run_inner(&self) -> Result<RunReport, OrchestratorError> {
        let started = Instant::now();
        let mut report = RunReport {
            dry_run: self.config.dry_run,
            ..Default::default()
        };
        let ctx = self.build_context();

        if !self.config.dry_run {
            let entries = self.gitignore_entries();
            if ensure_gitignore(&self.repo_root, &entries).context("Failed to update .gitignore")? {
                info!(entries = ?entries, "added run artifacts to .gitignore");
            }
        }

        if self.config.clean_start {
            ctx.state_manager.reset()?;
        } else if let Some(state) = ctx.state_manager.load() {
            info!(
                completed = state.completed_issues.len(),
                failed = state.failed_issues.len(),
                "resuming from saved state"
            );
            *lock(&ctx.recorder.state) = state;
        }

        if !self.config.clean_start {
            report.pending_worktrees = self.recover_pending(&ctx).await?;
        }
        if !self.config.dry_run {
            ctx.pool.cleanup_all_worktrees().await?;
        }

        let (plan, blockers) = self.plan(&ctx, &mut report)?;
        if self.config.dry_run {
            report.plan = plan;
            return Ok(report);
        }

        let executed = self.execute(&ctx, &plan, &blockers).await;

        let interrupted = self.cancel.is_cancelled();
        ctx.pool.shutdown(SHUTDOWN_TIMEOUT).await;
        ctx.merger.shutdown(SHUTDOWN_TIMEOUT).await;
        if !interrupted && let Err(e) = ctx.pool.cleanup_all_worktrees().await {
            warn!(error = %format!("{:#}", e), "final worktree cleanup failed");
        }
        executed?;

        self.finish(&ctx, &mut report, started, interrupted)?;
        report.plan = plan;
        Ok(report)
    }

    fn build_context(&self) -> RunContext {
        let root = self.repo_root.as_path();
        let repo = Arc::new(RepoMutex::new(root));
        let worktrees = Arc::new(WorktreeManager::new(
            Arc::clone(&repo),
            &self.config.worktree_base,
            self.config.worktree_copy_files.clone(),
        ));
        let lifecycle = Arc::new(IssueLifecycle::new(Arc::clone(&repo), &self.config.completed_dir));
        let exclusions = self.repo_exclusions();

        let merger = Arc::new(MergeCoordinator::new(
            Arc::clone(&repo),
            Arc::clone(&worktrees),
            Arc::clone(&lifecycle),
            MergeSettings {
                max_retries: self.config.max_merge_retries,
                stash_exclusions: exclusions.clone(),
                ..Default::default()
            },
        ));

        let worker_ctx = Arc::new(WorkerContext {
            repo: Arc::clone(&repo),
            worktrees: Arc::clone(&worktrees),
            agent: Arc::clone(&self.agent),
            settings: WorkerSettings {
                commands: AgentCommands {
                    ready: self.config.ready_command.clone(),
                    implement: self.config.implement_command.clone(),
                },
                timeout: self.config.issue_timeout(),
                require_code_changes: self.config.require_code_changes,
                issues_dir: self.config.issues_dir.clone(),
                leak_exclusions: exclusions,
            },
            terminating: CancellationToken::new(),
            activity: WorkerActivity::default(),
        });
        let pool = WorkerPool::new(worker_ctx, self.config.max_workers, Arc::clone(&self.registry));

        let recorder = Arc::new(Recorder {
            state: Mutex::new(OrchestratorState::default()),
            tally: Mutex::new(Tally::default()),
            dirty: AtomicBool::new(false),
            lifecycle,
            worktrees: Arc::clone(&worktrees),
            merger: Arc::clone(&merger),
        });

        RunContext {
            store: IssueStore::new(root, &self.config.issues_dir, &self.config.completed_dir),
            state_manager: StateManager::new(root.join(&self.config.state_file)),
            repo,
            worktrees,
            pool,
            merger,
            recorder,
        }
    }

    /// Run artifacts inside the repository, relative to its root.
    fn repo_exclusions(&self) -> Vec<PathBuf> {
        [&self.config.state_file, &self.config.worktree_base]
            .into_iter()
            .filter_map(|p| relative_to(&self.repo_root, p))
            .collect()
    }

    fn gitignore_entries(&self) -> Vec<String> {
        let mut entries = Vec::new();
        if let Some(state) = relative_to(&self.repo_root, &self.config.state_file) {
            entries.push(state.to_string_lossy().to_string());
        }
        if let Some(base) = relative_to(&self.repo_root, &self.config.worktree_base) {
            entries.push(format!("{}/", base.to_string_lossy().trim_end_matches('/')));
        }
        entries
    }

    async fn recover_pending(&self, ctx: &RunContext) -> Result<Vec<PendingWorktreeInfo>, OrchestratorError> {
        let mode = if self.config.dry_run && self.config.pending_mode() == PendingMode::Merge {
            PendingMode::Report
        } else {
            self.config.pending_mode()
        };
        if mode == PendingMode::Ignore {
            return Ok(Vec::new());
        }

        let pending = inspect_pending(&ctx.repo, &ctx.worktrees).await?;
        let with_work: Vec<&PendingWorktreeInfo> = pending.iter().filter(|p| p.has_work()).collect();
        if with_work.is_empty() {
            return Ok(pending);
        }

        match mode {
            PendingMode::Report => {
                for info in &with_work {
                    warn!(
                        branch = %info.branch_name,
                        commits = info.commits_ahead,
                        uncommitted = info.has_uncommitted_changes,
                        "leftover worktree from an earlier run will be cleaned up (use --merge-pending to keep it)"
                    );
                }
            }
            PendingMode::Merge => {
                let paths: HashMap<String, PathBuf> = ctx
                    .store
                    .scan()?
                    .into_iter()
                    .map(|issue| (issue.id, issue.path))
                    .collect();
                ctx.merger.start();
                for info in with_work {
                    let Some(id) = info.issue_id.as_deref() else {
                        continue;
                    };
                    if let Err(e) = commit_leftovers(info).await {
                        warn!(branch = %info.branch_name, error = %format!("{:#}", e), "skipping leftover worktree");
                        continue;
                    }
                    if let Some(result) = info.to_worker_result(paths.get(id).cloned()) {
                        info!(issue = id, branch = %info.branch_name, "merging leftover work");
                        ctx.recorder.mark_dispatched(id);
                        ctx.merger.queue_merge(result);
                    }
                }
                ctx.merger
                    .wait_for_completion(self.config.orchestrator_timeout())
                    .await;
                ctx.recorder.sync_merges().await;
                ctx.recorder.persist(&ctx.state_manager);
            }
            PendingMode::Ignore => {}
        }
        Ok(pending)
    }

    /// Select issues, build the graph and compute the (refined) wave plan.
    fn plan(&self, ctx: &RunContext, report: &mut RunReport) -> Result<(Vec<PlannedWave>, Blockers), OrchestratorError> {
        let scanned = ctx.store.scan()?;
        let filed = ctx.store.completed_ids()?;
        let settled = lock(&ctx.recorder.state).settled_ids();

        let all_known: HashSet<String> = scanned
            .iter()
            .map(|issue| issue.id.clone())
            .chain(filed.iter().cloned())
            .collect();
        let completed: HashSet<String> = filed
            .iter()
            .cloned()
            .chain(lock(&ctx.recorder.state).completed_issues.iter().cloned())
            .collect();
        let selected = select_issues(&self.config, scanned, &filed, &settled);
        info!(issues = selected.len(), "selected issues");

        let policy = if self.config.warn_unknown_blockers {
            UnknownBlockerPolicy::Warn
        } else {
            UnknownBlockerPolicy::Silent
        };
        let graph = IssueGraph::from_issues_with_policy(selected, &completed, &all_known, policy);
        report.graph_warnings = graph.warnings().to_vec();
        let blockers: Blockers = graph
            .issues()
            .filter_map(|issue| {
                graph
                    .blockers_of(&issue.id)
                    .filter(|set| !set.is_empty())
                    .map(|set| (issue.id.clone(), set.clone()))
            })
            .collect();

        let waves = graph.get_execution_waves(&completed)?;
        let plan = if self.config.overlap_detection {
            WaveRefiner::new(self.config.serialize_overlapping).refine_waves(waves)
        } else {
            plain_waves(waves)
        };
        info!(waves = plan.len(), "computed execution plan");
        Ok((plan, blockers))
    }

    async fn execute(&self, ctx: &RunContext, plan: &[PlannedWave], blockers: &Blockers) -> Result<(), OrchestratorError> {
        ctx.pool.start().await?;
        ctx.merger.start();
        ctx.recorder.dirty.store(true, Ordering::SeqCst);
        ctx.recorder.persist(&ctx.state_manager);

        for (index, wave) in plan.iter().enumerate() {
            if self.cancel.is_cancelled() {
                break;
            }
            info!(wave = index + 1, total = plan.len(), issues = ?wave.ids(), "starting wave");
            self.run_wave(ctx, wave, blockers).await?;
            self.drain_merges(ctx).await;
        }

        let timeout = self.config.orchestrator_timeout();
        if !ctx.pool.wait_idle(timeout).await {
            warn!(issues = ?ctx.pool.in_flight(), "workers exceeded the orchestrator timeout; terminating");
            ctx.pool.terminate_all_processes().await;
            ctx.pool.wait_idle(TERMINATE_GRACE).await;
        }
        self.drain_merges(ctx).await;
        Ok(())
    }

    async fn run_wave(&self, ctx: &RunContext, wave: &PlannedWave, blockers: &Blockers) -> Result<(), OrchestratorError> {
        // Earlier waves are fully merged by now, so their outcome is final.
        let mut queue = VecDeque::new();
        for issue in &wave.issues {
            let unmet = ctx.recorder.unmet_blockers(issue, blockers.get(&issue.id));
            if unmet.is_empty() {
                queue.push_back(issue.clone());
            } else {
                ctx.recorder.mark_blocked(&issue.id, unmet);
            }
        }

        loop {
            if self.cancel.is_cancelled() {
                info!(remaining = queue.len(), "shutdown requested; no further dispatch");
                ctx.recorder.persist(&ctx.state_manager);
                return Ok(());
            }
            if queue.is_empty() && ctx.pool.active_count() == 0 {
                return Ok(());
            }

            if queue.front().is_some_and(|issue| issue.priority.is_critical()) {
                if let Some(issue) = queue.pop_front() {
                    self.run_critical(ctx, issue).await?;
                }
                continue;
            }

            while ctx.pool.has_capacity()
                && queue.front().is_some_and(|issue| !issue.priority.is_critical())
            {
                let Some(issue) = queue.pop_front() else {
                    break;
                };
                self.dispatch(ctx, issue)?;
            }
            ctx.recorder.persist(&ctx.state_manager);

            tokio::select! {
                _ = tokio::time::sleep(POLL_INTERVAL) => {}
                _ = self.cancel.cancelled() => {}
            }
        }
    }

    fn dispatch(&self, ctx: &RunContext, issue: Issue) -> Result<tokio::task::JoinHandle<WorkerResult>, OrchestratorError> {
        debug!(issue = %issue.id, priority = %issue.priority, "dispatching");
        ctx.recorder.mark_dispatched(&issue.id);
        let recorder = Arc::clone(&ctx.recorder);
        let callback: CompletionCallback = Box::new(move |result| {
            async move { recorder.record(result).await }.boxed()
        });
        ctx.pool
            .submit(issue, Some(callback))
            .map_err(|e| OrchestratorError::Other(e.into()))
    }

    /// P0 issues run alone: drain parallel work and merges, run the issue,
    /// merge it before anything else is dispatched.
    async fn run_critical(&self, ctx: &RunContext, issue: Issue) -> Result<(), OrchestratorError> {
        info!(issue = %issue.id, "running critical issue sequentially");
        if !ctx.pool.wait_idle(self.config.orchestrator_timeout()).await {
            warn!(issues = ?ctx.pool.in_flight(), "parallel work still running before critical issue; terminating");
            ctx.pool.terminate_all_processes().await;
            if !ctx.pool.wait_idle(TERMINATE_GRACE).await {
                let running: Vec<String> = ctx.pool.in_flight().into_iter().map(|(id, _)| id).collect();
                ctx.recorder.mark_blocked(&issue.id, running);
                return Ok(());
            }
        }
        self.drain_merges(ctx).await;

        let id = issue.id.clone();
        let handle = self.dispatch(ctx, issue)?;
        if let Err(e) = handle.await {
            error!(issue = %id, error = %e, "critical issue task failed");
        }
        self.drain_merges(ctx).await;
        Ok(())
    }

    async fn drain_merges(&self, ctx: &RunContext) {
        if !ctx
            .merger
            .wait_for_completion(self.config.orchestrator_timeout())
            .await
        {
            warn!(pending = ctx.merger.pending(), "merge queue did not drain in time");
        }
        ctx.recorder.sync_merges().await;
        ctx.recorder.persist(&ctx.state_manager);
    }

    fn finish(
        &self,
        ctx: &RunContext,
        report: &mut RunReport,
        started: Instant,
        interrupted: bool,
    ) -> Result<(), OrchestratorError> {
        let tally = std::mem::take(&mut *lock(&ctx.recorder.tally));
        {
            let state = lock(&ctx.recorder.state);
            report.failed = state
                .failed_issues
                .iter()
                .filter(|(id, _)| tally.dispatched.contains(*id))
                .map(|(id, reason)| (id.clone(), reason.clone()))
                .collect();
            report.corrections = state
                .corrections
                .iter()
                .filter(|(id, _)| tally.dispatched.contains(*id))
                .map(|(id, c)| (id.clone(), c.clone()))
                .collect();
            report.issue_seconds = tally
                .dispatched
                .iter()
                .filter_map(|id| state.timing.get(id))
                .filter_map(|phases| phases.get("total"))
                .sum();
        }
        report.dispatched = tally.dispatched.len();
        report.merged = tally.merged;
        report.closed = tally.closed;
        report.interrupted_issues = tally.interrupted;
        report.blocked = tally.blocked;
        report.leaked_files = tally.leaked;
        report.unattributed_leaks = tally.unattributed_leaks;
        report.stash_pop_failures = ctx.merger.stash_pop_failures();
        report.interrupted = interrupted;
        report.wall_time = started.elapsed();

        if report.is_success() {
            ctx.state_manager.reset()?;
            debug!("run succeeded; state file removed");
        } else {
            ctx.recorder.dirty.store(true, Ordering::SeqCst);
            ctx.recorder.persist(&ctx.state_manager);
        }
        info!(
            merged = report.merged.len(),
            closed = report.closed.len(),
            failed = report.failed.len(),
            interrupted,
            "run finished"
        );
        Ok(())
    }
}

/// Active issues eligible for this run, in priority order.
pub fn select_issues(
    config: &ParallelConfig,
    scanned: Vec<Issue>,
    filed: &BTreeSet<String>,
    settled: &BTreeSet<String>,
) -> Vec<Issue> {
    let mut selected: Vec<Issue> = scanned
        .into_iter()
        .filter(|issue| !filed.contains(&issue.id) && !settled.contains(&issue.id))
        .filter(|issue| !config.skip_ids.contains(&issue.id))
        .filter(|issue| config.only_ids.is_empty() || config.only_ids.contains(&issue.id))
        .filter(|issue| config.allows_priority(issue.priority))
        .collect();
    sort_issues(&mut selected);
    if config.max_issues > 0 {
        selected.truncate(config.max_issues);
    }
    selected
}

/// Append missing entries to `.gitignore`. Returns whether the file changed.
pub fn ensure_gitignore(root: &Path, entries: &[String]) -> anyhow::Result<bool> {
    let path = root.join(".gitignore");
    let existing = if path.exists() {
        std::fs::read_to_string(&path)?
    } else {
        String::new()
    };
    let present: HashSet<&str> = existing
        .lines()
        .map(|line| line.trim().trim_start_matches('/').trim_end_matches('/'))
        .collect();
    let missing: Vec<&String> = entries
        .iter()
        .filter(|entry| !present.contains(entry.trim_end_matches('/')))
        .collect();
    if missing.is_empty() {
        return Ok(false);
    }

    let mut content = existing;
    if !content.is_empty() && !content.ends_with('\n') {
        content.push('\n');
    }
    for entry in missing {
        content.push_str(entry);
        content.push('\n');
    }
    std::fs::write(&path, content)?;
    Ok(true)
}

/// `path` relative to `root`, or `None` when it lies outside the repository.
fn relative_to(root: &Path, path: &Path) -> Option<PathBuf> {
    if path.is_relative() {
        Some(path.to_path_buf())
    } else {
        path.strip_prefix(root).ok().map(Path::to_path_buf)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
