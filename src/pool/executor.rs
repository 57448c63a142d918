//! Bounded concurrent executor for per-issue workers.
//!
//! The pool owns a semaphore sized to `max_workers`. Each submitted issue
//! runs on its own task holding a permit until the worker and its completion
//! callback have both finished, so `active_count` never undercounts work that
//! is still touching shared state.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::{Duration, Instant};

use anyhow::Result;
use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::Semaphore;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{info, warn};

use super::worker::{Worker, WorkerContext, WorkerResult};
use crate::agent::ProcessRegistry;
use crate::errors::PoolError;
use crate::issue::Issue;
use crate::tracker::CleanupReport;

/// Invoked exactly once with the worker's result.
pub type CompletionCallback = Box<dyn FnOnce(WorkerResult) -> BoxFuture<'static, ()> + Send>;

/// Grace period between SIGTERM and SIGKILL.
pub const TERMINATE_GRACE: Duration = Duration::from_secs(5);

struct InFlight {
    started_at: Instant,
    abort: AbortHandle,
}

pub struct WorkerPool {
    ctx: Arc<WorkerContext>,
    max_workers: usize,
    registry: Arc<ProcessRegistry>,
    semaphore: OnceLock<Arc<Semaphore>>,
    active: Arc<AtomicUsize>,
    in_flight: Arc<Mutex<HashMap<String, InFlight>>>,
    shutting_down: AtomicBool,
}

impl WorkerPool {
    pub fn new(ctx: Arc<WorkerContext>, max_workers: usize, registry: Arc<ProcessRegistry>) -> Self {
        Self {
            ctx,
            max_workers: max_workers.max(1),
            registry,
            semaphore: OnceLock::new(),
            active: Arc::new(AtomicUsize::new(0)),
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            shutting_down: AtomicBool::new(false),
        }
    }

    /// Create the bounded pool and the worktree base directory. Idempotent.
    pub async fn start(&self) -> Result<()> {
        self.ctx.worktrees.ensure_base_dir().await?;
        self.semaphore
            .get_or_init(|| Arc::new(Semaphore::new(self.max_workers)));
        Ok(())
    }

    pub fn is_started(&self) -> bool {
        self.semaphore.get().is_some()
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    /// Running workers plus completion callbacks still in flight.
    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn has_capacity(&self) -> bool {
        self.active_count() < self.max_workers
    }

    /// Ids of issues submitted and not yet fully complete, with elapsed time.
    pub fn in_flight(&self) -> Vec<(String, Duration)> {
        let mut items: Vec<(String, Duration)> = lock(&self.in_flight)
            .iter()
            .map(|(id, entry)| (id.clone(), entry.started_at.elapsed()))
            .collect();
        items.sort();
        items
    }

    /// Spawn processing of `issue`. `on_complete` fires once after the worker
    /// finishes and before the slot is released.
    pub fn submit(
        &self,
        issue: Issue,
        on_complete: Option<CompletionCallback>,
    ) -> Result<JoinHandle<WorkerResult>, PoolError> {
        let semaphore = self.semaphore.get().cloned().ok_or(PoolError::NotStarted)?;
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(PoolError::ShuttingDown);
        }

        let worker = Worker::new(Arc::clone(&self.ctx));
        let active = Arc::clone(&self.active);
        let in_flight = Arc::clone(&self.in_flight);
        let id = issue.id.clone();
        active.fetch_add(1, Ordering::SeqCst);

        // Held across spawn so the task cannot remove its entry before it exists.
        let mut tracked = lock(&self.in_flight);
        let handle = tokio::spawn(async move {
            let result = match semaphore.acquire_owned().await {
                Ok(_permit) => {
                    let mut result = match AssertUnwindSafe(worker.process(&issue))
                        .catch_unwind()
                        .await
                    {
                        Ok(result) => result,
                        Err(panic) => WorkerResult::failure(
                            &issue,
                            format!("worker panicked: {}", panic_message(panic.as_ref())),
                        ),
                    };
                    if let Some(callback) = on_complete
                        && let Err(panic) = AssertUnwindSafe(callback(result.clone()))
                            .catch_unwind()
                            .await
                    {
                        warn!(issue = %issue.id, "completion callback panicked: {}", panic_message(panic.as_ref()));
                        result.error.get_or_insert_with(|| "completion callback panicked".into());
                    }
                    result
                }
                Err(_) => {
                    let mut result = WorkerResult::failure(&issue, "worker pool closed before the issue started");
                    result.interrupted = true;
                    if let Some(callback) = on_complete {
                        callback(result.clone()).await;
                    }
                    result
                }
            };
            lock(&in_flight).remove(&issue.id);
            active.fetch_sub(1, Ordering::SeqCst);
            result
        });
        tracked.insert(
            id,
            InFlight {
                started_at: Instant::now(),
                abort: handle.abort_handle(),
            },
        );
        Ok(handle)
    }

    /// Wait until nothing is active. Returns `false` on timeout.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.active_count() == 0 {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// Terminate every tracked agent process group (SIGTERM, grace, SIGKILL).
    /// Results of workers cut short this way are marked interrupted.
    pub async fn terminate_all_processes(&self) -> usize {
        self.ctx.terminating.cancel();
        self.registry.terminate_all(TERMINATE_GRACE).await
    }

    /// Best-effort removal of every worktree and worker branch.
    pub async fn cleanup_all_worktrees(&self) -> Result<CleanupReport> {
        self.ctx.worktrees.cleanup_all().await
    }

    /// Stop accepting work, give in-flight work `timeout` to finish, then
    /// terminate agents and abort whatever is left.
    pub async fn shutdown(&self, timeout: Duration) {
        self.shutting_down.store(true, Ordering::SeqCst);
        if let Some(semaphore) = self.semaphore.get() {
            semaphore.close();
        }
        if self.wait_idle(timeout).await {
            return;
        }

        let stragglers: Vec<String> = self.in_flight().into_iter().map(|(id, _)| id).collect();
        warn!(issues = ?stragglers, "workers still running at shutdown; terminating");
        self.terminate_all_processes().await;
        if self.wait_idle(TERMINATE_GRACE).await {
            return;
        }

        let mut tracked = lock(&self.in_flight);
        for (id, entry) in tracked.drain() {
            info!(issue = %id, "aborting worker task");
            entry.abort.abort();
        }
        self.active.store(0, Ordering::SeqCst);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
