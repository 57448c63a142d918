//! Typed error hierarchy for forge-parallel.
//!
//! One enum per subsystem:
//! - `GraphError`: dependency graph failures (cycles)
//! - `GitError`: git subprocess failures
//! - `WorkerError`: per-issue workflow failures
//! - `PoolError`: worker pool misuse
//! - `OrchestratorError`: run-level failures that abort before dispatch

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Errors from dependency graph construction and ordering.
#[derive(Debug, Error)]
pub enum GraphError {
    #[error("Dependency cycle detected: {}", format_cycles(.cycles))]
    Cycle { cycles: Vec<Vec<String>> },
}

fn format_cycles(cycles: &[Vec<String>]) -> String {
    cycles
        .iter()
        .map(|cycle| {
            let mut path = cycle.clone();
            if let Some(first) = cycle.first() {
                path.push(first.clone());
            }
            path.join(" -> ")
        })
        .collect::<Vec<_>>()
        .join("; ")
}

/// Errors from running git as a subprocess.
#[derive(Debug, Error)]
pub enum GitError {
    #[error("Failed to spawn git {args}: {source}")]
    SpawnFailed {
        args: String,
        #[source]
        source: std::io::Error,
    },

    #[error("git {args} timed out after {}s", .timeout.as_secs())]
    TimedOut { args: String, timeout: Duration },

    #[error("git {args} exited with code {code}: {stderr}")]
    CommandFailed {
        args: String,
        code: i32,
        stderr: String,
    },
}

/// Errors from a single issue's workflow inside a worker.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Issue not ready: {reason}")]
    NotReady { reason: String },

    #[error("{phase} phase failed with exit code {exit_code}: {detail}")]
    AgentFailed {
        phase: String,
        exit_code: i32,
        detail: String,
    },

    #[error("{phase} phase timed out after {secs}s")]
    AgentTimedOut { phase: String, secs: u64 },

    #[error("no work detected: {0}")]
    NoWorkDone(String),

    #[error("Worktree setup failed at {path}: {source}")]
    WorktreeSetup {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },

    #[error("Interrupted by shutdown request")]
    Interrupted,

    #[error(transparent)]
    Git(#[from] GitError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors from misusing the worker pool.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("Worker pool has not been started")]
    NotStarted,

    #[error("Worker pool is shutting down")]
    ShuttingDown,
}

/// Errors that abort an orchestrator run.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Structural error: {0}")]
    Structural(#[from] GraphError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Failed to write state file at {path}: {source}")]
    StateWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{0} is not a git repository")]
    NotARepository(PathBuf),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
