//! Worker pool: bounded parallel execution of the per-issue workflow.

pub mod executor;
pub mod worker;

pub use executor::{CompletionCallback, TERMINATE_GRACE, WorkerPool};
pub use worker::{Worker, WorkerActivity, WorkerContext, WorkerResult, WorkerSettings, is_non_code};
