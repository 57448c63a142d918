//! Git integration: subprocess runner, main-checkout lock and worktree management.

pub mod git;
pub mod repo_lock;
pub mod worktree;

pub use git::{GitOutput, StatusEntry, run_git};
pub use repo_lock::{RepoGuard, RepoMutex};
pub use worktree::{CleanupReport, Worktree, WorktreeManager};
