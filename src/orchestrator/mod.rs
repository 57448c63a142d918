//! Run orchestration: planning, dispatch, state persistence, recovery and
//! shutdown handling.

pub mod lifecycle;
pub mod recovery;
pub mod runner;
pub mod shutdown;
pub mod state;

pub use lifecycle::{IssueLifecycle, Resolution};
pub use recovery::PendingWorktreeInfo;
pub use runner::{Orchestrator, RunReport};
pub use shutdown::INTERRUPTED_EXIT_CODE;
pub use state::{OrchestratorState, StateManager};
