//! Dependency graph and wave planning for parallel issue execution.
//!
//! ## Architecture
//!
//! 1. **Builder** - Constructs an [`IssueGraph`] from issue `blocked_by` / `blocks` declarations
//! 2. **Scheduler** - Readiness, topological order, cycle detection and execution waves
//! 3. **Refiner** - Splits waves whose issues are likely to edit the same files
//!
//! ## Example
//!
//! ```
//! use std::collections::HashSet;
//! use forge_parallel::dag::{IssueGraph, wave_ids};
//! use forge_parallel::issue::{Issue, Priority};
//!
//! let issues = vec![
//!     Issue::new("A", Priority::P2),
//!     Issue::new("B", Priority::P2).with_blocked_by(["A"]),
//!     Issue::new("C", Priority::P2).with_blocked_by(["A"]),
//! ];
//! let graph = IssueGraph::from_issues(issues, &HashSet::new(), &HashSet::new());
//! let waves = graph.get_execution_waves(&HashSet::new()).unwrap();
//! assert_eq!(wave_ids(&waves), vec![vec!["A"], vec!["B", "C"]]);
//! ```

pub mod builder;
pub mod refiner;
pub mod scheduler;

pub use builder::{IssueGraph, UnknownBlockerPolicy};
pub use refiner::{PlannedWave, WaveContentionNote, WaveRefiner, extract_file_paths, plain_waves};
pub use scheduler::wave_ids;
