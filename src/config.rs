//! Run configuration for parallel issue execution.
//!
//! Settings are layered: built-in defaults, then `.forge/parallel.toml`
//! (or an explicit `--config` file), then CLI flags.
//!
//! # Configuration File Format
//!
//! ```toml
//! max_workers = 3
//! priority_filter = ["P0", "P1", "P2"]
//! timeout_per_issue = 1800
//! overlap_detection = true
//! worktree_copy_files = [".env"]
//! ready_command = "claude -p \"/ready-issue {issue_id}\""
//! implement_command = "claude -p \"/manage-issue {issue_id}\""
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::errors::OrchestratorError;
use crate::issue::Priority;

/// Default location of the config file, relative to the project root.
pub const CONFIG_FILE: &str = ".forge/parallel.toml";

/// What to do with worktrees left behind by an earlier run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingMode {
    /// Merge leftover work that has commits ahead of the base.
    Merge,
    /// Report leftovers, then clean them up.
    Report,
    /// Skip inspection entirely.
    Ignore,
}

impl std::fmt::Display for PendingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PendingMode::Merge => write!(f, "merge"),
            PendingMode::Report => write!(f, "report"),
            PendingMode::Ignore => write!(f, "ignore"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParallelConfig {
    /// Maximum number of concurrent workers
    pub max_workers: usize,
    /// Priorities eligible for this run
    pub priority_filter: Vec<Priority>,
    /// Cap on issues processed in one run (0 = unlimited)
    pub max_issues: usize,
    /// Per-issue agent timeout in seconds
    pub timeout_per_issue: u64,
    /// Overall wait for outstanding workers in seconds (0 = derived)
    pub orchestrator_timeout: u64,
    pub only_ids: BTreeSet<String>,
    pub skip_ids: BTreeSet<String>,
    pub dry_run: bool,
    /// Discard persisted state and skip leftover-worktree inspection
    pub clean_start: bool,
    pub merge_pending: bool,
    pub ignore_pending: bool,
    /// Split waves whose issues reference the same files
    pub overlap_detection: bool,
    /// When overlaps are found, run contended issues in separate sub-waves
    pub serialize_overlapping: bool,
    pub worktree_base: PathBuf,
    pub state_file: PathBuf,
    pub issues_dir: PathBuf,
    pub completed_dir: PathBuf,
    /// Agent command for the readiness check (`{issue_id}`, `{issue_path}`, `{title}`)
    pub ready_command: String,
    /// Agent command for the implementation phase
    pub implement_command: String,
    pub max_merge_retries: u32,
    /// Fail issues whose diff touches only docs/text files
    pub require_code_changes: bool,
    /// Local-only files copied from the main checkout into each worktree
    pub worktree_copy_files: Vec<String>,
    /// Warn when a blocker id is unknown everywhere (edges are dropped either way)
    pub warn_unknown_blockers: bool,
}

fn default_ready_command() -> String {
    "claude --dangerously-skip-permissions -p \"/ready-issue {issue_id}\"".to_string()
}

fn default_implement_command() -> String {
    "claude --dangerously-skip-permissions -p \"/manage-issue {issue_id}\"".to_string()
}

fn default_worktree_copy_files() -> Vec<String> {
    vec![".claude/settings.local.json".to_string(), ".env".to_string()]
}

impl Default for ParallelConfig {
    fn default() -> Self {
        Self {
            max_workers: 2,
            priority_filter: Priority::ALL.to_vec(),
            max_issues: 0,
            timeout_per_issue: 3600,
            orchestrator_timeout: 0,
            only_ids: BTreeSet::new(),
            skip_ids: BTreeSet::new(),
            dry_run: false,
            clean_start: false,
            merge_pending: false,
            ignore_pending: false,
            overlap_detection: false,
            serialize_overlapping: true,
            worktree_base: PathBuf::from(".worktrees"),
            state_file: PathBuf::from(".parallel-state.json"),
            issues_dir: PathBuf::from(".issues"),
            completed_dir: PathBuf::from(".issues/completed"),
            ready_command: default_ready_command(),
            implement_command: default_implement_command(),
            max_merge_retries: 2,
            require_code_changes: true,
            worktree_copy_files: default_worktree_copy_files(),
            warn_unknown_blockers: true,
        }
    }
}

impl ParallelConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse parallel.toml")
    }

    /// Load `.forge/parallel.toml` under `project_dir`, or defaults if absent.
    pub fn load_or_default(project_dir: &Path) -> Result<Self> {
        let config_path = project_dir.join(CONFIG_FILE);
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn validate(&self) -> Result<(), OrchestratorError> {
        if self.max_workers == 0 {
            return Err(OrchestratorError::InvalidConfig(
                "max_workers must be at least 1".into(),
            ));
        }
        if self.merge_pending && self.ignore_pending {
            return Err(OrchestratorError::InvalidConfig(
                "merge_pending and ignore_pending are mutually exclusive".into(),
            ));
        }
        if self.priority_filter.is_empty() {
            return Err(OrchestratorError::InvalidConfig(
                "priority_filter must name at least one priority".into(),
            ));
        }
        if self.timeout_per_issue == 0 {
            return Err(OrchestratorError::InvalidConfig(
                "timeout_per_issue must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn pending_mode(&self) -> PendingMode {
        if self.ignore_pending {
            PendingMode::Ignore
        } else if self.merge_pending {
            PendingMode::Merge
        } else {
            PendingMode::Report
        }
    }

    pub fn issue_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_per_issue)
    }

    /// Overall wait for stragglers once dispatch stops.
    pub fn orchestrator_timeout(&self) -> Duration {
        if self.orchestrator_timeout > 0 {
            Duration::from_secs(self.orchestrator_timeout)
        } else {
            Duration::from_secs(self.timeout_per_issue + 300)
        }
    }

    pub fn allows_priority(&self, priority: Priority) -> bool {
        self.priority_filter.contains(&priority)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults() {
        let config = ParallelConfig::default();
        assert_eq!(config.max_workers, 2);
        assert_eq!(config.timeout_per_issue, 3600);
        assert!(config.serialize_overlapping);
        assert!(!config.overlap_detection);
        assert_eq!(config.pending_mode(), PendingMode::Report);
        assert_eq!(config.priority_filter.len(), 6);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_partial_file_keeps_defaults() {
        let config = ParallelConfig::parse(
            r#"
max_workers = 4
priority_filter = ["P0", "P1"]
overlap_detection = true
"#,
        )
        .unwrap();
        assert_eq!(config.max_workers, 4);
        assert_eq!(config.priority_filter, vec![Priority::P0, Priority::P1]);
        assert!(config.overlap_detection);
        assert_eq!(config.state_file, PathBuf::from(".parallel-state.json"));
        assert!(!config.allows_priority(Priority::P3));
    }

    #[test]
    fn test_parse_rejects_unknown_priority() {
        assert!(ParallelConfig::parse("priority_filter = [\"P7\"]").is_err());
    }

    #[test]
    fn test_validate_rejects_conflicts() {
        let config = ParallelConfig {
            merge_pending: true,
            ignore_pending: true,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(OrchestratorError::InvalidConfig(_))
        ));

        let config = ParallelConfig {
            max_workers: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_orchestrator_timeout_derived() {
        let config = ParallelConfig {
            timeout_per_issue: 100,
            ..Default::default()
        };
        assert_eq!(config.orchestrator_timeout(), Duration::from_secs(400));
        let config = ParallelConfig {
            orchestrator_timeout: 10,
            ..Default::default()
        };
        assert_eq!(config.orchestrator_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn test_load_or_default() {
        let dir = tempdir().unwrap();
        let config = ParallelConfig::load_or_default(dir.path()).unwrap();
        assert_eq!(config, ParallelConfig::default());

        std::fs::create_dir_all(dir.path().join(".forge")).unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE), "max_workers = 7\n").unwrap();
        let config = ParallelConfig::load_or_default(dir.path()).unwrap();
        assert_eq!(config.max_workers, 7);
    }
}
