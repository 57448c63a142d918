//! `run` and `plan`.

use anyhow::Result;
use clap::Args;
use console::style;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use forge_parallel::agent::{ProcessRegistry, ShellAgent};
use forge_parallel::config::ParallelConfig;
use forge_parallel::issue::Priority;
use forge_parallel::orchestrator::Orchestrator;
use forge_parallel::ui::icons::WARN;
use forge_parallel::ui::report::{print_plan, print_summary, render_pending};

/// Flags layered over the config file.
#[derive(Args, Debug, Clone, Default)]
pub struct RunArgs {
    /// Maximum concurrent workers
    #[arg(short, long)]
    pub workers: Option<usize>,

    /// Only run these priorities (comma-separated, e.g. P0,P1)
    #[arg(short, long, value_delimiter = ',')]
    pub priority: Vec<String>,

    /// Stop after this many issues (0 = unlimited)
    #[arg(long)]
    pub max_issues: Option<usize>,

    /// Per-issue agent timeout in seconds
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Only run these issue ids (comma-separated)
    #[arg(long, value_delimiter = ',')]
    pub only: Vec<String>,

    /// Skip these issue ids (comma-separated)
    #[arg(long, value_delimiter = ',')]
    pub skip: Vec<String>,

    #[arg(long)]
    pub dry_run: bool,

    /// Discard saved state and leftover worktrees
    #[arg(long)]
    pub clean_start: bool,

    /// Merge committed work found in leftover worktrees
    #[arg(long, conflicts_with = "ignore_pending")]
    pub merge_pending: bool,

    /// Do not inspect leftover worktrees
    #[arg(long)]
    pub ignore_pending: bool,

    /// Split waves whose issues mention the same files
    #[arg(long)]
    pub overlap_detection: bool,

    /// With overlap detection, only warn instead of splitting
    #[arg(long)]
    pub no_serialize_overlapping: bool,

    #[arg(long)]
    pub worktree_base: Option<PathBuf>,

    #[arg(long)]
    pub state_file: Option<PathBuf>,
}

impl RunArgs {
    pub fn apply(&self, config: &mut ParallelConfig) -> Result<()> {
        if let Some(workers) = self.workers {
            config.max_workers = workers;
        }
        if !self.priority.is_empty() {
            config.priority_filter = self
                .priority
                .iter()
                .map(|p| p.parse::<Priority>())
                .collect::<Result<Vec<_>>>()?;
        }
        if let Some(max) = self.max_issues {
            config.max_issues = max;
        }
        if let Some(timeout) = self.timeout {
            config.timeout_per_issue = timeout;
        }
        if !self.only.is_empty() {
            config.only_ids = self.only.iter().map(|id| id.trim().to_uppercase()).collect();
        }
        config
            .skip_ids
            .extend(self.skip.iter().map(|id| id.trim().to_uppercase()));
        config.dry_run |= self.dry_run;
        config.clean_start |= self.clean_start;
        config.merge_pending |= self.merge_pending;
        config.ignore_pending |= self.ignore_pending;
        config.overlap_detection |= self.overlap_detection;
        if self.no_serialize_overlapping {
            config.serialize_overlapping = false;
        }
        if let Some(base) = &self.worktree_base {
            config.worktree_base = base.clone();
        }
        if let Some(state) = &self.state_file {
            config.state_file = state.clone();
        }
        Ok(())
    }
}

/// Returns the process exit code.
pub async fn cmd_run(
    project_dir: &Path,
    config_path: Option<&Path>,
    args: &RunArgs,
    force_dry_run: bool,
) -> Result<i32> {
    let mut config = super::load_config(project_dir, config_path)?;
    args.apply(&mut config)?;
    config.dry_run |= force_dry_run;

    let registry = Arc::new(ProcessRegistry::new());
    let agent = Arc::new(ShellAgent::new(Arc::clone(&registry)));
    let orchestrator = Orchestrator::new(config, project_dir, agent, registry).handle_signals(true);

    let report = orchestrator.run().await?;

    eprint!("{}", render_pending(&report.pending_worktrees));
    for warning in &report.graph_warnings {
        eprintln!("{}{}", WARN, style(warning).yellow());
    }
    if report.dry_run {
        print_plan(&report.plan);
    } else {
        print_summary(&report);
    }
    Ok(report.exit_code())
}
