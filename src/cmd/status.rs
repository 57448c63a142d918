//! `status` and `clean`.

use anyhow::Result;
use console::style;
use std::path::Path;
use std::sync::Arc;

use forge_parallel::orchestrator::StateManager;
use forge_parallel::orchestrator::recovery::inspect_pending;
use forge_parallel::tracker::{RepoMutex, WorktreeManager};
use forge_parallel::ui::report::render_pending;

pub async fn cmd_status(project_dir: &Path, config_path: Option<&Path>) -> Result<i32> {
    let config = super::load_config(project_dir, config_path)?;
    let manager = StateManager::new(project_dir.join(&config.state_file));

    println!();
    println!("Parallel Run Status");
    println!("===================");
    println!();

    match manager.load() {
        None => println!("No saved run state."),
        Some(state) => {
            println!(
                "Started:    {}",
                state.started_at.format("%Y-%m-%d %H:%M:%S UTC")
            );
            println!(
                "Checkpoint: {}",
                state.last_checkpoint.format("%Y-%m-%d %H:%M:%S UTC")
            );
            println!(
                "Completed:  {}",
                style(state.completed_issues.len()).green()
            );
            println!("Failed:     {}", style(state.failed_issues.len()).red());
            for (id, reason) in &state.failed_issues {
                println!("  {} {}", id, style(reason).dim());
            }
            if !state.in_progress_issues.is_empty() {
                let ids: Vec<&str> = state.in_progress_issues.iter().map(String::as_str).collect();
                println!("In progress: {}", ids.join(", "));
            }
        }
    }

    if project_dir.join(".git").exists() {
        let repo = Arc::new(RepoMutex::new(project_dir));
        let worktrees = WorktreeManager::new(Arc::clone(&repo), &config.worktree_base, Vec::new());
        let pending = inspect_pending(&repo, &worktrees).await?;
        if !pending.is_empty() {
            println!();
            println!("Leftover worktrees: {}", pending.len());
            print!("{}", render_pending(&pending));
        }
    }
    println!();
    Ok(0)
}

pub async fn cmd_clean(project_dir: &Path, config_path: Option<&Path>, remove_state: bool) -> Result<i32> {
    let config = super::load_config(project_dir, config_path)?;
    let repo = Arc::new(RepoMutex::new(project_dir));
    let worktrees = WorktreeManager::new(repo, &config.worktree_base, Vec::new());

    let report = worktrees.cleanup_all().await?;
    println!(
        "Removed {} worktree(s) and {} branch(es)",
        report.removed_worktrees, report.deleted_branches
    );
    for error in &report.errors {
        eprintln!("  {}", style(error).red());
    }

    if remove_state {
        let manager = StateManager::new(project_dir.join(&config.state_file));
        if manager.exists() {
            manager.reset()?;
            println!("Deleted {}", manager.path().display());
        }
    }
    Ok(if report.errors.is_empty() { 0 } else { 1 })
}
