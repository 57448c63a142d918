//! Plain-terminal rendering of the wave plan and the run summary.

use console::style;
use std::fmt::Write as _;
use std::time::Duration;

use super::icons::{BLOCKER, CHECK, CLOCK, CLOSED, CROSS, MERGED, PAUSED, SPARKLE, WARN, WAVE};
use crate::dag::PlannedWave;
use crate::orchestrator::RunReport;
use crate::orchestrator::recovery::PendingWorktreeInfo;

const RULE_WIDTH: usize = 60;

fn rule() -> String {
    style("═".repeat(RULE_WIDTH)).cyan().to_string()
}

pub fn render_plan(plan: &[PlannedWave]) -> String {
    let mut out = String::new();
    let total: usize = plan.iter().map(|w| w.issues.len()).sum();
    let _ = writeln!(out, "\n{} Execution plan", rule());
    let _ = writeln!(
        out,
        "  {} issues in {} waves",
        style(total).yellow().bold(),
        style(plan.len()).yellow().bold()
    );
    let _ = writeln!(out);

    for (i, wave) in plan.iter().enumerate() {
        let ids = wave.ids().join(", ");
        let parallel = if wave.issues.len() > 1 {
            format!(" {}", style("(parallel)").dim())
        } else {
            String::new()
        };
        let _ = writeln!(
            out,
            "  {}Wave {}: [{}]{}",
            WAVE,
            style(i + 1).cyan(),
            style(ids).yellow(),
            parallel
        );
        if let Some(note) = &wave.note {
            let _ = writeln!(
                out,
                "      {}split {}/{} of wave {} on {}",
                BLOCKER,
                note.sub_wave_index + 1,
                note.total_sub_waves,
                note.parent_wave_index + 1,
                style(note.contended_paths.join(", ")).dim()
            );
        }
    }

    let _ = writeln!(out);
    let _ = writeln!(out, "{}", rule());
    out
}

pub fn print_plan(plan: &[PlannedWave]) {
    print!("{}", render_plan(plan));
}

pub fn render_pending(pending: &[PendingWorktreeInfo]) -> String {
    let mut out = String::new();
    for info in pending.iter().filter(|p| p.has_work()) {
        let _ = writeln!(
            out,
            "{}leftover {} ({}): {} commit(s) ahead{}",
            WARN,
            style(&info.branch_name).yellow(),
            info.issue_id.as_deref().unwrap_or("unknown issue"),
            info.commits_ahead,
            if info.has_uncommitted_changes {
                ", uncommitted changes"
            } else {
                ""
            }
        );
    }
    out
}

pub fn render_summary(report: &RunReport) -> String {
    let mut out = String::new();
    let _ = writeln!(out);
    let _ = writeln!(out, "{}", rule());
    if report.interrupted {
        let _ = writeln!(out, "{}Run {}", PAUSED, style("INTERRUPTED").yellow().bold());
    } else if report.is_success() {
        let _ = writeln!(
            out,
            "{}Run {} {}",
            SPARKLE,
            style("COMPLETE").green().bold(),
            SPARKLE
        );
    } else {
        let _ = writeln!(out, "{}Run {}", CROSS, style("FINISHED WITH FAILURES").red().bold());
    }
    let _ = writeln!(out, "{}", rule());
    let _ = writeln!(out);

    let _ = writeln!(
        out,
        "{}Issues: {}/{} completed",
        CLOCK,
        style(report.completed_count()).green().bold(),
        report.dispatched
    );
    let _ = writeln!(
        out,
        "     Duration: {}",
        style(format_duration(report.wall_time)).cyan()
    );
    if let Some(speedup) = report.speedup() {
        let _ = writeln!(out, "     Estimated speedup: {}", style(format!("{:.1}x", speedup)).cyan());
    }

    for id in &report.merged {
        let _ = writeln!(out, "  {}{}", MERGED, id);
    }
    for (id, status) in &report.closed {
        let _ = writeln!(out, "  {}{} {}", CLOSED, id, style(format!("({})", status)).dim());
    }
    for (id, reason) in &report.failed {
        let _ = writeln!(out, "  {}{} {}", CROSS, id, style(reason).red());
    }
    for id in &report.interrupted_issues {
        let _ = writeln!(out, "  {}{} {}", PAUSED, id, style("(will retry next run)").dim());
    }
    for (id, blockers) in &report.blocked {
        let _ = writeln!(
            out,
            "  {}{} {}",
            BLOCKER,
            id,
            style(format!("(blocked by {}; will retry next run)", blockers.join(", "))).yellow()
        );
    }

    if !report.corrections.is_empty() {
        let total: usize = report.corrections.values().map(Vec::len).sum();
        let _ = writeln!(
            out,
            "\n{}{} issue(s) corrected before implementation ({} correction(s))",
            CHECK,
            report.corrections.len(),
            total
        );
    }
    for (id, files) in &report.leaked_files {
        let _ = writeln!(
            out,
            "{}{} wrote outside its worktree; reverted: {}",
            WARN,
            id,
            files.join(", ")
        );
    }
    if !report.unattributed_leaks.is_empty() {
        let files: Vec<&str> = report.unattributed_leaks.iter().map(String::as_str).collect();
        let _ = writeln!(
            out,
            "{}changes of unknown origin in the main checkout were reverted: {}",
            WARN,
            files.join(", ")
        );
    }
    for (id, detail) in &report.stash_pop_failures {
        let _ = writeln!(
            out,
            "{}local changes stashed while merging {} could not be restored; recover them with `git stash list` ({})",
            WARN,
            style(id).yellow(),
            detail
        );
    }
    let _ = writeln!(out);
    out
}

pub fn print_summary(report: &RunReport) {
    print!("{}", render_summary(report));
}

pub fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    if secs >= 3600 {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    } else if secs >= 60 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else if secs > 0 {
        format!("{}s", secs)
    } else {
        format!("{}ms", d.as_millis())
    }
}
