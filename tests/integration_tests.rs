//! Integration tests for forge-parallel
//!
//! These drive the binary against throwaway git repositories.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use git2::{Repository, RepositoryInitOptions};
use predicates::prelude::*;
use std::fs;
use std::path::Path;
use tempfile::TempDir;

fn forge_parallel() -> Command {
    cargo_bin_cmd!("forge-parallel")
}

/// Commit every change in the working tree.
fn commit_all(dir: &Path, msg: &str) {
    let repo = Repository::open(dir).unwrap();
    let mut index = repo.index().unwrap();
    index
        .add_all(["*"].iter(), git2::IndexAddOption::DEFAULT, None)
        .unwrap();
    index.write().unwrap();
    let tree = repo.find_tree(index.write_tree().unwrap()).unwrap();
    let sig = git2::Signature::now("test", "test@test.com").unwrap();
    let parents = match repo.head() {
        Ok(head) => vec![head.peel_to_commit().unwrap()],
        Err(_) => vec![],
    };
    let parent_refs: Vec<&git2::Commit> = parents.iter().collect();
    repo.commit(Some("HEAD"), &sig, &sig, msg, &tree, &parent_refs)
        .unwrap();
}

fn write(dir: &Path, rel: &str, content: &str) {
    let path = dir.join(rel);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, content).unwrap();
}

/// A repository on `main` with a README and the run artifacts ignored.
fn create_repo() -> TempDir {
    let dir = TempDir::new().unwrap();
    let mut opts = RepositoryInitOptions::new();
    opts.initial_head("main");
    let repo = Repository::init_opts(dir.path(), &opts).unwrap();
    let mut config = repo.config().unwrap();
    config.set_str("user.name", "test").unwrap();
    config.set_str("user.email", "test@test.com").unwrap();
    config.set_bool("commit.gpgsign", false).unwrap();
    write(dir.path(), ".gitignore", ".worktrees/\n.parallel-state.json\n");
    write(dir.path(), "README.md", "# test\n");
    commit_all(dir.path(), "init");
    dir
}

fn add_issue(dir: &Path, name: &str, body: &str) {
    write(dir, &format!(".issues/bugs/{}", name), body);
    commit_all(dir, &format!("add {}", name));
}

// =============================================================================
// Basic CLI Tests
// =============================================================================

mod cli_basics {
    use super::*;

    #[test]
    fn test_help() {
        forge_parallel()
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("run"))
            .stdout(predicate::str::contains("plan"));
    }

    #[test]
    fn test_version() {
        forge_parallel().arg("--version").assert().success();
    }

    #[test]
    fn test_conflicting_pending_flags_rejected() {
        forge_parallel()
            .args(["run", "--merge-pending", "--ignore-pending"])
            .assert()
            .failure();
    }

    #[test]
    fn test_status_without_state() {
        let dir = create_repo();
        forge_parallel()
            .current_dir(dir.path())
            .arg("status")
            .assert()
            .success()
            .stdout(predicate::str::contains("No saved run state"));
    }
}

// =============================================================================
// Planning
// =============================================================================

mod planning {
    use super::*;

    #[test]
    fn test_plan_orders_waves_by_blockers() {
        let dir = create_repo();
        add_issue(dir.path(), "P1-BUG-001-first.md", "# BUG-001: First\n");
        add_issue(
            dir.path(),
            "P2-BUG-002-second.md",
            "# BUG-002: Second\n\n## Blocked By\n\n- BUG-001\n",
        );
        add_issue(dir.path(), "P2-BUG-003-third.md", "# BUG-003: Third\n");

        forge_parallel()
            .current_dir(dir.path())
            .arg("plan")
            .assert()
            .success()
            .stdout(predicate::str::contains("3 issues in 2 waves"))
            .stdout(predicate::str::contains("[BUG-001, BUG-003]"))
            .stdout(predicate::str::contains("[BUG-002]"));

        assert!(!dir.path().join(".parallel-state.json").exists());
    }

    #[test]
    fn test_plan_respects_priority_filter() {
        let dir = create_repo();
        add_issue(dir.path(), "P1-BUG-001-first.md", "# First\n");
        add_issue(dir.path(), "P4-BUG-002-later.md", "# Later\n");

        forge_parallel()
            .current_dir(dir.path())
            .args(["plan", "--priority", "P0,P1"])
            .assert()
            .success()
            .stdout(predicate::str::contains("1 issues in 1 waves"))
            .stdout(predicate::str::contains("BUG-002").not());
    }

    #[test]
    fn test_cycle_fails_without_state() {
        let dir = create_repo();
        add_issue(dir.path(), "P1-BUG-001-a.md", "# A\n\n## Blocked By\n\n- BUG-002\n");
        add_issue(dir.path(), "P1-BUG-002-b.md", "# B\n\n## Blocked By\n\n- BUG-001\n");

        forge_parallel()
            .current_dir(dir.path())
            .arg("run")
            .assert()
            .failure()
            .stderr(predicate::str::contains("Dependency cycle detected"));

        assert!(!dir.path().join(".parallel-state.json").exists());
    }

    #[test]
    fn test_not_a_repository() {
        let dir = TempDir::new().unwrap();
        forge_parallel()
            .current_dir(dir.path())
            .arg("plan")
            .assert()
            .failure()
            .stderr(predicate::str::contains("not a git repository"));
    }
}

// =============================================================================
// End-to-end runs with a shell agent
// =============================================================================

mod runs {
    use super::*;

    fn configure(dir: &Path, ready: &str, implement: &str) {
        let toml = format!(
            "max_workers = 2\ntimeout_per_issue = 60\nready_command = {:?}\nimplement_command = {:?}\n",
            ready, implement
        );
        write(dir, ".forge/parallel.toml", &toml);
        commit_all(dir, "configure");
    }

    #[test]
    fn test_run_merges_and_files_issues() {
        let dir = create_repo();
        configure(
            dir.path(),
            "echo 'VERDICT: READY'",
            "mkdir -p src && echo '// {title}' > src/{issue_id}.rs",
        );
        add_issue(dir.path(), "P2-BUG-001-a.md", "# BUG-001: Alpha\n");
        add_issue(
            dir.path(),
            "P2-BUG-002-b.md",
            "# BUG-002: Beta\n\n## Blocked By\n\n- BUG-001\n",
        );

        forge_parallel()
            .current_dir(dir.path())
            .arg("run")
            .assert()
            .success()
            .stdout(predicate::str::contains("COMPLETE"))
            .stdout(predicate::str::contains("2/2 completed"));

        assert!(dir.path().join("src/BUG-001.rs").exists());
        assert!(dir.path().join("src/BUG-002.rs").exists());
        assert!(dir.path().join(".issues/completed/P2-BUG-001-a.md").exists());
        assert!(dir.path().join(".issues/completed/P2-BUG-002-b.md").exists());
        assert!(!dir.path().join(".parallel-state.json").exists());
    }

    #[test]
    fn test_not_ready_verdict_fails_run_and_keeps_state() {
        let dir = create_repo();
        configure(
            dir.path(),
            "echo 'VERDICT: NOT_READY'; echo 'REASON: missing repro steps'",
            "true",
        );
        add_issue(dir.path(), "P2-BUG-003-c.md", "# BUG-003: Gamma\n");

        forge_parallel()
            .current_dir(dir.path())
            .arg("run")
            .assert()
            .code(1)
            .stdout(predicate::str::contains("missing repro steps"));

        let state = fs::read_to_string(dir.path().join(".parallel-state.json")).unwrap();
        assert!(state.contains("BUG-003"));

        forge_parallel()
            .current_dir(dir.path())
            .arg("status")
            .assert()
            .success()
            .stdout(predicate::str::contains("Failed:"));
    }

    #[test]
    fn test_clean_removes_state() {
        let dir = create_repo();
        write(
            dir.path(),
            ".parallel-state.json",
            r#"{"started_at":"2026-01-01T00:00:00Z","last_checkpoint":"2026-01-01T00:00:00Z"}"#,
        );

        forge_parallel()
            .current_dir(dir.path())
            .args(["clean", "--state"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Removed 0 worktree(s)"));

        assert!(!dir.path().join(".parallel-state.json").exists());
    }
}
