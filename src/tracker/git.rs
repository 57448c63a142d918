//! Thin async wrapper around the `git` CLI plus parsers for its porcelain output.
//!
//! Commands against the main checkout go through [`RepoMutex`](super::RepoMutex);
//! commands inside a private worktree call [`run_git`] directly.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tracing::debug;

use crate::errors::GitError;

pub const DEFAULT_GIT_TIMEOUT: Duration = Duration::from_secs(120);

/// Captured result of one git invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitOutput {
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl GitOutput {
    pub fn success(&self) -> bool {
        self.code == 0
    }

    /// Non-empty stdout lines, untrimmed (porcelain status depends on leading spaces).
    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.stdout.lines().filter(|l| !l.trim().is_empty())
    }

    /// Turn a non-zero exit into a [`GitError::CommandFailed`].
    pub fn check(self, args: &[&str]) -> Result<GitOutput, GitError> {
        if self.success() {
            Ok(self)
        } else {
            Err(GitError::CommandFailed {
                args: args.join(" "),
                code: self.code,
                stderr: self.stderr.trim().to_string(),
            })
        }
    }
}

/// Run `git <args>` in `cwd`. A non-zero exit is returned as data, not an error;
/// spawn failures and timeouts are errors. The child is killed on timeout.
pub async fn run_git(args: &[&str], cwd: &Path, timeout: Duration) -> Result<GitOutput, GitError> {
    let joined = args.join(" ");
    debug!(cwd = %cwd.display(), "git {}", joined);

    let child = Command::new("git")
        .args(args)
        .current_dir(cwd)
        .env("GIT_TERMINAL_PROMPT", "0")
        .env("GIT_MERGE_AUTOEDIT", "no")
        .env("GIT_EDITOR", "true")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| GitError::SpawnFailed {
            args: joined.clone(),
            source,
        })?;

    let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(result) => result.map_err(|source| GitError::SpawnFailed {
            args: joined.clone(),
            source,
        })?,
        Err(_) => {
            return Err(GitError::TimedOut {
                args: joined,
                timeout,
            });
        }
    };

    Ok(GitOutput {
        code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

/// Run and require success.
pub async fn run_git_checked(
    args: &[&str],
    cwd: &Path,
    timeout: Duration,
) -> Result<GitOutput, GitError> {
    run_git(args, cwd, timeout).await?.check(args)
}

/// One entry of `git status --porcelain` (v1).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StatusEntry {
    /// Two-character XY status code, e.g. `" M"`, `"??"`, `"A "`.
    pub code: String,
    pub path: String,
}

impl StatusEntry {
    pub fn is_untracked(&self) -> bool {
        self.code == "??"
    }

    /// Added to the index but not present in HEAD.
    pub fn is_added(&self) -> bool {
        self.code.starts_with('A')
    }
}

/// Parse `git status --porcelain` output. Renames report the new path.
pub fn parse_porcelain(stdout: &str) -> Vec<StatusEntry> {
    stdout
        .lines()
        .filter(|line| line.len() > 3)
        .filter_map(|line| {
            let code = line.get(..2)?.to_string();
            let mut path = line.get(3..)?;
            if let Some((_, new)) = path.split_once(" -> ") {
                path = new;
            }
            Some(StatusEntry {
                code,
                path: unquote(path),
            })
        })
        .collect()
}

/// Parse `git diff --name-only` output.
pub fn parse_name_only(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(unquote)
        .collect()
}

/// Strip git's C-style quoting from paths containing spaces or special characters.
fn unquote(path: &str) -> String {
    let trimmed = path.trim();
    match trimmed
        .strip_prefix('"')
        .and_then(|rest| rest.strip_suffix('"'))
    {
        Some(inner) => inner.replace("\\\"", "\"").replace("\\\\", "\\"),
        None => trimmed.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::init_repo;

    #[test]
    fn test_parse_porcelain_codes_and_paths() {
        let entries = parse_porcelain(
            " M src/lib.rs\n?? notes.txt\nA  new.rs\nR  old.rs -> renamed.rs\n?? \"with space.md\"\n",
        );
        assert_eq!(entries.len(), 5);
        assert_eq!(entries[0].code, " M");
        assert_eq!(entries[0].path, "src/lib.rs");
        assert!(entries[1].is_untracked());
        assert!(entries[2].is_added());
        assert_eq!(entries[3].path, "renamed.rs");
        assert_eq!(entries[4].path, "with space.md");
    }

    #[test]
    fn test_parse_porcelain_empty() {
        assert!(parse_porcelain("").is_empty());
        assert!(parse_porcelain("\n").is_empty());
    }

    #[test]
    fn test_parse_name_only() {
        assert_eq!(
            parse_name_only("src/a.rs\n\nsrc/b.rs\n"),
            vec!["src/a.rs".to_string(), "src/b.rs".to_string()]
        );
    }

    #[tokio::test]
    async fn test_run_git_reports_exit_codes() {
        let dir = init_repo();
        let ok = run_git(&["status", "--porcelain"], dir.path(), DEFAULT_GIT_TIMEOUT)
            .await
            .unwrap();
        assert!(ok.success());
        assert!(ok.stdout.trim().is_empty());

        let bad = run_git(&["rev-parse", "no-such-ref"], dir.path(), DEFAULT_GIT_TIMEOUT)
            .await
            .unwrap();
        assert!(!bad.success());
        assert!(bad.clone().check(&["rev-parse", "no-such-ref"]).is_err());
    }

    #[tokio::test]
    async fn test_run_git_sees_untracked_file() {
        let dir = init_repo();
        std::fs::write(dir.path().join("scratch.txt"), "x").unwrap();
        let out = run_git_checked(&["status", "--porcelain"], dir.path(), DEFAULT_GIT_TIMEOUT)
            .await
            .unwrap();
        let entries = parse_porcelain(&out.stdout);
        assert_eq!(entries.len(), 1);
        assert!(entries[0].is_untracked());
        assert_eq!(entries[0].path, "scratch.txt");
    }
}
