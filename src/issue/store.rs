//! Filesystem scanner for issue markdown files.
//!
//! Issues live under the issues directory (default `.issues`), usually in
//! category subdirectories, one file per issue named
//! `P<n>-<TYPE>-<num>-<slug>.md`:
//!
//! ```text
//! .issues/
//!   bugs/P1-BUG-042-crash-on-save.md
//!   features/P2-FEAT-007-export-csv.md
//!   completed/P3-ENH-001-faster-startup.md
//! ```
//!
//! Dependencies are declared in `## Blocked By` and `## Blocks` sections.

use anyhow::{Context, Result};
use regex::Regex;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use tracing::debug;

use super::{Issue, IssueType, Priority, sort_issues};

static FILENAME_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(P[0-5])-([A-Z]+)-(\d+)-(.+)\.md$").expect("Invalid regex pattern")
});

static ISSUE_ID_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b([A-Z]+-\d+)\b").expect("Invalid regex pattern"));

static SECTION_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^#{1,6}\s+(.+?)\s*$").expect("Invalid regex pattern"));

/// Reads issues from a repository checkout.
#[derive(Debug, Clone)]
pub struct IssueStore {
    root: PathBuf,
    issues_dir: PathBuf,
    completed_dir: PathBuf,
}

impl IssueStore {
    /// `issues_dir` and `completed_dir` are relative to `root`.
    pub fn new(root: impl Into<PathBuf>, issues_dir: &Path, completed_dir: &Path) -> Self {
        Self {
            root: root.into(),
            issues_dir: issues_dir.to_path_buf(),
            completed_dir: completed_dir.to_path_buf(),
        }
    }

    pub fn completed_dir(&self) -> &Path {
        &self.completed_dir
    }

    /// Scan all active (not completed) issues, sorted priority then id.
    pub fn scan(&self) -> Result<Vec<Issue>> {
        let completed_abs = self.root.join(&self.completed_dir);
        let mut issues = Vec::new();

        for path in self.markdown_files(&self.root.join(&self.issues_dir))? {
            if path.starts_with(&completed_abs) {
                continue;
            }
            let rel = path.strip_prefix(&self.root).unwrap_or(&path).to_path_buf();
            match Self::read_issue(&path, rel)? {
                Some(issue) => issues.push(issue),
                None => debug!(path = %path.display(), "skipping non-issue markdown file"),
            }
        }

        sort_issues(&mut issues);
        Ok(issues)
    }

    /// Ids of issues already filed in the completed directory.
    pub fn completed_ids(&self) -> Result<BTreeSet<String>> {
        let mut ids = BTreeSet::new();
        for path in self.markdown_files(&self.root.join(&self.completed_dir))? {
            if let Some(name) = path.file_name().and_then(|n| n.to_str())
                && let Some((_, id, _)) = parse_filename(name)
            {
                ids.insert(id);
            }
        }
        Ok(ids)
    }

    fn markdown_files(&self, dir: &Path) -> Result<Vec<PathBuf>> {
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let pattern = dir.join("**").join("*.md");
        let pattern = pattern.to_string_lossy();
        let mut files = Vec::new();
        for entry in glob::glob(&pattern).context("Invalid issue glob pattern")? {
            match entry {
                Ok(path) => files.push(path),
                Err(e) => debug!(error = %e, "unreadable path while scanning issues"),
            }
        }
        files.sort();
        Ok(files)
    }

    /// Parse one issue file. Returns `None` when the filename does not follow
    /// the issue naming convention.
    pub fn read_issue(path: &Path, rel_path: PathBuf) -> Result<Option<Issue>> {
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            return Ok(None);
        };
        let Some((priority, id, slug)) = parse_filename(name) else {
            return Ok(None);
        };
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read issue file: {}", path.display()))?;

        let prefix = id.split('-').next().unwrap_or_default().to_string();
        let title = extract_title(&content, &id).unwrap_or_else(|| slug.replace('-', " "));
        let blocked_by = section_ids(&content, "blocked by", &id);
        let blocks = section_ids(&content, "blocks", &id);

        Ok(Some(Issue {
            id,
            priority,
            issue_type: IssueType::from_prefix(&prefix),
            path: rel_path,
            title,
            content,
            blocked_by,
            blocks,
        }))
    }
}

/// Split `P1-BUG-042-crash-on-save.md` into `(P1, "BUG-042", "crash-on-save")`.
pub fn parse_filename(name: &str) -> Option<(Priority, String, String)> {
    let caps = FILENAME_REGEX.captures(name)?;
    let priority = caps[1].parse().ok()?;
    let id = format!("{}-{}", &caps[2], &caps[3]);
    Some((priority, id, caps[4].to_string()))
}

fn extract_title(content: &str, id: &str) -> Option<String> {
    let heading = content
        .lines()
        .find_map(|line| line.strip_prefix("# "))?
        .trim();
    let title = heading
        .strip_prefix(id)
        .map(|rest| rest.trim_start_matches([':', ' ', '-']))
        .unwrap_or(heading);
    (!title.is_empty()).then(|| title.to_string())
}

/// Collect issue ids listed under the named heading (case-insensitive),
/// up to the next heading. The issue's own id is never returned.
fn section_ids(content: &str, section: &str, own_id: &str) -> BTreeSet<String> {
    let mut ids = BTreeSet::new();
    let mut inside = false;
    for line in content.lines() {
        if let Some(caps) = SECTION_REGEX.captures(line) {
            inside = caps[1].trim_end_matches(':').eq_ignore_ascii_case(section);
            continue;
        }
        if !inside {
            continue;
        }
        for caps in ISSUE_ID_REGEX.captures_iter(line) {
            if &caps[1] != own_id {
                ids.insert(caps[1].to_string());
            }
        }
    }
    ids
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn write(root: &Path, rel: &str, content: &str) {
        let path = root.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    fn store(root: &Path) -> IssueStore {
        IssueStore::new(
            root,
            Path::new(".issues"),
            Path::new(".issues/completed"),
        )
    }

    #[test]
    fn test_parse_filename() {
        let (p, id, slug) = parse_filename("P1-BUG-042-crash-on-save.md").unwrap();
        assert_eq!(p, Priority::P1);
        assert_eq!(id, "BUG-042");
        assert_eq!(slug, "crash-on-save");
        assert!(parse_filename("README.md").is_none());
        assert!(parse_filename("P7-BUG-1-x.md").is_none());
    }

    #[test]
    fn test_section_ids_stop_at_next_heading() {
        let content = "# FEAT-002: Export\n\n## Blocked By\n\n- BUG-001\n- FEAT-002\n\n## Notes\n\nSee ENH-009.\n";
        let ids = section_ids(content, "blocked by", "FEAT-002");
        assert_eq!(ids.into_iter().collect::<Vec<_>>(), vec!["BUG-001"]);
    }

    #[test]
    fn test_extract_title_strips_id() {
        assert_eq!(
            extract_title("# BUG-001: Crash on save\n", "BUG-001").as_deref(),
            Some("Crash on save")
        );
        assert_eq!(
            extract_title("# Plain title\n", "BUG-001").as_deref(),
            Some("Plain title")
        );
        assert!(extract_title("no heading", "BUG-001").is_none());
    }

    #[test]
    fn test_scan_reads_dependencies_and_skips_completed() {
        let dir = tempdir().unwrap();
        write(
            dir.path(),
            ".issues/bugs/P1-BUG-001-crash.md",
            "# BUG-001: Crash\n\n## Blocks\n\n- FEAT-002\n",
        );
        write(
            dir.path(),
            ".issues/features/P2-FEAT-002-export.md",
            "# FEAT-002: Export\n\n## Blocked By\n\n- BUG-001\n",
        );
        write(
            dir.path(),
            ".issues/completed/P3-ENH-003-done.md",
            "# ENH-003: Done\n",
        );
        write(dir.path(), ".issues/README.md", "# Issues\n");

        let store = store(dir.path());
        let issues = store.scan().unwrap();
        let ids: Vec<_> = issues.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["BUG-001", "FEAT-002"]);

        assert!(issues[0].blocks.contains("FEAT-002"));
        assert!(issues[1].blocked_by.contains("BUG-001"));
        assert_eq!(issues[1].issue_type, IssueType::Feature);
        assert_eq!(
            issues[1].path,
            PathBuf::from(".issues/features/P2-FEAT-002-export.md")
        );

        let completed = store.completed_ids().unwrap();
        assert!(completed.contains("ENH-003"));
    }

    #[test]
    fn test_scan_missing_directory_is_empty() {
        let dir = tempdir().unwrap();
        assert!(store(dir.path()).scan().unwrap().is_empty());
        assert!(store(dir.path()).completed_ids().unwrap().is_empty());
    }
}
