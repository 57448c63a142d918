//! Issue records and the filesystem store that reads them.

pub mod store;

pub use store::IssueStore;

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::PathBuf;

/// Issue priority. `P0` is the most urgent and sorts first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Priority {
    P0,
    P1,
    P2,
    P3,
    P4,
    P5,
}

impl Priority {
    pub const ALL: [Priority; 6] = [
        Priority::P0,
        Priority::P1,
        Priority::P2,
        Priority::P3,
        Priority::P4,
        Priority::P5,
    ];

    /// Critical issues run alone, never alongside other workers.
    pub fn is_critical(self) -> bool {
        self == Priority::P0
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "P{}", *self as u8)
    }
}

impl std::str::FromStr for Priority {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "P0" => Ok(Priority::P0),
            "P1" => Ok(Priority::P1),
            "P2" => Ok(Priority::P2),
            "P3" => Ok(Priority::P3),
            "P4" => Ok(Priority::P4),
            "P5" => Ok(Priority::P5),
            _ => anyhow::bail!("Invalid priority '{}'. Valid values: P0..P5", s),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum IssueType {
    Bug,
    Feature,
    Enhancement,
    Other(String),
}

impl IssueType {
    /// Map an id prefix such as `BUG` or `FEAT` to a type.
    pub fn from_prefix(prefix: &str) -> Self {
        match prefix {
            "BUG" => IssueType::Bug,
            "FEAT" => IssueType::Feature,
            "ENH" => IssueType::Enhancement,
            other => IssueType::Other(other.to_string()),
        }
    }
}

impl std::fmt::Display for IssueType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IssueType::Bug => write!(f, "bug"),
            IssueType::Feature => write!(f, "feature"),
            IssueType::Enhancement => write!(f, "enhancement"),
            IssueType::Other(prefix) => write!(f, "{}", prefix.to_lowercase()),
        }
    }
}

/// A single unit of work, as read from its markdown file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Issue {
    pub id: String,
    pub priority: Priority,
    pub issue_type: IssueType,
    /// Path of the issue file relative to the repository root.
    pub path: PathBuf,
    pub title: String,
    pub content: String,
    pub blocked_by: BTreeSet<String>,
    pub blocks: BTreeSet<String>,
}

impl Issue {
    pub fn new(id: impl Into<String>, priority: Priority) -> Self {
        let id = id.into();
        let prefix = id.split('-').next().unwrap_or_default().to_string();
        Self {
            path: PathBuf::from(format!(".issues/{}.md", id)),
            title: id.clone(),
            issue_type: IssueType::from_prefix(&prefix),
            id,
            priority,
            content: String::new(),
            blocked_by: BTreeSet::new(),
            blocks: BTreeSet::new(),
        }
    }

    pub fn with_blocked_by<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.blocked_by.extend(ids.into_iter().map(Into::into));
        self
    }

    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = content.into();
        self
    }

    /// Sort key used everywhere ordering matters: priority, then id.
    pub fn sort_key(&self) -> (Priority, &str) {
        (self.priority, self.id.as_str())
    }
}

/// Sort issues by priority, then id.
pub fn sort_issues(issues: &mut [Issue]) {
    issues.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::P0 < Priority::P1);
        assert!(Priority::P4 < Priority::P5);
        assert!(Priority::P0.is_critical());
        assert!(!Priority::P1.is_critical());
    }

    #[test]
    fn test_priority_parse_and_display() {
        assert_eq!("p2".parse::<Priority>().unwrap(), Priority::P2);
        assert_eq!(Priority::P3.to_string(), "P3");
        assert!("P9".parse::<Priority>().is_err());
    }

    #[test]
    fn test_issue_type_from_prefix() {
        assert_eq!(IssueType::from_prefix("BUG"), IssueType::Bug);
        assert_eq!(IssueType::from_prefix("FEAT"), IssueType::Feature);
        assert_eq!(
            IssueType::from_prefix("DOC"),
            IssueType::Other("DOC".into())
        );
    }

    #[test]
    fn test_sort_issues_priority_then_id() {
        let mut issues = vec![
            Issue::new("FEAT-002", Priority::P2),
            Issue::new("BUG-010", Priority::P1),
            Issue::new("BUG-002", Priority::P2),
        ];
        sort_issues(&mut issues);
        let ids: Vec<_> = issues.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["BUG-010", "BUG-002", "FEAT-002"]);
    }
}
