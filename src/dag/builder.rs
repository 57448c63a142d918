//! Dependency graph construction from issue `blocked_by` / `blocks` declarations.
//!
//! Edges are only recorded between issues in the current batch. Blockers that
//! are already completed, or that exist elsewhere in the repository but were
//! filtered out of this run, are treated as satisfied. Blockers that are not
//! known anywhere are dropped too ("fail open"), with a warning.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use tracing::warn;

use crate::issue::Issue;

/// What to do with a blocker id that is unknown everywhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnknownBlockerPolicy {
    /// Drop the edge and record a warning.
    #[default]
    Warn,
    /// Drop the edge silently.
    Silent,
}

/// Directed graph of issues. An edge `a -> b` in `blocked_by` means `b`
/// must complete before `a`; `blocks` holds the exact inverse.
#[derive(Debug, Clone, Default)]
pub struct IssueGraph {
    pub(crate) issues: BTreeMap<String, Issue>,
    pub(crate) blocked_by: BTreeMap<String, BTreeSet<String>>,
    pub(crate) blocks: BTreeMap<String, BTreeSet<String>>,
    warnings: Vec<String>,
}

impl IssueGraph {
    /// Build a graph with the default unknown-blocker policy.
    pub fn from_issues(
        issues: Vec<Issue>,
        completed_ids: &HashSet<String>,
        all_known_ids: &HashSet<String>,
    ) -> Self {
        Self::from_issues_with_policy(
            issues,
            completed_ids,
            all_known_ids,
            UnknownBlockerPolicy::default(),
        )
    }

    pub fn from_issues_with_policy(
        issues: Vec<Issue>,
        completed_ids: &HashSet<String>,
        all_known_ids: &HashSet<String>,
        policy: UnknownBlockerPolicy,
    ) -> Self {
        let mut graph = IssueGraph::default();

        for issue in issues {
            if graph.issues.contains_key(&issue.id) {
                graph.warn(format!(
                    "Duplicate issue id {} in batch; keeping the last definition",
                    issue.id
                ));
            }
            graph.blocked_by.entry(issue.id.clone()).or_default();
            graph.blocks.entry(issue.id.clone()).or_default();
            graph.issues.insert(issue.id.clone(), issue);
        }

        // Declared edges as (dependent, blocker) pairs from both directions.
        let mut declared: Vec<(String, String)> = Vec::new();
        for issue in graph.issues.values() {
            for blocker in &issue.blocked_by {
                declared.push((issue.id.clone(), blocker.clone()));
            }
            for dependent in &issue.blocks {
                declared.push((dependent.clone(), issue.id.clone()));
            }
        }

        for (dependent, blocker) in declared {
            if dependent == blocker || completed_ids.contains(&blocker) {
                continue;
            }
            if !graph.issues.contains_key(&dependent) {
                // A `blocks` entry naming an issue outside the batch; nothing to order.
                continue;
            }
            if !graph.issues.contains_key(&blocker) {
                if !all_known_ids.contains(&blocker) && policy == UnknownBlockerPolicy::Warn {
                    graph.warn(format!(
                        "{} is blocked by unknown issue {}; ignoring the dependency",
                        dependent, blocker
                    ));
                }
                continue;
            }
            graph
                .blocked_by
                .entry(dependent.clone())
                .or_default()
                .insert(blocker.clone());
            graph.blocks.entry(blocker).or_default().insert(dependent);
        }

        graph
    }

    fn warn(&mut self, message: String) {
        warn!("{}", message);
        self.warnings.push(message);
    }

    pub fn len(&self) -> usize {
        self.issues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.issues.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Issue> {
        self.issues.get(id)
    }

    pub fn issues(&self) -> impl Iterator<Item = &Issue> {
        self.issues.values()
    }

    /// Issues that must complete before `id`.
    pub fn blockers_of(&self, id: &str) -> Option<&BTreeSet<String>> {
        self.blocked_by.get(id)
    }

    /// Issues waiting on `id`.
    pub fn dependents_of(&self, id: &str) -> Option<&BTreeSet<String>> {
        self.blocks.get(id)
    }

    /// Warnings produced while dropping edges.
    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::issue::Priority;

    fn issue(id: &str, deps: &[&str]) -> Issue {
        Issue::new(id, Priority::P2).with_blocked_by(deps.iter().copied())
    }

    fn ids(items: &[&str]) -> HashSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn assert_inverse(graph: &IssueGraph) {
        for (id, blockers) in &graph.blocked_by {
            for blocker in blockers {
                assert!(graph.blocks[blocker].contains(id));
            }
        }
        for (id, dependents) in &graph.blocks {
            for dependent in dependents {
                assert!(graph.blocked_by[dependent].contains(id));
            }
        }
    }

    #[test]
    fn test_edges_are_inverse() {
        let graph = IssueGraph::from_issues(
            vec![issue("A", &[]), issue("B", &["A"]), issue("C", &["A", "B"])],
            &HashSet::new(),
            &HashSet::new(),
        );
        assert_eq!(graph.len(), 3);
        assert_eq!(graph.dependents_of("A").unwrap().len(), 2);
        assert_eq!(graph.blockers_of("C").unwrap().len(), 2);
        assert_inverse(&graph);
    }

    #[test]
    fn test_blocks_declaration_adds_reverse_edge() {
        let mut a = issue("A", &[]);
        a.blocks.insert("B".into());
        let graph = IssueGraph::from_issues(
            vec![a, issue("B", &[])],
            &HashSet::new(),
            &HashSet::new(),
        );
        assert!(graph.blockers_of("B").unwrap().contains("A"));
        assert_inverse(&graph);
    }

    #[test]
    fn test_self_loop_dropped() {
        let graph = IssueGraph::from_issues(
            vec![issue("A", &["A"])],
            &HashSet::new(),
            &HashSet::new(),
        );
        assert!(graph.blockers_of("A").unwrap().is_empty());
        assert!(graph.warnings().is_empty());
    }

    #[test]
    fn test_completed_blocker_dropped() {
        let graph = IssueGraph::from_issues(
            vec![issue("A", &[]), issue("B", &["A"])],
            &ids(&["A"]),
            &HashSet::new(),
        );
        assert!(graph.blockers_of("B").unwrap().is_empty());
    }

    #[test]
    fn test_unknown_blocker_fails_open_with_warning() {
        let graph = IssueGraph::from_issues(
            vec![issue("B", &["GHOST-1"])],
            &HashSet::new(),
            &HashSet::new(),
        );
        assert!(graph.blockers_of("B").unwrap().is_empty());
        assert_eq!(graph.warnings().len(), 1);
        assert!(graph.warnings()[0].contains("GHOST-1"));
    }

    #[test]
    fn test_known_elsewhere_blocker_dropped_silently() {
        let graph = IssueGraph::from_issues(
            vec![issue("B", &["OTHER-1"])],
            &HashSet::new(),
            &ids(&["OTHER-1", "B"]),
        );
        assert!(graph.blockers_of("B").unwrap().is_empty());
        assert!(graph.warnings().is_empty());
    }

    #[test]
    fn test_silent_policy_suppresses_warning() {
        let graph = IssueGraph::from_issues_with_policy(
            vec![issue("B", &["GHOST-1"])],
            &HashSet::new(),
            &HashSet::new(),
            UnknownBlockerPolicy::Silent,
        );
        assert!(graph.warnings().is_empty());
    }

    #[test]
    fn test_duplicate_id_last_wins() {
        let first = issue("A", &[]).with_content("first");
        let second = issue("A", &[]).with_content("second");
        let graph = IssueGraph::from_issues(vec![first, second], &HashSet::new(), &HashSet::new());
        assert_eq!(graph.len(), 1);
        assert_eq!(graph.get("A").unwrap().content, "second");
        assert_eq!(graph.warnings().len(), 1);
    }
}
