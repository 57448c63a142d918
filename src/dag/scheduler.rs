//! Ordering queries over an [`IssueGraph`]: readiness, topological order,
//! cycle detection and execution waves.
//!
//! None of these mutate the graph; completion state is passed in.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap, HashMap, HashSet};

use crate::dag::builder::IssueGraph;
use crate::errors::GraphError;
use crate::issue::{Issue, Priority, sort_issues};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Color {
    White,
    Gray,
    Black,
}

impl IssueGraph {
    /// Issues not yet completed whose blockers are all completed, sorted
    /// priority then id.
    pub fn get_ready_issues(&self, completed: &HashSet<String>) -> Vec<Issue> {
        let mut ready: Vec<Issue> = self
            .issues
            .values()
            .filter(|issue| !completed.contains(&issue.id))
            .filter(|issue| {
                self.blocked_by
                    .get(&issue.id)
                    .is_none_or(|blockers| blockers.iter().all(|b| completed.contains(b)))
            })
            .cloned()
            .collect();
        sort_issues(&mut ready);
        ready
    }

    /// Kahn's algorithm. Among simultaneously ready issues the one with the
    /// lowest (priority, id) is emitted first.
    pub fn topological_sort(&self) -> Result<Vec<Issue>, GraphError> {
        let mut in_degree: HashMap<&str, usize> = self
            .issues
            .keys()
            .map(|id| {
                let degree = self.blocked_by.get(id).map_or(0, |b| b.len());
                (id.as_str(), degree)
            })
            .collect();

        let mut heap: BinaryHeap<Reverse<(Priority, &str)>> = in_degree
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .filter_map(|(id, _)| self.issues.get(*id).map(|i| Reverse(i.sort_key())))
            .collect();

        let mut order = Vec::with_capacity(self.issues.len());
        while let Some(Reverse((_, id))) = heap.pop() {
            let Some(issue) = self.issues.get(id) else {
                continue;
            };
            order.push(issue.clone());
            for dependent in self.blocks.get(id).into_iter().flatten() {
                if let Some(degree) = in_degree.get_mut(dependent.as_str()) {
                    *degree -= 1;
                    if *degree == 0
                        && let Some(next) = self.issues.get(dependent)
                    {
                        heap.push(Reverse(next.sort_key()));
                    }
                }
            }
        }

        if order.len() != self.issues.len() {
            return Err(GraphError::Cycle {
                cycles: self.detect_cycles(),
            });
        }
        Ok(order)
    }

    /// Find cycles with a white/gray/black DFS over `blocked_by` edges.
    ///
    /// Each returned cycle lists its ids in edge order without repeating the
    /// first one. At least one cycle is reported per cyclic component.
    pub fn detect_cycles(&self) -> Vec<Vec<String>> {
        let mut colors: BTreeMap<&str, Color> = self
            .issues
            .keys()
            .map(|id| (id.as_str(), Color::White))
            .collect();
        let mut stack: Vec<&str> = Vec::new();
        let mut cycles = Vec::new();

        let roots: Vec<&str> = colors.keys().copied().collect();
        for root in roots {
            if colors.get(root) == Some(&Color::White) {
                self.visit(root, &mut colors, &mut stack, &mut cycles);
            }
        }
        cycles
    }

    fn visit<'a>(
        &'a self,
        id: &'a str,
        colors: &mut BTreeMap<&'a str, Color>,
        stack: &mut Vec<&'a str>,
        cycles: &mut Vec<Vec<String>>,
    ) {
        colors.insert(id, Color::Gray);
        stack.push(id);

        for next in self.blocked_by.get(id).into_iter().flatten() {
            match colors.get(next.as_str()) {
                Some(Color::White) => self.visit(next, colors, stack, cycles),
                Some(Color::Gray) => {
                    if let Some(start) = stack.iter().position(|s| *s == next.as_str()) {
                        cycles.push(stack[start..].iter().map(|s| s.to_string()).collect());
                    }
                }
                _ => {}
            }
        }

        stack.pop();
        colors.insert(id, Color::Black);
    }

    pub fn has_cycles(&self) -> bool {
        !self.detect_cycles().is_empty()
    }

    /// Partition the not-yet-completed issues into waves. Every issue in
    /// wave `k` has all its blockers in `completed` or in waves `< k`.
    pub fn get_execution_waves(
        &self,
        completed: &HashSet<String>,
    ) -> Result<Vec<Vec<Issue>>, GraphError> {
        let cycles = self.detect_cycles();
        if !cycles.is_empty() {
            return Err(GraphError::Cycle { cycles });
        }

        let mut done = completed.clone();
        let remaining = self
            .issues
            .keys()
            .filter(|id| !completed.contains(*id))
            .count();
        let mut placed = 0;
        let mut waves = Vec::new();

        while placed < remaining {
            let wave = self.get_ready_issues(&done);
            if wave.is_empty() {
                // Unreachable without a cycle; guard against looping forever.
                return Err(GraphError::Cycle {
                    cycles: self.detect_cycles(),
                });
            }
            placed += wave.len();
            done.extend(wave.iter().map(|issue| issue.id.clone()));
            waves.push(wave);
        }

        Ok(waves)
    }
}

/// Render waves as ids, handy for logging and tests.
pub fn wave_ids(waves: &[Vec<Issue>]) -> Vec<Vec<String>> {
    waves
        .iter()
        .map(|wave| wave.iter().map(|issue| issue.id.clone()).collect())
        .collect()
}
