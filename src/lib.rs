//! Dependency-aware parallel execution of issue files.
//!
//! Issues are read from markdown files, ordered into waves by their
//! `Blocked By` relations, and handed to an external agent in isolated git
//! worktrees. Finished branches are merged back one at a time.

pub mod agent;
pub mod config;
pub mod dag;
pub mod errors;
pub mod issue;
pub mod merge;
pub mod orchestrator;
pub mod pool;
pub mod tracker;
pub mod ui;

#[cfg(test)]
mod test_support;
