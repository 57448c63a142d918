//! Contention-aware wave refinement.
//!
//! Issues in the same wave are independent by declaration, but two of them
//! may still edit the same files and produce merge conflicts. The refiner
//! guesses each issue's file footprint from its text and splits a wave into
//! sub-waves so that no two issues in a sub-wave share a referenced path.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::LazyLock;
use tracing::{info, warn};

use crate::issue::Issue;

/// Backticked tokens that look like a path: `src/cli.rs`, `README.md`.
static BACKTICK_PATH_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"`([A-Za-z0-9_.\-/]+\.[A-Za-z0-9]{1,8})(?::\d+(?:-\d+)?)?`")
        .expect("Invalid regex pattern")
});

/// Bare `dir/file.ext` tokens with at least one slash.
static BARE_PATH_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:^|[\s(\[])((?:[A-Za-z0-9_.\-]+/)+[A-Za-z0-9_\-]+\.[A-Za-z0-9]{1,8})\b")
        .expect("Invalid regex pattern")
});

/// Provenance of a sub-wave produced by splitting a contended wave.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaveContentionNote {
    /// Index of the wave this sub-wave was split from.
    pub parent_wave_index: usize,
    pub sub_wave_index: usize,
    pub total_sub_waves: usize,
    /// Paths referenced by at least two issues of the parent wave, sorted.
    pub contended_paths: Vec<String>,
}

/// A wave ready for dispatch, with its contention note if it was split.
#[derive(Debug, Clone)]
pub struct PlannedWave {
    pub issues: Vec<Issue>,
    pub note: Option<WaveContentionNote>,
}

impl PlannedWave {
    pub fn ids(&self) -> Vec<&str> {
        self.issues.iter().map(|i| i.id.as_str()).collect()
    }
}

/// Best-effort set of file paths an issue's text refers to.
pub fn extract_file_paths(content: &str) -> BTreeSet<String> {
    let mut paths = BTreeSet::new();
    for caps in BACKTICK_PATH_REGEX.captures_iter(content) {
        paths.insert(normalize(&caps[1]));
    }
    for caps in BARE_PATH_REGEX.captures_iter(content) {
        paths.insert(normalize(&caps[1]));
    }
    paths.retain(|p| !p.is_empty() && !p.starts_with("http"));
    paths
}

fn normalize(path: &str) -> String {
    path.trim_start_matches("./").trim_end_matches('.').to_string()
}

#[derive(Debug, Clone, Default)]
pub struct WaveRefiner {
    serialize: bool,
}

impl WaveRefiner {
    /// With `serialize == false` overlaps are logged but waves stay intact.
    pub fn new(serialize: bool) -> Self {
        Self { serialize }
    }

    /// Refine every wave, preserving order.
    pub fn refine_waves(&self, waves: Vec<Vec<Issue>>) -> Vec<PlannedWave> {
        let mut planned = Vec::new();
        for (index, wave) in waves.into_iter().enumerate() {
            planned.extend(self.refine_wave(index, wave));
        }
        planned
    }

    /// Split one wave by first-fit packing on shared paths.
    pub fn refine_wave(&self, wave_index: usize, wave: Vec<Issue>) -> Vec<PlannedWave> {
        if wave.len() <= 1 {
            return vec![PlannedWave {
                issues: wave,
                note: None,
            }];
        }

        let footprints: Vec<BTreeSet<String>> = wave
            .iter()
            .map(|issue| extract_file_paths(&issue.content))
            .collect();
        let contended = contended_paths(&footprints);
        if contended.is_empty() {
            return vec![PlannedWave {
                issues: wave,
                note: None,
            }];
        }

        if !self.serialize {
            warn!(
                wave = wave_index + 1,
                paths = ?contended,
                "issues in wave reference the same files; running them in parallel anyway"
            );
            return vec![PlannedWave {
                issues: wave,
                note: None,
            }];
        }

        // Each bin keeps its members and the union of their paths.
        let mut bins: Vec<(Vec<Issue>, BTreeSet<String>)> = Vec::new();
        for (issue, paths) in wave.into_iter().zip(footprints) {
            match bins
                .iter_mut()
                .find(|(_, used)| used.is_disjoint(&paths))
            {
                Some((members, used)) => {
                    members.push(issue);
                    used.extend(paths);
                }
                None => bins.push((vec![issue], paths)),
            }
        }

        let total = bins.len();
        info!(
            wave = wave_index + 1,
            sub_waves = total,
            paths = ?contended,
            "split wave on file contention"
        );
        bins.into_iter()
            .enumerate()
            .map(|(sub_index, (issues, _))| PlannedWave {
                issues,
                note: Some(WaveContentionNote {
                    parent_wave_index: wave_index,
                    sub_wave_index: sub_index,
                    total_sub_waves: total,
                    contended_paths: contended.clone(),
                }),
            })
            .collect()
    }
}

/// Paths that appear in at least two footprints.
fn contended_paths(footprints: &[BTreeSet<String>]) -> Vec<String> {
    let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
    for paths in footprints {
        for path in paths {
            *counts.entry(path.as_str()).or_default() += 1;
        }
    }
    counts
        .into_iter()
        .filter(|(_, n)| *n >= 2)
        .map(|(path, _)| path.to_string())
        .collect()
}

/// Wrap unrefined waves for dispatch.
pub fn plain_waves(waves: Vec<Vec<Issue>>) -> Vec<PlannedWave> {
    waves
        .into_iter()
        .map(|issues| PlannedWave { issues, note: None })
        .collect()
}
