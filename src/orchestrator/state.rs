use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::errors::OrchestratorError;

/// Resumable progress of a run, persisted between iterations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorState {
    #[serde(default)]
    pub completed_issues: BTreeSet<String>,
    /// Issue id to failure reason.
    #[serde(default)]
    pub failed_issues: BTreeMap<String, String>,
    #[serde(default)]
    pub in_progress_issues: BTreeSet<String>,
    /// Issue id to phase timings in seconds.
    #[serde(default)]
    pub timing: BTreeMap<String, BTreeMap<String, f64>>,
    #[serde(default)]
    pub corrections: BTreeMap<String, Vec<String>>,
    pub started_at: DateTime<Utc>,
    pub last_checkpoint: DateTime<Utc>,
}

impl Default for OrchestratorState {
    fn default() -> Self {
        let now = Utc::now();
        Self {
            completed_issues: BTreeSet::new(),
            failed_issues: BTreeMap::new(),
            in_progress_issues: BTreeSet::new(),
            timing: BTreeMap::new(),
            corrections: BTreeMap::new(),
            started_at: now,
            last_checkpoint: now,
        }
    }
}

impl OrchestratorState {
    pub fn mark_in_progress(&mut self, issue_id: &str) {
        self.in_progress_issues.insert(issue_id.to_string());
    }

    pub fn mark_completed(&mut self, issue_id: &str) {
        self.in_progress_issues.remove(issue_id);
        self.failed_issues.remove(issue_id);
        self.completed_issues.insert(issue_id.to_string());
    }

    pub fn mark_failed(&mut self, issue_id: &str, reason: impl Into<String>) {
        self.in_progress_issues.remove(issue_id);
        self.completed_issues.remove(issue_id);
        self.failed_issues.insert(issue_id.to_string(), reason.into());
    }

    /// Forget an in-flight issue without recording an outcome.
    pub fn clear_in_progress(&mut self, issue_id: &str) {
        self.in_progress_issues.remove(issue_id);
    }

    /// Ids that should not be dispatched again on resume.
    pub fn settled_ids(&self) -> BTreeSet<String> {
        self.completed_issues
            .iter()
            .chain(self.failed_issues.keys())
            .cloned()
            .collect()
    }

    /// Sum of recorded per-issue `total` timings.
    pub fn total_issue_seconds(&self) -> f64 {
        self.timing
            .values()
            .filter_map(|phases| phases.get("total"))
            .sum()
    }
}

pub struct StateManager {
    state_file: PathBuf,
}

impl StateManager {
    pub fn new(state_file: PathBuf) -> Self {
        Self { state_file }
    }

    pub fn path(&self) -> &Path {
        &self.state_file
    }

    pub fn exists(&self) -> bool {
        self.state_file.exists()
    }

    /// Missing file yields `None`; an unreadable or corrupt file is logged and
    /// also yields `None` so the run starts fresh.
    pub fn load(&self) -> Option<OrchestratorState> {
        if !self.state_file.exists() {
            return None;
        }
        let content = match fs::read_to_string(&self.state_file) {
            Ok(content) => content,
            Err(e) => {
                warn!(path = %self.state_file.display(), error = %e, "cannot read state file; starting fresh");
                return None;
            }
        };
        match serde_json::from_str::<OrchestratorState>(&content) {
            Ok(state) => {
                debug!(
                    completed = state.completed_issues.len(),
                    failed = state.failed_issues.len(),
                    "loaded state"
                );
                Some(state)
            }
            Err(e) => {
                warn!(path = %self.state_file.display(), error = %e, "corrupt state file; starting fresh");
                None
            }
        }
    }

    /// Write the state atomically and stamp `last_checkpoint`.
    pub fn save(&self, state: &mut OrchestratorState) -> Result<(), OrchestratorError> {
        state.last_checkpoint = Utc::now();
        self.write_atomic(state)
            .map_err(|source| OrchestratorError::StateWriteFailed {
                path: self.state_file.clone(),
                source,
            })
    }

    fn write_atomic(&self, state: &OrchestratorState) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(state)?;
        if let Some(parent) = self.state_file.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }
        let tmp = self.state_file.with_extension("json.tmp");
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(json.as_bytes())?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.state_file)
    }

    pub fn reset(&self) -> anyhow::Result<()> {
        if self.state_file.exists() {
            fs::remove_file(&self.state_file).context("Failed to remove state file")?;
        }
        Ok(())
    }
}
