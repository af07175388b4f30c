//! Persistent run state.
//!
//! Import progress, discovered branch parentage, and the pending submit
//! queue live in one JSON file inside the git directory. Reading it is
//! how a run resumes; git history is never scraped for progress.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

const STATE_FILE_NAME: &str = "depotsync-state.json";
const STATE_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunState {
    pub version: u32,
    /// Depot prefixes this repository was created from.
    pub depot_paths: Vec<String>,
    /// Import ref -> last changelist known to be fully imported into it.
    pub last_change: BTreeMap<String, u32>,
    /// Detected branch -> parent branch.
    pub branches: BTreeMap<String, String>,
    /// Commits prepared for submission but not yet submitted.
    pub pending_commits: Vec<String>,
}

impl Default for RunState {
    fn default() -> Self {
        RunState {
            version: STATE_VERSION,
            depot_paths: Vec::new(),
            last_change: BTreeMap::new(),
            branches: BTreeMap::new(),
            pending_commits: Vec::new(),
        }
    }
}

impl RunState {
    pub fn record_import(&mut self, import_ref: &str, change: u32) {
        let entry = self.last_change.entry(import_ref.to_string()).or_insert(0);
        if change > *entry {
            *entry = change;
        }
    }

    pub fn last_change_for(&self, import_ref: &str) -> Option<u32> {
        self.last_change.get(import_ref).copied()
    }

    /// Highest imported change across all refs; the resume point for a
    /// whole-repository sync.
    pub fn max_change(&self) -> Option<u32> {
        self.last_change.values().max().copied()
    }
}

/// Handle on the state file's location.
#[derive(Debug, Clone)]
pub struct StateFile {
    path: PathBuf,
}

impl StateFile {
    pub fn in_git_dir(git_dir: &Path) -> Self {
        StateFile {
            path: git_dir.join(STATE_FILE_NAME),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load existing state, or a fresh default when none exists yet.
    pub fn load(&self) -> Result<RunState> {
        if !self.path.exists() {
            return Ok(RunState::default());
        }
        let contents = std::fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read {}", self.path.display()))?;
        let state: RunState = serde_json::from_str(&contents)
            .with_context(|| format!("corrupt state file {}", self.path.display()))?;
        debug!(refs = state.last_change.len(), "loaded run state");
        Ok(state)
    }

    /// Write-then-rename so a crash mid-save never leaves a torn file.
    pub fn save(&self, state: &RunState) -> Result<()> {
        let tmp = self.path.with_extension("json.tmp");
        {
            let mut file = File::create(&tmp)
                .with_context(|| format!("failed to create {}", tmp.display()))?;
            let payload = serde_json::to_vec_pretty(state)?;
            file.write_all(&payload)?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("failed to replace {}", self.path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_loads_default() {
        let dir = tempfile::tempdir().unwrap();
        let file = StateFile::in_git_dir(dir.path());
        let state = file.load().unwrap();
        assert_eq!(state.version, STATE_VERSION);
        assert!(state.last_change.is_empty());
    }

    #[test]
    fn save_and_reload_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let file = StateFile::in_git_dir(dir.path());
        let mut state = RunState::default();
        state.depot_paths.push("//depot/main/".to_string());
        state.record_import("refs/remotes/p4/master", 120);
        state
            .branches
            .insert("rel1".to_string(), "main".to_string());
        state.pending_commits.push("abc123".to_string());
        file.save(&state).unwrap();

        let loaded = file.load().unwrap();
        assert_eq!(loaded.last_change_for("refs/remotes/p4/master"), Some(120));
        assert_eq!(loaded.branches.get("rel1").map(String::as_str), Some("main"));
        assert_eq!(loaded.pending_commits, vec!["abc123"]);
    }

    #[test]
    fn record_import_never_goes_backwards() {
        let mut state = RunState::default();
        state.record_import("r", 10);
        state.record_import("r", 5);
        assert_eq!(state.last_change_for("r"), Some(10));
        assert_eq!(state.max_change(), Some(10));
    }

    #[test]
    fn corrupt_state_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let file = StateFile::in_git_dir(dir.path());
        std::fs::write(file.path(), "not json").unwrap();
        assert!(file.load().is_err());
    }
}
