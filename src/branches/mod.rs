//! Branch detection: mapping depot directories to branches and finding
//! the parent branch a new branch was seeded from.

use std::collections::{BTreeMap, BTreeSet};

use anyhow::Result;
use tracing::debug;

use crate::errors::SyncError;
use crate::mapper::path_starts_with;
use crate::models::{FileAction, FileChange};
use crate::p4::P4;

/// Integration provenance for one file revision, as reported by the
/// depot's per-file history.
#[derive(Debug, Clone)]
pub struct Integration {
    /// The depot's verb for the integration ("branch from", "copy from",
    /// "merge from", "ignored", ...).
    pub how: String,
    pub source_path: String,
}

#[derive(Debug, Clone)]
pub struct FileLogEntry {
    pub action: FileAction,
    pub integrations: Vec<Integration>,
}

/// Source of per-file revision history. The depot client implements it;
/// tests substitute canned histories so the parent heuristic is testable
/// without a server.
pub trait FileLogSource {
    fn filelog(&self, depot_path: &str, revision: u32) -> Result<Option<FileLogEntry>>;
}

impl FileLogSource for P4 {
    fn filelog(&self, depot_path: &str, revision: u32) -> Result<Option<FileLogEntry>> {
        let spec = format!("{depot_path}#{revision}");
        let records = self.run_records(&["filelog", "-m", "1", &spec])?;
        let record = match records.iter().find(|r| !r.is_error()) {
            Some(r) => r,
            None => return Ok(None),
        };
        let action = match record
            .text("action0")
            .and_then(|a| FileAction::parse(&a))
        {
            Some(a) => a,
            None => return Ok(None),
        };
        let mut integrations = Vec::new();
        for index in 0.. {
            let how = match record.text(&format!("how0,{index}")) {
                Some(h) => h,
                None => break,
            };
            let source_path = record
                .text(&format!("file0,{index}"))
                .unwrap_or_default();
            integrations.push(Integration { how, source_path });
        }
        Ok(Some(FileLogEntry {
            action,
            integrations,
        }))
    }
}

/// Known branches under one depot root. Branch names are depot
/// directories relative to `base` ("" never appears; the root import is
/// not a branch).
#[derive(Debug, Default)]
pub struct BranchMap {
    /// Depot prefix all branches live under, ending with '/'.
    base: String,
    /// branch dir -> parent branch dir ("" when the parent is unknown).
    parents: BTreeMap<String, String>,
    /// Branches whose git refs have already been created this run.
    created: BTreeSet<String>,
}

impl BranchMap {
    pub fn new(base: String) -> Self {
        let base = if base.ends_with('/') {
            base
        } else {
            format!("{base}/")
        };
        BranchMap {
            base,
            ..Default::default()
        }
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    pub fn branches(&self) -> impl Iterator<Item = &str> {
        self.parents.keys().map(String::as_str)
    }

    pub fn parent_of(&self, branch: &str) -> Option<&str> {
        self.parents.get(branch).map(String::as_str).filter(|p| !p.is_empty())
    }

    pub fn insert(&mut self, branch: String, parent: String) {
        self.parents.entry(branch).or_insert(parent);
    }

    pub fn mark_created(&mut self, branch: &str) {
        self.created.insert(branch.to_string());
    }

    pub fn is_created(&self, branch: &str) -> bool {
        self.created.contains(branch)
    }

    /// Seed from server branch specs: each single-view spec whose sides
    /// both sit under `base` declares destination-branched-from-source.
    pub fn load_from_depot(&mut self, p4: &P4) -> Result<()> {
        for record in p4.run_records(&["branches"])? {
            let name = match record.text("branch") {
                Some(n) => n,
                None => continue,
            };
            let spec = p4.run_records(&["branch", "-o", &name])?;
            let spec = match spec.iter().find(|r| !r.is_error()) {
                Some(s) => s,
                None => continue,
            };
            // Multi-line views splice directories together; those cannot
            // be modeled as a whole-directory branch, so skip them.
            if spec.contains("View1") {
                debug!(branch = %name, "skipping multi-view branch spec");
                continue;
            }
            let view = match spec.text("View0") {
                Some(v) => v,
                None => continue,
            };
            if let Some((source, dest)) = self.parse_view_line(&view) {
                debug!(branch = %dest, parent = %source, "branch mapping from depot spec");
                self.insert(dest, source);
            }
        }
        Ok(())
    }

    /// `source:dest` overrides from configuration, taking precedence over
    /// depot specs.
    pub fn apply_overrides(&mut self, entries: &[String]) {
        for entry in entries {
            if let Some((source, dest)) = entry.split_once(':') {
                self.parents
                    .insert(dest.trim().to_string(), source.trim().to_string());
            }
        }
    }

    fn parse_view_line(&self, view: &str) -> Option<(String, String)> {
        let mut sides = view.split_whitespace();
        let source = sides.next()?.trim_end_matches("...");
        let dest = sides.next()?.trim_end_matches("...");
        let source = self.relative(source)?;
        let dest = self.relative(dest)?;
        if source.is_empty() || dest.is_empty() {
            return None;
        }
        Some((source, dest))
    }

    /// Strip `base` and any trailing slash, or None if outside the root.
    pub fn relative(&self, depot_path: &str) -> Option<String> {
        depot_path
            .strip_prefix(&self.base)
            .map(|rel| rel.trim_end_matches('/').to_string())
    }

    /// Longest known branch that contains `relative_path`.
    pub fn branch_of(&self, relative_path: &str) -> Option<&str> {
        self.parents
            .keys()
            .filter(|b| path_starts_with(relative_path, b, false))
            .max_by_key(|b| b.len())
            .map(String::as_str)
    }

    /// Reduce the directories touched by one changelist to the branches
    /// they belong to.
    ///
    /// Coalescing is conservative: a directory covered by an already
    /// chosen branch is absorbed, a directory that covers previous
    /// choices replaces them, and a directory matching a known branch
    /// snaps to that branch. Anything left becomes a new branch and is
    /// remembered, so later changelists touching only a subdirectory
    /// coalesce into it instead of spawning another branch.
    pub fn branches_for_commit(&mut self, dirs: &BTreeSet<String>) -> BTreeSet<String> {
        let mut branches: BTreeSet<String> = BTreeSet::new();
        for dir in dirs {
            if branches
                .iter()
                .any(|b| path_starts_with(dir, b, false))
            {
                continue;
            }
            let absorbed: Vec<String> = branches
                .iter()
                .filter(|b| path_starts_with(b, dir, false))
                .cloned()
                .collect();
            for b in absorbed {
                branches.remove(&b);
            }
            match self.branch_of(dir).map(str::to_string) {
                Some(known) => {
                    branches.insert(known);
                }
                None => {
                    self.insert(dir.clone(), String::new());
                    branches.insert(dir.clone());
                }
            }
        }
        branches
    }

    /// Find the branch a new branch was seeded from, by asking the file
    /// history where its integrated files came from. First qualifying
    /// source wins; file order is the changelist's own.
    pub fn find_parent(
        &self,
        source: &dyn FileLogSource,
        branch: &str,
        files: &[FileChange],
    ) -> Result<Option<String>> {
        let branch_prefix = format!("{}{}/", self.base, branch);
        for file in files {
            if !file.action.is_integration() {
                continue;
            }
            let entry = match source.filelog(&file.depot_path, file.revision)? {
                Some(e) => e,
                None => continue,
            };
            if entry.action != file.action {
                return Err(SyncError::Consistency(format!(
                    "filelog action {} disagrees with describe action {} for {}",
                    entry.action.as_str(),
                    file.action.as_str(),
                    file.depot_path
                ))
                .into());
            }
            for integration in &entry.integrations {
                if !integration.how.ends_with("from") {
                    continue;
                }
                if path_starts_with(&integration.source_path, &branch_prefix, false) {
                    // Intra-branch integration says nothing about parentage.
                    continue;
                }
                let relative = match self.relative(&integration.source_path) {
                    Some(r) => r,
                    None => continue,
                };
                let source_dir = crate::util::dir_of(&relative);
                if let Some(parent) = self.branch_of(source_dir) {
                    debug!(branch, parent, via = %file.depot_path, "found branch parent");
                    return Ok(Some(parent.to_string()));
                }
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{FileType, FileTypeBase, KeywordMode};

    fn change_file(path: &str, action: FileAction) -> FileChange {
        FileChange {
            depot_path: path.to_string(),
            revision: 1,
            action,
            file_type: FileType {
                base: FileTypeBase::Text,
                executable: false,
                keywords: KeywordMode::None,
            },
            shelved_change: None,
        }
    }

    struct CannedLog(BTreeMap<String, FileLogEntry>);

    impl FileLogSource for CannedLog {
        fn filelog(&self, depot_path: &str, _revision: u32) -> Result<Option<FileLogEntry>> {
            Ok(self.0.get(depot_path).cloned())
        }
    }

    fn map_with(branches: &[(&str, &str)]) -> BranchMap {
        let mut map = BranchMap::new("//depot/".to_string());
        for (branch, parent) in branches {
            map.insert(branch.to_string(), parent.to_string());
        }
        map
    }

    #[test]
    fn coalesces_subdirectories_into_known_branch() {
        let mut map = map_with(&[("a/b", "")]);
        let dirs: BTreeSet<String> =
            ["a/b/c".to_string(), "a/b".to_string()].into_iter().collect();
        let branches = map.branches_for_commit(&dirs);
        assert_eq!(branches.into_iter().collect::<Vec<_>>(), vec!["a/b"]);
    }

    #[test]
    fn unknown_directories_stand_alone() {
        let mut map = map_with(&[("main", "")]);
        let dirs: BTreeSet<String> =
            ["main/src".to_string(), "rel1/src".to_string()].into_iter().collect();
        let branches = map.branches_for_commit(&dirs);
        assert_eq!(
            branches.into_iter().collect::<Vec<_>>(),
            vec!["main", "rel1/src"]
        );
    }

    #[test]
    fn segment_boundaries_respected() {
        let mut map = map_with(&[("main", "")]);
        let dirs: BTreeSet<String> = ["main2/src".to_string()].into_iter().collect();
        let branches = map.branches_for_commit(&dirs);
        assert_eq!(branches.into_iter().collect::<Vec<_>>(), vec!["main2/src"]);
    }

    #[test]
    fn new_branches_are_remembered_across_changelists() {
        let mut map = BranchMap::new("//depot/proj/".to_string());

        // Changelist 1 touches only main; the map learns it.
        let dirs: BTreeSet<String> = ["main".to_string()].into_iter().collect();
        let branches = map.branches_for_commit(&dirs);
        assert_eq!(branches.into_iter().collect::<Vec<_>>(), vec!["main"]);
        assert_eq!(map.branches().collect::<Vec<_>>(), vec!["main"]);

        // Changelist 2 touches a subdirectory of main; it coalesces
        // into the remembered branch instead of becoming its own.
        let dirs: BTreeSet<String> = ["main/sub".to_string()].into_iter().collect();
        let branches = map.branches_for_commit(&dirs);
        assert_eq!(branches.into_iter().collect::<Vec<_>>(), vec!["main"]);

        // Changelist 3 seeds branch1 from main; the parent lookup sees
        // main because changelist 1 registered it.
        let dirs: BTreeSet<String> = ["branch1".to_string()].into_iter().collect();
        let branches = map.branches_for_commit(&dirs);
        assert_eq!(branches.into_iter().collect::<Vec<_>>(), vec!["branch1"]);

        let mut log = BTreeMap::new();
        log.insert(
            "//depot/proj/branch1/f".to_string(),
            FileLogEntry {
                action: FileAction::Branch,
                integrations: vec![Integration {
                    how: "branch from".to_string(),
                    source_path: "//depot/proj/main/f".to_string(),
                }],
            },
        );
        let files = vec![change_file("//depot/proj/branch1/f", FileAction::Branch)];
        let parent = map
            .find_parent(&CannedLog(log), "branch1", &files)
            .unwrap();
        assert_eq!(parent.as_deref(), Some("main"));
    }

    #[test]
    fn parent_found_from_integration_history() {
        let map = map_with(&[("main", ""), ("rel1", "")]);
        let mut log = BTreeMap::new();
        log.insert(
            "//depot/rel1/src/a.rs".to_string(),
            FileLogEntry {
                action: FileAction::Branch,
                integrations: vec![Integration {
                    how: "branch from".to_string(),
                    source_path: "//depot/main/src/a.rs".to_string(),
                }],
            },
        );
        let files = vec![change_file("//depot/rel1/src/a.rs", FileAction::Branch)];
        let parent = map
            .find_parent(&CannedLog(log), "rel1", &files)
            .unwrap();
        assert_eq!(parent.as_deref(), Some("main"));
    }

    #[test]
    fn intra_branch_integrations_are_ignored() {
        let map = map_with(&[("main", ""), ("rel1", "")]);
        let mut log = BTreeMap::new();
        log.insert(
            "//depot/rel1/src/a.rs".to_string(),
            FileLogEntry {
                action: FileAction::Branch,
                integrations: vec![Integration {
                    how: "branch from".to_string(),
                    source_path: "//depot/rel1/old/a.rs".to_string(),
                }],
            },
        );
        let files = vec![change_file("//depot/rel1/src/a.rs", FileAction::Branch)];
        let parent = map
            .find_parent(&CannedLog(log), "rel1", &files)
            .unwrap();
        assert_eq!(parent, None);
    }

    #[test]
    fn mismatched_filelog_action_is_inconsistent() {
        let map = map_with(&[("main", "")]);
        let mut log = BTreeMap::new();
        log.insert(
            "//depot/rel1/src/a.rs".to_string(),
            FileLogEntry {
                action: FileAction::Edit,
                integrations: vec![],
            },
        );
        let files = vec![change_file("//depot/rel1/src/a.rs", FileAction::Branch)];
        assert!(map.find_parent(&CannedLog(log), "rel1", &files).is_err());
    }

    #[test]
    fn overrides_beat_depot_specs() {
        let mut map = map_with(&[("rel1", "old")]);
        map.apply_overrides(&["main:rel1".to_string()]);
        assert_eq!(map.parent_of("rel1"), Some("main"));
    }
}
