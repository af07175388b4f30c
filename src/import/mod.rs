//! Changelist-to-commit conversion: the fast-import stream writer and
//! the sync engine that drives it.
//!
//! The engine walks changelists in ascending order, streams each one as
//! a commit (split across branches when branch detection is on), and
//! records durable progress in run state only after the importer has
//! acknowledged a checkpoint.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::io::Write as _;
use std::sync::OnceLock;

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use crate::branches::BranchMap;
use crate::errors::SyncError;
use crate::git::{provenance_trailer, FastImport, Git, ImportSink};
use crate::largefile::LargeFileStore;
use crate::mapper::PathMapper;
use crate::models::{ChangeRecord, FileChange, FileTypeBase, KeywordMode};
use crate::p4::P4;
use crate::state::{RunState, StateFile};
use crate::users::UserMap;
use crate::util::dir_of;

const UTF8_BOM: [u8; 3] = [0xEF, 0xBB, 0xBF];

// ---------------------------------------------------------------------
// Stream-writer primitives
// ---------------------------------------------------------------------

/// fast-import mode string for a depot file type.
pub fn file_mode(file_type: &crate::models::FileType) -> &'static str {
    if file_type.base == FileTypeBase::Symlink {
        "120000"
    } else if file_type.executable {
        "100755"
    } else {
        "100644"
    }
}

fn keyword_pattern(mode: KeywordMode) -> Option<&'static regex::bytes::Regex> {
    static FULL: OnceLock<regex::bytes::Regex> = OnceLock::new();
    static ID_ONLY: OnceLock<regex::bytes::Regex> = OnceLock::new();
    match mode {
        KeywordMode::None => None,
        KeywordMode::Full => Some(FULL.get_or_init(|| {
            regex::bytes::Regex::new(
                r"\$(Id|Header|Author|Date|DateTime|Change|File|Revision)(:[^$\n]*)?\$",
            )
            .expect("keyword pattern is valid")
        })),
        KeywordMode::IdOnly => Some(ID_ONLY.get_or_init(|| {
            regex::bytes::Regex::new(r"\$(Id|Header)(:[^$\n]*)?\$")
                .expect("keyword pattern is valid")
        })),
    }
}

/// Collapse expanded RCS keywords back to their bare `$Keyword$` form so
/// imported blobs are stable across revisions.
pub fn strip_keywords(content: &[u8], mode: KeywordMode) -> Vec<u8> {
    match keyword_pattern(mode) {
        None => content.to_vec(),
        Some(pattern) => pattern
            .replace_all(content, |caps: &regex::bytes::Captures| {
                let mut out = Vec::with_capacity(caps[1].len() + 2);
                out.push(b'$');
                out.extend_from_slice(&caps[1]);
                out.push(b'$');
                out
            })
            .into_owned(),
    }
}

/// Symlink targets come off the wire with a trailing newline; strip
/// exactly one. An empty target is unrepresentable and gets dropped.
pub fn normalize_symlink_target(mut content: Vec<u8>) -> Option<Vec<u8>> {
    if content.last() == Some(&b'\n') {
        content.pop();
    }
    if content.is_empty() {
        None
    } else {
        Some(content)
    }
}

fn write_data(sink: &mut dyn ImportSink, bytes: &[u8]) -> Result<()> {
    sink.write(format!("data {}\n", bytes.len()).as_bytes())?;
    sink.write(bytes)?;
    sink.write(b"\n")
}

/// Emit one `M <mode> inline <path>` entry.
pub fn write_file_entry(
    sink: &mut dyn ImportSink,
    mode: &str,
    repo_path: &str,
    content: &[u8],
) -> Result<()> {
    sink.write(format!("M {mode} inline {repo_path}\n").as_bytes())?;
    write_data(sink, content)
}

pub fn write_delete(sink: &mut dyn ImportSink, repo_path: &str) -> Result<()> {
    sink.write(format!("D {repo_path}\n").as_bytes())
}

/// Commit message: the changelist description, any attached jobs, and
/// the provenance trailer the submit side reads back.
pub fn compose_message(record: &ChangeRecord, depot_paths: &[String], with_trailer: bool) -> String {
    let mut message = record.description.trim_end().to_string();
    message.push('\n');
    if !record.jobs.is_empty() {
        message.push_str(&format!("\nJobs: {}\n", record.jobs.join(" ")));
    }
    if with_trailer {
        message.push('\n');
        message.push_str(&provenance_trailer(depot_paths, record.id));
        message.push('\n');
    }
    message
}

fn tz_offset(timestamp: i64) -> String {
    use chrono::TimeZone;
    match chrono::Local.timestamp_opt(timestamp, 0) {
        chrono::LocalResult::Single(dt) => dt.format("%z").to_string(),
        _ => "+0000".to_string(),
    }
}

pub fn write_commit_header(
    sink: &mut dyn ImportSink,
    branch_ref: &str,
    committer: &str,
    timestamp: i64,
    message: &str,
    from: Option<&str>,
    merge: Option<&str>,
) -> Result<()> {
    sink.write(format!("commit {branch_ref}\n").as_bytes())?;
    sink.write(
        format!("committer {committer} {timestamp} {}\n", tz_offset(timestamp)).as_bytes(),
    )?;
    write_data(sink, message.as_bytes())?;
    if let Some(from) = from {
        sink.write(format!("from {from}\n").as_bytes())?;
    }
    if let Some(merge) = merge {
        sink.write(format!("merge {merge}\n").as_bytes())?;
    }
    Ok(())
}

/// One-line progress indicator, overwritten in place with '\r'.
fn progress_line(change: u32, index: usize, total: usize) -> String {
    let percent = if total == 0 {
        100
    } else {
        (index + 1) * 100 / total
    };
    format!("importing change {change} ({percent}%)")
}

/// Annotated tag pinning `target_ref`'s current tip.
pub fn write_tag(
    sink: &mut dyn ImportSink,
    name: &str,
    target_ref: &str,
    tagger: &str,
    timestamp: i64,
    description: &str,
) -> Result<()> {
    sink.write(format!("tag {name}\n").as_bytes())?;
    sink.write(format!("from {target_ref}\n").as_bytes())?;
    sink.write(format!("tagger {tagger} {timestamp} {}\n", tz_offset(timestamp)).as_bytes())?;
    write_data(sink, description.trim_end().as_bytes())?;
    Ok(())
}

// ---------------------------------------------------------------------
// Labels
// ---------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct LabelInfo {
    pub name: String,
    pub description: String,
    pub owner: String,
    pub updated: i64,
    /// depot path -> revision pinned by the label.
    pub revisions: BTreeMap<String, u32>,
}

fn valid_tag_name() -> &'static regex::Regex {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    RE.get_or_init(|| regex::Regex::new(r"^[a-zA-Z0-9_.\-]+$").expect("tag pattern is valid"))
}

/// Collect labels on the imported paths, keyed by the newest changelist
/// each label pins. Labels whose names cannot be git tags are skipped.
pub fn fetch_labels(p4: &P4, depot_paths: &[String]) -> Result<BTreeMap<u32, Vec<LabelInfo>>> {
    let mut path_args: Vec<String> = depot_paths.iter().map(|p| format!("{p}...")).collect();
    let mut args = vec!["labels".to_string()];
    args.append(&mut path_args);
    let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();

    let mut labels: BTreeMap<u32, Vec<LabelInfo>> = BTreeMap::new();
    for record in p4.run_records(&arg_refs)? {
        let name = match record.text("label") {
            Some(n) => n,
            None => continue,
        };
        if !valid_tag_name().is_match(&name) {
            warn!(label = %name, "label name is not a valid tag name, skipping");
            continue;
        }
        let mut revisions = BTreeMap::new();
        let mut newest_change = 0u32;
        let file_args: Vec<String> = depot_paths
            .iter()
            .map(|p| format!("{p}...@{name}"))
            .collect();
        let mut files_cmd = vec!["files".to_string()];
        files_cmd.extend(file_args);
        let files_refs: Vec<&str> = files_cmd.iter().map(String::as_str).collect();
        for file in p4.run_records(&files_refs)? {
            if file.is_error() {
                continue;
            }
            let (depot, rev) = match (file.text("depotFile"), file.int("rev")) {
                (Some(d), Some(r)) => (d, r as u32),
                _ => continue,
            };
            revisions.insert(depot, rev);
            if let Some(change) = file.int("change") {
                newest_change = newest_change.max(change as u32);
            }
        }
        if revisions.is_empty() {
            continue;
        }
        labels.entry(newest_change).or_default().push(LabelInfo {
            name,
            description: record.text("Description").unwrap_or_default(),
            owner: record.text("Owner").unwrap_or_default(),
            updated: record.int("Update").unwrap_or(0),
            revisions,
        });
    }
    Ok(labels)
}

// ---------------------------------------------------------------------
// Sync engine
// ---------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// Ref commits land on when branch detection is off.
    pub import_ref: String,
    /// Prefix for detected branch refs, ending with '/'.
    pub branch_ref_prefix: String,
    pub detect_branches: bool,
    pub import_labels: bool,
    pub keep_empty_commits: bool,
    pub max_changes: Option<usize>,
    /// Changes between checkpoint-and-persist cycles.
    pub checkpoint_interval: u32,
    /// Leave the provenance trailer out of commit messages; unshelved
    /// commits set this because they never feed an incremental run.
    pub suppress_provenance: bool,
}

impl Default for SyncOptions {
    fn default() -> Self {
        SyncOptions {
            import_ref: "refs/remotes/p4/master".to_string(),
            branch_ref_prefix: "refs/remotes/p4/".to_string(),
            detect_branches: false,
            import_labels: false,
            keep_empty_commits: false,
            max_changes: None,
            checkpoint_interval: 100,
            suppress_provenance: false,
        }
    }
}

#[derive(Debug, Default)]
pub struct SyncSummary {
    pub imported: usize,
    pub skipped: usize,
    pub tags: usize,
}

pub struct SyncEngine {
    pub p4: P4,
    pub git: Git,
    pub mapper: PathMapper,
    pub users: UserMap,
    pub branch_map: BranchMap,
    pub largefiles: Option<LargeFileStore>,
    pub state: RunState,
    state_file: StateFile,
    options: SyncOptions,
    initial_parents: HashMap<String, String>,
    labels: BTreeMap<u32, Vec<LabelInfo>>,
    temp_branches: Vec<String>,
}

impl SyncEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        p4: P4,
        git: Git,
        mapper: PathMapper,
        users: UserMap,
        branch_map: BranchMap,
        largefiles: Option<LargeFileStore>,
        state_file: StateFile,
        options: SyncOptions,
    ) -> Result<Self> {
        let mut state = state_file.load()?;
        if state.depot_paths.is_empty() {
            state.depot_paths = mapper.depot_paths.clone();
        }
        Ok(SyncEngine {
            p4,
            git,
            mapper,
            users,
            branch_map,
            largefiles,
            state,
            state_file,
            options,
            initial_parents: HashMap::new(),
            labels: BTreeMap::new(),
            temp_branches: Vec::new(),
        })
    }

    pub fn options(&self) -> &SyncOptions {
        &self.options
    }

    /// Import the given changelists, ascending. Progress is persisted as
    /// the run advances, so an interrupted run resumes where it stopped.
    pub fn run(&mut self, changes: &[u32]) -> Result<SyncSummary> {
        if changes.is_empty() {
            info!("no new changelists to import");
            return Ok(SyncSummary::default());
        }
        self.seed_initial_parents()?;
        // Seed branch parentage remembered from earlier runs.
        let remembered: Vec<(String, String)> = self
            .state
            .branches
            .iter()
            .map(|(b, p)| (b.clone(), p.clone()))
            .collect();
        for (branch, parent) in remembered {
            self.branch_map.insert(branch, parent);
        }
        if self.options.import_labels {
            self.labels = fetch_labels(&self.p4, &self.mapper.depot_paths)?;
            debug!(label_changes = self.labels.len(), "prefetched labels");
        }

        let limit = self.options.max_changes.unwrap_or(usize::MAX);
        let mut fast = FastImport::open(&self.git)?;
        let result = self.run_stream(&mut fast, changes, limit);
        match result {
            Ok(summary) => {
                fast.close()?;
                self.cleanup_temp_branches();
                self.persist()?;
                info!(
                    imported = summary.imported,
                    skipped = summary.skipped,
                    tags = summary.tags,
                    "import finished"
                );
                Ok(summary)
            }
            Err(err) => {
                fast.abort();
                self.cleanup_temp_branches();
                // Keep whatever progress the last checkpoint made durable.
                let _ = self.state_file.save(&self.state);
                Err(err)
            }
        }
    }

    fn run_stream(
        &mut self,
        sink: &mut FastImport,
        changes: &[u32],
        limit: usize,
    ) -> Result<SyncSummary> {
        let mut summary = SyncSummary::default();
        let mut since_checkpoint = 0u32;
        let total = changes.len().min(limit);
        for (index, &change) in changes.iter().take(limit).enumerate() {
            print!("\r{}", progress_line(change, index, total));
            let _ = std::io::stdout().flush();
            let record = crate::changes::describe(&self.p4, &self.mapper, change, false)?;
            if record.files.is_empty() && !self.options.keep_empty_commits {
                debug!(change, "no wanted files, skipping");
                if self.labels.remove(&change).is_some() {
                    warn!(change, "change was skipped, not tagging its labels");
                }
                summary.skipped += 1;
                self.note_progress(None, change);
                continue;
            }
            let committed = self.import_change(sink, &record)?;
            match &committed {
                Some(target_ref) => {
                    summary.imported += 1;
                    summary.tags += self.emit_label_tags(sink, &record, target_ref)?;
                }
                None => {
                    if self.labels.remove(&change).is_some() {
                        warn!(change, "change was skipped, not tagging its labels");
                    }
                    summary.skipped += 1;
                }
            }

            since_checkpoint += 1;
            if since_checkpoint >= self.options.checkpoint_interval {
                sink.checkpoint()?;
                self.persist()?;
                since_checkpoint = 0;
            }
        }
        if total > 0 {
            println!();
        }
        sink.checkpoint()?;
        Ok(summary)
    }

    fn persist(&self) -> Result<()> {
        self.state_file.save(&self.state)
    }

    fn note_progress(&mut self, branch_ref: Option<&str>, change: u32) {
        let import_ref = self.options.import_ref.clone();
        self.state.record_import(&import_ref, change);
        if let Some(branch_ref) = branch_ref {
            self.state.record_import(branch_ref, change);
        }
    }

    /// Existing refs under the import prefix become both the "already
    /// created" set and the `from` target of each ref's first in-stream
    /// commit.
    fn seed_initial_parents(&mut self) -> Result<()> {
        let prefix = self.options.branch_ref_prefix.trim_end_matches('/');
        let lines = self
            .git
            .read_lines(&["for-each-ref", "--format=%(refname) %(objectname)", prefix])
            .unwrap_or_default();
        for line in lines {
            if let Some((refname, sha)) = line.split_once(' ') {
                self.initial_parents
                    .insert(refname.to_string(), sha.to_string());
                if let Some(branch) = refname.strip_prefix(&self.options.branch_ref_prefix) {
                    self.branch_map.mark_created(branch);
                }
            }
        }
        if !self.initial_parents.contains_key(&self.options.import_ref) {
            if let Ok(sha) =
                self.git
                    .read(&["rev-parse", "--verify", "--quiet", &self.options.import_ref])
            {
                if !sha.is_empty() {
                    self.initial_parents
                        .insert(self.options.import_ref.clone(), sha);
                }
            }
        }
        Ok(())
    }

    /// Import one changelist. Returns the ref its commit went to (the
    /// last branch ref when branch detection splits the change), or None
    /// when the change produced no commit.
    fn import_change(
        &mut self,
        sink: &mut dyn ImportSink,
        record: &ChangeRecord,
    ) -> Result<Option<String>> {
        let paths: Vec<String> = record.files.iter().map(|f| f.depot_path.clone()).collect();
        self.mapper.prime(&self.p4, &paths)?;

        if !self.options.detect_branches {
            let import_ref = self.options.import_ref.clone();
            let from = self.initial_parents.remove(&import_ref);
            self.write_change_commit(
                sink,
                record,
                &record.files,
                &import_ref,
                from.as_deref(),
                None,
            )?;
            self.note_progress(None, record.id);
            return Ok(Some(import_ref));
        }

        // Each branch commit strips and records the branch's own depot
        // prefix, exactly as a single-path import of that branch would.
        let saved_paths = self.mapper.depot_paths.clone();
        let mut committed_ref = None;
        let mut outcome: Result<()> = Ok(());
        for (branch, files) in self.split_by_branch(&record.files) {
            self.mapper.depot_paths =
                vec![format!("{}{}/", self.branch_map.base(), branch)];
            match self.import_branch_commit(sink, record, &branch, &files) {
                Ok(full_ref) => committed_ref = Some(full_ref),
                Err(err) => {
                    outcome = Err(err);
                    break;
                }
            }
        }
        self.mapper.depot_paths = saved_paths;
        outcome?;
        if committed_ref.is_none() {
            self.note_progress(None, record.id);
        }
        Ok(committed_ref)
    }

    fn import_branch_commit(
        &mut self,
        sink: &mut dyn ImportSink,
        record: &ChangeRecord,
        branch: &str,
        files: &[FileChange],
    ) -> Result<String> {
        let full_ref = format!("{}{}", self.options.branch_ref_prefix, branch);
        let mut from = self.initial_parents.remove(&full_ref);

        if !self.branch_map.is_created(branch) {
            self.branch_map.mark_created(branch);
            if from.is_none() {
                if let Some(parent) = self.parent_branch_for(branch, files)? {
                    let parent_ref = format!("{}{}", self.options.branch_ref_prefix, parent);
                    if self.git.succeeds(&["rev-parse", "--verify", "--quiet", &parent_ref]) {
                        from = Some(parent_ref);
                    }
                }
            }
        }

        // Refine a cross-branch parent to the exact commit whose tree
        // the new branch point matches.
        if let Some(parent) = from.clone() {
            let temp_ref = format!(
                "refs/depotsync-tmp/{}-{}",
                record.id,
                branch.replace('/', "-")
            );
            self.write_change_commit(sink, record, files, &temp_ref, Some(&parent), None)?;
            self.temp_branches.push(temp_ref.clone());
            sink.checkpoint()?;
            if let Some(exact) = self.search_parent(&parent, &temp_ref)? {
                from = Some(exact);
            }
        }

        self.write_change_commit(sink, record, files, &full_ref, from.as_deref(), None)?;
        self.note_progress(Some(full_ref.as_str()), record.id);
        Ok(full_ref)
    }

    /// Group a changelist's files by detected branch. Newly seen branch
    /// directories are recorded in the branch map; files outside every
    /// detected branch (unmappable paths) are dropped with a warning.
    fn split_by_branch(&mut self, files: &[FileChange]) -> BTreeMap<String, Vec<FileChange>> {
        let mut dirs = BTreeSet::new();
        for file in files {
            if let Some(rel) = self.branch_map.relative(&file.depot_path) {
                dirs.insert(dir_of(&rel).to_string());
            }
        }
        let branches = self.branch_map.branches_for_commit(&dirs);
        let mut grouped: BTreeMap<String, Vec<FileChange>> = BTreeMap::new();
        for file in files {
            let rel = match self.branch_map.relative(&file.depot_path) {
                Some(r) => r,
                None => {
                    warn!(path = %file.depot_path, "file outside the branch root, skipping");
                    continue;
                }
            };
            let branch = branches
                .iter()
                .filter(|b| crate::mapper::path_starts_with(&rel, b, false))
                .max_by_key(|b| b.len());
            match branch {
                Some(b) => grouped.entry(b.clone()).or_default().push(file.clone()),
                None => warn!(path = %file.depot_path, "no branch claims this file, skipping"),
            }
        }
        grouped
    }

    fn parent_branch_for(
        &mut self,
        branch: &str,
        files: &[FileChange],
    ) -> Result<Option<String>> {
        if let Some(parent) = self.branch_map.parent_of(branch) {
            return Ok(Some(parent.to_string()));
        }
        let found = self.branch_map.find_parent(&self.p4, branch, files)?;
        if let Some(parent) = &found {
            self.branch_map.insert(branch.to_string(), parent.clone());
            self.state
                .branches
                .insert(branch.to_string(), parent.clone());
        }
        Ok(found)
    }

    /// Walk the parent branch's first-parent history for the commit whose
    /// tree equals the candidate commit's tree: that is the branch point.
    fn search_parent(&self, parent_ref: &str, candidate_ref: &str) -> Result<Option<String>> {
        let target_tree = self
            .git
            .read(&["rev-parse", &format!("{candidate_ref}^{{tree}}")])?;
        let lines = self.git.read_lines(&[
            "rev-list",
            "--format=%H %T",
            "--first-parent",
            parent_ref,
        ])?;
        for line in lines {
            if line.starts_with("commit ") {
                continue;
            }
            if let Some((sha, tree)) = line.split_once(' ') {
                if tree == target_tree {
                    debug!(parent = sha, "matched branch point by tree");
                    return Ok(Some(sha.to_string()));
                }
            }
        }
        Ok(None)
    }

    fn write_change_commit(
        &mut self,
        sink: &mut dyn ImportSink,
        record: &ChangeRecord,
        files: &[FileChange],
        branch_ref: &str,
        from: Option<&str>,
        merge: Option<&str>,
    ) -> Result<()> {
        debug!(change = record.id, branch = branch_ref, files = files.len(), "commit");
        let committer = self.users.identity_for(&self.p4, &record.author);
        let message = compose_message(
            record,
            &self.mapper.depot_paths,
            !self.options.suppress_provenance,
        );
        write_commit_header(
            sink,
            branch_ref,
            &committer,
            record.timestamp,
            &message,
            from,
            merge,
        )?;

        let mut to_fetch = Vec::new();
        for file in files {
            if file.action.is_delete() {
                if let Some(path) = self.mapper.repo_path(&file.depot_path) {
                    write_delete(sink, &path)?;
                    if let Some(store) = &mut self.largefiles {
                        store.untrack(&path);
                    }
                }
            } else {
                to_fetch.push(file.clone());
            }
        }
        self.fetch_and_stream(sink, &to_fetch)?;

        if let Some(store) = &mut self.largefiles {
            if let Some(manifest) = store.take_manifest() {
                write_file_entry(sink, "100644", store.manifest_path(), manifest.as_bytes())?;
            }
        }
        sink.write(b"\n")
    }

    /// Fetch content for all non-deleted files in one batched print,
    /// streaming each file into the commit as its records arrive.
    fn fetch_and_stream(&mut self, sink: &mut dyn ImportSink, files: &[FileChange]) -> Result<()> {
        if files.is_empty() {
            return Ok(());
        }
        let by_path: HashMap<String, FileChange> = files
            .iter()
            .map(|f| (f.depot_path.clone(), f.clone()))
            .collect();
        let specs: Vec<String> = files
            .iter()
            .map(|f| match f.shelved_change {
                Some(change) => format!("{}@={change}", f.depot_path),
                None => format!("{}#{}", f.depot_path, f.revision),
            })
            .collect();

        let p4 = self.p4.clone();
        let mut current: Option<(FileChange, Vec<Vec<u8>>)> = None;
        p4.stream_records(&["print"], Some(specs.as_slice()), &mut |record| {
            if record.is_error() {
                return Err(SyncError::Consistency(format!(
                    "print failed: {}",
                    record.text("data").unwrap_or_default()
                ))
                .into());
            }
            if let Some(depot) = record.text("depotFile") {
                if let Some((file, chunks)) = current.take() {
                    self.stream_one_file(sink, &file, chunks)?;
                }
                match by_path.get(&depot) {
                    Some(file) => current = Some((file.clone(), Vec::new())),
                    None => {
                        return Err(SyncError::Consistency(format!(
                            "print returned unrequested file {depot}"
                        ))
                        .into())
                    }
                }
            } else if let Some(data) = record.bytes("data") {
                if let Some((_, chunks)) = &mut current {
                    chunks.push(data.to_vec());
                }
            }
            Ok(())
        })?;
        if let Some((file, chunks)) = current.take() {
            self.stream_one_file(sink, &file, chunks)?;
        }
        Ok(())
    }

    fn stream_one_file(
        &mut self,
        sink: &mut dyn ImportSink,
        file: &FileChange,
        chunks: Vec<Vec<u8>>,
    ) -> Result<()> {
        let repo_path = match self.mapper.repo_path(&file.depot_path) {
            Some(p) => p,
            None => return Ok(()),
        };
        match file.file_type.base {
            FileTypeBase::Apple | FileTypeBase::Resource => {
                warn!(path = %file.depot_path, "forked-format file cannot be imported, skipping");
                return Ok(());
            }
            _ => {}
        }

        let mut contents: Vec<u8> = chunks.concat();

        if file.file_type.base == FileTypeBase::Symlink {
            match normalize_symlink_target(contents) {
                Some(target) => return write_file_entry(sink, "120000", &repo_path, &target),
                None => {
                    warn!(path = %file.depot_path, "empty symlink target, skipping");
                    return Ok(());
                }
            }
        }

        // Structured output re-encodes utf16; fetch the raw bytes
        // separately for those.
        if file.file_type.base == FileTypeBase::Utf16 {
            contents = self.fetch_raw(file)?;
        }
        if file.file_type.base == FileTypeBase::Utf8 && !contents.starts_with(&UTF8_BOM) {
            let mut with_bom = UTF8_BOM.to_vec();
            with_bom.extend_from_slice(&contents);
            contents = with_bom;
        }

        contents = strip_keywords(&contents, file.file_type.keyword_mode());

        let mode = file_mode(&file.file_type);
        if let Some(store) = &mut self.largefiles {
            if store.is_active() {
                if store.should_offload(&repo_path, &contents)? {
                    let pointer = store.ingest(&repo_path, &contents)?;
                    return write_file_entry(sink, mode, &repo_path, &pointer.to_bytes());
                }
                store.untrack(&repo_path);
            }
        }
        write_file_entry(sink, mode, &repo_path, &contents)
    }

    /// Raw content fetch through a temporary file, bypassing structured
    /// output's text conversion.
    fn fetch_raw(&self, file: &FileChange) -> Result<Vec<u8>> {
        let dir = tempfile::tempdir().context("failed to create temp directory")?;
        let tmp_path = dir.path().join("content");
        let tmp_str = tmp_path
            .to_str()
            .context("temp path is not valid UTF-8")?;
        let spec = match file.shelved_change {
            Some(change) => format!("{}@={change}", file.depot_path),
            None => format!("{}#{}", file.depot_path, file.revision),
        };
        self.p4.run_text(&["print", "-q", "-o", tmp_str, &spec])?;
        std::fs::read(&tmp_path).context("failed to read raw print output")
    }

    /// Emit tags for labels pinned at this change, but only when the
    /// label's file set matches the change's exactly; a partial label is
    /// not a tree we ever built. `target_ref` is the ref the change was
    /// just committed to, so the tag pins the commit that carries it.
    fn emit_label_tags(
        &mut self,
        sink: &mut dyn ImportSink,
        record: &ChangeRecord,
        target_ref: &str,
    ) -> Result<usize> {
        let labels = match self.labels.remove(&record.id) {
            Some(l) => l,
            None => return Ok(0),
        };
        let change_arg = record.id.to_string();
        let mut files_cmd = vec!["files".to_string()];
        files_cmd.extend(
            self.mapper
                .depot_paths
                .iter()
                .map(|p| format!("{p}...@{change_arg}")),
        );
        let files_refs: Vec<&str> = files_cmd.iter().map(String::as_str).collect();
        let mut at_change: BTreeMap<String, u32> = BTreeMap::new();
        for file in self.p4.run_records(&files_refs)? {
            if file.is_error() {
                continue;
            }
            if let (Some(depot), Some(rev)) = (file.text("depotFile"), file.int("rev")) {
                at_change.insert(depot, rev as u32);
            }
        }

        let mut emitted = 0;
        for label in labels {
            if label.revisions != at_change {
                warn!(label = %label.name, change = record.id, "label file set does not match change, not tagging");
                continue;
            }
            let tagger = self.users.identity_for(&self.p4, &label.owner);
            let updated = if label.updated > 0 {
                label.updated
            } else {
                record.timestamp
            };
            write_tag(
                sink,
                &label.name,
                target_ref,
                &tagger,
                updated,
                &label.description,
            )?;
            emitted += 1;
        }
        Ok(emitted)
    }

    fn cleanup_temp_branches(&mut self) {
        for temp in self.temp_branches.drain(..) {
            let _ = self.git.run(&["update-ref", "-d", &temp]);
        }
    }

    /// Initial import of the current head state as one synthetic commit,
    /// used when no history range was requested.
    pub fn import_head(&mut self) -> Result<SyncSummary> {
        let newest = crate::changes::last_change(&self.p4)?;
        let mut files_cmd = vec!["files".to_string()];
        files_cmd.extend(self.mapper.depot_paths.iter().map(|p| format!("{p}...")));
        let files_refs: Vec<&str> = files_cmd.iter().map(String::as_str).collect();

        let mut files = Vec::new();
        for record in self.p4.run_records(&files_refs)? {
            if record.is_error() {
                continue;
            }
            let depot = match record.text("depotFile") {
                Some(d) => d,
                None => continue,
            };
            if !self.mapper.is_wanted(&depot) {
                continue;
            }
            let action = record
                .text("action")
                .and_then(|a| crate::models::FileAction::parse(&a))
                .unwrap_or(crate::models::FileAction::Add);
            if action.is_delete() {
                continue;
            }
            let file_type = record
                .text("type")
                .and_then(|t| crate::models::FileType::parse(&t))
                .ok_or_else(|| {
                    SyncError::Consistency(format!("unknown file type on {depot}"))
                })?;
            files.push(FileChange {
                depot_path: depot,
                revision: record.int("rev").unwrap_or(1).max(1) as u32,
                action: crate::models::FileAction::Add,
                file_type,
                shelved_change: None,
            });
        }
        if files.is_empty() {
            return Err(SyncError::Usage(format!(
                "no files found under {}",
                self.mapper.depot_paths.join(" ")
            ))
            .into());
        }

        let head = crate::changes::describe(&self.p4, &self.mapper, newest, false)
            .map(|r| (r.author, r.timestamp))
            .unwrap_or_else(|_| (String::new(), 0));
        let record = ChangeRecord {
            id: newest,
            author: head.0,
            timestamp: head.1,
            description: format!(
                "Initial import of {} from the state at change {newest}\n",
                self.mapper.depot_paths.join(" ")
            ),
            files,
            jobs: Vec::new(),
        };

        info!(change = newest, files = record.files.len(), "importing head state");
        let mut fast = FastImport::open(&self.git)?;
        let import_ref = self.options.import_ref.clone();
        let result = self
            .write_change_commit(&mut fast, &record, &record.files, &import_ref, None, None)
            .and_then(|_| fast.checkpoint());
        match result {
            Ok(()) => {
                fast.close()?;
                self.note_progress(None, newest);
                self.persist()?;
                Ok(SyncSummary {
                    imported: 1,
                    ..Default::default()
                })
            }
            Err(err) => {
                fast.abort();
                Err(err)
            }
        }
    }

    /// Materialize a shelved changelist as two commits on `target_ref`:
    /// a synthesized parent holding the pre-shelve file states on top of
    /// `origin`, then the shelved content itself.
    pub fn unshelve(&mut self, change: u32, origin: &str, target_ref: &str) -> Result<()> {
        self.options.suppress_provenance = true;
        let record = crate::changes::describe(&self.p4, &self.mapper, change, true)?;
        if record.files.is_empty() {
            return Err(SyncError::Usage(format!(
                "shelved changelist {change} touches no files under the imported paths"
            ))
            .into());
        }

        // Files added by the shelf do not exist in the parent; files the
        // shelf deletes must, so they flip to plain content fetches.
        let parent_files: Vec<FileChange> = record
            .files
            .iter()
            .filter(|f| !f.action.is_add())
            .map(|f| FileChange {
                action: crate::models::FileAction::Edit,
                shelved_change: None,
                ..f.clone()
            })
            .collect();
        let parent_record = ChangeRecord {
            id: change,
            author: record.author.clone(),
            timestamp: record.timestamp,
            description: format!("parent of shelved changelist {change}\n"),
            files: parent_files.clone(),
            jobs: Vec::new(),
        };

        // A previous unshelve of the same changelist moves aside under a
        // numbered suffix instead of being discarded.
        if self
            .git
            .succeeds(&["rev-parse", "--verify", "--quiet", target_ref])
        {
            let mut suffix = 1;
            let mut backup = format!("{target_ref}.{suffix}");
            while self
                .git
                .succeeds(&["rev-parse", "--verify", "--quiet", &backup])
            {
                suffix += 1;
                backup = format!("{target_ref}.{suffix}");
            }
            let previous = self.git.read(&["rev-parse", target_ref])?;
            self.git.run(&["update-ref", &backup, &previous])?;
            warn!(target = target_ref, backup = %backup, "moved existing unshelve ref aside");
            self.git.run(&["update-ref", "-d", target_ref])?;
        }

        let mut fast = FastImport::open(&self.git)?;
        let result = (|| -> Result<()> {
            self.write_change_commit(
                &mut fast,
                &parent_record,
                &parent_files,
                target_ref,
                Some(origin),
                None,
            )?;
            self.write_change_commit(&mut fast, &record, &record.files, target_ref, None, None)?;
            fast.checkpoint()
        })();
        match result {
            Ok(()) => {
                fast.close()?;
                info!(change, target = target_ref, "unshelved");
                Ok(())
            }
            Err(err) => {
                fast.abort();
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{FileAction, FileType};

    #[test]
    fn progress_line_reports_percent_done() {
        assert_eq!(progress_line(1042, 0, 4), "importing change 1042 (25%)");
        assert_eq!(progress_line(1045, 3, 4), "importing change 1045 (100%)");
    }

    #[test]
    fn keyword_stripping_full_set() {
        let input = b"// $Id: //depot/main/a.rs#3 $\n// $Change: 42 $\n// $Unknown: x $\n";
        let output = strip_keywords(input, KeywordMode::Full);
        assert_eq!(
            output,
            b"// $Id$\n// $Change$\n// $Unknown: x $\n".to_vec()
        );
    }

    #[test]
    fn keyword_stripping_id_only() {
        let input = b"$Id: x $ and $Change: 42 $";
        let output = strip_keywords(input, KeywordMode::IdOnly);
        assert_eq!(output, b"$Id$ and $Change: 42 $".to_vec());
    }

    #[test]
    fn symlink_target_normalization() {
        assert_eq!(
            normalize_symlink_target(b"target\n".to_vec()),
            Some(b"target".to_vec())
        );
        assert_eq!(
            normalize_symlink_target(b"target".to_vec()),
            Some(b"target".to_vec())
        );
        assert_eq!(normalize_symlink_target(b"\n".to_vec()), None);
        assert_eq!(normalize_symlink_target(Vec::new()), None);
    }

    #[test]
    fn commit_message_carries_jobs_and_trailer() {
        let record = ChangeRecord {
            id: 7,
            author: "alice".to_string(),
            timestamp: 0,
            description: "Fix parser\n".to_string(),
            files: Vec::new(),
            jobs: vec!["JOB-1".to_string()],
        };
        let message = compose_message(&record, &["//depot/main/".to_string()], true);
        assert!(message.starts_with("Fix parser\n"));
        assert!(message.contains("\nJobs: JOB-1\n"));
        assert!(message
            .contains("[depotsync: depot-paths = \"//depot/main/\": change = 7]"));

        let bare = compose_message(&record, &["//depot/main/".to_string()], false);
        assert!(!bare.contains("[depotsync:"));
    }

    #[test]
    fn file_modes() {
        let mut ft = FileType::parse("text").unwrap();
        assert_eq!(file_mode(&ft), "100644");
        ft.executable = true;
        assert_eq!(file_mode(&ft), "100755");
        let link = FileType::parse("symlink").unwrap();
        assert_eq!(file_mode(&link), "120000");
    }

    #[test]
    fn commit_header_format() {
        let mut sink: Vec<u8> = Vec::new();
        write_commit_header(
            &mut sink,
            "refs/remotes/p4/master",
            "Alice <alice@example.com>",
            1700000000,
            "msg\n",
            Some("refs/remotes/p4/master^0"),
            None,
        )
        .unwrap();
        let text = String::from_utf8(sink).unwrap();
        assert!(text.starts_with("commit refs/remotes/p4/master\n"));
        assert!(text.contains("committer Alice <alice@example.com> 1700000000 "));
        assert!(text.contains("data 4\nmsg\n"));
        assert!(text.contains("from refs/remotes/p4/master^0\n"));
    }

    #[test]
    fn delete_and_file_entries() {
        let mut sink: Vec<u8> = Vec::new();
        write_delete(&mut sink, "src/old.rs").unwrap();
        write_file_entry(&mut sink, "100644", "src/new.rs", b"fn main() {}\n").unwrap();
        let text = String::from_utf8(sink).unwrap();
        assert!(text.starts_with("D src/old.rs\n"));
        assert!(text.contains("M 100644 inline src/new.rs\ndata 13\nfn main() {}\n"));
    }

    #[test]
    fn unused_action_variants_do_not_fetch() {
        // Purge removes content server-side; it must route through the
        // delete path, not the print batch.
        assert!(FileAction::Purge.is_delete());
    }
}
