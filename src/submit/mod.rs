//! Commit-to-changelist export: replaying local commits into a client
//! workspace and submitting or shelving the result.

use std::collections::{BTreeMap, BTreeSet};
use std::io::{BufRead, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use crate::errors::SyncError;
use crate::git::{parse_diff_tree, parse_provenance, DiffEntry, Git};
use crate::import::strip_keywords;
use crate::mapper::wildcard_encode;
use crate::models::KeywordMode;
use crate::p4::P4;
use crate::state::{RunState, StateFile};

/// What to do with each replayed commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitMode {
    /// Submit a new changelist per commit.
    Submit,
    /// Shelve a new pending changelist per commit.
    Shelve,
    /// Replace the files of existing shelved changelists, one per commit.
    UpdateShelve(Vec<u32>),
    /// Open the files and write the changelist form, submitting nothing.
    PrepareOnly,
}

/// What happens when a commit fails to apply cleanly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictPolicy {
    /// Stop the run at the first conflict.
    AutoAbort,
    /// Revert the conflicting commit's opened files and continue.
    AutoSkip,
    /// Ask on the terminal.
    Interactive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Resolution {
    Skip,
    Abort,
}

/// Asks one question and returns one answer line, or None when no
/// answer can be had (EOF, closed terminal).
pub type Prompt = dyn FnMut(&str) -> Option<String>;

/// Question to stderr, answer from stdin.
fn terminal_prompt(question: &str) -> Option<String> {
    eprint!("{question}");
    let _ = std::io::stderr().flush();
    let mut line = String::new();
    if std::io::stdin().lock().read_line(&mut line).unwrap_or(0) == 0 {
        return None;
    }
    Some(line)
}

impl ConflictPolicy {
    /// The prompt is injected so the interactive policy never reads the
    /// terminal from inside the engine.
    fn resolve(&self, commit: &str, reason: &str, prompt: &mut Prompt) -> Resolution {
        match self {
            ConflictPolicy::AutoAbort => Resolution::Abort,
            ConflictPolicy::AutoSkip => Resolution::Skip,
            ConflictPolicy::Interactive => loop {
                let question =
                    format!("commit {commit} failed to apply ({reason}). [s]kip or [q]uit? ");
                let answer = match prompt(&question) {
                    Some(a) => a,
                    None => return Resolution::Abort,
                };
                match answer.trim() {
                    "s" | "S" => return Resolution::Skip,
                    "q" | "Q" => return Resolution::Abort,
                    _ => {}
                }
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct SubmitOptions {
    pub mode: SubmitMode,
    pub conflict: ConflictPolicy,
    /// Upstream ref the local branch is measured against.
    pub origin: String,
    /// Rename/copy detection flags for diff-tree.
    pub detect_renames: bool,
    pub detect_copies: bool,
    pub find_copies_harder: bool,
    /// Allow the one-shot keyword de-expansion retry when a patch fails
    /// its dry run.
    pub attempt_rcs_cleanup: bool,
}

impl Default for SubmitOptions {
    fn default() -> Self {
        SubmitOptions {
            mode: SubmitMode::Submit,
            conflict: ConflictPolicy::AutoAbort,
            origin: "refs/remotes/p4/master".to_string(),
            detect_renames: false,
            detect_copies: false,
            find_copies_harder: false,
            attempt_rcs_cleanup: true,
        }
    }
}

#[derive(Debug, Default)]
pub struct SubmitSummary {
    pub applied: Vec<String>,
    pub skipped: Vec<String>,
}

// ---------------------------------------------------------------------
// Commit application plan
// ---------------------------------------------------------------------

/// One workspace operation derived from a diff entry. Paths are
/// repository-relative and unencoded; encoding happens at the p4 call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlannedOp {
    Edit {
        path: String,
        exec: Option<bool>,
    },
    Add {
        path: String,
        exec: bool,
    },
    Delete {
        path: String,
    },
    /// Copy or rename integrated from `src`; `needs_edit` when the
    /// content differs from the source.
    Integrate {
        src: String,
        dst: String,
        rename: bool,
        needs_edit: bool,
        exec: Option<bool>,
    },
    /// File type changed; reopen with automatic type detection.
    Retype {
        path: String,
    },
}

fn exec_bit(mode: &str) -> bool {
    mode == "100755"
}

fn exec_change(entry: &DiffEntry) -> Option<bool> {
    let before = exec_bit(&entry.src_mode);
    let after = exec_bit(&entry.dst_mode);
    (before != after).then_some(after)
}

/// Classify a commit's diff entries into workspace operations. An add
/// of a path also planned for deletion collapses into an edit of the
/// re-created file; the reverse collapses into nothing plus a delete.
pub fn plan_from_diff(entries: &[DiffEntry]) -> Result<Vec<PlannedOp>> {
    let mut ops = Vec::new();
    for entry in entries {
        match entry.status {
            'M' => ops.push(PlannedOp::Edit {
                path: entry.path.clone(),
                exec: exec_change(entry),
            }),
            'A' => ops.push(PlannedOp::Add {
                path: entry.path.clone(),
                exec: exec_bit(&entry.dst_mode),
            }),
            'D' => ops.push(PlannedOp::Delete {
                path: entry.path.clone(),
            }),
            'C' | 'R' => {
                let dst = entry.dst_path.clone().ok_or_else(|| {
                    SyncError::Consistency(format!(
                        "diff entry {} lacks a destination path",
                        entry.path
                    ))
                })?;
                ops.push(PlannedOp::Integrate {
                    src: entry.path.clone(),
                    dst,
                    rename: entry.status == 'R',
                    needs_edit: entry.score != Some(100),
                    exec: exec_change(entry),
                });
            }
            'T' => ops.push(PlannedOp::Retype {
                path: entry.path.clone(),
            }),
            other => {
                return Err(SyncError::Consistency(format!(
                    "unhandled diff status '{other}' for {}",
                    entry.path
                ))
                .into())
            }
        }
    }
    Ok(coalesce_add_delete(ops))
}

fn coalesce_add_delete(ops: Vec<PlannedOp>) -> Vec<PlannedOp> {
    let added: BTreeSet<String> = ops
        .iter()
        .filter_map(|op| match op {
            PlannedOp::Add { path, .. } => Some(path.clone()),
            _ => None,
        })
        .collect();
    let deleted: BTreeSet<String> = ops
        .iter()
        .filter_map(|op| match op {
            PlannedOp::Delete { path } => Some(path.clone()),
            _ => None,
        })
        .collect();
    let both: BTreeSet<&String> = added.intersection(&deleted).collect();
    if both.is_empty() {
        return ops;
    }
    // A path deleted and re-added in the same commit is an edit in
    // changelist terms.
    let mut out = Vec::new();
    for op in ops {
        match op {
            PlannedOp::Add { path, exec } if both.contains(&path) => out.push(PlannedOp::Edit {
                path,
                exec: Some(exec),
            }),
            PlannedOp::Delete { path } if both.contains(&path) => {}
            other => out.push(other),
        }
    }
    out
}

// ---------------------------------------------------------------------
// Changelist form
// ---------------------------------------------------------------------

/// Strip the provenance trailer and any `Jobs:` lines from a commit
/// message, returning the cleaned description and the job ids.
pub fn split_message(message: &str) -> (String, Vec<String>) {
    let mut description = String::new();
    let mut jobs = Vec::new();
    for line in message.lines() {
        if parse_provenance(line).is_some() {
            continue;
        }
        if let Some(rest) = line.strip_prefix("Jobs:") {
            jobs.extend(rest.split_whitespace().map(|s| s.to_string()));
            continue;
        }
        description.push_str(line);
        description.push('\n');
    }
    (description.trim_end().to_string() + "\n", jobs)
}

fn indent_block(text: &str) -> String {
    text.lines()
        .map(|l| format!("\t{l}\n"))
        .collect::<String>()
}

/// Render a changelist form from the server's blank form, keeping only
/// opened files under the depot prefixes being exported.
pub fn render_changelist_form(
    blank: &crate::p4::marshal::Record,
    depot_paths: &[String],
    description: &str,
    jobs: &[String],
    change: Option<u32>,
) -> String {
    let mut form = String::new();
    match change {
        Some(n) => form.push_str(&format!("Change:\t{n}\n\n")),
        None => form.push_str("Change:\tnew\n\n"),
    }
    if let Some(client) = blank.text("Client") {
        form.push_str(&format!("Client:\t{client}\n\n"));
    }
    if let Some(user) = blank.text("User") {
        form.push_str(&format!("User:\t{user}\n\n"));
    }
    let status = if change.is_some() { "pending" } else { "new" };
    form.push_str(&format!("Status:\t{status}\n\n"));
    form.push_str("Description:\n");
    form.push_str(&indent_block(description));
    if !jobs.is_empty() {
        form.push_str("\nJobs:\n");
        for job in jobs {
            form.push_str(&format!("\t{job}\n"));
        }
    }
    let mut files = Vec::new();
    for index in 0.. {
        match blank.text(&format!("Files{index}")) {
            Some(file) => {
                if depot_paths
                    .iter()
                    .any(|p| crate::mapper::path_starts_with(&file, p, false))
                {
                    files.push(file);
                }
            }
            None => break,
        }
    }
    if !files.is_empty() {
        form.push_str("\nFiles:\n");
        for file in files {
            form.push_str(&format!("\t{file}\n"));
        }
    }
    form
}

// ---------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------

#[derive(Debug, Default)]
struct OpenedFiles {
    /// Paths opened for edit/add/integrate, for revert on failure.
    opened: Vec<String>,
    /// Added paths whose workspace files must be removed on revert.
    added: Vec<String>,
    /// Paths needing their exec bit reopened after patching.
    exec_changes: BTreeMap<String, bool>,
    /// Edited paths, candidates for keyword de-expansion on conflict.
    edited: Vec<String>,
}

pub struct SubmitEngine {
    pub p4: P4,
    pub git: Git,
    pub depot_paths: Vec<String>,
    pub state: RunState,
    state_file: StateFile,
    options: SubmitOptions,
    client_root: PathBuf,
    prompt: Box<Prompt>,
}

impl SubmitEngine {
    pub fn new(
        p4: P4,
        git: Git,
        depot_paths: Vec<String>,
        state_file: StateFile,
        options: SubmitOptions,
    ) -> Result<Self> {
        let state = state_file.load()?;
        let client_root = Self::resolve_client_root(&p4, &depot_paths)?;
        Ok(SubmitEngine {
            p4,
            git,
            depot_paths,
            state,
            state_file,
            options,
            client_root,
            prompt: Box::new(terminal_prompt),
        })
    }

    /// Replace the terminal prompt, for callers resolving conflicts
    /// without one.
    pub fn with_prompt(mut self, prompt: Box<Prompt>) -> Self {
        self.prompt = prompt;
        self
    }

    fn resolve_client_root(p4: &P4, depot_paths: &[String]) -> Result<PathBuf> {
        let first = depot_paths
            .first()
            .ok_or_else(|| SyncError::Usage("no depot paths configured".into()))?;
        let spec = format!("{first}...");
        for record in p4.run_records(&["where", &spec])? {
            if record.is_error() || record.contains("unmap") {
                continue;
            }
            if let Some(path) = record.text("path") {
                let root = path.trim_end_matches("...").trim_end_matches('/');
                return Ok(PathBuf::from(root));
            }
        }
        Err(SyncError::Usage(format!(
            "client {} does not map {first}",
            p4.client().unwrap_or("(default)")
        ))
        .into())
    }

    /// Export the commits on `branch` that are not yet upstream.
    pub fn run(&mut self, branch: &str) -> Result<SubmitSummary> {
        let range = format!("{}..{}", self.options.origin, branch);
        let commits = self
            .git
            .read_lines(&["rev-list", "--reverse", "--no-merges", &range])?;
        if commits.is_empty() {
            info!("no commits to export");
            return Ok(SubmitSummary::default());
        }
        self.run_commits(commits)
    }

    /// Resume an interrupted export: replay the persisted queue of
    /// commits that never landed in the depot.
    pub fn resume(&mut self) -> Result<SubmitSummary> {
        let commits = self.state.pending_commits.clone();
        if commits.is_empty() {
            return Err(SyncError::Usage(
                "no interrupted export to continue; the pending commit queue is empty".into(),
            )
            .into());
        }
        info!(count = commits.len(), "continuing interrupted export");
        self.run_commits(commits)
    }

    fn run_commits(&mut self, commits: Vec<String>) -> Result<SubmitSummary> {
        if let SubmitMode::UpdateShelve(changes) = &self.options.mode {
            if changes.len() != commits.len() {
                return Err(SyncError::Usage(format!(
                    "{} commits to export but {} shelved changelists given",
                    commits.len(),
                    changes.len()
                ))
                .into());
            }
        }

        // Patches apply against the client workspace, so the run moves
        // there; the repository stays reachable through GIT_DIR.
        self.git.pin_git_dir()?;
        std::env::set_current_dir(&self.client_root).with_context(|| {
            format!("cannot enter client root {}", self.client_root.display())
        })?;
        if self.p4.opened_count()? > 0 {
            return Err(SyncError::Usage(
                "the client workspace has opened files; revert or submit them first".into(),
            )
            .into());
        }
        self.p4.sync_file("...", false)?;

        // The queue holds every commit that has not landed yet; each
        // landed or skipped commit is removed and the state saved, so an
        // aborted run leaves exactly the remainder for a later resume.
        self.state.pending_commits = commits.clone();
        self.state_file.save(&self.state)?;

        let mut summary = SubmitSummary::default();
        for (index, commit) in commits.iter().enumerate() {
            let shelve_target = match &self.options.mode {
                SubmitMode::UpdateShelve(changes) => Some(changes[index]),
                _ => None,
            };
            let settled = match self.apply_commit(commit, shelve_target) {
                Ok(()) => {
                    summary.applied.push(commit.clone());
                    // Prepared commits have not landed; they stay queued
                    // until a later run submits them.
                    self.options.mode != SubmitMode::PrepareOnly
                }
                Err(err) => {
                    let reason = err.to_string();
                    let policy = self.options.conflict;
                    match policy.resolve(commit, &reason, self.prompt.as_mut()) {
                        Resolution::Skip => {
                            warn!(commit = %commit, reason = %reason, "skipping conflicting commit");
                            summary.skipped.push(commit.clone());
                            true
                        }
                        Resolution::Abort => {
                            self.state_file.save(&self.state)?;
                            return Err(SyncError::ApplyConflict {
                                commit: commit.clone(),
                                reason,
                            }
                            .into());
                        }
                    }
                }
            };
            if settled {
                self.state.pending_commits.retain(|c| c != commit);
                self.state_file.save(&self.state)?;
            }
        }

        self.state_file.save(&self.state)?;
        info!(
            applied = summary.applied.len(),
            skipped = summary.skipped.len(),
            "export finished"
        );
        Ok(summary)
    }

    fn apply_commit(&mut self, commit: &str, shelve_target: Option<u32>) -> Result<()> {
        debug!(commit, "applying commit");
        let parent = format!("{commit}^");
        let mut diff_args = vec!["diff-tree", "-r"];
        if self.options.detect_renames {
            diff_args.push("-M");
        }
        if self.options.detect_copies {
            diff_args.push("-C");
        }
        if self.options.find_copies_harder {
            diff_args.push("--find-copies-harder");
        }
        diff_args.push(&parent);
        diff_args.push(commit);
        let entries = parse_diff_tree(&self.git.read(&diff_args)?)?;
        let plan = plan_from_diff(&entries)?;

        let mut opened = OpenedFiles::default();
        let result = self.execute(commit, &plan, &mut opened, shelve_target);
        if result.is_err() {
            self.revert(&opened);
        }
        result
    }

    fn execute(
        &mut self,
        commit: &str,
        plan: &[PlannedOp],
        opened: &mut OpenedFiles,
        shelve_target: Option<u32>,
    ) -> Result<()> {
        let has_move = matches!(self.options.mode, SubmitMode::Submit | SubmitMode::PrepareOnly)
            && self.p4.has_move_command();
        let mut deletions = Vec::new();
        for op in plan {
            match op {
                PlannedOp::Edit { path, exec } => {
                    self.p4.edit(&wildcard_encode(path), None)?;
                    opened.opened.push(path.clone());
                    opened.edited.push(path.clone());
                    if let Some(exec) = exec {
                        opened.exec_changes.insert(path.clone(), *exec);
                    }
                }
                PlannedOp::Add { path, exec } => {
                    opened.added.push(path.clone());
                    if *exec {
                        opened.exec_changes.insert(path.clone(), true);
                    }
                }
                PlannedOp::Delete { path } => deletions.push(path.clone()),
                PlannedOp::Integrate {
                    src,
                    dst,
                    rename,
                    needs_edit,
                    exec,
                } => {
                    let enc_src = wildcard_encode(src);
                    let enc_dst = wildcard_encode(dst);
                    if *rename && has_move {
                        self.p4.move_file(&enc_src, &enc_dst)?;
                        opened.opened.push(src.clone());
                    } else {
                        self.p4.integrate(&enc_src, &enc_dst)?;
                        if *rename {
                            deletions.push(src.clone());
                        }
                    }
                    opened.opened.push(dst.clone());
                    if *needs_edit {
                        self.p4.edit(&enc_dst, None)?;
                        opened.edited.push(dst.clone());
                    }
                    if let Some(exec) = exec {
                        opened.exec_changes.insert(dst.clone(), *exec);
                    }
                }
                PlannedOp::Retype { path } => {
                    self.p4.edit(&wildcard_encode(path), Some("auto"))?;
                    opened.opened.push(path.clone());
                    opened.edited.push(path.clone());
                }
            }
        }

        self.apply_patch(commit, opened)?;

        // Adds after the patch so the files exist; deletes after the
        // patch so edited content never references removed files.
        for path in &opened.added {
            self.p4.add(path)?;
            opened.opened.push(path.clone());
        }
        for path in &deletions {
            self.p4.delete(&wildcard_encode(path))?;
            opened.opened.push(path.clone());
        }
        for (path, exec) in &opened.exec_changes {
            let flag = if *exec { "+x" } else { "-x" };
            self.p4.reopen(flag, &wildcard_encode(path))?;
        }

        self.finish_change(commit, shelve_target, opened)
    }

    fn apply_patch(&self, commit: &str, opened: &OpenedFiles) -> Result<()> {
        let patch = self
            .git
            .read_bytes(&["diff-tree", "--full-index", "-p", commit])?;
        if self.git.run_with_input(&["apply", "--check", "-"], &patch)? {
            if !self.git.run_with_input(&["apply", "-"], &patch)? {
                return Err(SyncError::ApplyConflict {
                    commit: commit.to_string(),
                    reason: "patch check passed but application failed".into(),
                }
                .into());
            }
            return Ok(());
        }

        // Expanded RCS keywords in the workspace copy are the one
        // recoverable cause of a failed check; de-expand and retry once.
        let mut cleaned_any = false;
        if !self.options.attempt_rcs_cleanup {
            return Err(SyncError::ApplyConflict {
                commit: commit.to_string(),
                reason: "patch does not apply to the workspace".into(),
            }
            .into());
        }
        for path in &opened.edited {
            if let Some(mode) = self.keyword_mode_for(path)? {
                self.deexpand_keywords(path, mode)?;
                cleaned_any = true;
            }
        }
        if cleaned_any
            && self.git.run_with_input(&["apply", "--check", "-"], &patch)?
            && self.git.run_with_input(&["apply", "-"], &patch)?
        {
            return Ok(());
        }
        Err(SyncError::ApplyConflict {
            commit: commit.to_string(),
            reason: "patch does not apply to the workspace".into(),
        }
        .into())
    }

    fn keyword_mode_for(&self, path: &str) -> Result<Option<KeywordMode>> {
        let encoded = wildcard_encode(path);
        for record in self.p4.run_records(&["fstat", "-T", "headType", &encoded])? {
            if record.is_error() {
                continue;
            }
            if let Some(head_type) = record.text("headType") {
                if let Some(ft) = crate::models::FileType::parse(&head_type) {
                    let mode = ft.keyword_mode();
                    if mode != KeywordMode::None {
                        return Ok(Some(mode));
                    }
                }
            }
        }
        Ok(None)
    }

    fn deexpand_keywords(&self, path: &str, mode: KeywordMode) -> Result<()> {
        let contents =
            std::fs::read(path).with_context(|| format!("cannot read workspace file {path}"))?;
        let cleaned = strip_keywords(&contents, mode);
        if cleaned != contents {
            debug!(path, "collapsed expanded keywords in workspace copy");
            std::fs::write(path, cleaned)
                .with_context(|| format!("cannot rewrite workspace file {path}"))?;
        }
        Ok(())
    }

    fn finish_change(
        &mut self,
        commit: &str,
        shelve_target: Option<u32>,
        opened: &OpenedFiles,
    ) -> Result<()> {
        let message = self
            .git
            .read(&["log", "--max-count=1", "--format=%B", commit])?;
        let (description, jobs) = split_message(&message);

        let blanks = self.p4.run_records(&["change", "-o"])?;
        let blank = blanks
            .iter()
            .find(|r| !r.is_error())
            .ok_or_else(|| SyncError::Consistency("change -o returned no form".into()))?;
        let form = render_changelist_form(
            blank,
            &self.depot_paths,
            &description,
            &jobs,
            shelve_target,
        );

        match &self.options.mode {
            SubmitMode::Submit => {
                self.p4.run_text_with_stdin(&["submit", "-i"], &form)?;
            }
            SubmitMode::Shelve => {
                self.p4.run_text_with_stdin(&["shelve", "-i"], &form)?;
                self.revert_opened_everything()?;
            }
            SubmitMode::UpdateShelve(_) => {
                // The opened files must sit in the target changelist for
                // the shelf replacement to pick them up.
                if let Some(change) = shelve_target {
                    for path in &opened.opened {
                        self.p4.reopen_in_change(change, &wildcard_encode(path))?;
                    }
                }
                self.p4.run_text_with_stdin(&["shelve", "-r", "-i"], &form)?;
                self.revert_opened_everything()?;
            }
            SubmitMode::PrepareOnly => {
                let diff = self.git.read(&["diff-tree", "--full-index", "-p", commit])?;
                let path = self.write_prepared_form(commit, &form, &diff)?;
                info!(commit, form = %path.display(), "changelist prepared; files remain open");
            }
        }
        Ok(())
    }

    /// Prepared form plus a read-only copy of the diff below a separator,
    /// for review before manual submission.
    fn write_prepared_form(&self, commit: &str, form: &str, diff: &str) -> Result<PathBuf> {
        let git_dir = self.git.git_dir()?;
        let path = git_dir.join(format!("depotsync-prepared-{commit}.txt"));
        let mut contents = form.to_string();
        contents.push_str("\n# ----- everything below this line is informational -----\n");
        for line in diff.lines() {
            contents.push_str("# ");
            contents.push_str(line);
            contents.push('\n');
        }
        std::fs::write(&path, contents)
            .with_context(|| format!("cannot write {}", path.display()))?;
        Ok(path)
    }

    fn revert_opened_everything(&self) -> Result<()> {
        self.p4.revert("...")
    }

    /// Undo a partially applied commit: revert opened files and remove
    /// workspace copies of files that were about to be added.
    fn revert(&self, opened: &OpenedFiles) {
        for path in &opened.opened {
            if let Err(err) = self.p4.revert(&wildcard_encode(path)) {
                warn!(path = %path, error = %err, "revert failed");
            }
        }
        for path in &opened.added {
            let _ = std::fs::remove_file(path);
        }
    }
}
