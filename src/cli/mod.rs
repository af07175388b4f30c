use std::collections::BTreeSet;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use tracing::{info, warn};

use crate::branches::BranchMap;
use crate::changes::{changes_for_paths, ChangeRange};
use crate::errors::SyncError;
use crate::git::Git;
use crate::import::{SyncEngine, SyncOptions};
use crate::largefile::{LargeFilePolicy, LargeFileStore};
use crate::mapper::{ClientView, PathMapper};
use crate::p4::P4;
use crate::state::StateFile;
use crate::submit::{ConflictPolicy, SubmitEngine, SubmitMode, SubmitOptions};
use crate::users::UserMap;

#[derive(Parser, Debug)]
#[command(
    name = "depotsync",
    version,
    about = "Bidirectional bridge between a Perforce depot and a git repository"
)]
pub struct Cli {
    /// Increase log verbosity (-v, -vv)
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Import new changelists into the current repository
    Sync(SyncArgs),
    /// Create a new repository from depot paths and import them
    Clone(CloneArgs),
    /// Export local commits back to the depot
    Submit(SubmitArgs),
    /// Import a shelved changelist as commits on an unshelve ref
    Unshelve(UnshelveArgs),
    /// Show the detected branch mappings
    Branches(BranchesArgs),
}

#[derive(Args, Debug)]
pub struct SyncArgs {
    /// Depot paths to import (//depot/path[/@revision-range]); defaults
    /// to the paths recorded by the previous run
    pub depot_paths: Vec<String>,

    /// Changelist range, e.g. @all or @1000,2000
    #[arg(long)]
    pub changes: Option<String>,

    /// Split imported changelists across detected branches
    #[arg(long)]
    pub detect_branches: bool,

    /// Import depot labels as git tags
    #[arg(long)]
    pub import_labels: bool,

    /// Keep changelists whose wanted file set is empty
    #[arg(long)]
    pub keep_empty_commits: bool,

    /// Stop after importing this many changelists
    #[arg(long)]
    pub max_changes: Option<usize>,

    /// Branch name under the import ref prefix
    #[arg(long, default_value = "master")]
    pub branch: String,

    /// Restrict the import through the client workspace view
    #[arg(long)]
    pub use_client_spec: bool,
}

#[derive(Args, Debug)]
pub struct CloneArgs {
    /// Depot paths to clone (//depot/path[/@revision-range])
    #[arg(required = true)]
    pub depot_paths: Vec<String>,

    /// Directory to create the repository in
    #[arg(long)]
    pub destination: Option<PathBuf>,

    #[command(flatten)]
    pub sync: CloneSyncFlags,
}

#[derive(Args, Debug)]
pub struct CloneSyncFlags {
    #[arg(long)]
    pub detect_branches: bool,
    #[arg(long)]
    pub import_labels: bool,
    #[arg(long)]
    pub use_client_spec: bool,
}

#[derive(Args, Debug)]
pub struct SubmitArgs {
    /// Branch whose commits are exported; defaults to HEAD
    pub branch: Option<String>,

    /// Upstream import ref the branch is measured against
    #[arg(long, default_value = "refs/remotes/p4/master")]
    pub origin: String,

    /// Shelve new pending changelists instead of submitting
    #[arg(long, conflicts_with_all = ["update_shelve", "prepare_only"])]
    pub shelve: bool,

    /// Replace these shelved changelists, one per exported commit
    #[arg(long = "update-shelve", value_delimiter = ',')]
    pub update_shelve: Vec<u32>,

    /// Open files and write the changelist form without submitting
    #[arg(long = "prepare-p4-only")]
    pub prepare_only: bool,

    /// What to do when a commit fails to apply: ask, skip, or quit
    #[arg(long, default_value = "quit")]
    pub conflict: String,

    /// Detect renamed files and export them as depot moves
    #[arg(short = 'M', long)]
    pub detect_renames: bool,

    /// Detect copied files and export them as integrations
    #[arg(short = 'C', long)]
    pub detect_copies: bool,

    /// Consider unmodified files as copy sources (expensive)
    #[arg(long)]
    pub find_copies_harder: bool,

    /// List the commits that would be exported and stop
    #[arg(long)]
    pub dry_run: bool,

    /// Resume an interrupted export from its pending commit queue
    #[arg(long = "continue", conflicts_with = "dry_run")]
    pub resume: bool,
}

#[derive(Args, Debug)]
pub struct UnshelveArgs {
    /// Shelved changelist number
    pub change: u32,

    /// Commit the synthesized parent is based on
    #[arg(long, default_value = "refs/remotes/p4/master")]
    pub origin: String,
}

#[derive(Args, Debug)]
pub struct BranchesArgs {
    /// Also query the server's branch specs
    #[arg(long)]
    pub from_server: bool,

    /// Print the mappings as JSON
    #[arg(long)]
    pub json: bool,
}

pub fn run_cli() -> Result<()> {
    let cli = Cli::parse();
    crate::runtime::init_tracing(cli.verbose)?;
    match cli.command {
        Command::Sync(args) => handle_sync(args),
        Command::Clone(args) => handle_clone(args),
        Command::Submit(args) => handle_submit(args),
        Command::Unshelve(args) => handle_unshelve(args),
        Command::Branches(args) => handle_branches(args),
    }
}

/// Split an optional `@revision` suffix off a depot path.
fn split_depot_revision(path: &str) -> (String, Option<String>) {
    match path.find('@') {
        Some(idx) => (path[..idx].to_string(), Some(path[idx..].to_string())),
        None => (path.to_string(), None),
    }
}

fn p4_from_config(git: &Git) -> P4 {
    P4::new().with_connection(
        git.config("depotsync.port"),
        git.config("depotsync.client"),
        git.config("depotsync.user"),
        git.config_int("depotsync.retries").unwrap_or(0).max(0) as u32,
    )
}

fn build_mapper(git: &Git, p4: &P4, depot_paths: Vec<String>, use_client_spec: bool) -> Result<PathMapper> {
    let mut mapper = PathMapper::new(depot_paths);
    mapper.ignore_case = git.config_bool("depotsync.ignoreCase", false);
    mapper.excludes = git
        .config_list("depotsync.exclude")
        .into_iter()
        .map(|e| crate::mapper::wildcard_encode(&e))
        .collect();
    if use_client_spec || git.config_bool("depotsync.useClientSpec", false) {
        let records = p4.run_records(&["client", "-o"])?;
        let spec = records
            .iter()
            .find(|r| !r.is_error())
            .ok_or_else(|| SyncError::Consistency("client -o returned no spec".into()))?;
        let client_name = spec
            .text("Client")
            .ok_or_else(|| SyncError::Consistency("client spec has no name".into()))?;
        let mut view_lines = Vec::new();
        for index in 0.. {
            match spec.text(&format!("View{index}")) {
                Some(line) => view_lines.push(line),
                None => break,
            }
        }
        mapper.client_view = Some(ClientView::from_spec(&client_name, &view_lines));
    }
    Ok(mapper)
}

fn largefile_store(git: &Git) -> Result<Option<LargeFileStore>> {
    let policy = LargeFilePolicy {
        threshold: git.config_int("depotsync.largeFileThreshold").map(|v| v as u64),
        compressed_threshold: git
            .config_int("depotsync.largeFileCompressedThreshold")
            .map(|v| v as u64),
        extensions: git
            .config_list("depotsync.largeFileExtension")
            .into_iter()
            .map(|e| e.trim_start_matches('.').to_string())
            .collect::<BTreeSet<_>>(),
    };
    if !policy.is_active() {
        return Ok(None);
    }
    let store_dir = match git.config("depotsync.largeFileDir") {
        Some(dir) => PathBuf::from(dir),
        None => git.git_dir()?.join("depotsync").join("largefiles"),
    };
    Ok(Some(LargeFileStore::new(policy, store_dir)))
}

fn build_engine(git: Git, args: &SyncArgs, depot_paths: Vec<String>) -> Result<SyncEngine> {
    let p4 = p4_from_config(&git);
    let mapper = build_mapper(&git, &p4, depot_paths, args.use_client_spec)?;
    let largefiles = largefile_store(&git)?;
    let state_file = StateFile::in_git_dir(&git.git_dir()?);

    let mut branch_map = BranchMap::new(
        mapper
            .depot_paths
            .first()
            .cloned()
            .unwrap_or_else(|| "//".to_string()),
    );
    if args.detect_branches {
        branch_map.load_from_depot(&p4)?;
        branch_map.apply_overrides(&git.config_list("depotsync.branchList"));
    }

    let options = SyncOptions {
        import_ref: format!("refs/remotes/p4/{}", args.branch),
        detect_branches: args.detect_branches,
        import_labels: args.import_labels,
        keep_empty_commits: args.keep_empty_commits
            || git.config_bool("depotsync.keepEmptyCommits", false),
        max_changes: args.max_changes,
        checkpoint_interval: git
            .config_int("depotsync.checkpointInterval")
            .map(|v| v.max(1) as u32)
            .unwrap_or(100),
        ..Default::default()
    };
    SyncEngine::new(
        p4,
        git,
        mapper,
        UserMap::load(),
        branch_map,
        largefiles,
        state_file,
        options,
    )
}

fn handle_sync(args: SyncArgs) -> Result<()> {
    let git = Git::new();
    let git_dir = git
        .git_dir()
        .context("sync must run inside a git repository")?;
    let state = StateFile::in_git_dir(&git_dir).load()?;

    // An explicit range on a depot path wins over --changes.
    let mut range_spec = args.changes.clone();
    let mut depot_paths = Vec::new();
    for raw in &args.depot_paths {
        let (path, revision) = split_depot_revision(raw);
        depot_paths.push(path);
        if let Some(revision) = revision {
            range_spec = Some(revision);
        }
    }
    if depot_paths.is_empty() {
        depot_paths = state.depot_paths.clone();
    }
    if depot_paths.is_empty() {
        return Err(SyncError::Usage(
            "no depot paths given and none recorded from a previous run".into(),
        )
        .into());
    }
    let mut engine = build_engine(git, &args, depot_paths)?;
    let resume_from = engine.state.max_change();
    run_import(&mut engine, range_spec.as_deref(), resume_from)
}

fn run_import(
    engine: &mut SyncEngine,
    range_spec: Option<&str>,
    resume_from: Option<u32>,
) -> Result<()> {
    let range = match (range_spec, resume_from) {
        (Some(spec), _) => Some(ChangeRange::parse(spec)?),
        (None, Some(last)) => Some(ChangeRange::Numeric {
            begin: last + 1,
            end: None,
        }),
        (None, None) => None,
    };
    let summary = match range {
        Some(range) => {
            let block_size = 512;
            let changes = changes_for_paths(
                &engine.p4,
                &engine.mapper.depot_paths,
                &range,
                block_size,
            )?;
            info!(count = changes.len(), "changelists to import");
            engine.run(&changes)?
        }
        // First contact with no range: snapshot the head state.
        None => engine.import_head()?,
    };
    println!(
        "imported {} changelist(s), skipped {}, {} tag(s)",
        summary.imported, summary.skipped, summary.tags
    );
    Ok(())
}

fn handle_clone(args: CloneArgs) -> Result<()> {
    let mut depot_paths = Vec::new();
    let mut range_spec = None;
    for raw in &args.depot_paths {
        let (path, revision) = split_depot_revision(raw);
        depot_paths.push(path);
        if let Some(revision) = revision {
            range_spec = Some(revision);
        }
    }

    let destination = match &args.destination {
        Some(dir) => dir.clone(),
        None => {
            // Last path segment of the first depot path.
            let first = depot_paths[0].trim_end_matches('/');
            PathBuf::from(first.rsplit('/').next().unwrap_or("depot"))
        }
    };
    crate::util::ensure_dir(&destination)?;
    let git = Git::in_dir(destination.clone());
    git.run(&["init", "-q"])?;
    info!(dir = %destination.display(), "initialized repository");

    let sync_args = SyncArgs {
        depot_paths: Vec::new(),
        changes: None,
        detect_branches: args.sync.detect_branches,
        import_labels: args.sync.import_labels,
        keep_empty_commits: false,
        max_changes: None,
        branch: "master".to_string(),
        use_client_spec: args.sync.use_client_spec,
    };
    let mut engine = build_engine(git.clone(), &sync_args, depot_paths)?;
    run_import(&mut engine, range_spec.as_deref(), None)?;

    let import_ref = engine.options().import_ref.clone();
    if git.succeeds(&["rev-parse", "--verify", "--quiet", &import_ref]) {
        git.run(&["checkout", "-q", "-b", "master", &import_ref])?;
    } else {
        warn!("nothing was imported; leaving the repository empty");
    }
    Ok(())
}

fn handle_submit(args: SubmitArgs) -> Result<()> {
    let git = Git::new();
    let git_dir = git
        .git_dir()
        .context("submit must run inside a git repository")?;
    let state = StateFile::in_git_dir(&git_dir).load()?;
    if state.depot_paths.is_empty() {
        return Err(SyncError::Usage(
            "this repository has no recorded depot paths; run sync first".into(),
        )
        .into());
    }

    let branch = args.branch.clone().unwrap_or_else(|| {
        git.read(&["symbolic-ref", "--short", "-q", "HEAD"])
            .unwrap_or_else(|_| "HEAD".to_string())
    });
    let allowed = git.config_list("depotsync.allowSubmit");
    if !allowed.is_empty() && !allowed.iter().any(|b| b == &branch) {
        return Err(SyncError::Usage(format!(
            "branch {branch} is not in depotsync.allowSubmit"
        ))
        .into());
    }

    if args.resume && state.pending_commits.is_empty() {
        return Err(SyncError::Usage(
            "no interrupted export to continue; the pending commit queue is empty".into(),
        )
        .into());
    }

    if args.dry_run {
        let range = format!("{}..{}", args.origin, branch);
        let lines = git.read_lines(&["log", "--reverse", "--no-merges", "--oneline", &range])?;
        if lines.is_empty() {
            println!("no commits to export");
        } else {
            println!("would export {} commit(s):", lines.len());
            for line in lines {
                println!("  {line}");
            }
        }
        return Ok(());
    }

    let mode = if !args.update_shelve.is_empty() {
        SubmitMode::UpdateShelve(args.update_shelve.clone())
    } else if args.shelve {
        SubmitMode::Shelve
    } else if args.prepare_only {
        SubmitMode::PrepareOnly
    } else {
        SubmitMode::Submit
    };
    let conflict = match args.conflict.as_str() {
        "ask" => ConflictPolicy::Interactive,
        "skip" => ConflictPolicy::AutoSkip,
        "quit" => ConflictPolicy::AutoAbort,
        other => {
            return Err(SyncError::Usage(format!(
                "unknown conflict policy '{other}' (expected ask, skip, or quit)"
            ))
            .into())
        }
    };

    let p4 = p4_from_config(&git);
    let options = SubmitOptions {
        mode,
        conflict,
        origin: args.origin.clone(),
        detect_renames: args.detect_renames || git.config_bool("depotsync.detectRenames", false),
        detect_copies: args.detect_copies || git.config_bool("depotsync.detectCopies", false),
        find_copies_harder: args.find_copies_harder
            || git.config_bool("depotsync.detectCopiesHarder", false),
        attempt_rcs_cleanup: git.config_bool("depotsync.attemptRcsCleanup", true),
    };
    let depot_paths = state.depot_paths.clone();
    let state_file = StateFile::in_git_dir(&git_dir);
    let mut engine = SubmitEngine::new(p4, git, depot_paths, state_file, options)?;

    let summary = if args.resume {
        engine.resume()?
    } else {
        engine.run(&branch)?
    };
    println!(
        "exported {} commit(s), skipped {}",
        summary.applied.len(),
        summary.skipped.len()
    );
    for commit in &summary.skipped {
        println!("skipped: {commit}");
    }
    Ok(())
}

fn handle_unshelve(args: UnshelveArgs) -> Result<()> {
    let git = Git::new();
    let git_dir = git
        .git_dir()
        .context("unshelve must run inside a git repository")?;
    let state = StateFile::in_git_dir(&git_dir).load()?;
    if state.depot_paths.is_empty() {
        return Err(SyncError::Usage(
            "this repository has no recorded depot paths; run sync first".into(),
        )
        .into());
    }

    let sync_args = SyncArgs {
        depot_paths: Vec::new(),
        changes: None,
        detect_branches: false,
        import_labels: false,
        keep_empty_commits: false,
        max_changes: None,
        branch: "master".to_string(),
        use_client_spec: false,
    };
    let mut engine = build_engine(git, &sync_args, state.depot_paths.clone())?;
    let target_ref = format!("refs/remotes/p4-unshelved/{}", args.change);
    engine.unshelve(args.change, &args.origin, &target_ref)?;
    println!("unshelved changelist {} onto {target_ref}", args.change);
    Ok(())
}

fn handle_branches(args: BranchesArgs) -> Result<()> {
    let git = Git::new();
    let git_dir = git
        .git_dir()
        .context("branches must run inside a git repository")?;
    let state = StateFile::in_git_dir(&git_dir).load()?;

    let base = state
        .depot_paths
        .first()
        .cloned()
        .unwrap_or_else(|| "//".to_string());
    let mut branch_map = BranchMap::new(base);
    for (branch, parent) in &state.branches {
        branch_map.insert(branch.clone(), parent.clone());
    }
    if args.from_server {
        let p4 = p4_from_config(&git);
        branch_map.load_from_depot(&p4)?;
    }
    branch_map.apply_overrides(&git.config_list("depotsync.branchList"));

    let listing: std::collections::BTreeMap<String, Option<String>> = branch_map
        .branches()
        .map(|b| (b.to_string(), branch_map.parent_of(b).map(str::to_string)))
        .collect();
    if args.json {
        println!("{}", serde_json::to_string_pretty(&listing)?);
        return Ok(());
    }
    if listing.is_empty() {
        println!("no branch mappings known");
    }
    for (branch, parent) in &listing {
        match parent {
            Some(parent) => println!("{branch} <- {parent}"),
            None => println!("{branch}"),
        }
    }
    Ok(())
}
