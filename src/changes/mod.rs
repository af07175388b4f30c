//! Changelist enumeration and metadata extraction.
//!
//! All depot output is normalized here, once, into [`ChangeRecord`]s with
//! closed enums; nothing downstream re-parses action or type strings.

use std::collections::BTreeSet;

use anyhow::{Context, Result};
use tracing::{debug, warn};

use crate::errors::SyncError;
use crate::mapper::PathMapper;
use crate::models::{ChangeRecord, FileAction, FileChange, FileType};
use crate::p4::marshal::Record;
use crate::p4::P4;

/// Inclusive changelist range requested on the command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeRange {
    /// Everything from the first changelist to the current head.
    All,
    /// Numeric bounds; `end` of `None` means head.
    Numeric { begin: u32, end: Option<u32> },
    /// Anything else (date specs and the like) is handed to the server
    /// verbatim in a single unbatched query.
    Raw(String),
}

impl ChangeRange {
    /// Parse a `@...` revision suffix. An empty spec means "everything
    /// after what run state already has", which callers express as
    /// `Numeric { begin, end: None }` themselves.
    pub fn parse(spec: &str) -> Result<Self> {
        let spec = spec.trim();
        if spec.is_empty() || spec == "@all" {
            return Ok(ChangeRange::All);
        }
        let body = spec.strip_prefix('@').ok_or_else(|| {
            SyncError::Usage(format!("revision range must start with '@': {spec}"))
        })?;
        let (begin_raw, end_raw) = match body.split_once(',') {
            Some((b, e)) => (b, Some(e)),
            None => (body, None),
        };
        let begin: u32 = match begin_raw.parse() {
            Ok(n) => n,
            Err(_) => return Ok(ChangeRange::Raw(spec.to_string())),
        };
        let end = match end_raw {
            None | Some("#head") => None,
            Some(raw) => match raw.parse() {
                Ok(n) => Some(n),
                Err(_) => return Ok(ChangeRange::Raw(spec.to_string())),
            },
        };
        Ok(ChangeRange::Numeric { begin, end })
    }
}

/// Most recent submitted changelist across the whole depot.
pub fn last_change(p4: &P4) -> Result<u32> {
    let records = p4.run_records(&["changes", "-m", "1", "-s", "submitted"])?;
    let record = records
        .iter()
        .find(|r| !r.is_error())
        .ok_or_else(|| SyncError::Consistency("no submitted changelists on server".into()))?;
    record
        .int("change")
        .map(|c| c as u32)
        .ok_or_else(|| SyncError::Consistency("changes record without change number".into()).into())
}

fn block_too_large(message: &str) -> bool {
    message.contains("Too many rows scanned") || message.contains("Request too large")
}

/// Enumerate submitted changelists touching any of `depot_paths` within
/// `range`, ascending and deduplicated.
///
/// Large servers reject unbounded `changes` queries, so numeric ranges
/// are walked in blocks; a block the server still rejects is halved
/// until it fits.
pub fn changes_for_paths(
    p4: &P4,
    depot_paths: &[String],
    range: &ChangeRange,
    initial_block_size: u32,
) -> Result<Vec<u32>> {
    let (mut begin, end) = match range {
        ChangeRange::All => (1, last_change(p4)?),
        ChangeRange::Numeric { begin, end } => (*begin, match end {
            Some(e) => *e,
            None => last_change(p4)?,
        }),
        ChangeRange::Raw(spec) => {
            let mut changes = BTreeSet::new();
            for path in depot_paths {
                let query = format!("{path}...{spec}");
                collect_changes(p4, &query, &mut changes)?;
            }
            return Ok(changes.into_iter().collect());
        }
    };

    let mut block_size = initial_block_size.max(1);
    let mut changes = BTreeSet::new();
    while begin <= end {
        let block_end = end.min(begin.saturating_add(block_size - 1));
        let mut block_ok = true;
        let mut block_changes = BTreeSet::new();
        for path in depot_paths {
            let query = format!("{path}...@{begin},{block_end}");
            match collect_changes(p4, &query, &mut block_changes) {
                Ok(()) => {}
                Err(err) if block_too_large(&err.to_string()) => {
                    block_ok = false;
                    break;
                }
                Err(err) => return Err(err),
            }
        }
        if !block_ok {
            if block_size == 1 {
                return Err(SyncError::Consistency(
                    "server rejected a single-changelist query as too large".into(),
                )
                .into());
            }
            block_size = (block_size / 2).max(1);
            debug!(block_size, "server rejected block, halving");
            continue;
        }
        changes.extend(block_changes);
        begin = block_end + 1;
    }
    Ok(changes.into_iter().collect())
}

fn collect_changes(p4: &P4, query: &str, out: &mut BTreeSet<u32>) -> Result<()> {
    for record in p4.run_records(&["changes", query])? {
        if record.is_error() {
            let data = record.text("data").unwrap_or_default();
            if block_too_large(&data) {
                return Err(SyncError::Consistency(data).into());
            }
            return Err(SyncError::Consistency(format!("changes query failed: {data}")).into());
        }
        if let Some(change) = record.int("change") {
            out.insert(change as u32);
        }
    }
    Ok(())
}

/// Fetch and normalize one changelist's metadata. Unwanted files are
/// dropped here so every later stage sees only in-scope paths.
pub fn describe(
    p4: &P4,
    mapper: &PathMapper,
    change: u32,
    shelved: bool,
) -> Result<ChangeRecord> {
    let change_arg = change.to_string();
    let args: Vec<&str> = if shelved {
        vec!["describe", "-s", "-S", &change_arg]
    } else {
        vec!["describe", "-s", &change_arg]
    };
    let records = p4
        .run_records(&args)
        .with_context(|| format!("describe of changelist {change} failed"))?;

    // A valid describe is exactly one record carrying a timestamp.
    // Anything else means the changelist does not exist or the server
    // sent an error disguised as data.
    if records.len() != 1 {
        return Err(SyncError::Consistency(format!(
            "describe of changelist {change} returned {} records, expected 1",
            records.len()
        ))
        .into());
    }
    let record = &records[0];
    if record.is_error() {
        return Err(SyncError::Consistency(format!(
            "describe of changelist {change} failed: {}",
            record.text("data").unwrap_or_default()
        ))
        .into());
    }
    if !record.contains("time") {
        return Err(SyncError::Consistency(format!(
            "describe of changelist {change} carries no timestamp"
        ))
        .into());
    }

    let timestamp = record
        .int("time")
        .ok_or_else(|| SyncError::Consistency(format!("unparsable time on change {change}")))?;
    Ok(ChangeRecord {
        id: change,
        author: record.text("user").unwrap_or_default(),
        timestamp,
        description: record.text("desc").unwrap_or_default(),
        files: extract_files(record, mapper, shelved.then_some(change))?,
        jobs: extract_jobs(record),
    })
}

/// Pull the indexed `depotFileN`/`actionN`/`revN`/`typeN` quads out of a
/// describe record, filtered to wanted paths.
pub fn extract_files(
    record: &Record,
    mapper: &PathMapper,
    shelved_change: Option<u32>,
) -> Result<Vec<FileChange>> {
    let mut files = Vec::new();
    for index in 0.. {
        let depot_path = match record.text(&format!("depotFile{index}")) {
            Some(p) => p,
            None => break,
        };
        if !mapper.is_wanted(&depot_path) {
            continue;
        }
        let action_raw = record
            .text(&format!("action{index}"))
            .unwrap_or_default();
        let action = match FileAction::parse(&action_raw) {
            Some(a) => a,
            None => {
                warn!(path = %depot_path, action = %action_raw, "unknown file action, treating as edit");
                FileAction::Edit
            }
        };
        let type_raw = record.text(&format!("type{index}")).unwrap_or_default();
        let file_type = FileType::parse(&type_raw).ok_or_else(|| {
            SyncError::Consistency(format!("unknown file type {type_raw} on {depot_path}"))
        })?;
        let revision = record
            .int(&format!("rev{index}"))
            .unwrap_or(1)
            .max(1) as u32;
        files.push(FileChange {
            depot_path,
            revision,
            action,
            file_type,
            shelved_change,
        });
    }
    Ok(files)
}

fn extract_jobs(record: &Record) -> Vec<String> {
    let mut jobs = Vec::new();
    for index in 0.. {
        match record.text(&format!("job{index}")) {
            Some(job) => jobs.push(job),
            None => break,
        }
    }
    jobs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::p4::marshal::Record;

    #[test]
    fn range_parsing() {
        assert_eq!(ChangeRange::parse("@all").unwrap(), ChangeRange::All);
        assert_eq!(
            ChangeRange::parse("@100,200").unwrap(),
            ChangeRange::Numeric {
                begin: 100,
                end: Some(200)
            }
        );
        assert_eq!(
            ChangeRange::parse("@100,#head").unwrap(),
            ChangeRange::Numeric {
                begin: 100,
                end: None
            }
        );
        assert_eq!(
            ChangeRange::parse("@2024/01/01,2024/06/01").unwrap(),
            ChangeRange::Raw("@2024/01/01,2024/06/01".to_string())
        );
        assert!(ChangeRange::parse("100,200").is_err());
    }

    #[test]
    fn extract_files_filters_and_decodes() {
        let record = Record::from_pairs(&[
            ("depotFile0", "//depot/main/src/a.rs"),
            ("action0", "edit"),
            ("type0", "text"),
            ("rev0", "3"),
            ("depotFile1", "//depot/other/b.rs"),
            ("action1", "add"),
            ("type1", "text"),
            ("rev1", "1"),
            ("depotFile2", "//depot/main/gone.rs"),
            ("action2", "move/delete"),
            ("type2", "text"),
            ("rev2", "7"),
        ]);
        let mapper = PathMapper::new(vec!["//depot/main/".to_string()]);
        let files = extract_files(&record, &mapper, None).unwrap();
        assert_eq!(files.len(), 2);
        assert_eq!(files[0].depot_path, "//depot/main/src/a.rs");
        assert_eq!(files[0].action, FileAction::Edit);
        assert_eq!(files[0].revision, 3);
        assert!(files[1].action.is_delete());
    }

    #[test]
    fn extract_jobs_in_order() {
        let record = Record::from_pairs(&[("job0", "JOB-1"), ("job1", "JOB-2")]);
        assert_eq!(extract_jobs(&record), vec!["JOB-1", "JOB-2"]);
    }
}
