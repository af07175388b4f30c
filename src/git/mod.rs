//! Invocation layer for the local git repository, plus the long-lived
//! `git fast-import` child process the importer streams into.

use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::OnceLock;

use anyhow::{bail, Context, Result};
use regex::Regex;
use tracing::debug;

use crate::errors::SyncError;

#[derive(Debug, Clone, Default)]
pub struct Git {
    /// Run all commands inside this directory when set.
    pub work_dir: Option<PathBuf>,
    /// Explicit GIT_DIR, pinning the repository when commands must run
    /// from an unrelated working directory (the client workspace).
    pub pinned_git_dir: Option<PathBuf>,
}

impl Git {
    pub fn new() -> Self {
        Git::default()
    }

    pub fn in_dir(dir: PathBuf) -> Self {
        Git {
            work_dir: Some(dir),
            ..Default::default()
        }
    }

    /// Resolve the repository now and keep using it regardless of later
    /// working-directory changes.
    pub fn pin_git_dir(&mut self) -> Result<()> {
        let dir = self.git_dir()?;
        self.pinned_git_dir = Some(dir);
        Ok(())
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new("git");
        if let Some(dir) = &self.work_dir {
            cmd.current_dir(dir);
        }
        if let Some(git_dir) = &self.pinned_git_dir {
            cmd.env("GIT_DIR", git_dir);
        }
        cmd
    }

    fn invocation_failed(args: &[&str], status: i32, stderr: &[u8]) -> SyncError {
        SyncError::ToolInvocation {
            program: format!("git {}", args.join(" ")),
            status,
            stderr: String::from_utf8_lossy(stderr).trim().to_string(),
        }
    }

    /// Run and discard output; non-zero exit is an error.
    pub fn run(&self, args: &[&str]) -> Result<()> {
        debug!(args = args.join(" "), "git");
        let output = self
            .command()
            .args(args)
            .output()
            .context("failed to launch git")?;
        if !output.status.success() {
            return Err(
                Self::invocation_failed(args, output.status.code().unwrap_or(-1), &output.stderr)
                    .into(),
            );
        }
        Ok(())
    }

    /// Run and return trimmed stdout.
    pub fn read(&self, args: &[&str]) -> Result<String> {
        Ok(String::from_utf8_lossy(&self.read_bytes(args)?)
            .trim_end()
            .to_string())
    }

    pub fn read_lines(&self, args: &[&str]) -> Result<Vec<String>> {
        Ok(self
            .read(args)?
            .lines()
            .map(|l| l.to_string())
            .collect())
    }

    pub fn read_bytes(&self, args: &[&str]) -> Result<Vec<u8>> {
        debug!(args = args.join(" "), "git");
        let output = self
            .command()
            .args(args)
            .output()
            .context("failed to launch git")?;
        if !output.status.success() {
            return Err(
                Self::invocation_failed(args, output.status.code().unwrap_or(-1), &output.stderr)
                    .into(),
            );
        }
        Ok(output.stdout)
    }

    /// Run with bytes on stdin (patch application). Returns Ok(false) on
    /// non-zero exit so callers can treat "does not apply" as data.
    pub fn run_with_input(&self, args: &[&str], input: &[u8]) -> Result<bool> {
        debug!(args = args.join(" "), "git (stdin)");
        let mut child = self
            .command()
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .context("failed to launch git")?;
        child
            .stdin
            .take()
            .context("child stdin unavailable")?
            .write_all(input)
            .context("failed to write to git stdin")?;
        Ok(child.wait().context("git did not exit")?.success())
    }

    /// True when the command exits zero; used for existence probes like
    /// `rev-parse --verify`.
    pub fn succeeds(&self, args: &[&str]) -> bool {
        self.command()
            .args(args)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }

    pub fn git_dir(&self) -> Result<PathBuf> {
        let dir = self.read(&["rev-parse", "--absolute-git-dir"])?;
        Ok(PathBuf::from(dir))
    }

    // Configuration. Absent keys are None/default, never errors.

    pub fn config(&self, key: &str) -> Option<String> {
        let output = self.command().args(["config", key]).output().ok()?;
        if output.status.success() {
            Some(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            None
        }
    }

    pub fn config_bool(&self, key: &str, default: bool) -> bool {
        let output = match self
            .command()
            .args(["config", "--type=bool", key])
            .output()
        {
            Ok(o) if o.status.success() => o,
            _ => return default,
        };
        String::from_utf8_lossy(&output.stdout).trim() == "true"
    }

    pub fn config_int(&self, key: &str) -> Option<i64> {
        self.config(key)?.parse().ok()
    }

    /// All values of a multi-valued key, in definition order.
    pub fn config_list(&self, key: &str) -> Vec<String> {
        let output = match self.command().args(["config", "--get-all", key]).output() {
            Ok(o) if o.status.success() => o,
            _ => return Vec::new(),
        };
        String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .collect()
    }
}

/// One entry from `git diff-tree -r`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffEntry {
    pub src_mode: String,
    pub dst_mode: String,
    pub src_sha: String,
    pub dst_sha: String,
    pub status: char,
    pub score: Option<u32>,
    pub path: String,
    /// Destination path for copies and renames.
    pub dst_path: Option<String>,
}

fn diff_tree_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^:(\d+) (\d+) ([0-9a-f]+) ([0-9a-f]+) ([A-Z])(\d+)?\t(.*?)((\t)(.*))?$")
            .expect("diff-tree pattern is valid")
    })
}

/// Parse the raw-format diff lines between two commits.
pub fn parse_diff_tree(output: &str) -> Result<Vec<DiffEntry>> {
    let re = diff_tree_re();
    let mut entries = Vec::new();
    for line in output.lines() {
        if line.is_empty() {
            continue;
        }
        let caps = re
            .captures(line)
            .ok_or_else(|| SyncError::Consistency(format!("unparsable diff-tree line: {line}")))?;
        entries.push(DiffEntry {
            src_mode: caps[1].to_string(),
            dst_mode: caps[2].to_string(),
            src_sha: caps[3].to_string(),
            dst_sha: caps[4].to_string(),
            status: caps[5].chars().next().unwrap_or('?'),
            score: caps.get(6).and_then(|m| m.as_str().parse().ok()),
            path: caps[7].to_string(),
            dst_path: caps.get(10).map(|m| m.as_str().to_string()),
        });
    }
    Ok(entries)
}

/// Provenance trailer appended to every imported commit message, and the
/// parser that reads it back.
pub fn provenance_trailer(depot_paths: &[String], change: u32) -> String {
    format!(
        "[depotsync: depot-paths = \"{}\": change = {}]",
        depot_paths.join(","),
        change
    )
}

fn trailer_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"\[depotsync: depot-paths = "(.*?)": change = (\d+)\]"#)
            .expect("trailer pattern is valid")
    })
}

/// Extract (depot paths, change number) from a commit message carrying a
/// provenance trailer. The last trailer in the message wins.
pub fn parse_provenance(message: &str) -> Option<(Vec<String>, u32)> {
    let caps = trailer_re().captures_iter(message).last()?;
    let paths = caps[1]
        .split(',')
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect();
    let change = caps[2].parse().ok()?;
    Some((paths, change))
}

/// Sink for fast-import commands. The production implementation is a
/// `git fast-import` child; tests capture the byte stream instead.
pub trait ImportSink {
    fn write(&mut self, data: &[u8]) -> Result<()>;
    fn checkpoint(&mut self) -> Result<()>;
}

impl ImportSink for Vec<u8> {
    fn write(&mut self, data: &[u8]) -> Result<()> {
        self.extend_from_slice(data);
        Ok(())
    }

    fn checkpoint(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Handle on a running `git fast-import` process.
pub struct FastImport {
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: BufReader<ChildStdout>,
}

impl FastImport {
    pub fn open(git: &Git) -> Result<Self> {
        let mut child = git
            .command()
            .args(["fast-import", "--quiet", "--done"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn()
            .context("failed to launch git fast-import")?;
        let stdin = child.stdin.take().context("fast-import stdin unavailable")?;
        let stdout = BufReader::new(
            child
                .stdout
                .take()
                .context("fast-import stdout unavailable")?,
        );
        Ok(FastImport {
            child,
            stdin: Some(stdin),
            stdout,
        })
    }

    fn stdin(&mut self) -> Result<&mut ChildStdin> {
        self.stdin
            .as_mut()
            .context("fast-import stream already closed")
    }

    /// Close the stream and wait for the importer to finish.
    pub fn close(mut self) -> Result<()> {
        self.stdin()?.write_all(b"done\n")?;
        drop(self.stdin.take());
        let status = self.child.wait().context("fast-import did not exit")?;
        if !status.success() {
            bail!(SyncError::ToolInvocation {
                program: "git fast-import".to_string(),
                status: status.code().unwrap_or(-1),
                stderr: String::new(),
            });
        }
        Ok(())
    }

    /// Abandon the stream after a fatal error, reaping the child.
    pub fn abort(mut self) {
        drop(self.stdin.take());
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

impl ImportSink for FastImport {
    fn write(&mut self, data: &[u8]) -> Result<()> {
        self.stdin()?
            .write_all(data)
            .context("failed to write to fast-import")
    }

    /// Flush importer state and wait for acknowledgement, so refs are
    /// durable before run state records progress past them.
    fn checkpoint(&mut self) -> Result<()> {
        self.stdin()?
            .write_all(b"checkpoint\n\nprogress checkpoint\n\n")
            .context("failed to write checkpoint")?;
        self.stdin()?.flush()?;
        let mut line = String::new();
        self.stdout
            .read_line(&mut line)
            .context("fast-import closed during checkpoint")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diff_tree_modify_and_rename() {
        let raw = ":100644 100755 ab12cd34 ef56ab78 M\tsrc/main.rs\n\
                   :100644 100644 11111111 22222222 R095\told/name.txt\tnew/name.txt\n";
        let entries = parse_diff_tree(raw).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].status, 'M');
        assert_eq!(entries[0].path, "src/main.rs");
        assert_eq!(entries[0].dst_path, None);
        assert_eq!(entries[1].status, 'R');
        assert_eq!(entries[1].score, Some(95));
        assert_eq!(entries[1].path, "old/name.txt");
        assert_eq!(entries[1].dst_path.as_deref(), Some("new/name.txt"));
    }

    #[test]
    fn diff_tree_rejects_garbage() {
        assert!(parse_diff_tree("not a diff line").is_err());
    }

    #[test]
    fn provenance_round_trip() {
        let paths = vec!["//depot/main/".to_string(), "//depot/lib/".to_string()];
        let trailer = provenance_trailer(&paths, 1234);
        let message = format!("Fix the thing\n\n{trailer}\n");
        let (parsed_paths, change) = parse_provenance(&message).unwrap();
        assert_eq!(parsed_paths, paths);
        assert_eq!(change, 1234);
    }

    #[test]
    fn provenance_last_trailer_wins() {
        let message = format!(
            "msg\n{}\n{}\n",
            provenance_trailer(&["//a/".to_string()], 1),
            provenance_trailer(&["//b/".to_string()], 2)
        );
        let (paths, change) = parse_provenance(&message).unwrap();
        assert_eq!(paths, vec!["//b/".to_string()]);
        assert_eq!(change, 2);
    }

    #[test]
    fn provenance_absent() {
        assert!(parse_provenance("no trailer here").is_none());
    }
}
