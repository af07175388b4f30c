//! Invocation layer for the depot command-line client.
//!
//! Everything that talks to the depot goes through [`P4`], which owns the
//! binary name and the connection flags and exposes the three invocation
//! shapes the rest of the tool needs: plain text output, a fully decoded
//! record list, and an incremental record stream with batched path input.

pub mod marshal;

use std::io::{BufReader, Read, Write};
use std::process::{Child, Command, Stdio};

use anyhow::{Context, Result};
use tracing::debug;

use crate::errors::SyncError;
use marshal::Record;

/// Connection parameters resolved once at startup (environment plus
/// repository configuration) and threaded explicitly to every call site.
#[derive(Debug, Clone, Default)]
pub struct P4 {
    program: String,
    port: Option<String>,
    client: Option<String>,
    user: Option<String>,
    /// Retry count passed through with `-r`; zero omits the flag.
    retries: u32,
}

impl P4 {
    pub fn new() -> Self {
        P4 {
            program: std::env::var("DEPOTSYNC_P4_BIN").unwrap_or_else(|_| "p4".to_string()),
            ..Default::default()
        }
    }

    pub fn with_connection(
        mut self,
        port: Option<String>,
        client: Option<String>,
        user: Option<String>,
        retries: u32,
    ) -> Self {
        self.port = port;
        self.client = client;
        self.user = user;
        self.retries = retries;
        self
    }

    pub fn client(&self) -> Option<&str> {
        self.client.as_deref()
    }

    fn base_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        if self.retries > 0 {
            cmd.arg("-r").arg(self.retries.to_string());
        }
        if let Some(port) = &self.port {
            cmd.arg("-p").arg(port);
        }
        if let Some(client) = &self.client {
            cmd.arg("-c").arg(client);
        }
        if let Some(user) = &self.user {
            cmd.arg("-u").arg(user);
        }
        cmd
    }

    fn invocation_failed(&self, args: &[&str], status: i32, stderr: &[u8]) -> SyncError {
        SyncError::ToolInvocation {
            program: format!("{} {}", self.program, args.join(" ")),
            status,
            stderr: String::from_utf8_lossy(stderr).trim().to_string(),
        }
    }

    /// Run a plain (non-record) command and return stdout as text.
    pub fn run_text(&self, args: &[&str]) -> Result<String> {
        debug!(args = args.join(" "), "p4");
        let output = self
            .base_command()
            .args(args)
            .output()
            .with_context(|| format!("failed to launch {}", self.program))?;
        if !output.status.success() {
            return Err(self
                .invocation_failed(args, output.status.code().unwrap_or(-1), &output.stderr)
                .into());
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Run a plain command with text fed on stdin (form-input commands
    /// like `submit -i` and `shelve -i`).
    pub fn run_text_with_stdin(&self, args: &[&str], input: &str) -> Result<String> {
        debug!(args = args.join(" "), "p4 (stdin form)");
        let mut child = self
            .base_command()
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("failed to launch {}", self.program))?;
        child
            .stdin
            .take()
            .context("child stdin unavailable")?
            .write_all(input.as_bytes())
            .context("failed to write form to p4 stdin")?;
        let output = child.wait_with_output().context("p4 did not exit")?;
        if !output.status.success() {
            return Err(self
                .invocation_failed(args, output.status.code().unwrap_or(-1), &output.stderr)
                .into());
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Run a record-mode command and decode every record. Non-zero exit
    /// is fatal; `error`-coded records are returned to the caller, who
    /// knows whether they are expected (e.g. "no such file").
    pub fn run_records(&self, args: &[&str]) -> Result<Vec<Record>> {
        self.records_inner(args, None)
    }

    /// Record-mode command with path arguments batched over stdin
    /// (`-x -`), sidestepping OS argument-length limits.
    pub fn run_records_with_input(&self, args: &[&str], input: &[String]) -> Result<Vec<Record>> {
        self.records_inner(args, Some(input))
    }

    fn records_inner(&self, args: &[&str], input: Option<&[String]>) -> Result<Vec<Record>> {
        let mut records = Vec::new();
        self.stream_records(args, input, &mut |record| {
            records.push(record);
            Ok(())
        })?;
        Ok(records)
    }

    /// Record-mode command with a per-record callback, decoding stdout
    /// incrementally. This is how bulk content fetches stay at O(1)
    /// memory per file rather than per batch.
    pub fn stream_records(
        &self,
        args: &[&str],
        input: Option<&[String]>,
        on_record: &mut dyn FnMut(Record) -> Result<()>,
    ) -> Result<()> {
        debug!(args = args.join(" "), "p4 -G");
        let mut cmd = self.base_command();
        cmd.arg("-G");
        if input.is_some() {
            cmd.arg("-x").arg("-");
            cmd.stdin(Stdio::piped());
        } else {
            cmd.stdin(Stdio::null());
        }
        cmd.args(args).stdout(Stdio::piped()).stderr(Stdio::piped());
        let mut child = cmd
            .spawn()
            .with_context(|| format!("failed to launch {}", self.program))?;

        // Feed the path list from a separate thread so a large batch
        // cannot deadlock against an unread stdout pipe.
        let writer = match (input, child.stdin.take()) {
            (Some(paths), Some(mut stdin)) => {
                let payload: Vec<u8> = paths
                    .iter()
                    .flat_map(|p| p.bytes().chain(std::iter::once(b'\n')))
                    .collect();
                Some(std::thread::spawn(move || stdin.write_all(&payload)))
            }
            _ => None,
        };

        let stdout = child.stdout.take().context("child stdout unavailable")?;
        let mut reader = BufReader::new(stdout);
        let stream_result = (|| -> Result<()> {
            while let Some(record) = marshal::read_record(&mut reader)
                .context("failed to decode p4 record stream")?
            {
                on_record(record)?;
            }
            Ok(())
        })();

        if stream_result.is_err() {
            // Reading stopped mid-stream, so the child may be blocked
            // writing into the full stdout pipe; stop it before waiting
            // or the wait below never returns.
            let _ = child.kill();
        }
        if let Some(handle) = writer {
            // A broken pipe here means the child exited early; the exit
            // status below reports the real failure.
            let _ = handle.join();
        }
        let status_err = self.wait_checking_status(&mut child, args);
        stream_result?;
        status_err
    }

    fn wait_checking_status(&self, child: &mut Child, args: &[&str]) -> Result<()> {
        let mut stderr = Vec::new();
        if let Some(mut pipe) = child.stderr.take() {
            let _ = pipe.read_to_end(&mut stderr);
        }
        let status = child.wait().context("p4 did not exit")?;
        if !status.success() {
            return Err(self
                .invocation_failed(args, status.code().unwrap_or(-1), &stderr)
                .into());
        }
        Ok(())
    }

    // Thin wrappers for the client-workspace verbs the submit engine
    // drives. Each takes encoded client-syntax or depot-syntax paths as
    // the caller already holds them.

    pub fn sync_file(&self, path: &str, force: bool) -> Result<()> {
        let mut args = vec!["sync"];
        if force {
            args.push("-f");
        }
        args.push(path);
        self.run_records(&args).map(|_| ())
    }

    pub fn edit(&self, path: &str, file_type: Option<&str>) -> Result<()> {
        let mut args = vec!["edit"];
        if let Some(ft) = file_type {
            args.push("-t");
            args.push(ft);
        }
        args.push(path);
        self.run_records(&args).map(|_| ())
    }

    pub fn add(&self, path: &str) -> Result<()> {
        // Paths with wildcard characters need -f to be accepted literally.
        if path.contains(['@', '#', '*', '%']) {
            self.run_records(&["add", "-f", path]).map(|_| ())
        } else {
            self.run_records(&["add", path]).map(|_| ())
        }
    }

    pub fn delete(&self, path: &str) -> Result<()> {
        self.run_records(&["delete", path]).map(|_| ())
    }

    pub fn revert(&self, path: &str) -> Result<()> {
        self.run_records(&["revert", path]).map(|_| ())
    }

    pub fn integrate(&self, src: &str, dest: &str) -> Result<()> {
        self.run_records(&["integrate", "-Dt", src, dest])
            .map(|_| ())
    }

    pub fn move_file(&self, src: &str, dest: &str) -> Result<()> {
        self.run_records(&["edit", src])?;
        self.run_records(&["move", "-k", src, dest]).map(|_| ())
    }

    pub fn reopen(&self, file_type: &str, path: &str) -> Result<()> {
        self.run_records(&["reopen", "-t", file_type, path])
            .map(|_| ())
    }

    pub fn reopen_in_change(&self, change: u32, path: &str) -> Result<()> {
        let change = change.to_string();
        self.run_records(&["reopen", "-c", &change, path]).map(|_| ())
    }

    pub fn opened_count(&self) -> Result<usize> {
        Ok(self
            .run_records(&["opened"])?
            .iter()
            .filter(|r| !r.is_error())
            .count())
    }

    /// Whether the server supports native `move`. Probing with a bogus
    /// revision spec fails fast either way; only the error text differs.
    pub fn has_move_command(&self) -> bool {
        let output = self
            .base_command()
            .args(["move", "-k", "@from", "@to"])
            .output();
        match output {
            Ok(out) => {
                let err = String::from_utf8_lossy(&out.stderr);
                !(err.contains("Unknown command") || err.contains("Invalid option"))
            }
            Err(_) => false,
        }
    }
}
