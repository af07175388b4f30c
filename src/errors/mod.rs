use thiserror::Error;

/// Failure taxonomy for a conversion run.
///
/// `Usage` and fatal variants unwind to the top level; the CLI maps them
/// to exit codes (2 for usage, 1 for everything else). Per-commit apply
/// conflicts are recoverable and handled by the submit engine's conflict
/// policy before they ever reach the top level.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("{0}")]
    Usage(String),

    /// An external VCS command exited non-zero.
    #[error("{program} exited with {status}: {stderr}")]
    ToolInvocation {
        program: String,
        status: i32,
        stderr: String,
    },

    /// The external tool's structured output violated an invariant we
    /// rely on (wrong record count, mismatched filelog action, missing
    /// required field). Never recoverable: guessing would corrupt
    /// history.
    #[error("inconsistent output from external tool: {0}")]
    Consistency(String),

    /// A single commit failed to apply during submit. Surfaced in the
    /// run summary; whether the run continues depends on the configured
    /// conflict policy.
    #[error("commit {commit} failed to apply: {reason}")]
    ApplyConflict { commit: String, reason: String },
}

impl SyncError {
    pub fn exit_code(&self) -> i32 {
        match self {
            SyncError::Usage(_) => 2,
            _ => 1,
        }
    }
}

/// Exit code for an error chain: a typed `SyncError` anywhere in the
/// chain decides, anything else is a plain fatal error.
pub fn exit_code_for(err: &anyhow::Error) -> i32 {
    for cause in err.chain() {
        if let Some(sync) = cause.downcast_ref::<SyncError>() {
            return sync.exit_code();
        }
    }
    1
}
