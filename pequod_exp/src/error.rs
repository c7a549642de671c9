use std::path::PathBuf;
use thiserror::Error;

/// Failures the orchestrator needs to tell apart; everything else travels as
/// a plain `color_eyre::Report`.
#[derive(Debug, Error)]
pub enum ExpError {
    #[error("could not reach host {host}: {reason}")]
    Connection { host: String, reason: String },

    #[error("command on host {host} exited with code {code:?}: {command}")]
    RemoteCommand {
        host: String,
        command: String,
        code: Option<i32>,
    },

    #[error("timed out after {secs}s waiting for {what}")]
    ProvisioningTimeout { what: String, secs: u64 },

    #[error("wanted {wanted} {role} host(s) but only {available} available")]
    InsufficientCapacity {
        role: String,
        wanted: usize,
        available: usize,
    },

    #[error("malformed result file {path}: {reason}")]
    MalformedResult { path: PathBuf, reason: String },

    #[error("{} worker(s) failed: {}", failed.len(), failed.join(", "))]
    PartialFailure {
        failed: Vec<String>,
        first_code: Option<i32>,
    },

    #[error("interrupted by operator")]
    Interrupted,

    #[error("invalid experiment definition: {0}")]
    InvalidDefinition(String),
}

impl ExpError {
    /// Extracts an `ExpError` from anywhere in a report's chain.
    pub fn find(report: &color_eyre::Report) -> Option<&ExpError> {
        report.chain().find_map(|cause| cause.downcast_ref::<ExpError>())
    }

    pub fn is_interrupted(report: &color_eyre::Report) -> bool {
        matches!(Self::find(report), Some(ExpError::Interrupted))
    }
}
