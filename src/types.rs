/// Core types and error taxonomy for the sandbox supervisor
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SandboxError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Process error: {0}")]
    Process(String),

    #[error("Archive error: {0}")]
    Archive(String),

    #[error("Lock error: {0}")]
    Lock(String),

    #[error("A run is already in progress")]
    Busy,

    #[error("Notification error: {0}")]
    Notify(String),
}

pub type Result<T> = std::result::Result<T, SandboxError>;

impl From<nix::errno::Errno> for SandboxError {
    fn from(err: nix::errno::Errno) -> Self {
        SandboxError::Process(err.to_string())
    }
}

/// How the supervised worker terminated, as observed by the intermediate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStatus {
    /// Worker exited on its own with the given code.
    Exited(i32),
    /// Worker was killed by the given signal.
    Signaled(i32),
    /// The timer expired before the worker exited.
    TimedOut,
    /// The intermediate failed to fork the worker or the timer.
    SpawnFailed,
}

/// Final classification of a run, as reported to the callback URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Finished,
    Failed,
    Timeout,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Finished => "finished",
            RunStatus::Failed => "failed",
            RunStatus::Timeout => "timeout",
        }
    }
}

/// Output streams recovered from the guest's output archive.
///
/// Missing entries are empty byte strings, never errors.
#[derive(Debug, Clone, Default)]
pub struct CapturedOutputs {
    pub test_output: Vec<u8>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

/// Everything the completion hook knows about a finished run.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub status: RunStatus,
    /// Inner exit code parsed from the output archive; absent when the run
    /// timed out, crashed, or produced no parseable `exit_code.txt`.
    pub exit_code: Option<i32>,
    pub outputs: CapturedOutputs,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_status_strings_match_wire_contract() {
        assert_eq!(RunStatus::Finished.as_str(), "finished");
        assert_eq!(RunStatus::Failed.as_str(), "failed");
        assert_eq!(RunStatus::Timeout.as_str(), "timeout");
    }

    #[test]
    fn run_status_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&RunStatus::Timeout).unwrap(),
            "\"timeout\""
        );
    }
}
