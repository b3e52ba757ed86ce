//! Error types for gpupilot
//!
//! Two families, matching how failures propagate:
//!
//! - `ProbeError`: a read-only diagnostic command failed or printed something
//!   unparseable. Always absorbed by the detector, which substitutes a default.
//! - `PilotError`: problems that must reach the caller before or around a
//!   transaction (unsupported environment, bad input, a second transaction
//!   while one is in flight).
//!
//! A failed privileged chain is NOT an error value. It is reported as
//! `TransactionStatus::Failed` inside a `TransactionReport`, together with the
//! exit code, stderr and the exact command list.

use thiserror::Error;

/// Failure of a read-only probe
#[derive(Error, Debug)]
pub enum ProbeError {
    /// The tool needed for the probe is not on PATH
    #[error("tool not available: {0}")]
    ToolMissing(String),

    /// The probe command exited non-zero or could not be spawned
    #[error("probe command failed: {command}")]
    CommandFailed { command: String },

    /// The probe ran but its output did not contain what we looked for
    #[error("could not parse {what}")]
    Unparseable { what: String },

    /// Reading a procfs/sysfs file failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProbeError {
    pub fn command_failed(command: impl Into<String>) -> Self {
        Self::CommandFailed {
            command: command.into(),
        }
    }

    pub fn unparseable(what: impl Into<String>) -> Self {
        Self::Unparseable { what: what.into() }
    }
}

/// Main error type for gpupilot
#[derive(Error, Debug)]
pub enum PilotError {
    /// IO errors (config files, thread spawning)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration errors (loading, validation)
    #[error("Configuration error: {0}")]
    Config(String),

    /// A required tool or package manager is missing; refused before elevation
    #[error("Unsupported environment: {0}")]
    EnvironmentUnsupported(String),

    /// Driver version string rejected before it reaches a shell
    #[error("Invalid driver version: {0:?}")]
    InvalidVersion(String),

    /// Country code is not two ASCII letters
    #[error("Invalid country code: {0:?}")]
    InvalidCountryCode(String),

    /// Another transaction is still running
    #[error("A transaction is already in progress: {0}")]
    TransactionInFlight(String),

    /// Transaction state machine rejected a transition
    #[error("Invalid transaction transition: {0}")]
    InvalidTransition(String),

    /// A chain was handed to the executor without any steps
    #[error("Empty command chain for task: {0}")]
    EmptyChain(String),

    /// Background worker thread problems (panicked, channel closed)
    #[error("Worker error: {0}")]
    Worker(String),
}

/// Result type alias for gpupilot operations
pub type Result<T> = std::result::Result<T, PilotError>;

impl PilotError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn unsupported(msg: impl Into<String>) -> Self {
        Self::EnvironmentUnsupported(msg.into())
    }

    pub fn invalid_transition(msg: impl Into<String>) -> Self {
        Self::InvalidTransition(msg.into())
    }

    pub fn worker(msg: impl Into<String>) -> Self {
        Self::Worker(msg.into())
    }

    /// Returns true for errors raised before any privilege prompt was shown.
    pub fn is_pre_elevation(&self) -> bool {
        matches!(
            self,
            Self::EnvironmentUnsupported(_)
                | Self::InvalidVersion(_)
                | Self::InvalidCountryCode(_)
                | Self::TransactionInFlight(_)
                | Self::EmptyChain(_)
        )
    }
}
