//! Error types returned at the supervisor boundary.
//!
//! Pipeline failures are not errors in this sense: a stage that exits non-zero
//! or cannot be spawned is recorded on the run record as a [`TerminalReason`]
//! and observed through snapshots. The variants below are only returned for
//! requests that are rejected synchronously.
//!
//! [`TerminalReason`]: crate::model::TerminalReason

use crate::model::{RunId, RunStatus};
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SupervisorError {
    /// No record exists for the requested id
    #[error("run not found: {run}")]
    RunNotFound { run: RunId },

    /// Bad or missing configuration, e.g. a non-positive end time
    #[error("invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    /// The operation is not allowed while the run is executing
    #[error("run {run} is running")]
    RunActive { run: RunId },

    /// The requested status change is not an edge of the run state machine
    #[error("invalid transition for run {run}: {from} -> {to}")]
    InvalidTransition {
        run: RunId,
        from: RunStatus,
        to: RunStatus,
    },
}

impl SupervisorError {
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        SupervisorError::InvalidConfig {
            reason: reason.into(),
        }
    }

    /// True for errors caused by the caller's request rather than by run state.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            SupervisorError::InvalidConfig { .. } | SupervisorError::RunNotFound { .. }
        )
    }
}

/// Failure to start an external stage process.
#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("working directory does not exist: {}", path.display())]
    MissingWorkDir { path: PathBuf },

    #[error("failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
}
