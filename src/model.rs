use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use time::OffsetDateTime;

/// Opaque run identifier, assigned once at creation.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(String);

impl RunId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RunId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Created,
    Running,
    Completed,
    Failed,
    Stopped,
}

impl RunStatus {
    /// Completed, failed and stopped end an execution; only a new start leaves them.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Stopped
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Created => "created",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Stopped => "stopped",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why an execution ended. Recorded on every terminal transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TerminalReason {
    Completed,
    StageFailed {
        stage: String,
        exit_code: Option<i32>,
        signal: Option<i32>,
    },
    LaunchFailed {
        stage: String,
        message: String,
    },
    Stopped {
        stage: String,
    },
    /// The record was still running when the supervisor process went away.
    Interrupted,
}

impl TerminalReason {
    /// Render a human-readable message for UI/CLI layers.
    pub fn to_message(&self) -> String {
        match self {
            TerminalReason::Completed => "completed".to_string(),
            TerminalReason::StageFailed {
                stage,
                exit_code,
                signal,
            } => match (exit_code, signal) {
                (Some(code), _) => format!("stage {stage} exited with code {code}"),
                (None, Some(sig)) => format!("stage {stage} killed by signal {sig}"),
                (None, None) => format!("stage {stage} failed"),
            },
            TerminalReason::LaunchFailed { stage, message } => {
                format!("stage {stage} could not be launched: {message}")
            }
            TerminalReason::Stopped { stage } if stage.is_empty() => "stopped".to_string(),
            TerminalReason::Stopped { stage } => format!("stopped during {stage}"),
            TerminalReason::Interrupted => "interrupted by supervisor restart".to_string(),
        }
    }
}

impl fmt::Display for TerminalReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_message())
    }
}

fn default_workers() -> usize {
    4
}

fn default_solver() -> String {
    "simpleFoam".to_string()
}

/// State of one run, owned by the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: RunId,
    #[serde(default)]
    pub name: Option<String>,
    pub status: RunStatus,
    /// Stage currently executing. Kept after a terminal transition for
    /// postmortem and cleared by the next start.
    #[serde(default)]
    pub pipeline_stage: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub started_at: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub ended_at: Option<OffsetDateTime>,
    pub configured_end_time: f64,
    #[serde(default)]
    pub solve_duration_seconds: Option<f64>,
    pub work_dir: PathBuf,
    #[serde(default)]
    pub parallel: bool,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default)]
    pub reason: Option<TerminalReason>,
    /// Settings of the planned or most recent start; what a restart reuses.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<RunConfig>,
}

impl RunRecord {
    /// Label for presentation layers: the user name if set, otherwise the id.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(self.run_id.as_str())
    }
}

/// One line of stage output. Immutable once published.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogLine {
    pub run_id: RunId,
    pub sequence: u64,
    /// Name of the stage that produced the line.
    pub stream_tag: String,
    pub text: String,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub run_id: RunId,
    pub sim_time: Option<f64>,
    pub percent: f64,
    pub eta_seconds: Option<f64>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub updated_at: Option<OffsetDateTime>,
}

impl ProgressSnapshot {
    pub fn empty(run_id: RunId) -> Self {
        Self {
            run_id,
            sim_time: None,
            percent: 0.0,
            eta_seconds: None,
            updated_at: None,
        }
    }
}

/// Denormalized per-run entry of a status report. Never stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusView {
    pub run_id: RunId,
    pub name: String,
    pub status: RunStatus,
    pub stage: String,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub started_at: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub ended_at: Option<OffsetDateTime>,
    pub end_time: f64,
    pub sim_time: Option<f64>,
    pub percent: f64,
    pub eta_seconds: Option<f64>,
    pub reason: Option<TerminalReason>,
    pub recent_logs: Vec<LogLine>,
}

/// Result of one reconciliation poll.
///
/// `run_ids` is the structural signal (which cards exist); everything inside
/// `runs` is content that consumers update in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    #[serde(with = "time::serde::rfc3339")]
    pub generated_at: OffsetDateTime,
    pub active: bool,
    pub run_ids: Vec<RunId>,
    pub runs: Vec<StatusView>,
}

/// Command overrides for the built-in pipeline stages.
///
/// `{solver}` and `{workers}` placeholders are substituted in every override.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageCommands {
    #[serde(default)]
    pub decompose: Option<String>,
    #[serde(default)]
    pub solve: Option<String>,
    #[serde(default)]
    pub reconstruct: Option<String>,
}

/// Extra stage appended after the solver pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostStage {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub required: bool,
}

/// Per-start execution settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    /// Simulated-time horizon used for percent-complete.
    pub end_time: f64,
    #[serde(default)]
    pub parallel: bool,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_solver")]
    pub solver: String,
    #[serde(default)]
    pub commands: StageCommands,
    #[serde(default)]
    pub post: Vec<PostStage>,
    /// Optional new label applied by this start.
    #[serde(default)]
    pub name: Option<String>,
}

impl RunConfig {
    pub fn new(end_time: f64) -> Self {
        Self {
            end_time,
            parallel: false,
            workers: default_workers(),
            solver: default_solver(),
            commands: StageCommands::default(),
            post: Vec::new(),
            name: None,
        }
    }

    /// Reject settings the pipeline cannot act on.
    pub fn validate(&self) -> Result<(), crate::error::SupervisorError> {
        use crate::error::SupervisorError;

        if !self.end_time.is_finite() || self.end_time <= 0.0 {
            return Err(SupervisorError::invalid_config(format!(
                "end_time must be a positive number, got {}",
                self.end_time
            )));
        }
        if self.parallel && self.workers == 0 {
            return Err(SupervisorError::invalid_config(
                "parallel runs need at least one worker",
            ));
        }
        if self.solver.trim().is_empty() && self.commands.solve.is_none() {
            return Err(SupervisorError::invalid_config("solver command is empty"));
        }
        for stage in &self.post {
            if stage.name.trim().is_empty() || stage.command.trim().is_empty() {
                return Err(SupervisorError::invalid_config(
                    "post stages need a name and a command",
                ));
            }
        }
        Ok(())
    }
}
