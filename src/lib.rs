//! Run orchestration and live monitoring for long-running simulation pipelines.
//!
//! A [`Supervisor`] drives each run's external stages, streams their output
//! through a [`LogHub`], derives progress with a [`ProgressEstimator`] and
//! answers cheap polling snapshots through a [`StatusReconciler`].

pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod loghub;
pub mod model;
pub mod orchestrator;
pub mod progress;
pub mod registry;
pub mod status;
pub mod storage;
pub mod telemetry;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::SupervisorConfig;
pub use engine::{ProcessLauncher, ShellLauncher, StagePlan, StageSpec};
pub use error::{LaunchError, SupervisorError};
pub use loghub::{LogHub, LogHubConfig, LogSubscription};
pub use model::{
    LogLine, PostStage, ProgressSnapshot, RunConfig, RunId, RunRecord, RunStatus, StageCommands,
    StatusReport, StatusView, TerminalReason,
};
pub use orchestrator::{run_controller, Supervisor, UiCommand};
pub use progress::ProgressEstimator;
pub use registry::{RunRegistry, RunStart, Transition};
pub use status::{DashboardModel, Reconciliation, StatusReconciler};
