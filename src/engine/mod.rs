mod launcher;
mod plan;

pub use launcher::{
    LaunchRequest, ProcessLauncher, RunningStage, ShellLauncher, StageExit, TreeTerminator,
};
pub use plan::{set_subdomains, StagePlan, StageSpec, DECOMPOSE, RECONSTRUCT, SOLVE};

use crate::loghub::LogHub;
use crate::model::{RunConfig, RunId, RunStatus, TerminalReason};
use crate::progress::ProgressEstimator;
use crate::registry::{RunRegistry, Transition};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::mpsc;
use tokio::time::Instant;

/// How long to keep reading output after a stage exited. Orphaned
/// grandchildren can hold the pipe open indefinitely.
const OUTPUT_DRAIN_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunControl {
    /// Terminate the current stage and end the run as stopped
    Stop,
}

/// Shared collaborators a pipeline reports into.
#[derive(Clone)]
pub struct PipelineContext {
    pub registry: Arc<RunRegistry>,
    pub hub: Arc<LogHub>,
    pub progress: Arc<ProgressEstimator>,
    pub launcher: Arc<dyn ProcessLauncher>,
    pub kill_grace: Duration,
    pub stage_logs: bool,
}

enum StageOutcome {
    Exited(StageExit),
    LaunchFailed(String),
    WaitFailed(io::Error),
    Stopped,
}

/// Executes one run's stage plan, start to finish.
pub struct PipelineEngine {
    run_id: RunId,
    work_dir: PathBuf,
    plan: StagePlan,
    parallel: bool,
    workers: usize,
}

impl PipelineEngine {
    pub fn new(run_id: RunId, work_dir: PathBuf, cfg: &RunConfig) -> Self {
        Self {
            run_id,
            work_dir,
            plan: StagePlan::build(cfg),
            parallel: cfg.parallel,
            workers: cfg.workers,
        }
    }

    pub fn plan(&self) -> &StagePlan {
        &self.plan
    }

    /// Run every stage in order and record the terminal state.
    ///
    /// The run must already be `running` in the registry. Returns the status
    /// the record ended in.
    pub async fn run(
        self,
        ctx: PipelineContext,
        mut control_rx: mpsc::UnboundedReceiver<RunControl>,
    ) -> RunStatus {
        if self.parallel {
            match set_subdomains(&self.work_dir, self.workers).await {
                Ok(true) => {
                    tracing::debug!(run_id = %self.run_id, workers = self.workers, "decomposeParDict updated");
                }
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(run_id = %self.run_id, error = %e, "could not update decomposeParDict");
                }
            }
        }

        let mut last_stage = String::new();
        for stage in self.plan.stages() {
            if matches!(control_rx.try_recv(), Ok(RunControl::Stop)) {
                tracing::info!(run_id = %self.run_id, "stop requested between stages");
                return self.finish(
                    &ctx,
                    RunStatus::Stopped,
                    TerminalReason::Stopped { stage: last_stage },
                );
            }

            if let Err(e) = ctx.registry.set_stage(&self.run_id, &stage.name) {
                tracing::warn!(run_id = %self.run_id, error = %e, "run vanished mid-pipeline");
                return RunStatus::Failed;
            }
            last_stage = stage.name.clone();

            let outcome = self.run_stage(&ctx, stage, &mut control_rx).await;
            let name = stage.name.clone();
            match outcome {
                StageOutcome::Exited(exit) if exit.success() => {}
                StageOutcome::Exited(exit) if stage.required_for_success => {
                    return self.finish(
                        &ctx,
                        RunStatus::Failed,
                        TerminalReason::StageFailed {
                            stage: name,
                            exit_code: exit.code,
                            signal: exit.signal,
                        },
                    );
                }
                StageOutcome::WaitFailed(e) if stage.required_for_success => {
                    tracing::warn!(run_id = %self.run_id, stage = %name, error = %e, "lost track of stage process");
                    return self.finish(
                        &ctx,
                        RunStatus::Failed,
                        TerminalReason::StageFailed {
                            stage: name,
                            exit_code: None,
                            signal: None,
                        },
                    );
                }
                StageOutcome::LaunchFailed(message) if stage.required_for_success => {
                    return self.finish(
                        &ctx,
                        RunStatus::Failed,
                        TerminalReason::LaunchFailed {
                            stage: name,
                            message,
                        },
                    );
                }
                StageOutcome::Stopped => {
                    return self.finish(
                        &ctx,
                        RunStatus::Stopped,
                        TerminalReason::Stopped { stage: name },
                    );
                }
                _ => {
                    tracing::warn!(run_id = %self.run_id, stage = %name, "optional stage failed, continuing");
                }
            }
        }

        self.finish(&ctx, RunStatus::Completed, TerminalReason::Completed)
    }

    fn finish(&self, ctx: &PipelineContext, status: RunStatus, reason: TerminalReason) -> RunStatus {
        match ctx.registry.transition_to(&self.run_id, status, reason) {
            Ok(Transition::Applied(record)) => record.status,
            Ok(Transition::Ignored { current }) => current,
            Err(e) => {
                tracing::warn!(run_id = %self.run_id, error = %e, "could not record pipeline result");
                ctx.registry
                    .get(&self.run_id)
                    .map(|r| r.status)
                    .unwrap_or(RunStatus::Failed)
            }
        }
    }

    async fn run_stage(
        &self,
        ctx: &PipelineContext,
        stage: &StageSpec,
        control_rx: &mut mpsc::UnboundedReceiver<RunControl>,
    ) -> StageOutcome {
        let name = stage.name.as_str();
        let mut log_file = if ctx.stage_logs {
            open_stage_log(&self.work_dir, name).await
        } else {
            None
        };

        tracing::info!(run_id = %self.run_id, stage = %name, command = %stage.command, "stage starting");
        self.emit(ctx, name, format!("[{name}] Running: {}", stage.command), &mut log_file)
            .await;

        let request = LaunchRequest {
            run_id: self.run_id.clone(),
            stage: name.to_string(),
            command: stage.command.clone(),
            work_dir: self.work_dir.clone(),
        };
        let mut running = match ctx.launcher.launch(&request) {
            Ok(running) => running,
            Err(e) => {
                tracing::warn!(run_id = %self.run_id, stage = %name, error = %e, "stage launch failed");
                let message = e.to_string();
                self.emit(ctx, name, format!("[{name}] ERROR: {message}"), &mut log_file)
                    .await;
                close_stage_log(log_file).await;
                return StageOutcome::LaunchFailed(message);
            }
        };

        let mut exit: Option<io::Result<StageExit>> = None;
        let mut output_open = true;
        let mut control_open = true;
        let mut cancelled = false;
        let mut kill_deadline: Option<Instant> = None;
        let mut drain_deadline: Option<Instant> = None;

        while exit.is_none() || output_open {
            tokio::select! {
                line = running.output.recv(), if output_open => match line {
                    Some(line) => self.emit(ctx, name, line, &mut log_file).await,
                    None => output_open = false,
                },
                res = &mut running.exit, if exit.is_none() => {
                    exit = Some(res);
                    kill_deadline = None;
                    drain_deadline = Some(Instant::now() + OUTPUT_DRAIN_GRACE);
                }
                msg = control_rx.recv(), if control_open && !cancelled && exit.is_none() => match msg {
                    Some(RunControl::Stop) => {
                        tracing::info!(run_id = %self.run_id, stage = %name, "stopping stage");
                        cancelled = true;
                        running.terminator.terminate();
                        kill_deadline = Some(Instant::now() + ctx.kill_grace);
                    }
                    None => control_open = false,
                },
                _ = sleep_until(kill_deadline) => {
                    tracing::warn!(run_id = %self.run_id, stage = %name, "stage ignored SIGTERM, killing");
                    running.terminator.kill();
                    kill_deadline = None;
                }
                _ = sleep_until(drain_deadline) => {
                    tracing::debug!(run_id = %self.run_id, stage = %name, "output still open after exit, detaching");
                    output_open = false;
                }
            }
        }

        let outcome = match exit {
            _ if cancelled => {
                self.emit(ctx, name, format!("[{name}] stopped"), &mut log_file)
                    .await;
                StageOutcome::Stopped
            }
            Some(Ok(status)) => {
                let text = match (status.code, status.signal) {
                    (Some(0), _) => format!("[{name}] completed (exit code: 0)"),
                    (Some(code), _) => format!("[{name}] failed (exit code: {code})"),
                    (None, Some(sig)) => format!("[{name}] failed (signal: {sig})"),
                    (None, None) => format!("[{name}] failed"),
                };
                tracing::info!(
                    run_id = %self.run_id,
                    stage = %name,
                    exit_code = ?status.code,
                    signal = ?status.signal,
                    "stage exited"
                );
                self.emit(ctx, name, text, &mut log_file).await;
                StageOutcome::Exited(status)
            }
            Some(Err(e)) => {
                self.emit(ctx, name, format!("[{name}] failed: {e}"), &mut log_file)
                    .await;
                StageOutcome::WaitFailed(e)
            }
            None => StageOutcome::WaitFailed(io::Error::other("stage exit was never observed")),
        };
        close_stage_log(log_file).await;
        outcome
    }

    /// Tee one line into the stage log, the progress estimator and the hub.
    async fn emit(
        &self,
        ctx: &PipelineContext,
        stage: &str,
        text: String,
        log_file: &mut Option<BufWriter<File>>,
    ) {
        if let Some(file) = log_file.as_mut() {
            if let Err(e) = file.write_all(format!("{text}\n").as_bytes()).await {
                tracing::warn!(run_id = %self.run_id, stage, error = %e, "stage log write failed, disabling");
                *log_file = None;
            }
        }
        ctx.progress.observe(&self.run_id, &text);
        ctx.hub.publish(&self.run_id, stage, text);
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => futures::future::pending().await,
    }
}

/// `<work_dir>/logs/<stage>.log`, truncated per execution.
async fn open_stage_log(work_dir: &Path, stage: &str) -> Option<BufWriter<File>> {
    if !tokio::fs::metadata(work_dir)
        .await
        .map(|m| m.is_dir())
        .unwrap_or(false)
    {
        return None;
    }
    let dir = work_dir.join("logs");
    if let Err(e) = tokio::fs::create_dir_all(&dir).await {
        tracing::warn!(path = %dir.display(), error = %e, "cannot create stage log directory");
        return None;
    }
    let file_name: String = stage
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    let path = dir.join(format!("{file_name}.log"));
    match File::create(&path).await {
        Ok(file) => Some(BufWriter::new(file)),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "cannot open stage log");
            None
        }
    }
}

async fn close_stage_log(log_file: Option<BufWriter<File>>) {
    if let Some(mut file) = log_file {
        if let Err(e) = file.flush().await {
            tracing::warn!(error = %e, "stage log flush failed");
        }
    }
}
