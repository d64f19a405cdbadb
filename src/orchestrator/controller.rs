//! Run lifecycle controller.
//!
//! [`Supervisor`] owns start/stop/restart orchestration for any number of
//! concurrent runs. Presentation layers call into it directly or, from
//! threads without a runtime, through [`run_controller`].

use crate::clock::Clock;
use crate::config::SupervisorConfig;
use crate::engine::{PipelineContext, PipelineEngine, ProcessLauncher, RunControl};
use crate::error::SupervisorError;
use crate::loghub::{LogHub, LogHubConfig, LogSubscription};
use crate::model::{RunConfig, RunId, RunRecord, RunStatus, StatusReport, StatusView, TerminalReason};
use crate::progress::ProgressEstimator;
use crate::registry::{RunRegistry, RunStart};
use crate::status::StatusReconciler;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;

/// Commands emitted by UI layers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UiCommand {
    Stop(RunId),
    Restart(RunId),
    Quit,
}

/// Internal handle for a running pipeline task.
struct ActiveRun {
    ctrl_tx: UnboundedSender<RunControl>,
    handle: JoinHandle<RunStatus>,
    generation: u64,
}

/// State shared between the supervisor handle and its pipeline tasks.
pub(crate) struct Shared {
    pub(crate) cfg: SupervisorConfig,
    pub(crate) registry: Arc<RunRegistry>,
    pub(crate) hub: Arc<LogHub>,
    pub(crate) progress: Arc<ProgressEstimator>,
    reconciler: StatusReconciler,
    launcher: Arc<dyn ProcessLauncher>,
    active: Mutex<HashMap<RunId, ActiveRun>>,
    generation: AtomicU64,
    /// Serializes registry saves from concurrently finishing runs.
    pub(crate) save_lock: Arc<Mutex<()>>,
}

impl Shared {
    fn pipeline_context(&self) -> PipelineContext {
        PipelineContext {
            registry: self.registry.clone(),
            hub: self.hub.clone(),
            progress: self.progress.clone(),
            launcher: self.launcher.clone(),
            kill_grace: self.cfg.kill_grace,
            stage_logs: self.cfg.stage_logs,
        }
    }

    /// Drop everything held for a run other than its registry record.
    pub(crate) fn forget(&self, run_id: &RunId) {
        self.hub.forget(run_id);
        self.progress.forget(run_id);
    }
}

#[derive(Clone)]
pub struct Supervisor {
    shared: Arc<Shared>,
}

impl Supervisor {
    pub fn new(
        cfg: SupervisorConfig,
        launcher: Arc<dyn ProcessLauncher>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, SupervisorError> {
        cfg.validate()?;
        let registry = Arc::new(RunRegistry::new(clock.clone()));
        let hub = Arc::new(LogHub::new(
            LogHubConfig {
                ring_capacity: cfg.ring_capacity,
                subscriber_queue: cfg.subscriber_queue,
            },
            clock.clone(),
        ));
        let progress = Arc::new(ProgressEstimator::new(clock));
        let reconciler =
            StatusReconciler::new(registry.clone(), hub.clone(), progress.clone(), cfg.recent_lines);

        Ok(Self {
            shared: Arc::new(Shared {
                cfg,
                registry,
                hub,
                progress,
                reconciler,
                launcher,
                active: Mutex::new(HashMap::new()),
                generation: AtomicU64::new(0),
                save_lock: Arc::new(Mutex::new(())),
            }),
        })
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.shared.cfg
    }

    /// Load previously saved records. Returns how many were added.
    pub fn restore(&self, records: Vec<RunRecord>) -> usize {
        self.shared.registry.restore(records)
    }

    pub fn create_run(&self, name: Option<String>, work_dir: PathBuf, end_time: f64) -> RunId {
        self.shared.registry.create(name, end_time, work_dir).run_id
    }

    /// Create a run that remembers `cfg`, so it can be started later with
    /// [`Supervisor::restart_run`].
    pub fn plan_run(
        &self,
        work_dir: PathBuf,
        cfg: RunConfig,
    ) -> Result<RunId, SupervisorError> {
        cfg.validate()?;
        let run_id = self.create_run(cfg.name.clone(), work_dir, cfg.end_time);
        self.shared.registry.set_config(&run_id, cfg)?;
        Ok(run_id)
    }

    /// Validate `cfg`, move the run to `running` and launch its pipeline.
    ///
    /// Returns as soon as the pipeline task is spawned. Stage failures are
    /// observed through snapshots, never returned here. Must be called from
    /// within a tokio runtime.
    pub fn start_run(&self, run_id: &RunId, cfg: RunConfig) -> Result<(), SupervisorError> {
        cfg.validate()?;
        let shared = &self.shared;

        // Held until the task is registered so it cannot finish unseen.
        let mut active = shared.active.lock();
        let record = shared.registry.start(
            run_id,
            RunStart {
                name: cfg.name.clone(),
                configured_end_time: cfg.end_time,
                parallel: cfg.parallel,
                workers: cfg.workers,
            },
        )?;
        shared.hub.clear(run_id);
        shared
            .progress
            .reset(run_id, cfg.end_time, record.started_at);

        let engine = PipelineEngine::new(run_id.clone(), record.work_dir.clone(), &cfg);
        tracing::debug!(run_id = %run_id, stages = ?engine.plan().names(), "pipeline planned");
        shared.registry.set_config(run_id, cfg)?;

        let (ctrl_tx, ctrl_rx) = mpsc::unbounded_channel::<RunControl>();
        let generation = shared.generation.fetch_add(1, Ordering::Relaxed);
        let task_shared = shared.clone();
        let task_id = run_id.clone();
        let handle = tokio::spawn(async move {
            let status = engine.run(task_shared.pipeline_context(), ctrl_rx).await;
            {
                let mut active = task_shared.active.lock();
                if active
                    .get(&task_id)
                    .is_some_and(|run| run.generation == generation)
                {
                    active.remove(&task_id);
                }
            }
            let processed = super::process_run_completion(&task_shared, &task_id, status).await;
            if let Some(path) = processed.saved_path {
                tracing::debug!(path = %path.display(), pruned = processed.pruned.len(), "registry saved");
            }
            status
        });

        active.insert(
            run_id.clone(),
            ActiveRun {
                ctrl_tx,
                handle,
                generation,
            },
        );
        Ok(())
    }

    /// Ask a running pipeline to stop. A no-op for runs that are not running.
    pub fn stop_run(&self, run_id: &RunId) -> Result<(), SupervisorError> {
        let record = self.shared.registry.get(run_id)?;
        if record.status != RunStatus::Running {
            return Ok(());
        }

        let ctrl_tx = self
            .shared
            .active
            .lock()
            .get(run_id)
            .map(|run| run.ctrl_tx.clone());
        match ctrl_tx {
            Some(tx) if tx.send(RunControl::Stop).is_ok() => {
                tracing::info!(run_id = %run_id, "stop requested");
            }
            _ => {
                // No pipeline is attached, so nothing else will end the run.
                self.shared.registry.transition_to(
                    run_id,
                    RunStatus::Stopped,
                    TerminalReason::Stopped {
                        stage: record.pipeline_stage,
                    },
                )?;
            }
        }
        Ok(())
    }

    /// Start a planned or finished run with the configuration recorded on
    /// it. Restored runs keep theirs across restarts of the supervisor.
    pub fn restart_run(&self, run_id: &RunId) -> Result<(), SupervisorError> {
        let cfg = self.shared.registry.get(run_id)?.config.ok_or_else(|| {
            SupervisorError::invalid_config(format!("run {run_id} has no recorded configuration"))
        })?;
        self.start_run(run_id, cfg)
    }

    pub fn get_snapshot(&self) -> StatusReport {
        self.shared.reconciler.snapshot()
    }

    pub fn run_detail(&self, run_id: &RunId) -> Result<StatusView, SupervisorError> {
        self.shared.reconciler.detail(run_id)
    }

    pub fn subscribe_logs(&self, run_id: &RunId) -> Result<LogSubscription, SupervisorError> {
        if !self.shared.registry.contains(run_id) {
            return Err(SupervisorError::RunNotFound {
                run: run_id.clone(),
            });
        }
        Ok(self.shared.hub.subscribe(run_id))
    }

    pub fn get_run(&self, run_id: &RunId) -> Result<RunRecord, SupervisorError> {
        self.shared.registry.get(run_id)
    }

    /// Every record, newest first.
    pub fn list_runs(&self) -> Vec<RunRecord> {
        self.shared.registry.list()
    }

    pub fn rename_run(&self, run_id: &RunId, name: Option<String>) -> Result<(), SupervisorError> {
        self.shared.registry.rename(run_id, name).map(|_| ())
    }

    pub fn delete_run(&self, run_id: &RunId) -> Result<(), SupervisorError> {
        self.shared.registry.delete(run_id)?;
        self.shared.forget(run_id);
        Ok(())
    }

    /// Wait until the run's current execution reaches a terminal status.
    pub async fn wait_for_terminal(&self, run_id: &RunId) -> Result<RunStatus, SupervisorError> {
        let mut rx = self.shared.registry.watch(run_id)?;
        let status = rx
            .wait_for(|status| status.is_terminal())
            .await
            .map(|status| *status)
            .map_err(|_| SupervisorError::RunNotFound {
                run: run_id.clone(),
            })?;
        Ok(status)
    }

    pub fn active_count(&self) -> usize {
        self.shared.active.lock().len()
    }

    /// Stop every running pipeline and wait for the tasks to finish.
    pub async fn shutdown(&self) -> usize {
        let runs: Vec<(RunId, ActiveRun)> = self.shared.active.lock().drain().collect();
        let count = runs.len();
        for (run_id, run) in &runs {
            if run.ctrl_tx.send(RunControl::Stop).is_err() {
                tracing::debug!(run_id = %run_id, "pipeline already finished");
            }
        }
        for (run_id, run) in runs {
            if let Err(e) = run.handle.await {
                tracing::warn!(run_id = %run_id, error = %e, "pipeline task failed");
            }
        }
        if count > 0 {
            tracing::info!(count, "supervisor shut down");
        }
        count
    }
}

/// Apply UI commands to the supervisor and report outcomes as messages.
///
/// Returns after `Quit` (or when every sender is gone), once all running
/// pipelines have been stopped.
pub async fn run_controller(
    supervisor: Supervisor,
    mut cmd_rx: UnboundedReceiver<UiCommand>,
    msg_tx: UnboundedSender<String>,
) {
    while let Some(cmd) = cmd_rx.recv().await {
        let message = match cmd {
            UiCommand::Stop(run_id) => match supervisor.stop_run(&run_id) {
                Ok(()) => format!("Stopping {run_id}…"),
                Err(e) => format!("Stop failed: {e}"),
            },
            UiCommand::Restart(run_id) => match supervisor.restart_run(&run_id) {
                Ok(()) => format!("Restarted {run_id}"),
                Err(e) => format!("Restart failed: {e}"),
            },
            UiCommand::Quit => break,
        };
        let _ = msg_tx.send(message);
    }

    let stopped = supervisor.shutdown().await;
    if stopped > 0 {
        let _ = msg_tx.send(format!("Stopped {stopped} running pipeline(s)"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::engine::testing::{Script, ScriptedLauncher};
    use crate::engine::SOLVE;
    use std::time::Duration;

    fn supervisor(launcher: ScriptedLauncher) -> (Supervisor, Arc<ScriptedLauncher>) {
        let launcher = Arc::new(launcher);
        let cfg = SupervisorConfig {
            kill_grace: Duration::from_millis(200),
            stage_logs: false,
            persist: false,
            ..Default::default()
        };
        let sup = Supervisor::new(cfg, launcher.clone(), Arc::new(SystemClock)).unwrap();
        (sup, launcher)
    }

    async fn wait(sup: &Supervisor, run: &RunId) -> RunStatus {
        tokio::time::timeout(Duration::from_secs(5), sup.wait_for_terminal(run))
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn bad_config_is_rejected_without_touching_the_run() {
        let (sup, launcher) = supervisor(ScriptedLauncher::new());
        let run = sup.create_run(None, "/tmp".into(), 10.0);

        let err = sup.start_run(&run, RunConfig::new(0.0)).unwrap_err();
        assert!(err.is_configuration());
        assert_eq!(sup.get_run(&run).unwrap().status, RunStatus::Created);
        assert!(launcher.launched().is_empty());

        let err = sup
            .start_run(&RunId::from("nope"), RunConfig::new(10.0))
            .unwrap_err();
        assert!(matches!(err, SupervisorError::RunNotFound { .. }));
    }

    #[tokio::test]
    async fn start_returns_while_the_pipeline_runs() {
        let launcher = ScriptedLauncher::new()
            .script(SOLVE, Script::UntilTerminated(vec!["Time = 5".into()]));
        let (sup, launcher) = supervisor(launcher);
        let run = sup.create_run(Some("cavity".into()), "/tmp".into(), 10.0);

        sup.start_run(&run, RunConfig::new(10.0)).unwrap();
        assert_eq!(sup.get_run(&run).unwrap().status, RunStatus::Running);
        assert_eq!(sup.get_snapshot().run_ids, vec![run.clone()]);

        let err = sup.start_run(&run, RunConfig::new(10.0)).unwrap_err();
        assert!(matches!(err, SupervisorError::RunActive { .. }));
        assert!(sup.delete_run(&run).is_err());

        let mut sub = sup.subscribe_logs(&run).unwrap();
        loop {
            let line = tokio::time::timeout(Duration::from_secs(5), sub.recv())
                .await
                .unwrap()
                .unwrap();
            if line.text == "Time = 5" {
                break;
            }
        }
        assert_eq!(sup.get_snapshot().runs[0].percent, 50.0);

        sup.stop_run(&run).unwrap();
        assert_eq!(wait(&sup, &run).await, RunStatus::Stopped);
        assert_eq!(launcher.terminations(), 1);
        assert!(!sup.get_snapshot().active);
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let launcher =
            ScriptedLauncher::new().script(SOLVE, Script::UntilTerminated(Vec::new()));
        let (sup, _) = supervisor(launcher);
        let run = sup.create_run(None, "/tmp".into(), 10.0);
        sup.start_run(&run, RunConfig::new(10.0)).unwrap();
        sup.stop_run(&run).unwrap();
        wait(&sup, &run).await;

        let ended_at = sup.get_run(&run).unwrap().ended_at;
        assert!(ended_at.is_some());
        sup.stop_run(&run).unwrap();
        sup.stop_run(&run).unwrap();
        let record = sup.get_run(&run).unwrap();
        assert_eq!(record.status, RunStatus::Stopped);
        assert_eq!(record.ended_at, ended_at);

        let never_started = sup.create_run(None, "/tmp".into(), 10.0);
        sup.stop_run(&never_started).unwrap();
        assert_eq!(sup.get_run(&never_started).unwrap().status, RunStatus::Created);
    }

    #[tokio::test]
    async fn restart_reuses_config_and_continues_sequences() {
        let launcher =
            ScriptedLauncher::new().script(SOLVE, Script::Exit(0, vec!["Time = 10".into()]));
        let (sup, launcher) = supervisor(launcher);
        let run = sup.create_run(None, "/tmp".into(), 10.0);
        sup.start_run(&run, RunConfig::new(10.0)).unwrap();
        assert_eq!(wait(&sup, &run).await, RunStatus::Completed);
        let last_seq = sup.run_detail(&run).unwrap().recent_logs.last().unwrap().sequence;

        let mut sub = sup.subscribe_logs(&run).unwrap();
        while sub.try_recv().is_ok() {}
        sup.restart_run(&run).unwrap();
        assert_eq!(wait(&sup, &run).await, RunStatus::Completed);

        let first_after = sub.recv().await.unwrap();
        assert_eq!(first_after.sequence, last_seq + 1);
        assert_eq!(first_after.text, "[solve] Running: simpleFoam");
        assert_eq!(launcher.launched(), vec![SOLVE.to_string(), SOLVE.to_string()]);
        assert_eq!(sup.run_detail(&run).unwrap().percent, 100.0);
    }

    #[tokio::test]
    async fn restart_without_history_is_a_configuration_error() {
        let (sup, _) = supervisor(ScriptedLauncher::new());
        let run = sup.create_run(None, "/tmp".into(), 10.0);
        assert!(sup.restart_run(&run).unwrap_err().is_configuration());
        assert!(matches!(
            sup.restart_run(&RunId::from("nope")),
            Err(SupervisorError::RunNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn planned_run_starts_from_its_recorded_config() {
        let launcher =
            ScriptedLauncher::new().script(SOLVE, Script::Exit(0, vec!["Time = 4".into()]));
        let (sup, launcher) = supervisor(launcher);
        let run = sup
            .plan_run("/tmp".into(), RunConfig::new(4.0))
            .unwrap();
        assert_eq!(sup.get_run(&run).unwrap().status, RunStatus::Created);
        assert!(launcher.launched().is_empty());

        sup.restart_run(&run).unwrap();
        assert_eq!(wait(&sup, &run).await, RunStatus::Completed);
        assert_eq!(sup.run_detail(&run).unwrap().percent, 100.0);

        assert!(sup
            .plan_run("/tmp".into(), RunConfig::new(-1.0))
            .unwrap_err()
            .is_configuration());
        assert_eq!(sup.list_runs().len(), 1);
    }

    #[tokio::test]
    async fn restored_run_can_be_restarted() {
        let (first, _) = supervisor(ScriptedLauncher::new());
        let cfg = RunConfig {
            parallel: true,
            workers: 3,
            ..RunConfig::new(8.0)
        };
        let run = first.plan_run("/tmp".into(), cfg.clone()).unwrap();
        let saved: Vec<RunRecord> = serde_json::from_str(
            &serde_json::to_string(&first.list_runs()).unwrap(),
        )
        .unwrap();

        let launcher =
            ScriptedLauncher::new().script(SOLVE, Script::Exit(0, vec!["Time = 8".into()]));
        let (sup, launcher) = supervisor(launcher);
        assert_eq!(sup.restore(saved), 1);
        assert_eq!(sup.get_run(&run).unwrap().config, Some(cfg));

        sup.restart_run(&run).unwrap();
        assert_eq!(wait(&sup, &run).await, RunStatus::Completed);
        let record = sup.get_run(&run).unwrap();
        assert!(record.parallel);
        assert_eq!(record.workers, 3);
        assert!(launcher.launched().contains(&SOLVE.to_string()));
    }

    #[tokio::test]
    async fn rename_waits_until_the_run_is_idle() {
        let launcher =
            ScriptedLauncher::new().script(SOLVE, Script::UntilTerminated(Vec::new()));
        let (sup, _) = supervisor(launcher);
        let run = sup.create_run(Some("cavity".into()), "/tmp".into(), 10.0);
        sup.start_run(&run, RunConfig::new(10.0)).unwrap();

        assert!(matches!(
            sup.rename_run(&run, Some("pitzDaily".into())),
            Err(SupervisorError::RunActive { .. })
        ));
        sup.stop_run(&run).unwrap();
        wait(&sup, &run).await;

        sup.rename_run(&run, Some("pitzDaily".into())).unwrap();
        assert_eq!(sup.get_run(&run).unwrap().display_name(), "pitzDaily");
        sup.rename_run(&run, Some("  ".into())).unwrap();
        assert_eq!(sup.get_run(&run).unwrap().name, None);
    }

    #[tokio::test]
    async fn overlapping_completions_leave_a_whole_registry_file() {
        let state = tempfile::tempdir().unwrap();
        let cfg = SupervisorConfig {
            persist: true,
            state_dir: Some(state.path().to_path_buf()),
            prune_after: None,
            stage_logs: false,
            ..Default::default()
        };
        let sup = Supervisor::new(cfg, Arc::new(ScriptedLauncher::new()), Arc::new(SystemClock))
            .unwrap();
        let runs: Vec<RunId> = (1..=4)
            .map(|i| sup.plan_run("/tmp".into(), RunConfig::new(f64::from(i))).unwrap())
            .collect();

        let processed = futures::future::join_all(runs.iter().map(|run| {
            super::super::process_run_completion(&sup.shared, run, RunStatus::Created)
        }))
        .await;
        assert!(processed.iter().all(|p| p.saved_path.is_some()));

        let saved = crate::storage::load_registry(state.path()).unwrap();
        assert_eq!(saved.len(), 4);
        assert!(saved.iter().all(|r| r.config.is_some()));
    }

    #[tokio::test]
    async fn shutdown_stops_every_pipeline() {
        let launcher =
            ScriptedLauncher::new().script(SOLVE, Script::UntilTerminated(Vec::new()));
        let (sup, _) = supervisor(launcher);
        let a = sup.create_run(Some("a".into()), "/tmp".into(), 10.0);
        let b = sup.create_run(Some("b".into()), "/tmp".into(), 10.0);
        sup.start_run(&a, RunConfig::new(10.0)).unwrap();
        sup.start_run(&b, RunConfig::new(10.0)).unwrap();
        assert_eq!(sup.active_count(), 2);

        let stopped = tokio::time::timeout(Duration::from_secs(5), sup.shutdown())
            .await
            .unwrap();
        assert_eq!(stopped, 2);
        assert_eq!(sup.get_run(&a).unwrap().status, RunStatus::Stopped);
        assert_eq!(sup.get_run(&b).unwrap().status, RunStatus::Stopped);
    }

    #[tokio::test]
    async fn controller_translates_ui_commands() {
        let launcher =
            ScriptedLauncher::new().script(SOLVE, Script::UntilTerminated(Vec::new()));
        let (sup, _) = supervisor(launcher);
        let run = sup.create_run(None, "/tmp".into(), 10.0);
        sup.start_run(&run, RunConfig::new(10.0)).unwrap();

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (msg_tx, mut msg_rx) = mpsc::unbounded_channel();
        let controller = tokio::spawn(run_controller(sup.clone(), cmd_rx, msg_tx));

        cmd_tx.send(UiCommand::Stop(run.clone())).unwrap();
        assert!(msg_rx.recv().await.unwrap().starts_with("Stopping"));
        wait(&sup, &run).await;

        cmd_tx.send(UiCommand::Restart(RunId::from("ghost"))).unwrap();
        assert!(msg_rx.recv().await.unwrap().starts_with("Restart failed"));

        cmd_tx.send(UiCommand::Quit).unwrap();
        tokio::time::timeout(Duration::from_secs(5), controller)
            .await
            .unwrap()
            .unwrap();
    }
}
