//! Authoritative table of run records.
//!
//! Every status change goes through [`RunRegistry::transition_to`] or
//! [`RunRegistry::start`], both of which take the per-record mutex, so two
//! callers finishing the same run cannot both win. The first terminal
//! transition sticks; later ones come back as [`Transition::Ignored`].

use crate::clock::Clock;
use crate::error::SupervisorError;
use crate::model::{RunConfig, RunId, RunRecord, RunStatus, TerminalReason};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use time::macros::format_description;
use tokio::sync::watch;

/// Settings applied by a (re-)start.
#[derive(Debug, Clone, PartialEq)]
pub struct RunStart {
    pub name: Option<String>,
    pub configured_end_time: f64,
    pub parallel: bool,
    pub workers: usize,
}

/// Outcome of [`RunRegistry::transition_to`].
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    Applied(RunRecord),
    /// The run had already reached a terminal state; nothing changed.
    Ignored { current: RunStatus },
}

impl Transition {
    pub fn is_applied(&self) -> bool {
        matches!(self, Transition::Applied(_))
    }
}

struct RunSlot {
    record: Mutex<RunRecord>,
    status_tx: watch::Sender<RunStatus>,
}

impl RunSlot {
    fn new(record: RunRecord) -> Self {
        let (status_tx, _) = watch::channel(record.status);
        Self {
            record: Mutex::new(record),
            status_tx,
        }
    }
}

pub struct RunRegistry {
    clock: Arc<dyn Clock>,
    runs: RwLock<HashMap<RunId, Arc<RunSlot>>>,
}

impl RunRegistry {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            runs: RwLock::new(HashMap::new()),
        }
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    fn slot(&self, run_id: &RunId) -> Result<Arc<RunSlot>, SupervisorError> {
        self.runs
            .read()
            .get(run_id)
            .cloned()
            .ok_or_else(|| SupervisorError::RunNotFound {
                run: run_id.clone(),
            })
    }

    /// Allocate a new record in `created` state.
    pub fn create(
        &self,
        name: Option<String>,
        configured_end_time: f64,
        work_dir: PathBuf,
    ) -> RunRecord {
        let now = self.clock.now();
        let base = base_run_id(name.as_deref(), now);

        let mut runs = self.runs.write();
        let mut run_id = RunId::new(base.clone());
        let mut counter = 1;
        while runs.contains_key(&run_id) {
            run_id = RunId::new(format!("{base}_{counter}"));
            counter += 1;
        }

        let record = RunRecord {
            run_id: run_id.clone(),
            name: name.filter(|n| !n.trim().is_empty()),
            status: RunStatus::Created,
            pipeline_stage: String::new(),
            created_at: now,
            started_at: None,
            ended_at: None,
            configured_end_time,
            solve_duration_seconds: None,
            work_dir,
            parallel: false,
            workers: 1,
            reason: None,
            config: None,
        };
        runs.insert(run_id, Arc::new(RunSlot::new(record.clone())));
        tracing::debug!(run_id = %record.run_id, "run created");
        record
    }

    /// Insert records loaded from disk. A record that was `running` when it
    /// was saved has no live pipeline any more and becomes `failed`.
    pub fn restore(&self, records: Vec<RunRecord>) -> usize {
        let now = self.clock.now();
        let mut runs = self.runs.write();
        let mut restored = 0;
        for mut record in records {
            if runs.contains_key(&record.run_id) {
                tracing::warn!(run_id = %record.run_id, "duplicate run in saved registry, skipping");
                continue;
            }
            if record.status == RunStatus::Running {
                tracing::warn!(run_id = %record.run_id, "run was still running at last exit");
                record.status = RunStatus::Failed;
                record.ended_at = Some(now);
                record.reason = Some(TerminalReason::Interrupted);
            }
            runs.insert(record.run_id.clone(), Arc::new(RunSlot::new(record)));
            restored += 1;
        }
        restored
    }

    pub fn get(&self, run_id: &RunId) -> Result<RunRecord, SupervisorError> {
        Ok(self.slot(run_id)?.record.lock().clone())
    }

    pub fn contains(&self, run_id: &RunId) -> bool {
        self.runs.read().contains_key(run_id)
    }

    /// All records, newest first.
    pub fn list(&self) -> Vec<RunRecord> {
        let slots: Vec<Arc<RunSlot>> = self.runs.read().values().cloned().collect();
        let mut records: Vec<RunRecord> = slots.iter().map(|s| s.record.lock().clone()).collect();
        records.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.run_id.cmp(&a.run_id))
        });
        records
    }

    /// Records currently in `status`, sorted by id.
    pub fn with_status(&self, status: RunStatus) -> Vec<RunRecord> {
        let slots: Vec<Arc<RunSlot>> = self.runs.read().values().cloned().collect();
        let mut records: Vec<RunRecord> = slots
            .iter()
            .map(|slot| slot.record.lock().clone())
            .filter(|record| record.status == status)
            .collect();
        records.sort_by(|a, b| a.run_id.cmp(&b.run_id));
        records
    }

    pub fn rename(&self, run_id: &RunId, name: Option<String>) -> Result<RunRecord, SupervisorError> {
        let slot = self.slot(run_id)?;
        let mut record = slot.record.lock();
        if record.status == RunStatus::Running {
            return Err(SupervisorError::RunActive {
                run: run_id.clone(),
            });
        }
        record.name = name.filter(|n| !n.trim().is_empty());
        Ok(record.clone())
    }

    /// Remember the settings a later (re-)start should use.
    pub fn set_config(&self, run_id: &RunId, config: RunConfig) -> Result<(), SupervisorError> {
        let slot = self.slot(run_id)?;
        slot.record.lock().config = Some(config);
        Ok(())
    }

    /// Move a `created` or finished run to `running`.
    ///
    /// Execution-scoped fields are reset; identity fields stay, except that
    /// the new start may relabel the run and change its end time.
    pub fn start(&self, run_id: &RunId, start: RunStart) -> Result<RunRecord, SupervisorError> {
        let slot = self.slot(run_id)?;
        let mut record = slot.record.lock();
        if record.status == RunStatus::Running {
            return Err(SupervisorError::RunActive {
                run: run_id.clone(),
            });
        }

        if let Some(name) = start.name.filter(|n| !n.trim().is_empty()) {
            record.name = Some(name);
        }
        record.configured_end_time = start.configured_end_time;
        record.parallel = start.parallel;
        record.workers = start.workers;
        record.started_at = Some(self.clock.now());
        record.ended_at = None;
        record.solve_duration_seconds = None;
        record.reason = None;
        record.pipeline_stage.clear();

        apply_status(&slot, &mut record, RunStatus::Running);
        tracing::info!(run_id = %run_id, parallel = record.parallel, "run started");
        Ok(record.clone())
    }

    /// Record the stage now executing. Only meaningful while running.
    pub fn set_stage(&self, run_id: &RunId, stage: &str) -> Result<(), SupervisorError> {
        let slot = self.slot(run_id)?;
        let mut record = slot.record.lock();
        if record.status == RunStatus::Running {
            record.pipeline_stage = stage.to_string();
        }
        Ok(())
    }

    /// End the current execution.
    ///
    /// Only `running -> {completed, failed, stopped}` is applied. A second
    /// terminal transition is ignored and logged; anything else is rejected.
    pub fn transition_to(
        &self,
        run_id: &RunId,
        status: RunStatus,
        reason: TerminalReason,
    ) -> Result<Transition, SupervisorError> {
        let slot = self.slot(run_id)?;
        let mut record = slot.record.lock();
        let from = record.status;

        if !status.is_terminal() {
            return Err(SupervisorError::InvalidTransition {
                run: run_id.clone(),
                from,
                to: status,
            });
        }

        match from {
            RunStatus::Running => {}
            current if current.is_terminal() => {
                tracing::warn!(
                    run_id = %run_id,
                    current = %current,
                    requested = %status,
                    "ignoring transition on finished run"
                );
                return Ok(Transition::Ignored { current });
            }
            _ => {
                return Err(SupervisorError::InvalidTransition {
                    run: run_id.clone(),
                    from,
                    to: status,
                });
            }
        }

        let now = self.clock.now();
        record.ended_at = Some(now);
        if status == RunStatus::Completed {
            record.solve_duration_seconds = record
                .started_at
                .map(|started| (now - started).as_seconds_f64().max(0.0));
        }
        record.reason = Some(reason);
        apply_status(&slot, &mut record, status);

        tracing::info!(
            run_id = %run_id,
            status = %status,
            stage = %record.pipeline_stage,
            "run finished"
        );
        Ok(Transition::Applied(record.clone()))
    }

    pub fn delete(&self, run_id: &RunId) -> Result<RunRecord, SupervisorError> {
        let mut runs = self.runs.write();
        let slot = runs
            .get(run_id)
            .cloned()
            .ok_or_else(|| SupervisorError::RunNotFound {
                run: run_id.clone(),
            })?;
        let record = slot.record.lock();
        if record.status == RunStatus::Running {
            return Err(SupervisorError::RunActive {
                run: run_id.clone(),
            });
        }
        runs.remove(run_id);
        Ok(record.clone())
    }

    /// Drop finished runs that ended more than `max_age` ago.
    pub fn prune_finished(&self, max_age: Duration) -> Vec<RunId> {
        let cutoff = self.clock.now() - max_age;
        let mut runs = self.runs.write();
        let expired: Vec<RunId> = runs
            .iter()
            .filter(|(_, slot)| {
                let record = slot.record.lock();
                record.status.is_terminal() && record.ended_at.is_some_and(|ended| ended < cutoff)
            })
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            runs.remove(id);
        }
        if !expired.is_empty() {
            tracing::info!(count = expired.len(), "pruned finished runs");
        }
        expired
    }

    /// Receiver that observes every status change of the run.
    pub fn watch(&self, run_id: &RunId) -> Result<watch::Receiver<RunStatus>, SupervisorError> {
        Ok(self.slot(run_id)?.status_tx.subscribe())
    }
}

fn apply_status(slot: &RunSlot, record: &mut RunRecord, status: RunStatus) {
    record.status = status;
    slot.status_tx.send_replace(status);
}

/// `<sanitized-name>_<YYYYmmdd_HHMMSS>`, or `run_<timestamp>` without a name.
fn base_run_id(name: Option<&str>, now: time::OffsetDateTime) -> String {
    let stamp = now
        .format(format_description!(
            "[year][month][day]_[hour][minute][second]"
        ))
        .unwrap_or_else(|_| now.unix_timestamp().to_string());
    let prefix = name
        .map(sanitize)
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "run".to_string());
    format!("{prefix}_{stamp}")
}

fn sanitize(name: &str) -> String {
    name.trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use time::macros::datetime;

    fn registry() -> (Arc<ManualClock>, RunRegistry) {
        let clock = Arc::new(ManualClock::new(datetime!(2024-05-10 08:30:00 UTC)));
        let registry = RunRegistry::new(clock.clone());
        (clock, registry)
    }

    fn start_args(end: f64) -> RunStart {
        RunStart {
            name: None,
            configured_end_time: end,
            parallel: false,
            workers: 1,
        }
    }

    #[test]
    fn ids_are_sanitized_timestamped_and_unique() {
        let (_, registry) = registry();
        let a = registry.create(Some("pipe flow/ v2".into()), 100.0, "/tmp".into());
        let b = registry.create(Some("pipe flow/ v2".into()), 100.0, "/tmp".into());
        let c = registry.create(None, 100.0, "/tmp".into());

        assert_eq!(a.run_id.as_str(), "pipe_flow__v2_20240510_083000");
        assert_eq!(b.run_id.as_str(), "pipe_flow__v2_20240510_083000_1");
        assert_eq!(c.run_id.as_str(), "run_20240510_083000");
        assert_eq!(a.status, RunStatus::Created);
    }

    #[test]
    fn start_sets_running_and_started_at() {
        let (clock, registry) = registry();
        let rec = registry.create(None, 100.0, "/tmp".into());
        clock.advance(Duration::from_secs(5));

        let started = registry.start(&rec.run_id, start_args(1000.0)).unwrap();
        assert_eq!(started.status, RunStatus::Running);
        assert_eq!(started.started_at, Some(datetime!(2024-05-10 08:30:05 UTC)));
        assert_eq!(started.configured_end_time, 1000.0);

        let err = registry.start(&rec.run_id, start_args(1000.0)).unwrap_err();
        assert!(matches!(err, SupervisorError::RunActive { .. }));
    }

    #[test]
    fn racing_terminal_transitions_apply_once() {
        let (clock, registry) = registry();
        let outcomes = [
            (RunStatus::Completed, TerminalReason::Completed),
            (
                RunStatus::Failed,
                TerminalReason::StageFailed {
                    stage: "solve".into(),
                    exit_code: Some(1),
                    signal: None,
                },
            ),
            (
                RunStatus::Stopped,
                TerminalReason::Stopped {
                    stage: "solve".into(),
                },
            ),
        ];

        for _ in 0..50 {
            let rec = registry.create(None, 100.0, "/tmp".into());
            registry.start(&rec.run_id, start_args(100.0)).unwrap();
            let barrier = std::sync::Barrier::new(outcomes.len());

            let results: Vec<Transition> = std::thread::scope(|scope| {
                let handles: Vec<_> = outcomes
                    .iter()
                    .map(|(status, reason)| {
                        let (registry, clock, barrier, run_id) =
                            (&registry, &clock, &barrier, &rec.run_id);
                        scope.spawn(move || {
                            barrier.wait();
                            clock.advance(Duration::from_secs(1));
                            registry
                                .transition_to(run_id, *status, reason.clone())
                                .unwrap()
                        })
                    })
                    .collect();
                handles.into_iter().map(|h| h.join().unwrap()).collect()
            });

            let applied: Vec<&RunRecord> = results
                .iter()
                .filter_map(|t| match t {
                    Transition::Applied(record) => Some(record),
                    Transition::Ignored { .. } => None,
                })
                .collect();
            assert_eq!(applied.len(), 1);
            let winner = applied[0];
            for t in &results {
                if let Transition::Ignored { current } = t {
                    assert_eq!(*current, winner.status);
                }
            }

            let record = registry.get(&rec.run_id).unwrap();
            assert_eq!(record.status, winner.status);
            assert_eq!(record.reason, winner.reason);
            assert!(record.ended_at.is_some());
            assert_eq!(record.ended_at, winner.ended_at);
        }
    }

    #[test]
    fn first_terminal_transition_wins() {
        let (_, registry) = registry();
        let rec = registry.create(None, 100.0, "/tmp".into());
        registry.start(&rec.run_id, start_args(100.0)).unwrap();

        let first = registry
            .transition_to(
                &rec.run_id,
                RunStatus::Failed,
                TerminalReason::StageFailed {
                    stage: "solve".into(),
                    exit_code: Some(2),
                    signal: None,
                },
            )
            .unwrap();
        assert!(first.is_applied());

        let second = registry
            .transition_to(&rec.run_id, RunStatus::Completed, TerminalReason::Completed)
            .unwrap();
        assert_eq!(
            second,
            Transition::Ignored {
                current: RunStatus::Failed
            }
        );

        let again = registry
            .transition_to(&rec.run_id, RunStatus::Failed, TerminalReason::Interrupted)
            .unwrap();
        assert!(!again.is_applied());

        let record = registry.get(&rec.run_id).unwrap();
        assert_eq!(record.status, RunStatus::Failed);
        assert!(matches!(
            record.reason,
            Some(TerminalReason::StageFailed { exit_code: Some(2), .. })
        ));
    }

    #[test]
    fn transitions_outside_the_state_machine_are_rejected() {
        let (_, registry) = registry();
        let rec = registry.create(None, 100.0, "/tmp".into());

        let err = registry
            .transition_to(&rec.run_id, RunStatus::Completed, TerminalReason::Completed)
            .unwrap_err();
        assert!(matches!(err, SupervisorError::InvalidTransition { .. }));

        let err = registry
            .transition_to(&rec.run_id, RunStatus::Running, TerminalReason::Completed)
            .unwrap_err();
        assert!(matches!(err, SupervisorError::InvalidTransition { .. }));
    }

    #[test]
    fn completion_records_solve_duration_and_keeps_stage() {
        let (clock, registry) = registry();
        let rec = registry.create(None, 100.0, "/tmp".into());
        registry.start(&rec.run_id, start_args(100.0)).unwrap();
        registry.set_stage(&rec.run_id, "solve").unwrap();
        clock.advance(Duration::from_secs(42));

        registry
            .transition_to(&rec.run_id, RunStatus::Completed, TerminalReason::Completed)
            .unwrap();
        let record = registry.get(&rec.run_id).unwrap();
        assert_eq!(record.solve_duration_seconds, Some(42.0));
        assert_eq!(record.pipeline_stage, "solve");
        assert!(record.ended_at.is_some());
    }

    #[test]
    fn restart_resets_execution_fields() {
        let (clock, registry) = registry();
        let rec = registry.create(Some("a".into()), 100.0, "/tmp".into());
        registry.start(&rec.run_id, start_args(100.0)).unwrap();
        registry.set_stage(&rec.run_id, "decompose").unwrap();
        registry
            .transition_to(&rec.run_id, RunStatus::Stopped, TerminalReason::Stopped {
                stage: "decompose".into(),
            })
            .unwrap();

        clock.advance(Duration::from_secs(60));
        let again = registry
            .start(
                &rec.run_id,
                RunStart {
                    name: Some("b".into()),
                    configured_end_time: 250.0,
                    parallel: true,
                    workers: 8,
                },
            )
            .unwrap();
        assert_eq!(again.status, RunStatus::Running);
        assert_eq!(again.run_id, rec.run_id);
        assert_eq!(again.name.as_deref(), Some("b"));
        assert_eq!(again.configured_end_time, 250.0);
        assert!(again.ended_at.is_none());
        assert!(again.reason.is_none());
        assert!(again.pipeline_stage.is_empty());
    }

    #[test]
    fn running_records_cannot_be_renamed_or_deleted() {
        let (_, registry) = registry();
        let rec = registry.create(None, 100.0, "/tmp".into());
        registry.start(&rec.run_id, start_args(100.0)).unwrap();

        assert!(registry.rename(&rec.run_id, Some("x".into())).is_err());
        assert!(registry.delete(&rec.run_id).is_err());
        assert!(registry.contains(&rec.run_id));

        registry
            .transition_to(&rec.run_id, RunStatus::Stopped, TerminalReason::Stopped {
                stage: String::new(),
            })
            .unwrap();
        assert_eq!(
            registry
                .rename(&rec.run_id, Some("x".into()))
                .unwrap()
                .name
                .as_deref(),
            Some("x")
        );
        registry.delete(&rec.run_id).unwrap();
        assert!(matches!(
            registry.get(&rec.run_id),
            Err(SupervisorError::RunNotFound { .. })
        ));
    }

    #[test]
    fn list_is_newest_first() {
        let (clock, registry) = registry();
        let old = registry.create(Some("old".into()), 1.0, "/tmp".into());
        clock.advance(Duration::from_secs(10));
        let new = registry.create(Some("new".into()), 1.0, "/tmp".into());

        let ids: Vec<RunId> = registry.list().into_iter().map(|r| r.run_id).collect();
        assert_eq!(ids, vec![new.run_id, old.run_id]);
    }

    #[test]
    fn prune_only_touches_old_finished_runs() {
        let (clock, registry) = registry();
        let finished = registry.create(Some("done".into()), 1.0, "/tmp".into());
        let running = registry.create(Some("live".into()), 1.0, "/tmp".into());
        let fresh = registry.create(Some("fresh".into()), 1.0, "/tmp".into());
        registry.start(&finished.run_id, start_args(1.0)).unwrap();
        registry.start(&running.run_id, start_args(1.0)).unwrap();
        registry
            .transition_to(&finished.run_id, RunStatus::Completed, TerminalReason::Completed)
            .unwrap();

        clock.advance(Duration::from_secs(25 * 3600));
        let pruned = registry.prune_finished(Duration::from_secs(24 * 3600));

        assert_eq!(pruned, vec![finished.run_id]);
        assert!(registry.contains(&running.run_id));
        assert!(registry.contains(&fresh.run_id));
    }

    #[test]
    fn restore_marks_running_records_interrupted() {
        let (_, source) = registry();
        let rec = source.create(None, 10.0, "/tmp".into());
        source.start(&rec.run_id, start_args(10.0)).unwrap();
        let saved = source.list();

        let (_, registry) = registry();
        assert_eq!(registry.restore(saved), 1);
        let record = registry.get(&rec.run_id).unwrap();
        assert_eq!(record.status, RunStatus::Failed);
        assert_eq!(record.reason, Some(TerminalReason::Interrupted));
    }

    #[tokio::test]
    async fn watch_observes_terminal_status() {
        let (_, registry) = registry();
        let rec = registry.create(None, 10.0, "/tmp".into());
        let mut rx = registry.watch(&rec.run_id).unwrap();
        registry.start(&rec.run_id, start_args(10.0)).unwrap();
        registry
            .transition_to(&rec.run_id, RunStatus::Completed, TerminalReason::Completed)
            .unwrap();

        let status = *rx.wait_for(|s| s.is_terminal()).await.unwrap();
        assert_eq!(status, RunStatus::Completed);
    }
}
