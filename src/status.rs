//! Polling snapshots and the consumer-side reconciliation contract.
//!
//! A [`StatusReport`] separates structure from content: `run_ids` decides
//! which cards exist, while the per-run views only refresh what a card shows.
//! [`DashboardModel`] is the reference consumer. It rebuilds only when the
//! id set changes and keeps consumer-local state (collapse flags, scroll
//! offsets) for every card that survives a poll.

use crate::error::SupervisorError;
use crate::loghub::LogHub;
use crate::model::{RunId, RunRecord, RunStatus, StatusReport, StatusView};
use crate::progress::ProgressEstimator;
use crate::registry::RunRegistry;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

pub struct StatusReconciler {
    registry: Arc<RunRegistry>,
    hub: Arc<LogHub>,
    progress: Arc<ProgressEstimator>,
    recent_lines: usize,
}

impl StatusReconciler {
    pub fn new(
        registry: Arc<RunRegistry>,
        hub: Arc<LogHub>,
        progress: Arc<ProgressEstimator>,
        recent_lines: usize,
    ) -> Self {
        Self {
            registry,
            hub,
            progress,
            recent_lines,
        }
    }

    /// Views of every running run, sorted by id. Read-only.
    pub fn snapshot(&self) -> StatusReport {
        let runs: Vec<StatusView> = self
            .registry
            .with_status(RunStatus::Running)
            .into_iter()
            .map(|record| self.view(record))
            .collect();
        StatusReport {
            generated_at: self.registry.clock().now(),
            active: !runs.is_empty(),
            run_ids: runs.iter().map(|v| v.run_id.clone()).collect(),
            runs,
        }
    }

    /// View of a single run in any state, for postmortem detail.
    pub fn detail(&self, run_id: &RunId) -> Result<StatusView, SupervisorError> {
        Ok(self.view(self.registry.get(run_id)?))
    }

    fn view(&self, record: RunRecord) -> StatusView {
        let progress = self.progress.snapshot(&record.run_id);
        let recent_logs = self.hub.recent(&record.run_id, self.recent_lines);
        StatusView {
            name: record.display_name().to_string(),
            status: record.status,
            stage: record.pipeline_stage,
            started_at: record.started_at,
            ended_at: record.ended_at,
            end_time: record.configured_end_time,
            sim_time: progress.sim_time,
            percent: progress.percent,
            eta_seconds: progress.eta_seconds,
            reason: record.reason,
            recent_logs,
            run_id: record.run_id,
        }
    }
}

/// What one [`DashboardModel::apply`] changed.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Reconciliation {
    pub added: Vec<RunId>,
    pub removed: Vec<RunId>,
    /// Surviving cards whose content differs from the previous poll.
    pub content_updated: Vec<RunId>,
}

impl Reconciliation {
    /// True when cards must be added or removed.
    pub fn is_structural(&self) -> bool {
        !self.added.is_empty() || !self.removed.is_empty()
    }

    pub fn is_empty(&self) -> bool {
        !self.is_structural() && self.content_updated.is_empty()
    }
}

/// Consumer-side mirror of the last report, with local state `S` per card.
#[derive(Debug)]
pub struct DashboardModel<S> {
    ids: Vec<RunId>,
    views: HashMap<RunId, StatusView>,
    local: HashMap<RunId, S>,
    active: bool,
}

impl<S: Default> Default for DashboardModel<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: Default> DashboardModel<S> {
    pub fn new() -> Self {
        Self {
            ids: Vec::new(),
            views: HashMap::new(),
            local: HashMap::new(),
            active: false,
        }
    }

    pub fn apply(&mut self, report: StatusReport) -> Reconciliation {
        let incoming: HashSet<&RunId> = report.run_ids.iter().collect();
        let mut change = Reconciliation::default();

        for id in &self.ids {
            if !incoming.contains(id) {
                change.removed.push(id.clone());
            }
        }
        for id in &report.run_ids {
            if !self.local.contains_key(id) {
                change.added.push(id.clone());
            }
        }

        for id in &change.removed {
            self.local.remove(id);
            self.views.remove(id);
        }
        for id in &change.added {
            self.local.insert(id.clone(), S::default());
        }

        for view in report.runs {
            if !incoming.contains(&view.run_id) {
                continue;
            }
            match self.views.get_mut(&view.run_id) {
                Some(current) => {
                    if *current != view {
                        change.content_updated.push(view.run_id.clone());
                        *current = view;
                    }
                }
                None => {
                    self.views.insert(view.run_id.clone(), view);
                }
            }
        }

        self.ids = report.run_ids;
        self.active = report.active;
        change
    }

    /// Card ids in report order.
    pub fn ids(&self) -> &[RunId] {
        &self.ids
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn view(&self, run_id: &RunId) -> Option<&StatusView> {
        self.views.get(run_id)
    }

    pub fn local(&self, run_id: &RunId) -> Option<&S> {
        self.local.get(run_id)
    }

    pub fn local_mut(&mut self, run_id: &RunId) -> Option<&mut S> {
        self.local.get_mut(run_id)
    }

    /// `(view, local state)` for each card, in report order.
    pub fn cards(&self) -> impl Iterator<Item = (&StatusView, &S)> + '_ {
        self.ids
            .iter()
            .filter_map(|id| Some((self.views.get(id)?, self.local.get(id)?)))
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::loghub::LogHubConfig;
    use crate::model::TerminalReason;
    use crate::registry::RunStart;
    use std::time::Duration;
    use time::macros::datetime;

    struct Fixture {
        clock: Arc<ManualClock>,
        registry: Arc<RunRegistry>,
        hub: Arc<LogHub>,
        progress: Arc<ProgressEstimator>,
        reconciler: StatusReconciler,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::new(datetime!(2024-06-01 10:00:00 UTC)));
        let registry = Arc::new(RunRegistry::new(clock.clone()));
        let hub = Arc::new(LogHub::new(LogHubConfig::default(), clock.clone()));
        let progress = Arc::new(ProgressEstimator::new(clock.clone()));
        let reconciler = StatusReconciler::new(registry.clone(), hub.clone(), progress.clone(), 3);
        Fixture {
            clock,
            registry,
            hub,
            progress,
            reconciler,
        }
    }

    fn start(f: &Fixture, name: &str, end: f64) -> RunId {
        let rec = f.registry.create(Some(name.into()), end, "/tmp".into());
        let started = f
            .registry
            .start(
                &rec.run_id,
                RunStart {
                    name: None,
                    configured_end_time: end,
                    parallel: false,
                    workers: 1,
                },
            )
            .unwrap();
        f.progress.reset(&rec.run_id, end, started.started_at);
        rec.run_id
    }

    #[test]
    fn snapshot_merges_record_progress_and_recent_logs() {
        let f = fixture();
        let run = start(&f, "cavity", 1000.0);
        f.registry.set_stage(&run, "solve").unwrap();
        f.clock.advance(Duration::from_secs(60));
        for text in ["Time = 100", "a", "b", "Time = 250"] {
            f.hub.publish(&run, "solve", text);
            f.progress.observe(&run, text);
        }

        let report = f.reconciler.snapshot();
        assert!(report.active);
        assert_eq!(report.run_ids, vec![run.clone()]);
        let view = &report.runs[0];
        assert_eq!(view.name, "cavity");
        assert_eq!(view.stage, "solve");
        assert_eq!(view.percent, 25.0);
        assert_eq!(view.sim_time, Some(250.0));
        assert!((view.eta_seconds.unwrap() - 180.0).abs() < 1e-6);
        let texts: Vec<&str> = view.recent_logs.iter().map(|l| l.text.as_str()).collect();
        assert_eq!(texts, vec!["a", "b", "Time = 250"]);
    }

    #[test]
    fn snapshot_lists_only_running_runs() {
        let f = fixture();
        let a = start(&f, "a", 10.0);
        let b = start(&f, "b", 10.0);
        f.registry.create(Some("idle".into()), 10.0, "/tmp".into());
        f.registry
            .transition_to(&b, RunStatus::Completed, TerminalReason::Completed)
            .unwrap();

        let report = f.reconciler.snapshot();
        assert_eq!(report.run_ids, vec![a]);

        f.registry
            .transition_to(&report.run_ids[0], RunStatus::Stopped, TerminalReason::Stopped {
                stage: String::new(),
            })
            .unwrap();
        let report = f.reconciler.snapshot();
        assert!(!report.active);
        assert!(report.runs.is_empty());
    }

    #[test]
    fn detail_covers_finished_runs() {
        let f = fixture();
        let run = start(&f, "a", 10.0);
        f.registry.set_stage(&run, "decompose").unwrap();
        f.hub.publish(&run, "decompose", "FOAM FATAL ERROR");
        f.registry
            .transition_to(&run, RunStatus::Failed, TerminalReason::StageFailed {
                stage: "decompose".into(),
                exit_code: Some(1),
                signal: None,
            })
            .unwrap();

        let view = f.reconciler.detail(&run).unwrap();
        assert_eq!(view.status, RunStatus::Failed);
        assert_eq!(view.stage, "decompose");
        assert_eq!(view.recent_logs.len(), 1);
        assert!(matches!(
            f.reconciler.detail(&RunId::from("missing")),
            Err(SupervisorError::RunNotFound { .. })
        ));
    }

    #[derive(Debug, Default, PartialEq)]
    struct CardState {
        collapsed: bool,
    }

    #[test]
    fn content_changes_never_rebuild_cards() {
        let f = fixture();
        let run = start(&f, "a", 100.0);
        let mut model: DashboardModel<CardState> = DashboardModel::new();

        let first = model.apply(f.reconciler.snapshot());
        assert_eq!(first.added, vec![run.clone()]);
        model.local_mut(&run).unwrap().collapsed = true;

        f.clock.advance(Duration::from_secs(5));
        f.hub.publish(&run, "solve", "Time = 10");
        f.progress.observe(&run, "Time = 10");
        let second = model.apply(f.reconciler.snapshot());

        assert!(!second.is_structural());
        assert_eq!(second.content_updated, vec![run.clone()]);
        assert_eq!(model.local(&run), Some(&CardState { collapsed: true }));
        assert_eq!(model.view(&run).unwrap().percent, 10.0);

        let third = model.apply(f.reconciler.snapshot());
        assert!(third.is_empty());
    }

    #[test]
    fn structural_changes_keep_surviving_state() {
        let f = fixture();
        let a = start(&f, "a", 100.0);
        let mut model: DashboardModel<CardState> = DashboardModel::new();
        model.apply(f.reconciler.snapshot());
        model.local_mut(&a).unwrap().collapsed = true;

        let b = start(&f, "b", 100.0);
        let change = model.apply(f.reconciler.snapshot());
        assert_eq!(change.added, vec![b.clone()]);
        assert!(change.removed.is_empty());
        assert!(model.local(&a).unwrap().collapsed);
        assert!(!model.local(&b).unwrap().collapsed);

        f.registry
            .transition_to(&a, RunStatus::Completed, TerminalReason::Completed)
            .unwrap();
        let change = model.apply(f.reconciler.snapshot());
        assert_eq!(change.removed, vec![a.clone()]);
        assert!(model.local(&a).is_none());
        assert_eq!(model.ids(), &[b.clone()]);
        assert_eq!(model.cards().count(), 1);
    }
}
