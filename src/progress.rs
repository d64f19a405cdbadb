//! Progress and ETA estimation from solver output.
//!
//! The only marker understood is a line of the form `Time = <float>`, which
//! solvers print once per time step. Everything else is ignored.

use crate::clock::Clock;
use crate::model::{ProgressSnapshot, RunId};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use time::OffsetDateTime;

/// Parse the simulated time out of a `Time = <float>` line.
///
/// Leading whitespace is allowed. The token must be exactly `Time`, so
/// `ExecutionTime = 1.2 s` and `Timestep = 3` do not match.
pub fn parse_sim_time(line: &str) -> Option<f64> {
    let rest = line.trim_start().strip_prefix("Time")?;
    let rest = rest.trim_start().strip_prefix('=')?;
    let token = rest.split_whitespace().next()?;
    let value: f64 = token.parse().ok()?;
    value.is_finite().then_some(value)
}

/// `sim_time / end_time * 100` clamped to `[0, 100]`. `None` without a
/// positive horizon.
pub fn percent_complete(sim_time: f64, end_time: f64) -> Option<f64> {
    if !end_time.is_finite() || end_time <= 0.0 {
        return None;
    }
    Some((sim_time / end_time * 100.0).clamp(0.0, 100.0))
}

/// Linear extrapolation: `elapsed * 100 / percent - elapsed`, floored at zero.
pub fn eta_seconds(percent: f64, elapsed_seconds: f64) -> Option<f64> {
    if percent.is_nan() || percent <= 0.0 {
        return None;
    }
    let elapsed = elapsed_seconds.max(0.0);
    let total = elapsed * 100.0 / percent;
    Some((total - elapsed).max(0.0))
}

#[derive(Debug)]
struct RunProgress {
    configured_end_time: f64,
    started_at: Option<OffsetDateTime>,
    snapshot: ProgressSnapshot,
}

pub struct ProgressEstimator {
    clock: Arc<dyn Clock>,
    runs: RwLock<HashMap<RunId, Arc<Mutex<RunProgress>>>>,
}

impl ProgressEstimator {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            runs: RwLock::new(HashMap::new()),
        }
    }

    /// Start a fresh snapshot for a new execution of `run_id`.
    pub fn reset(
        &self,
        run_id: &RunId,
        configured_end_time: f64,
        started_at: Option<OffsetDateTime>,
    ) {
        let state = RunProgress {
            configured_end_time,
            started_at,
            snapshot: ProgressSnapshot::empty(run_id.clone()),
        };
        self.runs
            .write()
            .insert(run_id.clone(), Arc::new(Mutex::new(state)));
    }

    /// Feed one output line. Returns the updated snapshot when the line
    /// carried a time marker.
    pub fn observe(&self, run_id: &RunId, line: &str) -> Option<ProgressSnapshot> {
        let sim_time = parse_sim_time(line)?;
        let state = self.runs.read().get(run_id).cloned()?;
        let now = self.clock.now();

        let mut state = state.lock();
        let end_time = state.configured_end_time;
        let started_at = state.started_at;
        let snap = &mut state.snapshot;

        snap.sim_time = Some(sim_time);
        if let Some(percent) = percent_complete(sim_time, end_time) {
            snap.percent = percent;
        }
        // Recomputed on every sample so a regression to 0% clears the ETA.
        snap.eta_seconds =
            started_at.and_then(|s| eta_seconds(snap.percent, (now - s).as_seconds_f64()));
        snap.updated_at = Some(now);
        Some(snap.clone())
    }

    /// Latest snapshot; an empty one for runs that never produced a marker.
    pub fn snapshot(&self, run_id: &RunId) -> ProgressSnapshot {
        match self.runs.read().get(run_id) {
            Some(state) => state.lock().snapshot.clone(),
            None => ProgressSnapshot::empty(run_id.clone()),
        }
    }

    pub fn forget(&self, run_id: &RunId) {
        self.runs.write().remove(run_id);
    }
}
