//! Post-run processing.
//!
//! Logs the outcome, prunes expired runs and saves the registry after a
//! pipeline finishes. The save runs on the blocking pool.

use super::controller::Shared;
use crate::model::{RunId, RunStatus};
use crate::storage;
use std::path::PathBuf;

/// Result of post-run processing.
#[derive(Debug)]
pub(crate) struct ProcessedRun {
    pub pruned: Vec<RunId>,
    pub saved_path: Option<PathBuf>,
}

pub(crate) async fn process_run_completion(
    shared: &Shared,
    run_id: &RunId,
    status: RunStatus,
) -> ProcessedRun {
    match shared.registry.get(run_id).ok() {
        Some(r) => tracing::info!(
            run_id = %run_id,
            status = %status,
            stage = %r.pipeline_stage,
            solve_seconds = ?r.solve_duration_seconds,
            reason = %r.reason.as_ref().map(|x| x.to_message()).unwrap_or_default(),
            "pipeline finished"
        ),
        None => tracing::debug!(run_id = %run_id, "finished run was deleted"),
    }

    let pruned = match shared.cfg.prune_after {
        Some(max_age) => shared.registry.prune_finished(max_age),
        None => Vec::new(),
    };
    for id in &pruned {
        shared.forget(id);
    }

    let saved_path = if shared.cfg.persist {
        let dir = shared.cfg.resolved_state_dir();
        let registry = shared.registry.clone();
        let save_lock = shared.save_lock.clone();
        let saved = tokio::task::spawn_blocking(move || {
            let _guard = save_lock.lock();
            storage::save_registry(&dir, &registry.list())
        })
        .await;
        match saved {
            Ok(Ok(path)) => Some(path),
            Ok(Err(e)) => {
                tracing::warn!(error = %format!("{e:#}"), "failed to save run registry");
                None
            }
            Err(e) => {
                tracing::warn!(error = %e, "registry save task failed");
                None
            }
        }
    } else {
        None
    };

    ProcessedRun {
        pruned,
        saved_path,
    }
}
