use crate::error::SupervisorError;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Process-wide supervisor settings. Built from CLI flags by the binary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Lines retained per run for replay and recent-log views.
    pub ring_capacity: usize,
    /// Live lines a subscriber may fall behind before it is dropped.
    pub subscriber_queue: usize,
    /// Log lines carried by each status view.
    pub recent_lines: usize,
    pub shell: String,
    /// Prepended to every stage command as `<prelude> && <command>`.
    pub prelude: Option<String>,
    /// Time between SIGTERM and SIGKILL when stopping a stage.
    #[serde(with = "humantime_serde")]
    pub kill_grace: Duration,
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    pub state_dir: Option<PathBuf>,
    /// Tee each stage's output into `<work_dir>/logs/<stage>.log`.
    pub stage_logs: bool,
    /// Save the registry to `runs.json` after every finished run.
    pub persist: bool,
    #[serde(with = "humantime_serde")]
    pub prune_after: Option<Duration>,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            ring_capacity: 500,
            subscriber_queue: 256,
            recent_lines: 3,
            shell: "/bin/bash".to_string(),
            prelude: None,
            kill_grace: Duration::from_secs(5),
            poll_interval: Duration::from_millis(500),
            state_dir: None,
            stage_logs: true,
            persist: false,
            prune_after: Some(Duration::from_secs(24 * 60 * 60)),
        }
    }
}

impl SupervisorConfig {
    pub fn validate(&self) -> Result<(), SupervisorError> {
        if self.ring_capacity == 0 {
            return Err(SupervisorError::invalid_config(
                "ring_capacity must be greater than zero",
            ));
        }
        if self.subscriber_queue == 0 {
            return Err(SupervisorError::invalid_config(
                "subscriber_queue must be greater than zero",
            ));
        }
        if self.shell.trim().is_empty() {
            return Err(SupervisorError::invalid_config("shell must not be empty"));
        }
        if self.poll_interval.is_zero() {
            return Err(SupervisorError::invalid_config(
                "poll_interval must be greater than zero",
            ));
        }
        Ok(())
    }

    /// Directory holding `runs.json` and the TUI log file.
    pub fn resolved_state_dir(&self) -> PathBuf {
        self.state_dir
            .clone()
            .unwrap_or_else(crate::storage::default_state_dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = SupervisorConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.ring_capacity, 500);
        assert_eq!(cfg.recent_lines, 3);
    }

    #[test]
    fn zero_capacities_are_rejected() {
        let cfg = SupervisorConfig {
            ring_capacity: 0,
            ..Default::default()
        };
        assert!(matches!(
            cfg.validate(),
            Err(SupervisorError::InvalidConfig { .. })
        ));

        let cfg = SupervisorConfig {
            subscriber_queue: 0,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn durations_deserialize_from_humantime_strings() {
        let cfg: SupervisorConfig =
            serde_json::from_str(r#"{"kill_grace": "2s", "prune_after": "12h"}"#).unwrap();
        assert_eq!(cfg.kill_grace, Duration::from_secs(2));
        assert_eq!(cfg.prune_after, Some(Duration::from_secs(12 * 3600)));
        assert_eq!(cfg.shell, "/bin/bash");
    }
}
