//! Text summary builder for CLI output.
//!
//! Formats one human-readable block per finished run for text mode.

use simwatch::{RunRecord, RunStatus};
use std::time::Duration;

/// Pre-formatted lines for text output.
pub(crate) struct TextSummary {
    pub lines: Vec<String>,
}

fn fmt_seconds(secs: f64) -> String {
    if !secs.is_finite() || secs < 0.0 {
        return "-".into();
    }
    humantime::format_duration(Duration::from_secs(secs.round() as u64)).to_string()
}

/// Build a text summary from the final registry records.
pub(crate) fn build_text_summary(records: &[RunRecord]) -> TextSummary {
    let mut lines = Vec::new();

    for r in records {
        lines.push(format!("== {} ({}) ==", r.display_name(), r.run_id));
        lines.push(format!("Status:   {}", r.status));
        if let Some(reason) = r.reason.as_ref() {
            lines.push(format!("Reason:   {}", reason.to_message()));
        }
        if !r.pipeline_stage.is_empty() && r.status != RunStatus::Completed {
            lines.push(format!("Stage:    {}", r.pipeline_stage));
        }
        lines.push(format!(
            "Mode:     {}",
            if r.parallel {
                format!("parallel ({} workers)", r.workers)
            } else {
                "serial".to_string()
            }
        ));
        if let (Some(start), Some(end)) = (r.started_at, r.ended_at) {
            let wall = (end - start).as_seconds_f64();
            lines.push(format!("Wall time: {}", fmt_seconds(wall)));
        }
        if let Some(solve) = r.solve_duration_seconds {
            lines.push(format!("Solve:    {}", fmt_seconds(solve)));
        }
        lines.push(format!("Work dir: {}", r.work_dir.display()));
    }

    let completed = records
        .iter()
        .filter(|r| r.status == RunStatus::Completed)
        .count();
    lines.push(format!("{completed}/{} run(s) completed", records.len()));

    TextSummary { lines }
}

#[cfg(test)]
mod tests {
    use super::*;
    use simwatch::{RunId, TerminalReason};
    use time::macros::datetime;

    fn record(status: RunStatus, reason: Option<TerminalReason>) -> RunRecord {
        RunRecord {
            run_id: RunId::from("cavity_20260101_120000"),
            name: Some("cavity".into()),
            status,
            pipeline_stage: "decompose".into(),
            created_at: datetime!(2026-01-01 12:00 UTC),
            started_at: Some(datetime!(2026-01-01 12:00 UTC)),
            ended_at: Some(datetime!(2026-01-01 12:03 UTC)),
            configured_end_time: 1000.0,
            solve_duration_seconds: None,
            work_dir: "/cases/cavity".into(),
            parallel: true,
            workers: 4,
            reason,
            config: None,
        }
    }

    #[test]
    fn failed_run_reports_reason_and_stage() {
        let reason = TerminalReason::StageFailed {
            stage: "decompose".into(),
            exit_code: Some(1),
            signal: None,
        };
        let summary = build_text_summary(&[record(RunStatus::Failed, Some(reason.clone()))]);
        let text = summary.lines.join("\n");
        assert!(text.contains("Status:   failed"));
        assert!(text.contains(&reason.to_message()));
        assert!(text.contains("Stage:    decompose"));
        assert!(text.contains("Wall time: 3m"));
        assert!(text.ends_with("0/1 run(s) completed"));
    }

    #[test]
    fn completed_run_shows_solve_time() {
        let mut r = record(RunStatus::Completed, Some(TerminalReason::Completed));
        r.solve_duration_seconds = Some(90.0);
        let summary = build_text_summary(&[r]);
        assert!(summary.lines.iter().any(|l| l == "Solve:    1m 30s"));
        assert!(!summary.lines.iter().any(|l| l.starts_with("Stage:")));
        assert_eq!(summary.lines.last().unwrap(), "1/1 run(s) completed");
    }
}
