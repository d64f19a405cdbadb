use ratatui::{
    style::Color,
    style::Style,
    text::{Line, Span},
};
use simwatch::{DashboardModel, LogLine, LogSubscription, RunId, RunRecord, RunStatus};
use std::collections::VecDeque;
use std::time::Instant;

/// Consumer-local state of one dashboard card. Survives every content refresh.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CardState {
    pub collapsed: bool,
}

/// Live tail of one run's output.
pub struct LogView {
    pub run_id: RunId,
    pub lines: VecDeque<LogLine>,
    pub capacity: usize,
    /// Lines scrolled up from the tail; 0 follows new output.
    pub scroll: usize,
    pub subscription: LogSubscription,
}

impl LogView {
    pub fn new(run_id: RunId, subscription: LogSubscription, capacity: usize) -> Self {
        Self {
            run_id,
            lines: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
            scroll: 0,
            subscription,
        }
    }

    /// Move whatever the subscription has buffered into the view.
    pub fn pump(&mut self) {
        while let Ok(line) = self.subscription.try_recv() {
            if self.lines.len() == self.capacity {
                self.lines.pop_front();
            }
            self.lines.push_back(line);
        }
    }
}

pub struct UiState {
    pub tab: usize,
    pub info: String,
    pub dashboard: DashboardModel<CardState>,
    /// Selected dashboard card, tracked by id so structural changes keep it.
    pub selected: Option<RunId>,
    pub history: Vec<RunRecord>,
    pub history_selected: usize,
    pub log_view: Option<LogView>,
    pub last_poll: Option<Instant>,
    pub last_history_refresh: Option<Instant>,
}

impl Default for UiState {
    fn default() -> Self {
        Self {
            tab: 0,
            info: String::new(),
            dashboard: DashboardModel::new(),
            selected: None,
            history: Vec::new(),
            history_selected: 0,
            log_view: None,
            last_poll: None,
            last_history_refresh: None,
        }
    }
}

impl UiState {
    /// Keep the selection on a card that still exists.
    pub fn fix_selection(&mut self) {
        let ids = self.dashboard.ids();
        let still_there = self
            .selected
            .as_ref()
            .is_some_and(|id| ids.contains(id));
        if !still_there {
            self.selected = ids.first().cloned();
        }
    }

    pub fn select_offset(&mut self, delta: isize) {
        let ids = self.dashboard.ids();
        if ids.is_empty() {
            self.selected = None;
            return;
        }
        let current = self
            .selected
            .as_ref()
            .and_then(|id| ids.iter().position(|x| x == id))
            .unwrap_or(0);
        let next = (current as isize + delta).clamp(0, ids.len() as isize - 1) as usize;
        self.selected = Some(ids[next].clone());
    }

    pub fn history_offset(&mut self, delta: isize) {
        if self.history.is_empty() {
            self.history_selected = 0;
            return;
        }
        let max = self.history.len() as isize - 1;
        self.history_selected = (self.history_selected as isize + delta).clamp(0, max) as usize;
    }

    pub fn selected_history(&self) -> Option<&RunRecord> {
        self.history.get(self.history_selected)
    }

    pub fn set_history(&mut self, history: Vec<RunRecord>) {
        self.history = history;
        if self.history_selected >= self.history.len() {
            self.history_selected = self.history.len().saturating_sub(1);
        }
    }
}

pub fn status_color(status: RunStatus) -> Color {
    match status {
        RunStatus::Created => Color::Gray,
        RunStatus::Running => Color::Cyan,
        RunStatus::Completed => Color::Green,
        RunStatus::Failed => Color::Red,
        RunStatus::Stopped => Color::Yellow,
    }
}

pub fn fmt_eta(eta_seconds: Option<f64>) -> String {
    match eta_seconds {
        Some(secs) if secs.is_finite() => {
            let secs = std::time::Duration::from_secs(secs.round() as u64);
            humantime::format_duration(secs).to_string()
        }
        _ => "-".to_string(),
    }
}

pub fn fmt_percent(percent: f64) -> String {
    format!("{percent:.1}%")
}

pub fn kv_line(label: &str, value: impl Into<String>) -> Line<'static> {
    Line::from(vec![
        Span::styled(format!("{label}: "), Style::default().fg(Color::Gray)),
        Span::raw(value.into()),
    ])
}
