mod help;
mod state;

use self::help::draw_help;
use self::state::{fmt_eta, fmt_percent, kv_line, status_color, CardState, LogView, UiState};
use anyhow::{Context, Result};
use crossterm::{
    event::{self, Event, KeyCode, KeyEventKind, KeyModifiers},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{
    backend::CrosstermBackend,
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Gauge, Paragraph, Tabs},
    Terminal,
};
use simwatch::{run_controller, RunId, StatusView, Supervisor, UiCommand};
use std::{io, time::Duration, time::Instant};
use tokio::sync::mpsc;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};

const HISTORY_REFRESH: Duration = Duration::from_secs(1);

pub async fn run(supervisor: Supervisor) -> Result<()> {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel::<UiCommand>();
    let (msg_tx, msg_rx) = mpsc::unbounded_channel::<String>();

    // TUI runs in a dedicated thread to keep all blocking I/O out of the Tokio runtime.
    let ui_supervisor = supervisor.clone();
    let ui_handle = std::thread::spawn(move || run_threaded(ui_supervisor, msg_rx, cmd_tx));

    run_controller(supervisor, cmd_rx, msg_tx).await;

    let join_res = tokio::task::spawn_blocking(move || ui_handle.join()).await;
    if let Ok(joined) = join_res {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(anyhow::anyhow!("TUI thread panicked")),
        }
    }
    Ok(())
}

/// Run the TUI loop on a dedicated thread.
pub fn run_threaded(
    supervisor: Supervisor,
    mut msg_rx: UnboundedReceiver<String>,
    cmd_tx: UnboundedSender<UiCommand>,
) -> Result<()> {
    enable_raw_mode().context("enable raw mode")?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen).ok();

    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend).context("create terminal")?;
    terminal.clear().ok();

    let poll_interval = supervisor.config().poll_interval;
    let log_capacity = supervisor.config().ring_capacity;

    // UiState is owned by the UI thread only; no cross-thread mutation.
    let mut state = UiState::default();
    state.set_history(supervisor.list_runs());

    let tick_rate = Duration::from_millis(100);
    let mut last_tick = Instant::now();

    let res = loop {
        while let Ok(msg) = msg_rx.try_recv() {
            state.info = msg;
        }

        if state
            .last_poll
            .map_or(true, |t| t.elapsed() >= poll_interval)
        {
            refresh_dashboard(&supervisor, &mut state);
        }
        if state.tab == 1
            && state
                .last_history_refresh
                .map_or(true, |t| t.elapsed() >= HISTORY_REFRESH)
        {
            state.set_history(supervisor.list_runs());
            state.last_history_refresh = Some(Instant::now());
        }
        if let Some(view) = state.log_view.as_mut() {
            view.pump();
        }

        if last_tick.elapsed() >= tick_rate {
            terminal.draw(|f| draw(f.area(), f, &state)).ok();
            last_tick = Instant::now();
        }

        // Poll input with a short timeout to avoid blocking the render loop.
        if event::poll(Duration::from_millis(10)).unwrap_or(false) {
            if let Ok(Event::Key(k)) = event::read() {
                if k.kind != KeyEventKind::Press {
                    continue;
                }
                match (k.modifiers, k.code) {
                    (_, KeyCode::Char('q')) | (KeyModifiers::CONTROL, KeyCode::Char('c')) => {
                        let _ = cmd_tx.send(UiCommand::Quit);
                        break Ok(());
                    }
                    (_, KeyCode::Tab) => {
                        state.tab = (state.tab + 1) % 3;
                        state.last_history_refresh = None;
                    }
                    (_, KeyCode::Char('?')) => {
                        state.tab = 2;
                    }
                    (_, KeyCode::Esc) => {
                        // Dropping the view unsubscribes from the run's log stream.
                        state.log_view = None;
                    }
                    (_, KeyCode::Up) | (_, KeyCode::Char('k')) => {
                        if let Some(view) = state.log_view.as_mut() {
                            view.scroll = (view.scroll + 1).min(view.lines.len());
                        } else if state.tab == 0 {
                            state.select_offset(-1);
                        } else if state.tab == 1 {
                            state.history_offset(-1);
                        }
                    }
                    (_, KeyCode::Down) | (_, KeyCode::Char('j')) => {
                        if let Some(view) = state.log_view.as_mut() {
                            view.scroll = view.scroll.saturating_sub(1);
                        } else if state.tab == 0 {
                            state.select_offset(1);
                        } else if state.tab == 1 {
                            state.history_offset(1);
                        }
                    }
                    (_, KeyCode::End) => {
                        if let Some(view) = state.log_view.as_mut() {
                            view.scroll = 0;
                        }
                    }
                    (_, KeyCode::Enter) => {
                        if state.tab == 0 && state.log_view.is_none() {
                            if let Some(id) = state.selected.clone() {
                                if let Some(card) = state.dashboard.local_mut(&id) {
                                    card.collapsed = !card.collapsed;
                                }
                            }
                        }
                    }
                    (_, KeyCode::Char('l')) => {
                        if let Some(id) = target_run(&state) {
                            match supervisor.subscribe_logs(&id) {
                                Ok(sub) => {
                                    state.info = format!("Following {id}");
                                    state.log_view = Some(LogView::new(id, sub, log_capacity));
                                }
                                Err(e) => state.info = format!("Logs unavailable: {e}"),
                            }
                        }
                    }
                    (_, KeyCode::Char('s')) => {
                        if let Some(id) = target_run(&state) {
                            let _ = cmd_tx.send(UiCommand::Stop(id));
                        }
                    }
                    (_, KeyCode::Char('r')) => {
                        if let Some(id) = target_run(&state) {
                            state.info = format!("Restarting {id}…");
                            let _ = cmd_tx.send(UiCommand::Restart(id));
                            state.last_poll = None;
                        }
                    }
                    (_, KeyCode::Char('d')) => {
                        if state.tab == 1 && state.log_view.is_none() {
                            if let Some(id) = state.selected_history().map(|r| r.run_id.clone()) {
                                state.info = match supervisor.delete_run(&id) {
                                    Ok(()) => "Deleted".into(),
                                    Err(e) => format!("Delete failed: {e}"),
                                };
                                state.set_history(supervisor.list_runs());
                            }
                        }
                    }
                    _ => {}
                }
            }
        }
    };

    disable_raw_mode().ok();
    let mut stdout = io::stdout();
    execute!(stdout, LeaveAlternateScreen).ok();
    res
}

fn refresh_dashboard(supervisor: &Supervisor, state: &mut UiState) {
    let change = state.dashboard.apply(supervisor.get_snapshot());
    if change.is_structural() {
        state.fix_selection();
        for id in &change.removed {
            if let Ok(record) = supervisor.get_run(id) {
                state.info = format!("{}: {}", record.display_name(), record.status);
            }
        }
        state.last_history_refresh = None;
    }
    state.last_poll = Some(Instant::now());
}

/// The run a command key acts on: the followed run, the selected card or the
/// selected history entry.
fn target_run(state: &UiState) -> Option<RunId> {
    if let Some(view) = state.log_view.as_ref() {
        return Some(view.run_id.clone());
    }
    match state.tab {
        0 => state.selected.clone(),
        1 => state.selected_history().map(|r| r.run_id.clone()),
        _ => None,
    }
}

fn draw(area: Rect, f: &mut ratatui::Frame, state: &UiState) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Length(3), Constraint::Min(0)].as_ref())
        .split(area);

    let tabs = Tabs::new(vec![
        Line::from("Dashboard"),
        Line::from("History"),
        Line::from("Help"),
    ])
    .select(state.tab)
    .block(Block::default().borders(Borders::ALL).title("simwatch"))
    .highlight_style(Style::default().fg(Color::Yellow));
    f.render_widget(tabs, chunks[0]);

    let body = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Min(0), Constraint::Length(3)].as_ref())
        .split(chunks[1]);

    match (state.tab, state.log_view.as_ref()) {
        (2, _) => draw_help(chunks[1], f),
        (_, Some(view)) => draw_logs(body[0], f, view),
        (0, None) => draw_dashboard(body[0], f, state),
        _ => draw_history(body[0], f, state),
    }
    if state.tab != 2 {
        draw_status(body[1], f, state);
    }
}

fn draw_status(area: Rect, f: &mut ratatui::Frame, state: &UiState) {
    let running = state.dashboard.len();
    let line = Line::from(vec![
        Span::styled("Running: ", Style::default().fg(Color::Gray)),
        Span::raw(running.to_string()),
        Span::raw("  "),
        Span::raw(state.info.clone()),
    ]);
    let p = Paragraph::new(line).block(Block::default().borders(Borders::ALL).title("Status"));
    f.render_widget(p, area);
}

fn card_height(view: &StatusView, card: &CardState) -> u16 {
    if card.collapsed {
        3
    } else {
        // Borders, summary line, gauge and the recent log lines.
        4 + view.recent_logs.len().max(1) as u16
    }
}

fn draw_dashboard(area: Rect, f: &mut ratatui::Frame, state: &UiState) {
    if state.dashboard.is_empty() {
        let p = Paragraph::new(vec![
            Line::from("No running pipelines."),
            Line::from(vec![
                Span::raw("Restart a finished run from the "),
                Span::styled("History", Style::default().fg(Color::Magenta)),
                Span::raw(" tab."),
            ]),
        ])
        .block(Block::default().borders(Borders::ALL).title("Runs"));
        f.render_widget(p, area);
        return;
    }

    let constraints: Vec<Constraint> = state
        .dashboard
        .cards()
        .map(|(view, card)| Constraint::Length(card_height(view, card)))
        .chain(std::iter::once(Constraint::Min(0)))
        .collect();
    let rows = Layout::default()
        .direction(Direction::Vertical)
        .constraints(constraints)
        .split(area);

    for (row, (view, card)) in rows.iter().zip(state.dashboard.cards()) {
        if row.height == 0 {
            break;
        }
        let selected = state.selected.as_ref() == Some(&view.run_id);
        draw_card(*row, f, view, card, selected);
    }
}

fn draw_card(area: Rect, f: &mut ratatui::Frame, view: &StatusView, card: &CardState, selected: bool) {
    let title = Line::from(vec![
        Span::raw(format!(" {} ", view.name)),
        Span::styled(
            format!("[{}] ", view.status),
            Style::default().fg(status_color(view.status)),
        ),
    ]);
    let border = if selected {
        Style::default().fg(Color::Yellow)
    } else {
        Style::default()
    };
    let block = Block::default()
        .borders(Borders::ALL)
        .border_style(border)
        .title(title);
    let inner = block.inner(area);
    f.render_widget(block, area);

    let sim = match view.sim_time {
        Some(t) => format!("{t} / {}", view.end_time),
        None => format!("- / {}", view.end_time),
    };
    let summary = Line::from(vec![
        Span::styled("Stage: ", Style::default().fg(Color::Gray)),
        Span::raw(format!("{}  ", view.stage)),
        Span::styled("Time: ", Style::default().fg(Color::Gray)),
        Span::raw(format!("{sim}  ")),
        Span::styled("ETA: ", Style::default().fg(Color::Gray)),
        Span::raw(fmt_eta(view.eta_seconds)),
        Span::raw(if card.collapsed {
            format!("  {}", fmt_percent(view.percent))
        } else {
            String::new()
        }),
    ]);

    if card.collapsed {
        f.render_widget(Paragraph::new(summary), inner);
        return;
    }

    let parts = Layout::default()
        .direction(Direction::Vertical)
        .constraints(
            [
                Constraint::Length(1),
                Constraint::Length(1),
                Constraint::Min(0),
            ]
            .as_ref(),
        )
        .split(inner);
    f.render_widget(Paragraph::new(summary), parts[0]);

    let gauge = Gauge::default()
        .gauge_style(Style::default().fg(Color::Cyan))
        .ratio((view.percent / 100.0).clamp(0.0, 1.0))
        .label(fmt_percent(view.percent));
    f.render_widget(gauge, parts[1]);

    let logs: Vec<Line> = if view.recent_logs.is_empty() {
        vec![Line::from(Span::styled(
            "(no output yet)",
            Style::default().fg(Color::DarkGray),
        ))]
    } else {
        view.recent_logs
            .iter()
            .map(|l| Line::from(Span::styled(l.text.clone(), Style::default().fg(Color::DarkGray))))
            .collect()
    };
    f.render_widget(Paragraph::new(logs), parts[2]);
}

fn draw_logs(area: Rect, f: &mut ratatui::Frame, view: &LogView) {
    let height = area.height.saturating_sub(2) as usize;
    let end = view.lines.len().saturating_sub(view.scroll);
    let start = end.saturating_sub(height);
    let lines: Vec<Line> = view
        .lines
        .range(start..end)
        .map(|l| {
            Line::from(vec![
                Span::styled(format!("{:>6} ", l.sequence), Style::default().fg(Color::DarkGray)),
                Span::raw(l.text.clone()),
            ])
        })
        .collect();

    let mut title = format!("Logs: {} (Esc to close)", view.run_id);
    if view.scroll > 0 {
        title.push_str(" [scrolled, End to follow]");
    }
    let p = Paragraph::new(lines).block(Block::default().borders(Borders::ALL).title(title));
    f.render_widget(p, area);
}

fn draw_history(area: Rect, f: &mut ratatui::Frame, state: &UiState) {
    let stamp = time::macros::format_description!("[year]-[month]-[day] [hour]:[minute]");

    let mut lines: Vec<Line> = Vec::new();
    // Borders, header and the work dir footer.
    let max_items = (area.height as usize).saturating_sub(5).max(1);
    let total = state.history.len();
    let current_pos = if total > 0 { state.history_selected + 1 } else { 0 };

    lines.push(Line::from(vec![
        Span::raw(format!("History ({current_pos}/{total}) - ")),
        Span::styled("↑/↓/j/k", Style::default().fg(Color::Magenta)),
        Span::raw(": navigate, "),
        Span::styled("r", Style::default().fg(Color::Magenta)),
        Span::raw(": start/restart, "),
        Span::styled("s", Style::default().fg(Color::Magenta)),
        Span::raw(": stop, "),
        Span::styled("l", Style::default().fg(Color::Magenta)),
        Span::raw(": logs, "),
        Span::styled("d", Style::default().fg(Color::Magenta)),
        Span::raw(": delete"),
    ]));

    let offset = state.history_selected.saturating_sub(max_items - 1);
    for (i, r) in state.history.iter().enumerate().skip(offset).take(max_items) {
        let created = r.created_at.format(stamp).unwrap_or_default();
        let reason = r.reason.as_ref().map(|x| x.to_message()).unwrap_or_default();
        let mut spans = vec![
            Span::raw(if i == state.history_selected { "> " } else { "  " }),
            Span::styled(format!("{created}  "), Style::default().fg(Color::Gray)),
            Span::raw(format!("{:<28} ", r.display_name())),
            Span::styled(
                format!("{:<10}", r.status.as_str()),
                Style::default().fg(status_color(r.status)),
            ),
            Span::raw(reason),
        ];
        if i == state.history_selected {
            for span in &mut spans {
                span.style = span.style.add_modifier(Modifier::BOLD);
            }
        }
        lines.push(Line::from(spans));
    }

    if let Some(r) = state.selected_history() {
        lines.push(Line::from(""));
        lines.push(kv_line("Work dir", r.work_dir.display().to_string()));
    }

    let p = Paragraph::new(lines).block(Block::default().borders(Borders::ALL).title("History"));
    f.render_widget(p, area);
}
