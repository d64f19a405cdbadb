use anyhow::{Context, Result};
use clap::Parser;
use futures::{FutureExt, StreamExt};
use serde::Deserialize;
use simwatch::telemetry::{init_tracing, LogTarget};
use simwatch::{
    storage, RunConfig, RunId, RunRecord, RunStatus, ShellLauncher, StatusReport, Supervisor,
    SupervisorConfig, SystemClock,
};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Output line routing for stdout/stderr writer.
enum OutputLine {
    Stdout(String),
    Stderr(String),
}

/// Spawn a blocking writer for stdout/stderr to avoid blocking async tasks.
fn spawn_output_writer() -> (
    mpsc::UnboundedSender<OutputLine>,
    tokio::task::JoinHandle<()>,
) {
    let (tx, mut rx) = mpsc::unbounded_channel::<OutputLine>();
    let handle = tokio::task::spawn_blocking(move || {
        let stdout = std::io::stdout();
        let stderr = std::io::stderr();
        let mut out = std::io::LineWriter::new(stdout.lock());
        let mut err = std::io::LineWriter::new(stderr.lock());

        while let Some(line) = rx.blocking_recv() {
            match line {
                OutputLine::Stdout(msg) => {
                    let _ = writeln!(out, "{}", msg);
                }
                OutputLine::Stderr(msg) => {
                    let _ = writeln!(err, "{}", msg);
                }
            }
        }

        let _ = out.flush();
        let _ = err.flush();
    });
    (tx, handle)
}

#[derive(Debug, Parser, Clone)]
#[command(
    name = "simwatch",
    version,
    about = "Run and monitor simulation pipelines with an optional TUI"
)]
pub struct Cli {
    /// Run plan (JSON) listing the runs to supervise
    pub plan: Option<PathBuf>,

    /// Print NDJSON status reports until the planned runs finish (no TUI)
    #[arg(long)]
    pub json: bool,

    /// Stream run output and print a text summary at the end (no TUI)
    #[arg(long)]
    pub text: bool,

    /// Run silently: suppress all output except errors (for batch usage)
    #[arg(long)]
    pub silent: bool,

    /// Log lines retained per run for replay
    #[arg(long, default_value_t = 500)]
    pub ring_capacity: usize,

    /// Live lines a log subscriber may fall behind before it is dropped
    #[arg(long, default_value_t = 256)]
    pub subscriber_queue: usize,

    /// Recent log lines shown per dashboard card
    #[arg(long, default_value_t = 3)]
    pub recent_lines: usize,

    /// Status polling interval
    #[arg(long, default_value = "500ms")]
    pub poll_interval: humantime::Duration,

    /// Grace period between SIGTERM and SIGKILL when stopping a stage
    #[arg(long, default_value = "5s")]
    pub kill_grace: humantime::Duration,

    /// Shell used to run stage commands
    #[arg(long, default_value = "/bin/bash")]
    pub shell: String,

    /// Environment setup run before each stage (e.g. "source /opt/openfoam/etc/bashrc")
    #[arg(long)]
    pub prelude: Option<String>,

    /// Directory holding runs.json and the TUI log file
    #[arg(long)]
    pub state_dir: Option<PathBuf>,

    /// Use --persist true or --persist false to override
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    pub persist: bool,

    /// Tee stage output into <work_dir>/logs/<stage>.log
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    pub stage_logs: bool,

    /// Drop finished runs older than this from the registry
    #[arg(long, default_value = "24h")]
    pub prune_after: humantime::Duration,

    /// Start every planned run when the app launches
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    pub start_on_launch: bool,
}

/// A run plan file: `{"runs": [{"work_dir": "...", "end_time": 1000, ...}]}`.
#[derive(Debug, Clone, Deserialize)]
pub struct RunPlan {
    pub runs: Vec<PlannedRun>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlannedRun {
    /// Relative paths resolve against the plan file's directory.
    pub work_dir: PathBuf,
    #[serde(flatten)]
    pub config: RunConfig,
}

pub fn load_plan(path: &Path) -> Result<RunPlan> {
    let data =
        std::fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let mut plan: RunPlan =
        serde_json::from_str(&data).with_context(|| format!("parse {}", path.display()))?;
    let base = path.parent().unwrap_or_else(|| Path::new("."));
    for run in &mut plan.runs {
        if run.work_dir.is_relative() {
            run.work_dir = base.join(&run.work_dir);
        }
    }
    Ok(plan)
}

/// Build a `SupervisorConfig` from CLI arguments.
pub fn build_config(args: &Cli) -> SupervisorConfig {
    SupervisorConfig {
        ring_capacity: args.ring_capacity,
        subscriber_queue: args.subscriber_queue,
        recent_lines: args.recent_lines,
        shell: args.shell.clone(),
        prelude: args.prelude.clone(),
        kill_grace: Duration::from(args.kill_grace),
        poll_interval: Duration::from(args.poll_interval),
        state_dir: args.state_dir.clone(),
        stage_logs: args.stage_logs,
        persist: args.persist,
        prune_after: Some(Duration::from(args.prune_after)).filter(|d| !d.is_zero()),
    }
}

fn is_tui_mode(args: &Cli) -> bool {
    cfg!(feature = "tui") && !args.json && !args.text && !args.silent
}

/// Build the supervisor, restore saved history and launch the planned runs.
///
/// Returns the ids of the runs created from the plan, in plan order.
pub fn prepare(args: &Cli) -> Result<(Supervisor, Vec<RunId>)> {
    let cfg = build_config(args);
    let launcher = Arc::new(ShellLauncher::from_config(&cfg));
    let supervisor = Supervisor::new(cfg.clone(), launcher, Arc::new(SystemClock))
        .context("invalid supervisor configuration")?;

    if cfg.persist {
        let dir = cfg.resolved_state_dir();
        match storage::load_registry(&dir) {
            Ok(records) => {
                let restored = supervisor.restore(records);
                tracing::debug!(restored, dir = %dir.display(), "restored run registry");
            }
            Err(e) => tracing::warn!(error = %format!("{e:#}"), "failed to load run registry"),
        }
    }

    let plan = match args.plan.as_deref() {
        Some(path) => load_plan(path)?,
        None => RunPlan { runs: Vec::new() },
    };

    let mut ids = Vec::with_capacity(plan.runs.len());
    for run in plan.runs {
        let work_dir = run.work_dir.clone();
        let id = supervisor
            .plan_run(run.work_dir, run.config)
            .with_context(|| format!("invalid run for {}", work_dir.display()))?;
        if args.start_on_launch {
            supervisor
                .restart_run(&id)
                .with_context(|| format!("failed to start {id}"))?;
        }
        ids.push(id);
    }
    Ok((supervisor, ids))
}

pub async fn run(args: Cli) -> Result<()> {
    if !is_tui_mode(&args) && args.plan.is_none() {
        return Err(anyhow::anyhow!(
            "a run plan is required for --json, --text and --silent"
        ));
    }
    if !args.start_on_launch && !is_tui_mode(&args) {
        return Err(anyhow::anyhow!(
            "--start-on-launch false only makes sense with the TUI"
        ));
    }

    let log_file = build_config(&args).resolved_state_dir().join("simwatch.log");
    if is_tui_mode(&args) || args.silent {
        init_tracing(LogTarget::File(log_file))?;
    } else {
        init_tracing(LogTarget::Stderr)?;
    }

    let (supervisor, ids) = prepare(&args)?;

    // Silent mode takes precedence over other output modes
    if args.silent {
        return run_silent(supervisor, ids).await;
    }

    if is_tui_mode(&args) {
        #[cfg(feature = "tui")]
        {
            return crate::tui::run(supervisor).await;
        }
    }

    if args.json {
        return run_json(supervisor, ids).await;
    }

    run_text(supervisor, ids).await
}

/// Resolves once every listed run is terminal.
async fn wait_all(supervisor: &Supervisor, ids: &[RunId]) -> Vec<RunStatus> {
    let waits = ids.iter().map(|id| supervisor.wait_for_terminal(id));
    futures::future::join_all(waits)
        .await
        .into_iter()
        .map(|r| r.unwrap_or(RunStatus::Failed))
        .collect()
}

/// Stop every pipeline on Ctrl-C; the waits in each mode then complete.
fn spawn_interrupt_handler(supervisor: Supervisor) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupted, stopping running pipelines");
            supervisor.shutdown().await;
        }
    })
}

fn failure_error(records: &[RunRecord]) -> Option<anyhow::Error> {
    let failed: Vec<String> = records
        .iter()
        .filter(|r| r.status == RunStatus::Failed)
        .map(|r| {
            let reason = r.reason.as_ref().map(|x| x.to_message()).unwrap_or_default();
            format!("{}: {reason}", r.display_name())
        })
        .collect();
    if failed.is_empty() {
        None
    } else {
        Some(anyhow::anyhow!(
            "{} run(s) failed: {}",
            failed.len(),
            failed.join("; ")
        ))
    }
}

fn records_for(supervisor: &Supervisor, ids: &[RunId]) -> Vec<RunRecord> {
    ids.iter()
        .filter_map(|id| supervisor.get_run(id).ok())
        .collect()
}

async fn run_silent(supervisor: Supervisor, ids: Vec<RunId>) -> Result<()> {
    let interrupt = spawn_interrupt_handler(supervisor.clone());
    wait_all(&supervisor, &ids).await;
    interrupt.abort();

    match failure_error(&records_for(&supervisor, &ids)) {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Final report covering the planned runs, whatever their status.
fn final_report(supervisor: &Supervisor, ids: &[RunId]) -> StatusReport {
    let runs: Vec<_> = ids
        .iter()
        .filter_map(|id| supervisor.run_detail(id).ok())
        .collect();
    StatusReport {
        generated_at: time::OffsetDateTime::now_utc(),
        active: runs.iter().any(|v| v.status == RunStatus::Running),
        run_ids: runs.iter().map(|v| v.run_id.clone()).collect(),
        runs,
    }
}

async fn run_json(supervisor: Supervisor, ids: Vec<RunId>) -> Result<()> {
    let (out_tx, out_handle) = spawn_output_writer();
    let interrupt = spawn_interrupt_handler(supervisor.clone());

    let mut ticker = tokio::time::interval(supervisor.config().poll_interval);
    let all_done = wait_all(&supervisor, &ids);
    tokio::pin!(all_done);

    loop {
        tokio::select! {
            _ = &mut all_done => break,
            _ = ticker.tick() => {
                let report = supervisor.get_snapshot();
                let _ = out_tx.send(OutputLine::Stdout(serde_json::to_string(&report)?));
            }
        }
    }
    interrupt.abort();

    let report = final_report(&supervisor, &ids);
    let _ = out_tx.send(OutputLine::Stdout(serde_json::to_string(&report)?));
    if let Some(path) = saved_registry(&supervisor) {
        let _ = out_tx.send(OutputLine::Stderr(format!("Saved: {}", path.display())));
    }

    drop(out_tx);
    let _ = out_handle.await;
    Ok(())
}

async fn run_text(supervisor: Supervisor, ids: Vec<RunId>) -> Result<()> {
    let (out_tx, out_handle) = spawn_output_writer();
    let interrupt = spawn_interrupt_handler(supervisor.clone());

    let mut streams = Vec::with_capacity(ids.len());
    for id in &ids {
        streams.push(supervisor.subscribe_logs(id)?.into_stream().boxed());
    }
    let mut merged = futures::stream::select_all(streams);

    let all_done = wait_all(&supervisor, &ids);
    tokio::pin!(all_done);
    let tag = ids.len() > 1;

    let print = |line: simwatch::LogLine| {
        let msg = if tag {
            format!("[{}] {}", line.run_id, line.text)
        } else {
            line.text
        };
        let _ = out_tx.send(OutputLine::Stderr(msg));
    };

    loop {
        tokio::select! {
            _ = &mut all_done => break,
            Some(line) = merged.next() => print(line),
        }
    }
    // Everything a run printed is queued before it turns terminal.
    while let Some(Some(line)) = merged.next().now_or_never() {
        print(line);
    }
    interrupt.abort();

    let records = records_for(&supervisor, &ids);
    let summary = crate::text_summary::build_text_summary(&records);
    for line in summary.lines {
        let _ = out_tx.send(OutputLine::Stdout(line));
    }
    if let Some(path) = saved_registry(&supervisor) {
        let _ = out_tx.send(OutputLine::Stderr(format!("Saved: {}", path.display())));
    }
    drop(out_tx);
    let _ = out_handle.await;

    match failure_error(&records) {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

fn saved_registry(supervisor: &Supervisor) -> Option<PathBuf> {
    let cfg = supervisor.config();
    if !cfg.persist {
        return None;
    }
    let path = cfg.resolved_state_dir().join(storage::REGISTRY_FILE);
    path.exists().then_some(path)
}
