//! External process launching.
//!
//! [`ShellLauncher`] runs each stage as `<shell> -c "<prelude> && <command>"`
//! in its own process group so that a stop reaches every worker a parallel
//! launcher forked, not only the shell.

use crate::config::SupervisorConfig;
use crate::error::LaunchError;
use crate::model::RunId;
use command_group::{AsyncCommandGroup, AsyncGroupChild};
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use std::io;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchRequest {
    pub run_id: RunId,
    pub stage: String,
    pub command: String,
    pub work_dir: PathBuf,
}

/// How a stage process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageExit {
    pub code: Option<i32>,
    /// Terminating signal, when the process did not exit on its own.
    pub signal: Option<i32>,
}

impl StageExit {
    pub fn code(code: i32) -> Self {
        Self {
            code: Some(code),
            signal: None,
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl From<ExitStatus> for StageExit {
    fn from(status: ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = std::os::unix::process::ExitStatusExt::signal(&status);
        #[cfg(not(unix))]
        let signal = None;
        Self {
            code: status.code(),
            signal,
        }
    }
}

/// Stops the process tree of one running stage.
pub trait TreeTerminator: Send + Sync {
    /// Ask every process of the stage to exit (SIGTERM).
    fn terminate(&self);
    /// Force the stage down (SIGKILL).
    fn kill(&self);
}

/// A launched stage: its merged output, its exit, and a way to stop it.
pub struct RunningStage {
    /// stdout and stderr, one line per message. Closes once both pipes hit EOF.
    pub output: mpsc::Receiver<String>,
    pub exit: BoxFuture<'static, io::Result<StageExit>>,
    pub terminator: Box<dyn TreeTerminator>,
}

pub trait ProcessLauncher: Send + Sync + 'static {
    fn launch(&self, request: &LaunchRequest) -> Result<RunningStage, LaunchError>;
}

#[derive(Debug, Clone)]
pub struct ShellLauncher {
    shell: String,
    prelude: Option<String>,
    output_buffer: usize,
}

impl ShellLauncher {
    pub fn new(shell: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
            prelude: None,
            output_buffer: 1024,
        }
    }

    pub fn from_config(cfg: &SupervisorConfig) -> Self {
        Self::new(cfg.shell.clone()).with_prelude(cfg.prelude.clone())
    }

    pub fn with_prelude(mut self, prelude: Option<String>) -> Self {
        self.prelude = prelude.filter(|p| !p.trim().is_empty());
        self
    }

    /// The string handed to `<shell> -c`.
    pub fn command_line(&self, command: &str) -> String {
        match &self.prelude {
            Some(prelude) => format!("{prelude} && {command}"),
            None => command.to_string(),
        }
    }
}

impl ProcessLauncher for ShellLauncher {
    fn launch(&self, request: &LaunchRequest) -> Result<RunningStage, LaunchError> {
        if !request.work_dir.is_dir() {
            return Err(LaunchError::MissingWorkDir {
                path: request.work_dir.clone(),
            });
        }

        let mut cmd = Command::new(&self.shell);
        cmd.arg("-c")
            .arg(self.command_line(&request.command))
            .current_dir(&request.work_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child: AsyncGroupChild =
            cmd.group_spawn().map_err(|source| LaunchError::Spawn {
                command: request.command.clone(),
                source,
            })?;
        let pid = child.inner().id();
        tracing::debug!(run_id = %request.run_id, stage = %request.stage, pid = ?pid, "stage spawned");

        let (tx, output) = mpsc::channel(self.output_buffer);
        if let Some(stdout) = child.inner().stdout.take() {
            tokio::spawn(forward_lines(stdout, tx.clone()));
        }
        if let Some(stderr) = child.inner().stderr.take() {
            tokio::spawn(forward_lines(stderr, tx));
        }

        let (kill_tx, mut kill_rx) = oneshot::channel::<()>();
        let exit = async move {
            tokio::select! {
                status = child.wait() => return status.map(StageExit::from),
                Ok(()) = &mut kill_rx => {}
            }
            // Kills the whole group, not only the shell.
            if let Err(e) = child.start_kill() {
                tracing::debug!(error = %e, "stage group already gone");
            }
            child.wait().await.map(StageExit::from)
        }
        .boxed();

        Ok(RunningStage {
            output,
            exit,
            terminator: Box::new(GroupTerminator {
                pid,
                kill_tx: Mutex::new(Some(kill_tx)),
            }),
        })
    }
}

/// Read lines until EOF, decoding lossily so a stray byte never ends the stream.
async fn forward_lines<R>(reader: R, tx: mpsc::Sender<String>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&buf);
                let line = text.trim_end_matches(['\r', '\n']).to_string();
                if tx.send(line).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                tracing::debug!(error = %e, "stage output read failed");
                break;
            }
        }
    }
}

struct GroupTerminator {
    pid: Option<u32>,
    kill_tx: Mutex<Option<oneshot::Sender<()>>>,
}

impl GroupTerminator {
    fn kill_child(&self) {
        if let Some(tx) = self.kill_tx.lock().take() {
            let _ = tx.send(());
        }
    }
}

impl TreeTerminator for GroupTerminator {
    fn terminate(&self) {
        #[cfg(unix)]
        signal_group(self.pid, nix::sys::signal::Signal::SIGTERM);
        #[cfg(not(unix))]
        self.kill_child();
    }

    fn kill(&self) {
        #[cfg(unix)]
        signal_group(self.pid, nix::sys::signal::Signal::SIGKILL);
        self.kill_child();
    }
}

/// Signal every process in the group the stage shell leads.
#[cfg(unix)]
fn signal_group(pid: Option<u32>, signal: nix::sys::signal::Signal) {
    use nix::errno::Errno;
    use nix::unistd::Pid;

    let Some(pid) = pid.and_then(|pid| i32::try_from(pid).ok()) else {
        return;
    };
    match nix::sys::signal::kill(Pid::from_raw(-pid), signal) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => tracing::warn!(pgid = pid, signal = ?signal, error = %e, "signal to stage group failed"),
    }
}
