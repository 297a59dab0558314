//! Lifecycle of the single supervised program and its optional debugger.
//!
//! Start spawns the freshly built binary in its own process group and relays
//! its output; stop escalates from a soft interrupt to a hard kill after a
//! bounded grace period. At most one process is managed at any time.
use crate::config::DebuggerConfig;
use crate::output::{spawn_relay, OutputSink};
use crate::platform::{isolate, PlatformTerminator, Terminate};
use chrono::{DateTime, Utc};
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};
use tokio::process::{Child, Command};

/// How long to wait for the kernel to reap a process after a hard kill.
const REAP_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Idle,
    Starting,
    Running,
    Debugging,
    Stopping,
    /// The program exited on its own and has not been cleaned up yet.
    Crashed,
}

impl std::fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SupervisorState::Idle => "idle",
            SupervisorState::Starting => "starting",
            SupervisorState::Running => "running",
            SupervisorState::Debugging => "debugging",
            SupervisorState::Stopping => "stopping",
            SupervisorState::Crashed => "crashed",
        };
        f.write_str(name)
    }
}

/// Errors from supervising the program.
#[derive(Debug)]
pub enum SupervisorError {
    /// `start` was called while a process is still managed.
    NotIdle { state: SupervisorState },
    /// The binary could not be spawned.
    Start {
        path: PathBuf,
        source: std::io::Error,
    },
    /// The debugger could not be attached; the program itself keeps running.
    DebuggerAttach {
        command: String,
        pid: u32,
        source: std::io::Error,
    },
    /// Neither soft nor hard termination worked.
    Kill { pid: u32, source: std::io::Error },
}

impl std::fmt::Display for SupervisorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SupervisorError::NotIdle { state } => {
                write!(f, "cannot start: a process is still {}", state)
            }
            SupervisorError::Start { path, source } => {
                write!(f, "failed to start {}: {}", path.display(), source)
            }
            SupervisorError::DebuggerAttach {
                command,
                pid,
                source,
            } => {
                write!(
                    f,
                    "failed to attach debugger `{}` to pid {}: {}",
                    command, pid, source
                )
            }
            SupervisorError::Kill { pid, source } => {
                write!(f, "failed to kill pid {}: {}", pid, source)
            }
        }
    }
}

impl std::error::Error for SupervisorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SupervisorError::NotIdle { .. } => None,
            SupervisorError::Start { source, .. } => Some(source),
            SupervisorError::DebuggerAttach { source, .. } => Some(source),
            SupervisorError::Kill { source, .. } => Some(source),
        }
    }
}

/// What happened to the debugger during `start`.
#[derive(Debug)]
pub enum DebuggerStatus {
    Disabled,
    Attached { pid: u32 },
    Failed(SupervisorError),
}

/// Result of a successful `start`.
#[derive(Debug)]
pub struct Started {
    pub pid: u32,
    pub debugger: DebuggerStatus,
}

/// The currently managed program.
#[derive(Debug)]
pub struct SupervisedProcess {
    pub pid: u32,
    pub started_at: DateTime<Utc>,
    child: Child,
    exited: bool,
    debugger: Option<DebuggerProcess>,
}

#[derive(Debug)]
struct DebuggerProcess {
    pid: u32,
    child: Child,
}

impl SupervisedProcess {
    #[cfg(test)]
    pub fn debugger_pid(&self) -> Option<u32> {
        self.debugger.as_ref().map(|d| d.pid)
    }
}

/// Starts, monitors, and stops the built binary.
pub struct Supervisor<T: Terminate = PlatformTerminator> {
    binary: PathBuf,
    args: Vec<String>,
    sink: OutputSink,
    debugger: Option<DebuggerConfig>,
    grace: Duration,
    terminator: T,
    state: SupervisorState,
    current: Option<SupervisedProcess>,
}

impl Supervisor<PlatformTerminator> {
    pub fn new(binary: impl Into<PathBuf>, args: Vec<String>, sink: OutputSink) -> Self {
        Self::with_terminator(binary, args, sink, PlatformTerminator::default())
    }
}

impl<T: Terminate> Supervisor<T> {
    pub fn with_terminator(
        binary: impl Into<PathBuf>,
        args: Vec<String>,
        sink: OutputSink,
        terminator: T,
    ) -> Self {
        Self {
            binary: binary.into(),
            args,
            sink,
            debugger: None,
            grace: Duration::from_secs(3),
            terminator,
            state: SupervisorState::Idle,
            current: None,
        }
    }

    /// Attach this debugger after every start.
    pub fn with_debugger(mut self, debugger: DebuggerConfig) -> Self {
        self.debugger = Some(debugger);
        self
    }

    /// Time between the soft and the hard kill.
    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn state(&self) -> SupervisorState {
        self.state
    }

    pub fn current(&self) -> Option<&SupervisedProcess> {
        self.current.as_ref()
    }

    pub fn pid(&self) -> Option<u32> {
        self.current.as_ref().map(|p| p.pid)
    }

    /// Spawn the binary. Valid only from `Idle`.
    ///
    /// Output is relayed to the sink by background tasks; this returns as
    /// soon as the process exists. A failed debugger attach is reported in
    /// [`Started::debugger`] and leaves the program running.
    pub fn start(&mut self) -> Result<Started, SupervisorError> {
        if self.state != SupervisorState::Idle {
            return Err(SupervisorError::NotIdle { state: self.state });
        }
        self.state = SupervisorState::Starting;

        let mut command = Command::new(&self.binary);
        command
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        isolate(&mut command);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                self.state = SupervisorState::Idle;
                return Err(SupervisorError::Start {
                    path: self.binary.clone(),
                    source: e,
                });
            }
        };

        let pid = child.id().unwrap_or(0);
        relay_output(&mut child, &self.sink);
        tracing::info!(pid, binary = %self.binary.display(), args = ?self.args, "process started");

        self.current = Some(SupervisedProcess {
            pid,
            started_at: Utc::now(),
            child,
            exited: false,
            debugger: None,
        });
        self.state = SupervisorState::Running;

        let debugger = match self.debugger.clone() {
            None => DebuggerStatus::Disabled,
            Some(config) => match self.attach_debugger(&config) {
                Ok(debugger_pid) => {
                    self.state = SupervisorState::Debugging;
                    DebuggerStatus::Attached { pid: debugger_pid }
                }
                Err(e) => {
                    tracing::warn!(pid, error = %e, "debugging unavailable for this build");
                    DebuggerStatus::Failed(e)
                }
            },
        };

        Ok(Started { pid, debugger })
    }

    fn attach_debugger(&mut self, config: &DebuggerConfig) -> Result<u32, SupervisorError> {
        let Some(process) = self.current.as_mut() else {
            return Err(SupervisorError::DebuggerAttach {
                command: config.command.clone(),
                pid: 0,
                source: std::io::Error::other("no process to attach to"),
            });
        };
        let pid = process.pid;
        let attach_error = |source| SupervisorError::DebuggerAttach {
            command: config.command.clone(),
            pid,
            source,
        };

        // Only attach to a process that is confirmed alive.
        match process.child.try_wait() {
            Ok(None) => {}
            Ok(Some(status)) => {
                process.exited = true;
                self.state = SupervisorState::Crashed;
                return Err(attach_error(std::io::Error::other(format!(
                    "process already exited with {status}"
                ))));
            }
            Err(e) => return Err(attach_error(e)),
        }

        let mut command = Command::new(&config.command);
        command
            .args(debugger_args(config, pid))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        isolate(&mut command);

        let mut child = command.spawn().map_err(attach_error)?;
        let debugger_pid = child.id().unwrap_or(0);
        relay_output(&mut child, &self.sink);
        tracing::info!(pid, debugger_pid, listen = %config.listen, "debugger attached");

        process.debugger = Some(DebuggerProcess {
            pid: debugger_pid,
            child,
        });
        Ok(debugger_pid)
    }

    /// Stop the managed process (and debugger). No-op when idle.
    ///
    /// Sends the soft termination, waits up to the grace period, then hard
    /// kills. Returns once termination is confirmed.
    pub async fn stop(&mut self) -> Result<(), SupervisorError> {
        let Some(process) = self.current.as_mut() else {
            self.state = SupervisorState::Idle;
            return Ok(());
        };
        self.state = SupervisorState::Stopping;
        let pid = process.pid;

        if let Some(debugger) = process.debugger.as_ref() {
            signal_debugger(&self.terminator, debugger.pid);
        }

        let result = terminate(&self.terminator, &mut process.child, pid, self.grace).await;

        let reaped = match &result {
            Ok(reaped) => *reaped,
            Err(_) => false,
        };

        let debugger_reaped = match process.debugger.as_mut() {
            Some(debugger) => reap_debugger(&self.terminator, debugger).await,
            None => true,
        };

        // Confirmed (or given up on): the slot is free from here on.
        if let Some(mut process) = self.current.take() {
            if !reaped {
                tokio::spawn(async move {
                    let _ = process.child.wait().await;
                });
            } else if !debugger_reaped {
                if let Some(mut debugger) = process.debugger.take() {
                    tokio::spawn(async move {
                        let _ = debugger.child.wait().await;
                    });
                }
            }
        }
        self.state = SupervisorState::Idle;

        match result {
            Ok(_) => Ok(()),
            Err(e) => {
                tracing::error!(pid, error = %e, "process may have leaked");
                Err(e)
            }
        }
    }

    /// Resolves when the running program exits on its own.
    ///
    /// Cancel-safe. Pending forever while nothing is running or the exit was
    /// already reported.
    pub async fn wait_exit(&mut self) -> std::io::Result<ExitStatus> {
        let process = match self.current.as_mut() {
            Some(process) if !process.exited => process,
            _ => return std::future::pending().await,
        };
        let status = process.child.wait().await;
        process.exited = true;
        self.state = SupervisorState::Crashed;
        status
    }

    /// True when the binary on disk is newer than the running process.
    pub fn needs_refresh(&self) -> bool {
        let Some(process) = self.current.as_ref() else {
            return false;
        };
        match std::fs::metadata(&self.binary).and_then(|m| m.modified()) {
            Ok(modified) => DateTime::<Utc>::from(modified) > process.started_at,
            Err(_) => false,
        }
    }
}

fn relay_output(child: &mut Child, sink: &OutputSink) {
    if let Some(stdout) = child.stdout.take() {
        spawn_relay(stdout, sink.clone());
    }
    if let Some(stderr) = child.stderr.take() {
        spawn_relay(stderr, sink.clone());
    }
}

/// `dlv attach` in headless multi-client mode, resuming the target at once.
fn debugger_args(config: &DebuggerConfig, pid: u32) -> Vec<String> {
    vec![
        "attach".to_string(),
        "--headless=true".to_string(),
        "--api-version=2".to_string(),
        "--accept-multiclient".to_string(),
        "--continue".to_string(),
        format!("--listen={}", config.listen),
        pid.to_string(),
    ]
}

fn signal_debugger<T: Terminate>(terminator: &T, pid: u32) {
    if let Err(soft) = terminator.soft_terminate(pid) {
        tracing::warn!(pid, error = %soft, "soft kill of debugger failed, forcing");
        if let Err(hard) = terminator.hard_terminate(pid) {
            tracing::error!(pid, error = %hard, "failed to kill debugger");
        }
    }
}

/// Collect the debugger's exit, forcing it if it outlived the program.
/// Returns whether it was reaped.
async fn reap_debugger<T: Terminate>(terminator: &T, debugger: &mut DebuggerProcess) -> bool {
    if tokio::time::timeout(REAP_TIMEOUT, debugger.child.wait())
        .await
        .is_ok()
    {
        return true;
    }
    tracing::warn!(pid = debugger.pid, "debugger still running, killing");
    if terminator.hard_terminate(debugger.pid).is_err() {
        let _ = debugger.child.start_kill();
    }
    tokio::time::timeout(REAP_TIMEOUT, debugger.child.wait())
        .await
        .is_ok()
}

/// Soft, bounded wait, hard. Returns whether the child was reaped.
async fn terminate<T: Terminate>(
    terminator: &T,
    child: &mut Child,
    pid: u32,
    grace: Duration,
) -> Result<bool, SupervisorError> {
    if let Ok(Some(status)) = child.try_wait() {
        // Sweep whatever the exited leader left behind in its group.
        let _ = terminator.hard_terminate(pid);
        tracing::debug!(pid, %status, "process had already exited");
        return Ok(true);
    }

    let start = Instant::now();
    match terminator.soft_terminate(pid) {
        Ok(()) => match tokio::time::timeout(grace, child.wait()).await {
            Ok(Ok(status)) => {
                // Descendants that ignored the interrupt must not outlive the leader.
                let _ = terminator.hard_terminate(pid);
                tracing::info!(
                    pid,
                    %status,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "process stopped"
                );
                return Ok(true);
            }
            Ok(Err(e)) => {
                tracing::warn!(pid, error = %e, "waiting for process failed, forcing");
            }
            Err(_) => {
                tracing::warn!(
                    pid,
                    grace_ms = grace.as_millis() as u64,
                    "process ignored interrupt, killing"
                );
            }
        },
        Err(e) => {
            tracing::warn!(pid, error = %e, "soft kill failed, forcing");
        }
    }

    if let Err(hard) = terminator.hard_terminate(pid) {
        if let Err(e) = child.start_kill() {
            tracing::error!(pid, error = %e, "direct kill failed too");
            return Err(SupervisorError::Kill { pid, source: hard });
        }
    }

    let reaped = tokio::time::timeout(REAP_TIMEOUT, child.wait())
        .await
        .is_ok();
    tracing::info!(
        pid,
        reaped,
        elapsed_ms = start.elapsed().as_millis() as u64,
        "process killed"
    );
    Ok(reaped)
}
