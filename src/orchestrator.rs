//! The rebuild loop: build, start, wait for a change, stop, repeat.
use crate::builder::{Build, BuildResult};
use crate::output::OutputSink;
use crate::platform::{PlatformTerminator, Terminate};
use crate::supervisor::{DebuggerStatus, Supervisor, SupervisorError};
use crate::watcher::{ChangeSignal, ChangeStream, WatcherError};
use std::process::ExitStatus;
use tokio::sync::watch;

/// Why the loop ended.
#[derive(Debug)]
pub enum Exit {
    /// Ctrl-C or SIGTERM.
    Interrupted,
    /// The change detector died; nothing would ever trigger a rebuild again.
    WatcherFailed(WatcherError),
    /// A process could not be confirmed dead.
    KillFailed(SupervisorError),
}

impl Exit {
    pub fn exit_code(&self) -> i32 {
        match self {
            Exit::Interrupted => 130,
            Exit::WatcherFailed(_) | Exit::KillFailed(_) => 1,
        }
    }
}

impl std::fmt::Display for Exit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Exit::Interrupted => write!(f, "interrupted"),
            Exit::WatcherFailed(e) => write!(f, "watcher failed: {e}"),
            Exit::KillFailed(e) => write!(f, "could not stop process: {e}"),
        }
    }
}

/// What woke the loop while a program was (maybe) running.
enum Wake {
    Interrupt,
    Change,
    WatcherDown(WatcherError),
    ProcessExited(std::io::Result<ExitStatus>),
}

/// Owns the supervisor and drives one cycle per change signal.
pub struct Orchestrator<B: Build, T: Terminate = PlatformTerminator> {
    builder: B,
    supervisor: Supervisor<T>,
    sink: OutputSink,
    cycles: u64,
}

impl<B: Build, T: Terminate> Orchestrator<B, T> {
    /// `sink` receives compiler diagnostics; program output goes through
    /// the supervisor's own sink.
    pub fn new(builder: B, supervisor: Supervisor<T>, sink: OutputSink) -> Self {
        Self {
            builder,
            supervisor,
            sink,
            cycles: 0,
        }
    }

    #[cfg(test)]
    pub fn supervisor(&self) -> &Supervisor<T> {
        &self.supervisor
    }

    /// Number of builds attempted so far.
    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    /// Run until interrupted or until something makes continuing unsafe.
    ///
    /// The program is always stopped before this returns.
    pub async fn run(
        &mut self,
        mut changes: ChangeStream,
        mut shutdown: watch::Receiver<bool>,
    ) -> Exit {
        loop {
            if let Err(exit) = self.cycle(&mut shutdown).await {
                return exit;
            }

            loop {
                let wake = tokio::select! {
                    biased;
                    _ = interrupted(&mut shutdown) => Wake::Interrupt,
                    change = changes.next() => match change {
                        Ok(ChangeSignal) => Wake::Change,
                        Err(e) => Wake::WatcherDown(e),
                    },
                    status = self.supervisor.wait_exit() => Wake::ProcessExited(status),
                };

                match wake {
                    Wake::Interrupt => {
                        tracing::info!("interrupted, shutting down");
                        return self.finish(Exit::Interrupted).await;
                    }
                    Wake::WatcherDown(e) => {
                        tracing::error!(error = %e, "change detection stopped");
                        return self.finish(Exit::WatcherFailed(e)).await;
                    }
                    Wake::ProcessExited(status) => {
                        self.report_exit(status);
                        // Rebuilt by something else while it ran: no change will announce it.
                        if self.supervisor.needs_refresh() {
                            tracing::info!("binary on disk is newer than the exited program, restarting");
                            break;
                        }
                    }
                    Wake::Change => break,
                }
            }

            tracing::debug!(state = %self.supervisor.state(), "change detected, restarting");
            if let Err(e) = self.supervisor.stop().await {
                return Exit::KillFailed(e);
            }
        }
    }

    /// Build and, if that worked, start. Only an interrupt or an
    /// unkillable process ends the loop from here.
    async fn cycle(&mut self, shutdown: &mut watch::Receiver<bool>) -> Result<(), Exit> {
        self.cycles += 1;
        // Dropping the build future kills the compiler.
        let result = tokio::select! {
            biased;
            _ = interrupted(shutdown) => None,
            result = self.builder.build() => Some(result),
        };
        let Some(result) = result else {
            tracing::info!("interrupted during build, shutting down");
            return Err(self.finish(Exit::Interrupted).await);
        };

        self.report_build(&result).await;
        if !result.succeeded {
            return Ok(());
        }

        match self.supervisor.start() {
            Ok(started) => match started.debugger {
                DebuggerStatus::Failed(e) => {
                    tracing::error!(pid = started.pid, error = %e, "debugger unavailable, program left running");
                }
                DebuggerStatus::Attached { pid } => {
                    tracing::debug!(pid = started.pid, debugger_pid = pid, "debugging");
                }
                DebuggerStatus::Disabled => {}
            },
            Err(e) => tracing::error!(error = %e, "could not start program"),
        }
        Ok(())
    }

    async fn report_build(&self, result: &BuildResult) {
        if !result.diagnostics.is_empty() {
            self.sink.write(result.diagnostics.as_bytes()).await;
            if !result.diagnostics.ends_with('\n') {
                self.sink.write(b"\n").await;
            }
        }
        if !result.succeeded {
            tracing::warn!(cycle = self.cycles, "build failed, waiting for changes");
        }
    }

    fn report_exit(&self, status: std::io::Result<ExitStatus>) {
        let pid = self.supervisor.pid();
        match status {
            Ok(status) if status.success() => {
                tracing::info!(pid = ?pid, "program exited, waiting for changes");
            }
            Ok(status) => {
                tracing::warn!(pid = ?pid, status = %status, "program crashed, waiting for changes");
            }
            Err(e) => tracing::error!(pid = ?pid, error = %e, "lost track of program"),
        }
    }

    /// Final stop. A process that will not die outranks the reason for stopping.
    async fn finish(&mut self, exit: Exit) -> Exit {
        match self.supervisor.stop().await {
            Ok(()) => exit,
            Err(e) => {
                tracing::error!(reason = %exit, "shutdown incomplete");
                Exit::KillFailed(e)
            }
        }
    }
}

/// Resolves once shutdown is requested; never if the sender is gone.
async fn interrupted(shutdown: &mut watch::Receiver<bool>) {
    let requested = shutdown.wait_for(|stop| *stop).await.map(|_| ());
    if requested.is_err() {
        std::future::pending::<()>().await;
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::platform::unix::{is_alive, ReapsBehindTheHandle};
    use crate::supervisor::SupervisorState;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::{Duration, Instant};
    use tokio::sync::mpsc;

    const DIAGNOSTICS: &str = "./main.go:3:2: undefined: foo\n";

    /// Stand-in compiler: plays back a list of outcomes, then succeeds.
    struct FakeBuild {
        outcomes: Mutex<VecDeque<bool>>,
        builds: Arc<AtomicUsize>,
        duration: Duration,
    }

    impl FakeBuild {
        fn new(outcomes: &[bool]) -> (Self, Arc<AtomicUsize>) {
            let builds = Arc::new(AtomicUsize::new(0));
            let fake = Self {
                outcomes: Mutex::new(outcomes.iter().copied().collect()),
                builds: builds.clone(),
                duration: Duration::from_millis(10),
            };
            (fake, builds)
        }

        fn slow(mut self, duration: Duration) -> Self {
            self.duration = duration;
            self
        }
    }

    impl Build for FakeBuild {
        async fn build(&self) -> BuildResult {
            self.builds.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.duration).await;
            let succeeded = self.outcomes.lock().unwrap().pop_front().unwrap_or(true);
            BuildResult {
                succeeded,
                diagnostics: if succeeded {
                    String::new()
                } else {
                    DIAGNOSTICS.to_string()
                },
            }
        }
    }

    struct Harness {
        orchestrator: Orchestrator<FakeBuild>,
        sink: OutputSink,
        changes: mpsc::Sender<Result<ChangeSignal, WatcherError>>,
        stream: ChangeStream,
        shutdown: watch::Sender<bool>,
        shutdown_rx: watch::Receiver<bool>,
    }

    /// The program announces itself and its pid, then runs `tail`.
    fn harness(builder: FakeBuild, tail: &str) -> Harness {
        let sink = OutputSink::buffer();
        let script = format!("echo \"started $$\"; {tail}");
        let supervisor = Supervisor::new("sh", vec!["-c".to_string(), script], sink.clone())
            .with_grace(Duration::from_millis(500));
        let (changes, rx) = mpsc::channel(1);
        let (shutdown, shutdown_rx) = watch::channel(false);
        Harness {
            orchestrator: Orchestrator::new(builder, supervisor, sink.clone()),
            sink,
            changes,
            stream: ChangeStream::new(rx),
            shutdown,
            shutdown_rx,
        }
    }

    async fn output(sink: &OutputSink) -> String {
        String::from_utf8_lossy(&sink.snapshot().await).into_owned()
    }

    fn started_pids(output: &str) -> Vec<u32> {
        output
            .lines()
            .filter_map(|line| line.strip_prefix("started "))
            .filter_map(|pid| pid.trim().parse().ok())
            .collect()
    }

    async fn wait_for_starts(sink: &OutputSink, count: usize) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while started_pids(&output(sink).await).len() < count {
            assert!(Instant::now() < deadline, "program did not start {count} time(s)");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    async fn wait_for_builds(builds: &AtomicUsize, count: usize) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while builds.load(Ordering::SeqCst) < count {
            assert!(Instant::now() < deadline, "build {count} never happened");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(Exit::Interrupted.exit_code(), 130);
        assert_eq!(Exit::WatcherFailed(WatcherError::Closed).exit_code(), 1);
        let kill = SupervisorError::Kill {
            pid: 42,
            source: std::io::Error::from(std::io::ErrorKind::PermissionDenied),
        };
        assert_eq!(Exit::KillFailed(kill).exit_code(), 1);
    }

    #[tokio::test]
    async fn test_failed_build_starts_nothing_and_next_change_rebuilds() {
        let (builder, builds) = FakeBuild::new(&[false, true]);
        let Harness {
            mut orchestrator,
            sink,
            changes,
            stream,
            shutdown,
            shutdown_rx,
        } = harness(builder, "exec sleep 30");

        let driver = async {
            wait_for_builds(&builds, 1).await;
            tokio::time::sleep(Duration::from_millis(200)).await;
            let out = output(&sink).await;
            assert!(out.contains(DIAGNOSTICS), "diagnostics not shown: {out:?}");
            assert!(started_pids(&out).is_empty());

            changes.send(Ok(ChangeSignal)).await.unwrap();
            wait_for_starts(&sink, 1).await;
            shutdown.send(true).unwrap();
        };

        let (exit, ()) = tokio::join!(orchestrator.run(stream, shutdown_rx), driver);

        assert!(matches!(exit, Exit::Interrupted));
        assert_eq!(builds.load(Ordering::SeqCst), 2);
        assert_eq!(orchestrator.cycles(), 2);
        assert_eq!(orchestrator.supervisor().state(), SupervisorState::Idle);
    }

    #[tokio::test]
    async fn test_interrupt_stops_once_without_rebuilding() {
        let (builder, builds) = FakeBuild::new(&[]);
        let Harness {
            mut orchestrator,
            sink,
            changes: _changes,
            stream,
            shutdown,
            shutdown_rx,
        } = harness(builder, "exec sleep 30");

        let driver = async {
            wait_for_starts(&sink, 1).await;
            shutdown.send(true).unwrap();
        };

        let (exit, ()) = tokio::join!(orchestrator.run(stream, shutdown_rx), driver);

        assert!(matches!(exit, Exit::Interrupted));
        assert_eq!(builds.load(Ordering::SeqCst), 1);
        let pids = started_pids(&output(&sink).await);
        assert_eq!(pids.len(), 1);
        assert!(!is_alive(pids[0]));
        assert!(orchestrator.supervisor().pid().is_none());
    }

    #[tokio::test]
    async fn test_change_replaces_the_running_program() {
        let (builder, builds) = FakeBuild::new(&[]);
        let Harness {
            mut orchestrator,
            sink,
            changes,
            stream,
            shutdown,
            shutdown_rx,
        } = harness(builder, "exec sleep 30");

        let driver = async {
            wait_for_starts(&sink, 1).await;
            changes.send(Ok(ChangeSignal)).await.unwrap();
            wait_for_starts(&sink, 2).await;
            shutdown.send(true).unwrap();
        };

        let (exit, ()) = tokio::join!(orchestrator.run(stream, shutdown_rx), driver);

        assert!(matches!(exit, Exit::Interrupted));
        assert_eq!(builds.load(Ordering::SeqCst), 2);
        for pid in started_pids(&output(&sink).await) {
            assert!(!is_alive(pid), "pid {pid} survived");
        }
    }

    #[tokio::test]
    async fn test_crash_is_survived_until_next_change() {
        let (builder, builds) = FakeBuild::new(&[]);
        let Harness {
            mut orchestrator,
            sink,
            changes,
            stream,
            shutdown,
            shutdown_rx,
        } = harness(builder, "exit 3");

        let driver = async {
            wait_for_starts(&sink, 1).await;
            // Let the loop observe the crash before the next change arrives.
            tokio::time::sleep(Duration::from_millis(300)).await;
            assert_eq!(builds.load(Ordering::SeqCst), 1);

            changes.send(Ok(ChangeSignal)).await.unwrap();
            wait_for_starts(&sink, 2).await;
            shutdown.send(true).unwrap();
        };

        let (exit, ()) = tokio::join!(orchestrator.run(stream, shutdown_rx), driver);

        assert!(matches!(exit, Exit::Interrupted));
        assert_eq!(builds.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_interrupt_during_build_abandons_it() {
        let (builder, builds) = FakeBuild::new(&[]);
        let Harness {
            mut orchestrator,
            sink,
            changes: _changes,
            stream,
            shutdown,
            shutdown_rx,
        } = harness(builder.slow(Duration::from_secs(30)), "exec sleep 30");

        let begun = Instant::now();
        let driver = async {
            wait_for_builds(&builds, 1).await;
            shutdown.send(true).unwrap();
        };

        let (exit, ()) = tokio::join!(orchestrator.run(stream, shutdown_rx), driver);

        assert!(matches!(exit, Exit::Interrupted));
        assert!(begun.elapsed() < Duration::from_secs(5));
        assert!(started_pids(&output(&sink).await).is_empty());
    }

    #[tokio::test]
    async fn test_watcher_failure_stops_program() {
        let (builder, _builds) = FakeBuild::new(&[]);
        let Harness {
            mut orchestrator,
            sink,
            changes,
            stream,
            shutdown: _shutdown,
            shutdown_rx,
        } = harness(builder, "exec sleep 30");

        let driver = async {
            wait_for_starts(&sink, 1).await;
            changes.send(Err(WatcherError::Closed)).await.unwrap();
        };

        let (exit, ()) = tokio::join!(orchestrator.run(stream, shutdown_rx), driver);

        assert!(matches!(exit, Exit::WatcherFailed(WatcherError::Closed)));
        assert_eq!(exit.exit_code(), 1);
        let pids = started_pids(&output(&sink).await);
        assert!(!is_alive(pids[0]));
    }

    #[tokio::test]
    async fn test_program_that_fails_to_start_keeps_loop_alive() {
        let (builder, builds) = FakeBuild::new(&[]);
        let sink = OutputSink::buffer();
        let supervisor = Supervisor::new("/nonexistent/reforge-app", Vec::new(), sink.clone());
        let mut orchestrator = Orchestrator::new(builder, supervisor, sink);
        let (changes, rx) = mpsc::channel(1);
        let (shutdown, shutdown_rx) = watch::channel(false);

        let driver = async {
            wait_for_builds(&builds, 1).await;
            changes.send(Ok(ChangeSignal)).await.unwrap();
            wait_for_builds(&builds, 2).await;
            shutdown.send(true).unwrap();
        };

        let (exit, ()) = tokio::join!(orchestrator.run(ChangeStream::new(rx), shutdown_rx), driver);

        assert!(matches!(exit, Exit::Interrupted));
        assert_eq!(orchestrator.supervisor().state(), SupervisorState::Idle);
    }

    #[tokio::test]
    async fn test_unkillable_program_ends_loop_with_kill_failure() {
        let (builder, builds) = FakeBuild::new(&[]);
        let sink = OutputSink::buffer();
        let supervisor = Supervisor::with_terminator(
            "sh",
            vec!["-c".to_string(), "echo \"started $$\"; exec sleep 30".to_string()],
            sink.clone(),
            ReapsBehindTheHandle,
        )
        .with_grace(Duration::from_millis(100));
        let mut orchestrator = Orchestrator::new(builder, supervisor, sink.clone());
        let (_changes, rx) = mpsc::channel(1);
        let (shutdown, shutdown_rx) = watch::channel(false);

        let driver = async {
            wait_for_starts(&sink, 1).await;
            shutdown.send(true).unwrap();
        };

        let (exit, ()) = tokio::join!(orchestrator.run(ChangeStream::new(rx), shutdown_rx), driver);

        assert!(
            matches!(exit, Exit::KillFailed(SupervisorError::Kill { .. })),
            "{exit:?}"
        );
        assert_eq!(exit.exit_code(), 1);
        assert_eq!(builds.load(Ordering::SeqCst), 1);
        assert_eq!(orchestrator.supervisor().state(), SupervisorState::Idle);
        assert!(orchestrator.supervisor().pid().is_none());
    }

    /// Make a freshly written script executable and date it a minute back.
    fn script_app(path: &std::path::Path) -> std::time::SystemTime {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
        let past = std::time::SystemTime::now() - Duration::from_secs(60);
        filetime::set_file_mtime(path, filetime::FileTime::from_system_time(past)).unwrap();
        // A fork on another test thread may still hold the write handle (ETXTBSY).
        std::thread::sleep(Duration::from_millis(100));
        past
    }

    #[tokio::test]
    async fn test_exit_of_outdated_program_restarts_without_a_change() {
        let dir = tempfile::tempdir().unwrap();
        let app = dir.path().join("app");
        std::fs::write(&app, "#!/bin/sh\necho \"started $$\"\nsleep 0.3\nexit 3\n").unwrap();
        let past = script_app(&app);
        let (builder, builds) = FakeBuild::new(&[]);
        let sink = OutputSink::buffer();
        let supervisor = Supervisor::new(&app, Vec::new(), sink.clone());
        let mut orchestrator = Orchestrator::new(builder, supervisor, sink.clone());
        let (_changes, rx) = mpsc::channel(1);
        let (shutdown, shutdown_rx) = watch::channel(false);

        let driver = async {
            wait_for_starts(&sink, 1).await;
            let future = std::time::SystemTime::now() + Duration::from_secs(60);
            filetime::set_file_mtime(&app, filetime::FileTime::from_system_time(future)).unwrap();
            wait_for_starts(&sink, 2).await;
            filetime::set_file_mtime(&app, filetime::FileTime::from_system_time(past)).unwrap();
            shutdown.send(true).unwrap();
        };

        let (exit, ()) = tokio::join!(orchestrator.run(ChangeStream::new(rx), shutdown_rx), driver);

        assert!(matches!(exit, Exit::Interrupted));
        assert!(builds.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn test_exit_of_current_program_waits_for_a_change() {
        let dir = tempfile::tempdir().unwrap();
        let app = dir.path().join("app");
        std::fs::write(&app, "#!/bin/sh\necho \"started $$\"\nexit 3\n").unwrap();
        script_app(&app);
        let (builder, builds) = FakeBuild::new(&[]);
        let sink = OutputSink::buffer();
        let supervisor = Supervisor::new(&app, Vec::new(), sink.clone());
        let mut orchestrator = Orchestrator::new(builder, supervisor, sink.clone());
        let (_changes, rx) = mpsc::channel(1);
        let (shutdown, shutdown_rx) = watch::channel(false);

        let driver = async {
            wait_for_starts(&sink, 1).await;
            tokio::time::sleep(Duration::from_millis(300)).await;
            shutdown.send(true).unwrap();
        };

        let (exit, ()) = tokio::join!(orchestrator.run(ChangeStream::new(rx), shutdown_rx), driver);

        assert!(matches!(exit, Exit::Interrupted));
        assert_eq!(builds.load(Ordering::SeqCst), 1);
        assert_eq!(started_pids(&output(&sink).await).len(), 1);
    }
}
