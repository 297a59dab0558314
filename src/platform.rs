//! Per-platform process termination.
//!
//! The supervisor only talks to [`Terminate`]; which implementation it gets
//! is decided at compile time through [`PlatformTerminator`].
use tokio::process::Command;

/// Soft and hard termination of a process (and its descendants where the
/// platform allows it). A process that is already gone counts as terminated.
pub trait Terminate: Send + Sync {
    /// Ask the process to exit; it may clean up first.
    fn soft_terminate(&self, pid: u32) -> std::io::Result<()>;

    /// Kill the process unconditionally.
    fn hard_terminate(&self, pid: u32) -> std::io::Result<()>;
}

#[cfg(unix)]
pub type PlatformTerminator = unix::ProcessGroupSignals;

#[cfg(windows)]
pub type PlatformTerminator = windows::TaskKill;

/// Put spawned children where the terminator can reach their descendants.
pub fn isolate(command: &mut Command) {
    #[cfg(unix)]
    {
        command.process_group(0); // New process group for clean kill
    }
    #[cfg(windows)]
    {
        const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;
        command.creation_flags(CREATE_NEW_PROCESS_GROUP);
    }
}

#[cfg(unix)]
pub mod unix {
    use super::Terminate;
    use nix::errno::Errno;
    use nix::sys::signal::{kill, killpg, Signal};
    use nix::unistd::Pid;

    /// Signals the whole process group led by the child: `SIGINT` to ask,
    /// `SIGKILL` to force.
    #[derive(Debug, Default, Clone, Copy)]
    pub struct ProcessGroupSignals;

    impl ProcessGroupSignals {
        fn signal(pid: u32, signal: Signal) -> std::io::Result<()> {
            let pgid = Pid::from_raw(pid as i32);
            match killpg(pgid, signal) {
                Ok(()) | Err(Errno::ESRCH) => Ok(()),
                Err(errno) => {
                    // Not a group leader (or the group is gone): signal the pid itself.
                    match kill(pgid, signal) {
                        Ok(()) | Err(Errno::ESRCH) => Ok(()),
                        Err(_) => Err(std::io::Error::from(errno)),
                    }
                }
            }
        }
    }

    impl Terminate for ProcessGroupSignals {
        fn soft_terminate(&self, pid: u32) -> std::io::Result<()> {
            Self::signal(pid, Signal::SIGINT)
        }

        fn hard_terminate(&self, pid: u32) -> std::io::Result<()> {
            Self::signal(pid, Signal::SIGKILL)
        }
    }

    /// Whether a process with this pid exists (zombies included).
    pub fn is_alive(pid: u32) -> bool {
        kill(Pid::from_raw(pid as i32), None).is_ok()
    }

    /// Kills and reaps the process itself on the first request, then
    /// refuses every request. The child handle is left pointing at a pid
    /// that no longer exists, so a direct kill through it fails as well.
    #[cfg(test)]
    #[derive(Debug, Default, Clone, Copy)]
    pub struct ReapsBehindTheHandle;

    #[cfg(test)]
    impl Terminate for ReapsBehindTheHandle {
        fn soft_terminate(&self, pid: u32) -> std::io::Result<()> {
            let pid = Pid::from_raw(pid as i32);
            if kill(pid, Signal::SIGKILL).is_ok() {
                let _ = nix::sys::wait::waitpid(pid, None);
            }
            Err(std::io::Error::from(std::io::ErrorKind::PermissionDenied))
        }

        fn hard_terminate(&self, _pid: u32) -> std::io::Result<()> {
            Err(std::io::Error::from(std::io::ErrorKind::PermissionDenied))
        }
    }
}

#[cfg(windows)]
pub mod windows {
    use super::Terminate;

    /// `taskkill /T /F`: Windows has no interrupt to send a background
    /// process, so soft and hard termination are the same forced tree kill.
    #[derive(Debug, Default, Clone, Copy)]
    pub struct TaskKill;

    impl TaskKill {
        fn kill_tree(pid: u32) -> std::io::Result<()> {
            let status = std::process::Command::new("taskkill")
                .args(["/T", "/F", "/PID", &pid.to_string()])
                .stdout(std::process::Stdio::null())
                .stderr(std::process::Stdio::null())
                .status()?;
            // 128: no such process.
            if status.success() || status.code() == Some(128) {
                Ok(())
            } else {
                Err(std::io::Error::other(format!(
                    "taskkill for pid {pid} exited with {status}"
                )))
            }
        }
    }

    impl Terminate for TaskKill {
        fn soft_terminate(&self, pid: u32) -> std::io::Result<()> {
            Self::kill_tree(pid)
        }

        fn hard_terminate(&self, pid: u32) -> std::io::Result<()> {
            Self::kill_tree(pid)
        }
    }
}
