//! OS process handles

use std::fmt;
use std::io;
use std::process::{Child, ExitStatus};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use nix::errno::Errno;
use nix::unistd::Pid;

use crate::error::SignalError;
use crate::signal::Signal;

// ============================================================================
// ProcessHandle Trait
// ============================================================================

/// A running process as seen by the supervisor.
///
/// Implementations must never deliver a signal to a process that has
/// already been reaped: once [`ProcessHandle::wait`] has returned, `signal`
/// reports [`SignalError::ProcessDone`].
#[async_trait]
pub trait ProcessHandle: Send + Sync + fmt::Debug {
    /// The OS process id.
    fn id(&self) -> u32;

    /// Deliver `signal` to the process.
    fn signal(&self, signal: Signal) -> Result<(), SignalError>;

    /// Force-kill the process.
    fn kill(&self) -> Result<(), SignalError> {
        self.signal(Signal::SIGKILL)
    }

    /// Wait for the process to exit and reap it.
    async fn wait(&self) -> io::Result<ExitStatus>;
}

// ============================================================================
// OsProcess
// ============================================================================

#[derive(Debug)]
struct ChildState {
    child: Child,
    status: Option<ExitStatus>,
}

/// [`ProcessHandle`] for a child spawned with [`std::process::Command`].
///
/// Waiting happens in two steps. A blocking task waits with `WNOWAIT` until
/// the child is waitable, leaving it unreaped. The reap then happens under
/// the same lock that guards signal delivery, so a signal is either sent to
/// the live (or zombie) child or refused, never sent to a recycled pid.
#[derive(Debug)]
pub struct OsProcess {
    pid: u32,
    state: Mutex<ChildState>,
}

impl OsProcess {
    #[must_use]
    pub fn new(child: Child) -> Self {
        Self {
            pid: child.id(),
            state: Mutex::new(ChildState {
                child,
                status: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ChildState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[allow(clippy::cast_possible_wrap)]
    fn nix_pid(&self) -> Pid {
        Pid::from_raw(self.pid as libc::pid_t)
    }
}

#[async_trait]
impl ProcessHandle for OsProcess {
    fn id(&self) -> u32 {
        self.pid
    }

    fn signal(&self, signal: Signal) -> Result<(), SignalError> {
        let state = self.lock();
        if state.status.is_some() {
            return Err(SignalError::ProcessDone);
        }
        match nix::sys::signal::kill(self.nix_pid(), signal) {
            Ok(()) => Ok(()),
            Err(Errno::ESRCH) => Err(SignalError::ProcessDone),
            Err(errno) => Err(SignalError::Os(io::Error::from(errno))),
        }
    }

    async fn wait(&self) -> io::Result<ExitStatus> {
        let reaped = self.lock().status;
        if let Some(status) = reaped {
            return Ok(status);
        }

        let pid = self.pid;
        tokio::task::spawn_blocking(move || block_until_waitable(pid))
            .await
            .map_err(io::Error::other)??;

        let mut state = self.lock();
        if let Some(status) = state.status {
            return Ok(status);
        }
        let status = state.child.wait()?;
        state.status = Some(status);
        Ok(status)
    }
}

/// Block until `pid` has exited without reaping it.
fn block_until_waitable(pid: u32) -> io::Result<()> {
    loop {
        // SAFETY: siginfo_t is plain old data; all-zero is a valid value.
        let mut info: libc::siginfo_t = unsafe { std::mem::zeroed() };
        // SAFETY: `info` is a valid, exclusively borrowed siginfo_t for the
        // duration of the call.
        let rc = unsafe {
            libc::waitid(
                libc::P_PID,
                libc::id_t::from(pid),
                &mut info,
                libc::WEXITED | libc::WNOWAIT,
            )
        };
        if rc == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::process::ExitStatusExt;
    use std::process::{Command, Stdio};

    fn spawn_sh(script: &str) -> OsProcess {
        let child = Command::new("sh")
            .arg("-c")
            .arg(script)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .unwrap();
        OsProcess::new(child)
    }

    #[tokio::test]
    async fn test_wait_reports_exit_code() {
        let process = spawn_sh("exit 3");
        let status = process.wait().await.unwrap();
        assert_eq!(status.code(), Some(3));

        // A second wait returns the recorded status.
        assert_eq!(process.wait().await.unwrap().code(), Some(3));
    }

    #[tokio::test]
    async fn test_signal_after_reap_is_process_done() {
        let process = spawn_sh("exit 0");
        process.wait().await.unwrap();
        assert!(matches!(
            process.signal(Signal::SIGTERM),
            Err(SignalError::ProcessDone)
        ));
    }

    #[tokio::test]
    async fn test_kill_terminates() {
        let process = spawn_sh("sleep 30");
        process.kill().unwrap();
        let status = process.wait().await.unwrap();
        assert_eq!(status.signal(), Some(libc::SIGKILL));
    }
}
