//! Exit codes for the graceexec binary
//!
//! A child that exits on its own passes its code through. Everything the
//! supervisor itself decides maps to one of the constants below, following
//! the conventions of `timeout(1)` and the shell.

use std::io;
use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;

use graceexec_runner::{ContextError, ExecError};

/// Process exit code returned by the CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExitCode(i32);

impl ExitCode {
    /// The child exited successfully and nothing was escalated.
    pub const SUCCESS: ExitCode = ExitCode(0);

    /// Internal error - supervision itself failed
    pub const INTERNAL: ExitCode = ExitCode(1);

    /// The timeout fired or the grace period ran out.
    pub const TIMEOUT: ExitCode = ExitCode(124);

    /// Invalid configuration or the child could not be started.
    pub const CONFIG: ExitCode = ExitCode(125);

    /// The program exists but could not be executed.
    pub const NOT_EXECUTABLE: ExitCode = ExitCode(126);

    /// The program was not found.
    pub const NOT_FOUND: ExitCode = ExitCode(127);

    /// Stopped by Ctrl-C.
    pub const CANCELED: ExitCode = ExitCode(130);

    #[must_use]
    pub const fn as_i32(self) -> i32 {
        self.0
    }

    #[must_use]
    pub const fn from_i32(code: i32) -> Self {
        ExitCode(code)
    }

    /// The shell convention for a child that exited or was killed.
    #[must_use]
    pub fn from_status(status: ExitStatus) -> Self {
        match (status.code(), status.signal()) {
            (Some(code), _) => ExitCode(code),
            (None, Some(signo)) => ExitCode(128 + signo),
            (None, None) => Self::INTERNAL,
        }
    }

    /// Map the result of a supervised run.
    ///
    /// `ended_by` is why the context ended, if it did. A run that failed
    /// after the context ended reports the timeout or cancellation rather
    /// than whatever status the interrupted child left behind.
    #[must_use]
    pub fn from_run(result: &Result<ExitStatus, ExecError>, ended_by: Option<ContextError>) -> Self {
        let err = match result {
            Ok(status) => return Self::from_status(*status),
            Err(err) => err,
        };
        match ended_by {
            Some(ContextError::DeadlineExceeded) => return Self::TIMEOUT,
            Some(ContextError::Canceled) => return Self::CANCELED,
            None => {}
        }
        Self::from_error(err)
    }

    #[must_use]
    pub fn from_error(err: &ExecError) -> Self {
        match err {
            ExecError::Exit { status } => Self::from_status(*status),
            ExecError::GracePeriodExpired
            | ExecError::Context(ContextError::DeadlineExceeded) => Self::TIMEOUT,
            ExecError::Context(ContextError::Canceled) => Self::CANCELED,
            ExecError::Spawn { source, .. } => match source.kind() {
                io::ErrorKind::NotFound => Self::NOT_FOUND,
                io::ErrorKind::PermissionDenied => Self::NOT_EXECUTABLE,
                _ => Self::CONFIG,
            },
            ExecError::Pipe { .. } => Self::CONFIG,
            err if err.is_config_error() => Self::CONFIG,
            _ => Self::INTERNAL,
        }
    }
}

impl From<ExitCode> for i32 {
    fn from(code: ExitCode) -> Self {
        code.0
    }
}
