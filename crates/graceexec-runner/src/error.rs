//! Error types for the runner crate

use std::io;
use std::process::ExitStatus;

use thiserror::Error;

use crate::context::ContextError;
use crate::signal::Signal;
use crate::types::StreamName;

/// Errors reported by [`Command`](crate::Command) and its supervisor.
#[derive(Error, Debug)]
pub enum ExecError {
    #[error("interrupt signal requires a cancellation context")]
    InterruptWithoutContext,

    #[error("signal {signal} is not supported by the active signal policy")]
    UnsupportedSignal { signal: Signal },

    #[error("process already started")]
    AlreadyStarted,

    #[error("{stream} already set")]
    StreamAlreadySet { stream: StreamName },

    #[error("{stream} pipe requested after process started")]
    PipeAfterStart { stream: StreamName },

    #[error("invalid {stream} configuration: {reason}")]
    InvalidStream { stream: StreamName, reason: String },

    #[error("no Tokio runtime available to supervise the process")]
    NoRuntime,

    #[error("process not started")]
    NotStarted,

    #[error("wait was already called")]
    AlreadyCollected,

    #[error("failed to create pipe: {source}")]
    Pipe {
        #[source]
        source: io::Error,
    },

    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to send {signal}: {source}")]
    Signal {
        signal: Signal,
        #[source]
        source: io::Error,
    },

    #[error("grace period expired before I/O completed")]
    GracePeriodExpired,

    #[error(transparent)]
    Context(#[from] ContextError),

    #[error("{status}")]
    Exit { status: ExitStatus },

    #[error("wait failed: {source}")]
    Wait {
        #[source]
        source: io::Error,
    },
}

impl ExecError {
    /// True for errors caused by how the command was configured rather than
    /// by anything the process did.
    #[must_use]
    pub const fn is_config_error(&self) -> bool {
        matches!(
            self,
            Self::InterruptWithoutContext
                | Self::UnsupportedSignal { .. }
                | Self::AlreadyStarted
                | Self::StreamAlreadySet { .. }
                | Self::PipeAfterStart { .. }
                | Self::InvalidStream { .. }
                | Self::NoRuntime
        )
    }

    /// The unsuccessful exit status carried by [`ExecError::Exit`].
    #[must_use]
    pub const fn exit_status(&self) -> Option<ExitStatus> {
        match self {
            Self::Exit { status } => Some(*status),
            _ => None,
        }
    }
}

/// Failure to deliver a signal through a [`ProcessHandle`](crate::ProcessHandle).
#[derive(Error, Debug)]
pub enum SignalError {
    /// The process was already reaped, or the kernel reports it gone.
    #[error("process already finished")]
    ProcessDone,

    #[error(transparent)]
    Os(#[from] io::Error),
}

impl SignalError {
    /// Whether the failure is the expected race with a process that just exited.
    #[must_use]
    pub fn is_benign(&self) -> bool {
        match self {
            Self::ProcessDone => true,
            Self::Os(err) => err.raw_os_error() == Some(libc::ESRCH),
        }
    }
}

/// Error from [`Command::combined_output`](crate::Command::combined_output),
/// carrying whatever the process wrote before failing.
#[derive(Error, Debug)]
#[error("{source}")]
pub struct OutputError {
    pub output: Vec<u8>,
    #[source]
    pub source: ExecError,
}
