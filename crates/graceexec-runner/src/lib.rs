//! Process supervision with managed pipes and two-phase shutdown
//!
//! A [`Command`] launches a program, routes any async stdin/stdout/stderr
//! streams through OS pipes serviced by background tasks, and settles on a
//! single result once the process and all of its I/O are done.
//!
//! Shutdown is driven by a [`Context`]. When the context ends the process gets
//! its interrupt signal. If it (or a descendant still holding its pipes) has
//! not finished when the grace period runs out, it is killed and the pipes
//! are closed so nothing blocks forever.
//!
//! Unix only.

#[cfg(not(unix))]
compile_error!("graceexec-runner supports Unix platforms only");

pub mod capture;
pub mod command;
pub mod context;
pub mod error;
mod escalator;
pub mod pipes;
pub mod process;
pub mod result_cell;
pub mod ring_buffer;
pub mod signal;
pub mod stdio;
mod supervisor;
pub mod types;

pub use capture::{SharedBuffer, SharedRingBuffer};
pub use command::Command;
pub use context::{Context, ContextError};
pub use error::{ExecError, OutputError, SignalError};
pub use pipes::{PipeReader, PipeWriter};
pub use process::{OsProcess, ProcessHandle};
pub use ring_buffer::RingBuffer;
pub use signal::{KillOnlyPolicy, Signal, SignalPolicy, UnixPolicy, parse_signal};
pub use stdio::{Input, Output};
pub use types::StreamName;
