//! graceexec: run a command with cancellation, a polite interrupt and a
//! bounded grace period
//!
//! The supervision engine lives in [`graceexec_runner`] and configuration in
//! [`graceexec_config`]; this crate is the command-line front end.

pub mod cli;
pub mod exit_codes;
pub mod logging;
pub mod report;

pub use exit_codes::ExitCode;
pub use graceexec_config::{CliArgs, Config};
pub use graceexec_runner::{Command, Context, ExecError};
