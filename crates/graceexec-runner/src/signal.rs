//! Signal values and the policy deciding which of them a command may use
//!
//! Signals are plain [`nix`] values. Which ones are acceptable as an interrupt
//! is decided by a [`SignalPolicy`] resolved when the command starts, so a
//! restricted environment can be modelled without touching the supervisor.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::error::ExecError;

pub use nix::sys::signal::Signal;

/// Decides which signals may be configured as an interrupt.
pub trait SignalPolicy: Send + Sync + fmt::Debug {
    /// Whether `signal` can be delivered as an interrupt.
    fn supports_signal(&self, signal: Signal) -> bool;

    /// The error reported when `signal` is rejected at start.
    fn describe_unsupported(&self, signal: Signal) -> ExecError {
        ExecError::UnsupportedSignal { signal }
    }

    /// The signal used to ask a process to quit and dump state, if any.
    fn quit_signal(&self) -> Option<Signal>;
}

/// Full Unix signal semantics.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnixPolicy;

impl SignalPolicy for UnixPolicy {
    fn supports_signal(&self, _signal: Signal) -> bool {
        true
    }

    fn quit_signal(&self) -> Option<Signal> {
        Some(Signal::SIGQUIT)
    }
}

/// A policy that only permits force-kill, for hosts where polite signals
/// cannot be delivered.
#[derive(Debug, Default, Clone, Copy)]
pub struct KillOnlyPolicy;

impl SignalPolicy for KillOnlyPolicy {
    fn supports_signal(&self, signal: Signal) -> bool {
        signal == Signal::SIGKILL
    }

    fn quit_signal(&self) -> Option<Signal> {
        None
    }
}

/// The policy used when a command does not set one.
#[must_use]
pub fn platform_policy() -> Arc<dyn SignalPolicy> {
    Arc::new(UnixPolicy)
}

/// Parse a signal given as `SIGTERM`, `term` or a number such as `15`.
#[must_use]
pub fn parse_signal(value: &str) -> Option<Signal> {
    let value = value.trim();
    if let Ok(number) = value.parse::<i32>() {
        return Signal::try_from(number).ok();
    }

    let upper = value.to_ascii_uppercase();
    if upper.starts_with("SIG") {
        Signal::from_str(&upper).ok()
    } else {
        Signal::from_str(&format!("SIG{upper}")).ok()
    }
}
