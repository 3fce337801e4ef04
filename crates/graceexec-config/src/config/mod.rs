//! Configuration management for graceexec
//!
//! Precedence: CLI > file > defaults. Every effective value remembers where
//! it came from so `--verbose` runs can explain themselves.

mod builder;
mod cli_args;
mod discovery;
mod model;
mod sources;
mod validation;

use std::time::Duration;

use graceexec_runner::{Signal, parse_signal};

pub use builder::ConfigBuilder;
pub use cli_args::CliArgs;
pub use model::*;
pub use sources::ConfigSource;

use crate::duration::parse_duration;
use crate::error::ConfigError;

/// Signal name that disables the interrupt.
pub const NO_SIGNAL: &str = "none";

impl Config {
    /// The interrupt sent on cancellation, or `None` when disabled.
    pub fn interrupt_signal(&self) -> Result<Option<Signal>, ConfigError> {
        let name = self.supervisor.signal.as_deref().unwrap_or(DEFAULT_SIGNAL);
        if name.eq_ignore_ascii_case(NO_SIGNAL) {
            return Ok(None);
        }
        parse_signal(name)
            .map(Some)
            .ok_or_else(|| ConfigError::invalid("signal", format!("unknown signal '{name}'")))
    }

    /// Time between the interrupt and the forced kill, or `None` to never kill.
    pub fn grace_period(&self) -> Result<Option<Duration>, ConfigError> {
        let value = self
            .supervisor
            .grace_period
            .as_deref()
            .unwrap_or(DEFAULT_GRACE_PERIOD);
        optional_duration("grace_period", value)
    }

    /// Overall time limit for the child, if any.
    pub fn timeout(&self) -> Result<Option<Duration>, ConfigError> {
        match self.supervisor.timeout.as_deref() {
            Some(value) => optional_duration("timeout", value),
            None => Ok(None),
        }
    }

    #[must_use]
    pub fn capture_enabled(&self) -> bool {
        self.capture.enabled.unwrap_or(false)
    }

    #[must_use]
    pub fn stdout_cap_bytes(&self) -> usize {
        self.capture
            .stdout_cap_bytes
            .unwrap_or(DEFAULT_STDOUT_CAP_BYTES)
    }

    #[must_use]
    pub fn stderr_cap_bytes(&self) -> usize {
        self.capture
            .stderr_cap_bytes
            .unwrap_or(DEFAULT_STDERR_CAP_BYTES)
    }

    #[must_use]
    pub fn verbose(&self) -> bool {
        self.logging.verbose.unwrap_or(false)
    }

    #[must_use]
    pub fn json_logs(&self) -> bool {
        self.logging.json.unwrap_or(false)
    }
}

fn optional_duration(key: &str, value: &str) -> Result<Option<Duration>, ConfigError> {
    if value.eq_ignore_ascii_case("none") {
        return Ok(None);
    }
    parse_duration(value)
        .map(Some)
        .map_err(|err| ConfigError::invalid(key, err.to_string()))
}
