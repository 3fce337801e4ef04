use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::ConfigSource;

/// Interrupt used when none is configured.
pub const DEFAULT_SIGNAL: &str = "SIGTERM";

/// Grace period used when none is configured.
pub const DEFAULT_GRACE_PERIOD: &str = "10s";

/// Default tail kept of a captured stdout (2 MiB).
pub const DEFAULT_STDOUT_CAP_BYTES: usize = 2 * 1024 * 1024;

/// Default tail kept of a captured stderr (256 KiB).
pub const DEFAULT_STDERR_CAP_BYTES: usize = 256 * 1024;

/// Effective configuration with the source of every value.
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub supervisor: SupervisorConfig,
    pub capture: CaptureConfig,
    pub logging: LoggingConfig,
    pub source_attribution: HashMap<String, ConfigSource>,
}

/// `[supervisor]`: how the child is shut down.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct SupervisorConfig {
    /// Interrupt signal name or number; `"none"` disables it.
    pub signal: Option<String>,
    /// Time between interrupt and kill, e.g. `"5s"`; `"none"` never kills.
    pub grace_period: Option<String>,
    /// Overall limit after which the child is interrupted.
    pub timeout: Option<String>,
}

/// `[capture]`: bounded capture of the child's output.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct CaptureConfig {
    pub enabled: Option<bool>,
    pub stdout_cap_bytes: Option<usize>,
    pub stderr_cap_bytes: Option<usize>,
}

/// `[logging]`
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    pub verbose: Option<bool>,
    pub json: Option<bool>,
}
