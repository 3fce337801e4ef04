use std::path::PathBuf;

/// Values supplied on the command line, all optional.
#[derive(Debug, Clone, Default)]
pub struct CliArgs {
    /// Explicit config file; disables discovery.
    pub config_path: Option<PathBuf>,
    pub signal: Option<String>,
    pub grace_period: Option<String>,
    pub timeout: Option<String>,
    pub capture: bool,
    pub stdout_cap_bytes: Option<usize>,
    pub stderr_cap_bytes: Option<usize>,
    pub verbose: bool,
    pub log_json: bool,
}
