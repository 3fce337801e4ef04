//! CLI argument definitions

use std::ffi::OsString;
use std::path::PathBuf;

use clap::Parser;
use graceexec_config::CliArgs;
use graceexec_config::config::NO_SIGNAL;

/// graceexec - run a command with a polite interrupt and a bounded grace period
#[derive(Parser, Debug)]
#[command(name = "graceexec")]
#[command(about = "Run a command with cancellation, a polite interrupt and a bounded grace period")]
#[command(long_about = r#"
graceexec runs PROGRAM as a child process. When the timeout fires or Ctrl-C is
pressed the child receives the interrupt signal. If the child, or a descendant
still holding its output, is not finished when the grace period runs out, it is
killed and its pipes are closed.

EXAMPLES:
  # Give a build two minutes, then SIGTERM, then SIGKILL five seconds later
  graceexec --timeout 2m --grace 5s -- make all

  # Interrupt with SIGINT and keep the last 64 KiB of output in a report
  graceexec --signal INT --capture --stdout-cap-bytes 65536 --report run.json -- ./server

CONFIGURATION:
  Precedence: CLI flags > config file > defaults
  The config file is found by searching upward from CWD for .graceexec/config.toml,
  or given with --config or GRACEEXEC_CONFIG.

EXIT STATUS:
  The child's exit code, 128+N when it was killed by signal N, 124 on timeout
  or grace expiry, 125 on configuration or spawn failure, 126 when PROGRAM is
  not executable, 127 when it is not found, 130 after Ctrl-C.
"#)]
#[command(version)]
pub struct Cli {
    /// Path to configuration file (overrides discovery)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Interrupt signal, e.g. SIGTERM, TERM or 15
    #[arg(long, value_name = "SIG")]
    pub signal: Option<String>,

    /// Send no interrupt; go straight to the kill after the grace period
    #[arg(long, conflicts_with = "signal")]
    pub no_signal: bool,

    /// Grace period between interrupt and kill, e.g. 500ms, 10s, or "none"
    #[arg(long, value_name = "DUR")]
    pub grace: Option<String>,

    /// Interrupt the child after this long, e.g. 30s or 2m
    #[arg(long, value_name = "DUR")]
    pub timeout: Option<String>,

    /// Working directory for the child
    #[arg(long, value_name = "DIR")]
    pub cwd: Option<PathBuf>,

    /// Extra environment variable for the child (repeatable)
    #[arg(long = "env", value_name = "KEY=VALUE", value_parser = parse_env_pair)]
    pub env: Vec<(String, String)>,

    /// Capture a bounded tail of stdout/stderr and replay it after the run
    #[arg(long)]
    pub capture: bool,

    /// Bytes of stdout kept when capturing
    #[arg(long, value_name = "BYTES")]
    pub stdout_cap_bytes: Option<usize>,

    /// Bytes of stderr kept when capturing
    #[arg(long, value_name = "BYTES")]
    pub stderr_cap_bytes: Option<usize>,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long)]
    pub log_json: bool,

    /// Write a JSON run report to PATH
    #[arg(long, value_name = "PATH")]
    pub report: Option<PathBuf>,

    /// Program to run, followed by its arguments
    #[arg(
        required = true,
        trailing_var_arg = true,
        allow_hyphen_values = true,
        value_name = "PROGRAM"
    )]
    pub command: Vec<OsString>,
}

impl Cli {
    /// The subset of flags that feeds configuration discovery.
    #[must_use]
    pub fn to_cli_args(&self) -> CliArgs {
        CliArgs {
            config_path: self.config.clone(),
            signal: if self.no_signal {
                Some(NO_SIGNAL.to_string())
            } else {
                self.signal.clone()
            },
            grace_period: self.grace.clone(),
            timeout: self.timeout.clone(),
            capture: self.capture,
            stdout_cap_bytes: self.stdout_cap_bytes,
            stderr_cap_bytes: self.stderr_cap_bytes,
            verbose: self.verbose,
            log_json: self.log_json,
        }
    }
}

fn parse_env_pair(value: &str) -> Result<(String, String), String> {
    match value.split_once('=') {
        Some((key, _)) if key.is_empty() => Err(format!("empty variable name in '{value}'")),
        Some((key, val)) => Ok((key.to_string(), val.to_string())),
        None => Err(format!("expected KEY=VALUE, got '{value}'")),
    }
}
