use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use super::{
    CaptureConfig, CliArgs, Config, ConfigSource, LoggingConfig, SupervisorConfig,
};
use crate::error::ConfigError;

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV_VAR: &str = "GRACEEXEC_CONFIG";

/// TOML configuration file structure
#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
struct TomlConfig {
    supervisor: Option<SupervisorConfig>,
    capture: Option<CaptureConfig>,
    logging: Option<LoggingConfig>,
}

/// Move `$from` into `$into` when set, recording `$source` under `$key`.
macro_rules! overlay {
    ($attribution:expr, $source:expr, $into:expr, $from:expr, $key:literal) => {
        if let Some(value) = $from {
            $into = Some(value);
            $attribution.insert($key.to_string(), $source);
        }
    };
}

impl Config {
    /// Discover and load configuration with precedence: CLI > file > defaults
    ///
    /// Without `--config`, the `GRACEEXEC_CONFIG` environment variable is
    /// consulted, then the current directory and its ancestors.
    pub fn discover(cli_args: &CliArgs) -> Result<Self> {
        let mut cli_args = cli_args.clone();
        if cli_args.config_path.is_none()
            && let Some(path) = std::env::var_os(CONFIG_ENV_VAR).filter(|p| !p.is_empty())
        {
            cli_args.config_path = Some(PathBuf::from(path));
        }
        let start_dir = std::env::current_dir().context("Failed to get current directory")?;
        Self::discover_from(&start_dir, &cli_args)
    }

    /// Discover and load configuration starting from a specific directory
    ///
    /// The path-driven variant used by tests to avoid process-global state.
    pub fn discover_from(start_dir: &Path, cli_args: &CliArgs) -> Result<Self> {
        let mut source_attribution = HashMap::new();
        let mut supervisor = SupervisorConfig::default();
        let mut capture = CaptureConfig::default();
        let mut logging = LoggingConfig::default();

        let config_path = match &cli_args.config_path {
            Some(explicit) => {
                if !explicit.exists() {
                    return Err(ConfigError::NotFound {
                        path: explicit.display().to_string(),
                    }
                    .into());
                }
                Some(explicit.clone())
            }
            None => Self::discover_config_file_from(start_dir),
        };

        if let Some(path) = &config_path {
            let file = Self::load_config_file(path)
                .with_context(|| format!("Failed to load config file: {}", path.display()))?;
            let source = ConfigSource::Config;

            if let Some(file_supervisor) = file.supervisor {
                overlay!(source_attribution, source, supervisor.signal, file_supervisor.signal, "signal");
                overlay!(source_attribution, source, supervisor.grace_period, file_supervisor.grace_period, "grace_period");
                overlay!(source_attribution, source, supervisor.timeout, file_supervisor.timeout, "timeout");
            }
            if let Some(file_capture) = file.capture {
                overlay!(source_attribution, source, capture.enabled, file_capture.enabled, "capture");
                overlay!(source_attribution, source, capture.stdout_cap_bytes, file_capture.stdout_cap_bytes, "stdout_cap_bytes");
                overlay!(source_attribution, source, capture.stderr_cap_bytes, file_capture.stderr_cap_bytes, "stderr_cap_bytes");
            }
            if let Some(file_logging) = file.logging {
                overlay!(source_attribution, source, logging.verbose, file_logging.verbose, "verbose");
                overlay!(source_attribution, source, logging.json, file_logging.json, "log_json");
            }
        }

        // Apply CLI overrides (highest priority)
        let cli = ConfigSource::Cli;
        overlay!(source_attribution, cli, supervisor.signal, cli_args.signal.clone(), "signal");
        overlay!(source_attribution, cli, supervisor.grace_period, cli_args.grace_period.clone(), "grace_period");
        overlay!(source_attribution, cli, supervisor.timeout, cli_args.timeout.clone(), "timeout");
        overlay!(source_attribution, cli, capture.enabled, cli_args.capture.then_some(true), "capture");
        overlay!(source_attribution, cli, capture.stdout_cap_bytes, cli_args.stdout_cap_bytes, "stdout_cap_bytes");
        overlay!(source_attribution, cli, capture.stderr_cap_bytes, cli_args.stderr_cap_bytes, "stderr_cap_bytes");
        overlay!(source_attribution, cli, logging.verbose, cli_args.verbose.then_some(true), "verbose");
        overlay!(source_attribution, cli, logging.json, cli_args.log_json.then_some(true), "log_json");

        let config = Self {
            supervisor,
            capture,
            logging,
            source_attribution,
        };
        config.validate()?;
        Ok(config)
    }

    /// Search upward from `start_dir` for `.graceexec/config.toml`, stopping
    /// at a repository root (.git, .hg, .svn) or the filesystem root.
    #[must_use]
    pub fn discover_config_file_from(start_dir: &Path) -> Option<PathBuf> {
        for dir in start_dir.ancestors() {
            let config_path = dir.join(".graceexec").join("config.toml");
            if config_path.is_file() {
                return Some(config_path);
            }
            if [".git", ".hg", ".svn"]
                .iter()
                .any(|marker| dir.join(marker).exists())
            {
                break;
            }
        }
        None
    }

    fn load_config_file(path: &Path) -> Result<TomlConfig> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        toml::from_str(&content)
            .map_err(|err| ConfigError::InvalidFile(err.to_string()).into())
    }
}
