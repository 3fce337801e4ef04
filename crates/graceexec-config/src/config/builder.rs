use std::collections::HashMap;
use std::time::Duration;

use graceexec_runner::Signal;

use super::{CaptureConfig, Config, ConfigSource, LoggingConfig, NO_SIGNAL, SupervisorConfig};
use crate::duration::format_duration;
use crate::error::ConfigError;

impl Config {
    /// Create a builder for programmatic configuration.
    ///
    /// Use this when embedding graceexec without config files or CLI flags.
    ///
    /// # Example
    ///
    /// ```rust
    /// use graceexec_config::Config;
    /// use std::time::Duration;
    ///
    /// let config = Config::builder()
    ///     .grace_period(Duration::from_secs(3))
    ///     .timeout(Duration::from_secs(60))
    ///     .build()
    ///     .expect("valid config");
    /// assert_eq!(config.grace_period().unwrap(), Some(Duration::from_secs(3)));
    /// ```
    #[must_use]
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::new()
    }
}

/// Builder for a [`Config`] that never touches the filesystem.
///
/// All values set via the builder are attributed to
/// [`ConfigSource::Programmatic`].
#[derive(Debug, Clone, Default)]
pub struct ConfigBuilder {
    signal: Option<String>,
    grace_period: Option<String>,
    timeout: Option<String>,
    capture: Option<bool>,
    stdout_cap_bytes: Option<usize>,
    stderr_cap_bytes: Option<usize>,
    verbose: Option<bool>,
    json_logs: Option<bool>,
}

impl ConfigBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn signal(mut self, signal: Signal) -> Self {
        self.signal = Some(signal.as_str().to_string());
        self
    }

    /// Never interrupt; cancellation goes straight to the forced kill.
    #[must_use]
    pub fn no_signal(mut self) -> Self {
        self.signal = Some(NO_SIGNAL.to_string());
        self
    }

    #[must_use]
    pub fn grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = Some(format_duration(grace_period));
        self
    }

    /// Wait indefinitely after the interrupt.
    #[must_use]
    pub fn no_grace_period(mut self) -> Self {
        self.grace_period = Some("none".to_string());
        self
    }

    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(format_duration(timeout));
        self
    }

    #[must_use]
    pub const fn capture(mut self, enabled: bool) -> Self {
        self.capture = Some(enabled);
        self
    }

    #[must_use]
    pub const fn stdout_cap_bytes(mut self, bytes: usize) -> Self {
        self.stdout_cap_bytes = Some(bytes);
        self
    }

    #[must_use]
    pub const fn stderr_cap_bytes(mut self, bytes: usize) -> Self {
        self.stderr_cap_bytes = Some(bytes);
        self
    }

    #[must_use]
    pub const fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = Some(verbose);
        self
    }

    #[must_use]
    pub const fn json_logs(mut self, json: bool) -> Self {
        self.json_logs = Some(json);
        self
    }

    /// Build and validate the configuration.
    pub fn build(self) -> Result<Config, ConfigError> {
        let mut source_attribution = HashMap::new();
        let mut attribute = |key: &str, set: bool| {
            if set {
                source_attribution.insert(key.to_string(), ConfigSource::Programmatic);
            }
        };
        attribute("signal", self.signal.is_some());
        attribute("grace_period", self.grace_period.is_some());
        attribute("timeout", self.timeout.is_some());
        attribute("capture", self.capture.is_some());
        attribute("stdout_cap_bytes", self.stdout_cap_bytes.is_some());
        attribute("stderr_cap_bytes", self.stderr_cap_bytes.is_some());
        attribute("verbose", self.verbose.is_some());
        attribute("log_json", self.json_logs.is_some());

        let config = Config {
            supervisor: SupervisorConfig {
                signal: self.signal,
                grace_period: self.grace_period,
                timeout: self.timeout,
            },
            capture: CaptureConfig {
                enabled: self.capture,
                stdout_cap_bytes: self.stdout_cap_bytes,
                stderr_cap_bytes: self.stderr_cap_bytes,
            },
            logging: LoggingConfig {
                verbose: self.verbose,
                json: self.json_logs,
            },
            source_attribution,
        };
        config.validate()?;
        Ok(config)
    }
}
