use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::Config;
use crate::duration::format_duration;

/// Where an effective configuration value came from.
///
/// Serializes to lowercase strings: `"cli"`, `"config"`, `"programmatic"`, `"default"`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ConfigSource {
    /// Value provided via CLI argument (highest precedence).
    Cli,
    /// Value loaded from a configuration file.
    Config,
    /// Value provided through [`ConfigBuilder`](super::ConfigBuilder).
    Programmatic,
    /// Built-in default value (lowest precedence).
    Default,
}

impl ConfigSource {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Cli => "cli",
            Self::Config => "config",
            Self::Programmatic => "programmatic",
            Self::Default => "default",
        }
    }
}

impl Config {
    fn source_of(&self, key: &str) -> String {
        self.source_attribution
            .get(key)
            .unwrap_or(&ConfigSource::Default)
            .as_str()
            .to_string()
    }

    /// Effective configuration as `key -> (value, source)`, sorted by key.
    #[must_use]
    pub fn effective_config(&self) -> BTreeMap<String, (String, String)> {
        let mut config = BTreeMap::new();
        let mut add = |key: &str, value: String| {
            config.insert(key.to_string(), (value, self.source_of(key)));
        };

        let signal = match self.interrupt_signal() {
            Ok(Some(signal)) => signal.to_string(),
            Ok(None) => "none".to_string(),
            Err(_) => self.supervisor.signal.clone().unwrap_or_default(),
        };
        add("signal", signal);

        let duration_or_none = |value: Option<std::time::Duration>| {
            value.map_or_else(|| "none".to_string(), format_duration)
        };
        if let Ok(grace) = self.grace_period() {
            add("grace_period", duration_or_none(grace));
        }
        if let Ok(timeout) = self.timeout() {
            add("timeout", duration_or_none(timeout));
        }

        add("capture", self.capture_enabled().to_string());
        add("stdout_cap_bytes", self.stdout_cap_bytes().to_string());
        add("stderr_cap_bytes", self.stderr_cap_bytes().to_string());
        add("verbose", self.verbose().to_string());
        add("log_json", self.json_logs().to_string());

        config
    }
}
