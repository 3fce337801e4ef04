use crate::error::ConfigError;

use super::Config;

/// Smallest accepted capture cap.
const MIN_CAP_BYTES: usize = 1024;
const MAX_STDOUT_CAP_BYTES: usize = 100 * 1024 * 1024;
const MAX_STDERR_CAP_BYTES: usize = 10 * 1024 * 1024;

impl Config {
    /// Validate configuration values
    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        self.interrupt_signal()?;
        self.grace_period()?;

        if let Some(timeout) = self.timeout()?
            && timeout.is_zero()
        {
            return Err(ConfigError::invalid("timeout", "must be greater than 0"));
        }

        if let Some(cap) = self.capture.stdout_cap_bytes {
            check_cap("stdout_cap_bytes", cap, MAX_STDOUT_CAP_BYTES, "100MB")?;
        }
        if let Some(cap) = self.capture.stderr_cap_bytes {
            check_cap("stderr_cap_bytes", cap, MAX_STDERR_CAP_BYTES, "10MB")?;
        }

        Ok(())
    }
}

fn check_cap(key: &str, cap: usize, max: usize, max_label: &str) -> Result<(), ConfigError> {
    if cap < MIN_CAP_BYTES {
        return Err(ConfigError::invalid(
            key,
            format!("must be at least {MIN_CAP_BYTES} bytes"),
        ));
    }
    if cap > max {
        return Err(ConfigError::invalid(
            key,
            format!("exceeds maximum limit of {max_label}"),
        ));
    }
    Ok(())
}
