//! Configuration for graceexec
//!
//! Hierarchical configuration with discovery and precedence CLI > file >
//! defaults. The TOML file has `[supervisor]`, `[capture]` and `[logging]`
//! sections and is found by searching upward for `.graceexec/config.toml`.

pub mod config;
pub mod duration;
pub mod error;

pub use config::{
    CaptureConfig, CliArgs, Config, ConfigBuilder, ConfigSource, LoggingConfig, SupervisorConfig,
};
pub use duration::{format_duration, parse_duration};
pub use error::ConfigError;
