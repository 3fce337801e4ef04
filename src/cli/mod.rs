//! Command-line interface for graceexec
//!
//! - `args`: clap argument definitions
//! - `run`: entry point, runtime setup and exit-code mapping

pub mod args;
mod run;

pub use args::Cli;
pub use run::run;
