//! JSON run report written by `--report`

use std::os::unix::process::ExitStatusExt;
use std::path::Path;
use std::process::ExitStatus;
use std::time::Duration;

use anyhow::{Context, Result};
use graceexec_runner::{ContextError, ExecError, RingBuffer};
use serde::Serialize;

/// How a supervised run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Success,
    Failed,
    Canceled,
    DeadlineExceeded,
    GracePeriodExpired,
    SpawnFailed,
    Error,
}

impl RunOutcome {
    #[must_use]
    pub fn classify(result: &Result<ExitStatus, ExecError>, ended_by: Option<ContextError>) -> Self {
        let err = match result {
            Ok(_) => return Self::Success,
            Err(err) => err,
        };
        match (err, ended_by) {
            (ExecError::GracePeriodExpired, _) => Self::GracePeriodExpired,
            (ExecError::Spawn { .. } | ExecError::Pipe { .. }, _) => Self::SpawnFailed,
            (_, Some(ContextError::DeadlineExceeded)) => Self::DeadlineExceeded,
            (_, Some(ContextError::Canceled)) => Self::Canceled,
            (ExecError::Context(ContextError::DeadlineExceeded), None) => Self::DeadlineExceeded,
            (ExecError::Context(ContextError::Canceled), None) => Self::Canceled,
            (ExecError::Exit { .. }, None) => Self::Failed,
            _ => Self::Error,
        }
    }
}

/// Tail of one captured stream.
#[derive(Debug, Clone, Serialize)]
pub struct CapturedStream {
    /// Last bytes written, lossily decoded as UTF-8.
    pub tail: String,
    pub total_bytes: u64,
    pub truncated: bool,
}

impl From<&RingBuffer> for CapturedStream {
    fn from(buffer: &RingBuffer) -> Self {
        Self {
            tail: String::from_utf8_lossy(&buffer.contents()).into_owned(),
            total_bytes: buffer.total_bytes_written(),
            truncated: buffer.was_truncated(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub program: String,
    pub args: Vec<String>,
    pub pid: Option<u32>,
    pub outcome: RunOutcome,
    /// The child's own exit code, when it exited normally.
    pub exit_code: Option<i32>,
    /// The signal that terminated the child.
    pub signal: Option<i32>,
    pub error: Option<String>,
    /// What graceexec itself exits with.
    pub graceexec_exit_code: i32,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stdout: Option<CapturedStream>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stderr: Option<CapturedStream>,
}

impl RunReport {
    /// Fill in the status fields from the process state left by `wait`.
    pub fn set_status(&mut self, status: Option<ExitStatus>) {
        self.exit_code = status.and_then(|s| s.code());
        self.signal = status.and_then(|s| s.signal());
    }

    pub fn set_duration(&mut self, duration: Duration) {
        self.duration_ms = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
    }

    /// Write the report as pretty JSON.
    pub fn write_to(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self).context("Failed to serialize run report")?;
        std::fs::write(path, json + "\n")
            .with_context(|| format!("Failed to write run report to {}", path.display()))
    }
}
