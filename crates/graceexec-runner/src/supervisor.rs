//! The authoritative wait loop of a started command

use std::io;
use std::process::ExitStatus;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::ExecError;
use crate::escalator::{EscalationHandle, EscalationOutcome};
use crate::pipes::LocalPipes;
use crate::process::ProcessHandle;
use crate::result_cell::ResultCell;

/// The reconciled end state of a supervised process.
#[derive(Debug)]
pub(crate) struct Outcome {
    pub status: Option<ExitStatus>,
    pub error: Option<ExecError>,
}

/// Owns everything a started command needs to reach a single result.
#[derive(Debug)]
pub(crate) struct Supervisor {
    pub process: Arc<dyn ProcessHandle>,
    pub copiers: Vec<JoinHandle<()>>,
    pub escalation: Option<EscalationHandle>,
    pub pipes: LocalPipes,
    pub cell: Arc<ResultCell<Outcome>>,
}

impl Supervisor {
    /// Run the wait loop on the current runtime.
    ///
    /// A guard task publishes a wait error if the loop itself dies, so
    /// collectors never wait forever.
    pub(crate) fn spawn(self) {
        let cell = Arc::clone(&self.cell);
        let pid = self.process.id();
        let supervisor = tokio::spawn(self.run());
        tokio::spawn(async move {
            if let Err(err) = supervisor.await {
                warn!(pid, error = %err, "supervisor task ended without a result");
                let _ = cell.publish(Outcome {
                    status: None,
                    error: Some(ExecError::Wait {
                        source: io::Error::other(err.to_string()),
                    }),
                });
            }
        });
    }

    async fn run(self) {
        let pid = self.process.id();
        let waited = self.process.wait().await;
        match &waited {
            Ok(status) => debug!(pid, %status, "process exited"),
            Err(err) => {
                warn!(pid, error = %err, "waiting for process failed");
                // Without a reliable exit there is no EOF to wait for.
                let _ = self.process.kill();
                self.pipes.close_all();
            }
        }

        if let Some(escalation) = &self.escalation {
            escalation.exited.cancel();
        }

        for copier in self.copiers {
            if let Err(err) = copier.await {
                debug!(pid, error = %err, "copy task failed");
            }
        }

        let escalation = match self.escalation {
            Some(handle) => {
                handle.collecting.cancel();
                match handle.report.await {
                    Ok(outcome) => outcome,
                    Err(_) => {
                        if let Err(err) = handle.task.await {
                            warn!(pid, error = %err, "escalation task failed");
                        }
                        EscalationOutcome::default()
                    }
                }
            }
            None => EscalationOutcome::default(),
        };

        let outcome = resolve(waited, escalation);
        self.pipes.close_all();
        if self.cell.publish(outcome).is_err() {
            debug!(pid, "result already published");
        }
    }
}

/// Pick the single error a caller sees.
///
/// A failed wait or an unsuccessful exit status always wins. After that a
/// real signal delivery failure, then grace period expiry, then the reason
/// the interrupt was sent.
pub(crate) fn resolve(waited: io::Result<ExitStatus>, escalation: EscalationOutcome) -> Outcome {
    match waited {
        Err(source) => Outcome {
            status: None,
            error: Some(ExecError::Wait { source }),
        },
        Ok(status) if !status.success() => Outcome {
            status: Some(status),
            error: Some(ExecError::Exit { status }),
        },
        Ok(status) => {
            let error = escalation
                .signal_error
                .or_else(|| escalation.grace_expired.then_some(ExecError::GracePeriodExpired))
                .or_else(|| escalation.context_error.map(ExecError::Context));
            Outcome {
                status: Some(status),
                error,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{Context, ContextError};
    use crate::error::SignalError;
    use crate::escalator::Escalator;
    use crate::signal::Signal;
    use async_trait::async_trait;
    use std::io::Write;
    use std::os::unix::process::ExitStatusExt;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;
    use tokio::sync::{oneshot, watch};

    // ============================================================================
    // Fake process
    // ============================================================================

    #[derive(Debug, Clone, Copy)]
    enum OnInterrupt {
        /// Exit with this code when interrupted.
        Exit(i32),
        /// Accept the signal and keep running.
        Ignore,
        /// Fail delivery with this errno.
        Fail(i32),
    }

    #[derive(Debug)]
    struct FakeProcess {
        exit: watch::Sender<Option<ExitStatus>>,
        on_interrupt: OnInterrupt,
        signals: Mutex<Vec<Signal>>,
    }

    impl FakeProcess {
        fn new(on_interrupt: OnInterrupt) -> Arc<Self> {
            Arc::new(Self {
                exit: watch::Sender::new(None),
                on_interrupt,
                signals: Mutex::new(Vec::new()),
            })
        }

        fn finish(&self, status: ExitStatus) {
            self.exit.send_if_modified(|current| {
                if current.is_some() {
                    return false;
                }
                *current = Some(status);
                true
            });
        }

        fn signals(&self) -> Vec<Signal> {
            self.signals.lock().unwrap().clone()
        }
    }

    fn code(code: i32) -> ExitStatus {
        ExitStatus::from_raw(code << 8)
    }

    #[async_trait]
    impl ProcessHandle for FakeProcess {
        fn id(&self) -> u32 {
            4242
        }

        fn signal(&self, signal: Signal) -> Result<(), SignalError> {
            if self.exit.borrow().is_some() {
                return Err(SignalError::ProcessDone);
            }
            self.signals.lock().unwrap().push(signal);
            if signal == Signal::SIGKILL {
                self.finish(ExitStatus::from_raw(libc::SIGKILL));
                return Ok(());
            }
            match self.on_interrupt {
                OnInterrupt::Exit(c) => self.finish(code(c)),
                OnInterrupt::Ignore => {}
                OnInterrupt::Fail(errno) => {
                    return Err(SignalError::Os(io::Error::from_raw_os_error(errno)));
                }
            }
            Ok(())
        }

        async fn wait(&self) -> io::Result<ExitStatus> {
            let mut rx = self.exit.subscribe();
            let status = *rx
                .wait_for(Option::is_some)
                .await
                .map_err(io::Error::other)?;
            Ok(status.unwrap_or_else(|| code(0)))
        }
    }

    struct Setup {
        context: Option<Context>,
        interrupt: Option<Signal>,
        grace_period: Option<Duration>,
        copiers: Vec<JoinHandle<()>>,
        pipes: LocalPipes,
    }

    impl Default for Setup {
        fn default() -> Self {
            Self {
                context: None,
                interrupt: None,
                grace_period: None,
                copiers: Vec::new(),
                pipes: LocalPipes::from(Vec::new()),
            }
        }
    }

    fn supervise(process: &Arc<FakeProcess>, setup: Setup) -> Arc<ResultCell<Outcome>> {
        let process: Arc<dyn ProcessHandle> = Arc::clone(process) as Arc<dyn ProcessHandle>;
        let cell = Arc::new(ResultCell::new());
        let escalation = Escalator::is_armed(setup.interrupt, setup.grace_period).then(|| {
            Escalator {
                process: Arc::clone(&process),
                context: setup.context,
                interrupt: setup.interrupt,
                grace_period: setup.grace_period,
                pipes: setup.pipes.clone(),
            }
            .spawn()
        });
        Supervisor {
            process,
            copiers: setup.copiers,
            escalation,
            pipes: setup.pipes,
            cell: Arc::clone(&cell),
        }
        .spawn();
        cell
    }

    async fn collect(cell: &ResultCell<Outcome>) -> Outcome {
        tokio::time::timeout(Duration::from_secs(5), cell.collect())
            .await
            .expect("supervisor did not publish")
            .expect("result collected twice")
    }

    // ============================================================================
    // Precedence
    // ============================================================================

    #[tokio::test]
    async fn test_plain_success() {
        let process = FakeProcess::new(OnInterrupt::Ignore);
        let cell = supervise(&process, Setup::default());
        process.finish(code(0));

        let outcome = collect(&cell).await;
        assert!(outcome.error.is_none());
        assert_eq!(outcome.status.and_then(|s| s.code()), Some(0));
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_exit_error() {
        let process = FakeProcess::new(OnInterrupt::Ignore);
        let cell = supervise(&process, Setup::default());
        process.finish(code(2));

        let outcome = collect(&cell).await;
        let status = outcome.error.and_then(|e| e.exit_status());
        assert_eq!(status.and_then(|s| s.code()), Some(2));
    }

    #[tokio::test]
    async fn test_handled_interrupt_reports_context_error() {
        let process = FakeProcess::new(OnInterrupt::Exit(0));
        let context = Context::new();
        let cell = supervise(
            &process,
            Setup {
                context: Some(context.clone()),
                interrupt: Some(Signal::SIGINT),
                grace_period: Some(Duration::from_secs(5)),
                ..Setup::default()
            },
        );
        context.cancel();

        let outcome = collect(&cell).await;
        assert!(matches!(
            outcome.error,
            Some(ExecError::Context(ContextError::Canceled))
        ));
        assert_eq!(outcome.status.and_then(|s| s.code()), Some(0));
        assert_eq!(process.signals(), vec![Signal::SIGINT]);
    }

    #[tokio::test]
    async fn test_ignored_interrupt_is_killed_after_grace() {
        let process = FakeProcess::new(OnInterrupt::Ignore);
        let context = Context::new();
        let cell = supervise(
            &process,
            Setup {
                context: Some(context.clone()),
                interrupt: Some(Signal::SIGINT),
                grace_period: Some(Duration::from_millis(30)),
                ..Setup::default()
            },
        );
        context.cancel();

        let outcome = collect(&cell).await;
        let status = outcome.error.and_then(|e| e.exit_status());
        assert_eq!(status.and_then(|s| s.signal()), Some(libc::SIGKILL));
        assert_eq!(process.signals(), vec![Signal::SIGINT, Signal::SIGKILL]);
    }

    #[tokio::test]
    async fn test_exit_error_beats_signal_error() {
        let process = FakeProcess::new(OnInterrupt::Fail(libc::EPERM));
        let context = Context::new();
        let cell = supervise(
            &process,
            Setup {
                context: Some(context.clone()),
                interrupt: Some(Signal::SIGTERM),
                ..Setup::default()
            },
        );
        context.cancel();
        tokio::time::sleep(Duration::from_millis(20)).await;
        process.finish(code(1));

        let outcome = collect(&cell).await;
        assert!(matches!(outcome.error, Some(ExecError::Exit { .. })));
    }

    #[tokio::test]
    async fn test_signal_error_beats_context_error() {
        let process = FakeProcess::new(OnInterrupt::Fail(libc::EPERM));
        let context = Context::new();
        let cell = supervise(
            &process,
            Setup {
                context: Some(context.clone()),
                interrupt: Some(Signal::SIGTERM),
                ..Setup::default()
            },
        );
        context.cancel();
        tokio::time::sleep(Duration::from_millis(20)).await;
        process.finish(code(0));

        let outcome = collect(&cell).await;
        match outcome.error {
            Some(ExecError::Signal { signal, source }) => {
                assert_eq!(signal, Signal::SIGTERM);
                assert_eq!(source.raw_os_error(), Some(libc::EPERM));
            }
            other => panic!("expected signal error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_grace_expiry_after_exit_closes_stuck_pipes() {
        let process = FakeProcess::new(OnInterrupt::Ignore);
        let (mut reader, remote) = crate::pipes::output_pipe().unwrap();
        let pipes = LocalPipes::from(vec![reader.closer()]);
        let copier = tokio::spawn(async move {
            let mut sink = Vec::new();
            let _ = reader.read_to_end(&mut sink).await;
        });

        let cell = supervise(
            &process,
            Setup {
                grace_period: Some(Duration::from_millis(30)),
                copiers: vec![copier],
                pipes,
                ..Setup::default()
            },
        );
        process.finish(code(0));

        let outcome = collect(&cell).await;
        assert!(matches!(outcome.error, Some(ExecError::GracePeriodExpired)));
        // The remote end was never closed; only the force-close ended the copy.
        drop(remote);
    }

    #[tokio::test]
    async fn test_zero_grace_after_exit_waits_for_eof() {
        let process = FakeProcess::new(OnInterrupt::Ignore);
        let (mut reader, mut remote) = crate::pipes::output_pipe().unwrap();
        let pipes = LocalPipes::from(vec![reader.closer()]);
        let (tx, rx) = oneshot::channel();
        let copier = tokio::spawn(async move {
            let mut sink = Vec::new();
            let _ = reader.read_to_end(&mut sink).await;
            let _ = tx.send(sink);
        });

        let cell = supervise(
            &process,
            Setup {
                grace_period: Some(Duration::ZERO),
                copiers: vec![copier],
                pipes,
                ..Setup::default()
            },
        );
        process.finish(code(0));

        // Output still in flight after the exit must not be cut off.
        let writer = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            remote.write_all(&[7u8; 64 * 1024])
        });

        let outcome = collect(&cell).await;
        assert!(outcome.error.is_none(), "{:?}", outcome.error);
        writer.join().unwrap().unwrap();
        assert_eq!(rx.await.unwrap().len(), 64 * 1024);
    }

    #[tokio::test]
    async fn test_zero_grace_kills_immediately_on_cancel() {
        let process = FakeProcess::new(OnInterrupt::Ignore);
        let context = Context::new();
        let cell = supervise(
            &process,
            Setup {
                context: Some(context.clone()),
                interrupt: Some(Signal::SIGTERM),
                grace_period: Some(Duration::ZERO),
                ..Setup::default()
            },
        );
        context.cancel();

        let outcome = collect(&cell).await;
        let status = outcome.error.and_then(|e| e.exit_status());
        assert_eq!(status.and_then(|s| s.signal()), Some(libc::SIGKILL));
        assert_eq!(process.signals(), vec![Signal::SIGTERM, Signal::SIGKILL]);
    }

    #[tokio::test]
    async fn test_cancel_without_escalation_has_no_effect() {
        let process = FakeProcess::new(OnInterrupt::Ignore);
        let context = Context::new();
        let cell = supervise(
            &process,
            Setup {
                context: Some(context.clone()),
                ..Setup::default()
            },
        );
        context.cancel();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!cell.is_published());
        assert!(process.signals().is_empty());

        process.finish(code(0));
        assert!(collect(&cell).await.error.is_none());
    }

    #[tokio::test]
    async fn test_interrupt_after_exit_is_benign() {
        let process = FakeProcess::new(OnInterrupt::Ignore);
        process.finish(code(0));
        assert!(matches!(
            process.signal(Signal::SIGINT),
            Err(SignalError::ProcessDone)
        ));

        let context = Context::new();
        context.cancel();
        let cell = supervise(
            &process,
            Setup {
                context: Some(context),
                interrupt: Some(Signal::SIGINT),
                ..Setup::default()
            },
        );

        let outcome = collect(&cell).await;
        assert!(outcome.error.is_none());
    }

    #[test]
    fn test_resolve_grace_beats_context() {
        let outcome = resolve(
            Ok(code(0)),
            EscalationOutcome {
                signal_error: None,
                grace_expired: true,
                context_error: Some(ContextError::Canceled),
            },
        );
        assert!(matches!(outcome.error, Some(ExecError::GracePeriodExpired)));
    }

    #[test]
    fn test_resolve_wait_failure_wins() {
        let outcome = resolve(
            Err(io::Error::other("boom")),
            EscalationOutcome {
                signal_error: None,
                grace_expired: true,
                context_error: None,
            },
        );
        assert!(outcome.status.is_none());
        assert!(matches!(outcome.error, Some(ExecError::Wait { .. })));
    }
}
