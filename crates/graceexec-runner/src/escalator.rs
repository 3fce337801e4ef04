//! Two-phase shutdown: interrupt, then force-kill after a grace period

use std::future::pending;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::context::{Context, ContextError};
use crate::error::{ExecError, SignalError};
use crate::pipes::LocalPipes;
use crate::process::ProcessHandle;
use crate::signal::Signal;

/// What the escalation branch observed, handed to the supervisor once.
#[derive(Debug, Default)]
pub(crate) struct EscalationOutcome {
    /// A signal delivery failure that was not the benign exit race.
    pub signal_error: Option<ExecError>,
    /// The grace period ran out and the process was force-killed.
    pub grace_expired: bool,
    /// Why the interrupt was sent, recorded only when it was delivered.
    pub context_error: Option<ContextError>,
}

/// Tokens and report channel linking a running escalator to its supervisor.
#[derive(Debug)]
pub(crate) struct EscalationHandle {
    /// Fired by the supervisor once the process has exited.
    pub exited: CancellationToken,
    /// Fired by the supervisor once it is ready to collect the outcome.
    pub collecting: CancellationToken,
    pub report: oneshot::Receiver<EscalationOutcome>,
    /// Awaited only when the report never arrives, to surface a panic.
    pub task: JoinHandle<()>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Trigger {
    Canceled,
    Exited,
}

#[derive(Debug)]
pub(crate) struct Escalator {
    pub process: Arc<dyn ProcessHandle>,
    pub context: Option<Context>,
    pub interrupt: Option<Signal>,
    pub grace_period: Option<Duration>,
    pub pipes: LocalPipes,
}

impl Escalator {
    /// Escalation only runs when there is something to escalate with.
    pub(crate) const fn is_armed(interrupt: Option<Signal>, grace_period: Option<Duration>) -> bool {
        interrupt.is_some() || grace_period.is_some()
    }

    pub(crate) fn spawn(self) -> EscalationHandle {
        let exited = CancellationToken::new();
        let collecting = CancellationToken::new();
        let (tx, report) = oneshot::channel();

        let task = tokio::spawn({
            let exited = exited.clone();
            let collecting = collecting.clone();
            async move {
                let outcome = self.run(exited, collecting).await;
                // The supervisor only goes away if it was aborted.
                let _ = tx.send(outcome);
            }
        });

        EscalationHandle {
            exited,
            collecting,
            report,
            task,
        }
    }

    async fn run(
        self,
        exited: CancellationToken,
        collecting: CancellationToken,
    ) -> EscalationOutcome {
        let mut outcome = EscalationOutcome::default();
        let grace_armed = self.grace_period.is_some();

        let trigger = tokio::select! {
            biased;
            () = collecting.cancelled() => return outcome,
            () = context_done(self.context.as_ref()) => Trigger::Canceled,
            () = exited_if(&exited, grace_armed) => Trigger::Exited,
        };

        if let (Trigger::Canceled, Some(signal)) = (trigger, self.interrupt) {
            self.interrupt(signal, &mut outcome);
        }

        let Some(grace) = self.grace_period else {
            return outcome;
        };

        // A zero grace after a natural exit waits for EOF instead of racing it.
        if trigger == Trigger::Exited && grace.is_zero() {
            collecting.cancelled().await;
            return outcome;
        }

        tokio::select! {
            biased;
            () = collecting.cancelled() => return outcome,
            () = tokio::time::sleep(grace) => {}
        }

        outcome.grace_expired = true;
        let pid = self.process.id();
        if let Err(err) = self.process.kill() {
            debug!(pid, error = %err, "kill after grace period failed");
        }
        self.pipes.close_all();
        warn!(
            pid,
            grace_ms = u64::try_from(grace.as_millis()).unwrap_or(u64::MAX),
            "grace period expired; process killed and pipes closed"
        );
        outcome
    }

    fn interrupt(&self, signal: Signal, outcome: &mut EscalationOutcome) {
        let pid = self.process.id();
        match self.process.signal(signal) {
            Ok(()) => {
                debug!(pid, %signal, "interrupt delivered");
                outcome.context_error = self.context.as_ref().and_then(Context::err);
            }
            Err(err) if err.is_benign() => {
                debug!(pid, %signal, "process exited before interrupt");
            }
            Err(SignalError::Os(source)) => {
                warn!(pid, %signal, error = %source, "failed to deliver interrupt");
                outcome.signal_error = Some(ExecError::Signal { signal, source });
            }
            Err(SignalError::ProcessDone) => {}
        }
    }
}

async fn context_done(context: Option<&Context>) {
    match context {
        Some(context) => context.done().await,
        None => pending().await,
    }
}

async fn exited_if(exited: &CancellationToken, armed: bool) {
    if armed {
        exited.cancelled().await;
    } else {
        pending::<()>().await;
    }
}
