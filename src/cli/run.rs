//! CLI entry point
//!
//! `run()` parses arguments, discovers configuration, builds the Tokio
//! runtime and supervises the child. It prints every error itself and only
//! hands an `ExitCode` back to `main`.

use std::io::Write;
use std::process::ExitStatus;
use std::time::Duration;

use clap::Parser;
use graceexec_config::Config;
use graceexec_runner::{
    Command, Context, ContextError, ExecError, Input, Output, RingBuffer, SharedRingBuffer,
};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::args::Cli;
use crate::exit_codes::ExitCode;
use crate::logging;
use crate::report::{CapturedStream, RunOutcome, RunReport};

/// Main CLI execution function.
///
/// Returns `Err(ExitCode)` for anything other than a clean, successful run.
pub fn run() -> Result<(), ExitCode> {
    let cli = Cli::parse();

    let config = match Config::discover(&cli.to_cli_args()) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("graceexec: {err:#}");
            return Err(ExitCode::CONFIG);
        }
    };

    if let Err(err) = logging::init_tracing(config.verbose(), config.json_logs()) {
        eprintln!("graceexec: failed to initialize logging: {err}");
    }
    for (key, (value, source)) in config.effective_config() {
        debug!(key = %key, value = %value, source = %source, "effective config");
    }

    let plan = match Plan::from_config(&config) {
        Ok(plan) => plan,
        Err(err) => {
            eprintln!("graceexec: {err}");
            return Err(ExitCode::CONFIG);
        }
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("graceexec: failed to start async runtime: {err}");
            return Err(ExitCode::INTERNAL);
        }
    };

    let code = runtime.block_on(supervise(&cli, &plan));
    // Copy tasks have finished by now; leftover blocking reads must not hold
    // up exit.
    runtime.shutdown_timeout(Duration::from_millis(100));

    if code == ExitCode::SUCCESS {
        Ok(())
    } else {
        Err(code)
    }
}

/// Resolved supervision settings.
#[derive(Debug, Clone)]
struct Plan {
    interrupt: Option<graceexec_runner::Signal>,
    grace_period: Option<Duration>,
    timeout: Option<Duration>,
    capture: Option<(usize, usize)>,
}

impl Plan {
    fn from_config(config: &Config) -> Result<Self, graceexec_config::ConfigError> {
        Ok(Self {
            interrupt: config.interrupt_signal()?,
            grace_period: config.grace_period()?,
            timeout: config.timeout()?,
            capture: config
                .capture_enabled()
                .then(|| (config.stdout_cap_bytes(), config.stderr_cap_bytes())),
        })
    }
}

async fn supervise(cli: &Cli, plan: &Plan) -> ExitCode {
    let context = match plan.timeout {
        Some(timeout) => Context::with_timeout(timeout),
        None => Context::new(),
    };
    let Some((program, args)) = cli.command.split_first() else {
        eprintln!("graceexec: no program given");
        return ExitCode::CONFIG;
    };

    let mut command = Command::with_context(context.clone(), program)
        .args(args)
        .envs(cli.env.iter().cloned())
        .stdin(Input::Inherit);
    command = match plan.interrupt {
        Some(signal) => command.interrupt(signal),
        None => command.no_interrupt(),
    };
    if let Some(grace_period) = plan.grace_period {
        command = command.grace_period(grace_period);
    }
    if let Some(dir) = &cli.cwd {
        command = command.current_dir(dir);
    }

    let captured = plan.capture.map(|(stdout_cap, stderr_cap)| {
        (
            SharedRingBuffer::new(stdout_cap),
            SharedRingBuffer::new(stderr_cap),
        )
    });
    command = match &captured {
        Some((stdout, stderr)) => command
            .stdout(Output::writer(stdout.clone()))
            .stderr(Output::writer(stderr.clone())),
        None => command.stdout(Output::Inherit).stderr(Output::Inherit),
    };

    let mut report = RunReport {
        program: command.program().display().to_string(),
        args: args.iter().map(|a| a.to_string_lossy().into_owned()).collect(),
        pid: None,
        outcome: RunOutcome::Error,
        exit_code: None,
        signal: None,
        error: None,
        graceexec_exit_code: 0,
        duration_ms: 0,
        stdout: None,
        stderr: None,
    };

    let started_at = Instant::now();
    let interrupt_watch = tokio::spawn(cancel_on_ctrl_c(context.clone()));

    let result = match command.start() {
        Ok(()) => {
            report.pid = command.id();
            command.wait().await
        }
        Err(err) => Err(err),
    };
    interrupt_watch.abort();
    let ended_by = context.err();

    let code = ExitCode::from_run(&result, ended_by);
    report.outcome = RunOutcome::classify(&result, ended_by);
    report.set_status(command.process_state());
    report.set_duration(started_at.elapsed());
    report.graceexec_exit_code = code.as_i32();
    log_result(&result, ended_by, code);
    if let Err(err) = &result
        && err.exit_status().is_none()
    {
        eprintln!("graceexec: {err}");
    }
    report.error = result.as_ref().err().map(ToString::to_string);

    if let Some((stdout, stderr)) = &captured {
        let (stdout, stderr) = (stdout.snapshot(), stderr.snapshot());
        replay("stdout", &stdout, &mut std::io::stdout().lock());
        replay("stderr", &stderr, &mut std::io::stderr().lock());
        report.stdout = Some(CapturedStream::from(&stdout));
        report.stderr = Some(CapturedStream::from(&stderr));
    }

    if let Some(path) = &cli.report
        && let Err(err) = report.write_to(path)
    {
        eprintln!("graceexec: {err:#}");
        if code == ExitCode::SUCCESS {
            return ExitCode::INTERNAL;
        }
    }
    code
}

async fn cancel_on_ctrl_c(context: Context) {
    tokio::select! {
        signal = tokio::signal::ctrl_c() => match signal {
            Ok(()) => {
                info!("received Ctrl-C, stopping child");
                context.cancel();
            }
            Err(err) => warn!(error = %err, "failed to listen for Ctrl-C"),
        },
        () = context.done() => {}
    }
}

fn log_result(result: &Result<ExitStatus, ExecError>, ended_by: Option<ContextError>, code: ExitCode) {
    match result {
        Ok(status) => debug!(%status, "child finished"),
        Err(err) => info!(
            error = %err,
            context = ?ended_by,
            exit_code = code.as_i32(),
            "child did not finish cleanly"
        ),
    }
}

/// Write a captured tail to one of our own streams.
fn replay(name: &str, buffer: &RingBuffer, sink: &mut dyn Write) {
    if buffer.was_truncated() {
        warn!(
            stream = name,
            dropped_bytes = buffer.dropped_bytes(),
            "captured output was truncated"
        );
    }
    if let Err(err) = sink.write_all(&buffer.contents()).and_then(|()| sink.flush()) {
        debug!(stream = name, error = %err, "failed to replay captured output");
    }
}
