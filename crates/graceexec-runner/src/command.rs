//! The supervised command: builder, start, wait

use std::ffi::{OsStr, OsString};
use std::fmt;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, ExitStatus};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::Duration;

use tracing::{debug, info};

use crate::capture::SharedBuffer;
use crate::context::Context;
use crate::error::{ExecError, OutputError};
use crate::escalator::Escalator;
use crate::pipes::{self, PipeCloser, PipeManager, PipeReader, PipeWriter};
use crate::process::{OsProcess, ProcessHandle};
use crate::result_cell::ResultCell;
use crate::signal::{self, Signal, SignalPolicy};
use crate::stdio::{Input, Output};
use crate::supervisor::{Outcome, Supervisor};
use crate::types::StreamName;

#[derive(Debug, Default)]
struct Streams {
    stdin: Input,
    stdout: Output,
    stderr: Output,
}

/// An external program run under supervision.
///
/// Configure it with the builder methods, then [`start`](Command::start) it
/// inside a Tokio runtime and [`wait`](Command::wait) for the result. With a
/// [`Context`] attached, cancelling the context sends the interrupt signal;
/// with a grace period set, a process (or an orphaned descendant holding its
/// pipes) that outlives the grace period is killed and its pipes are closed.
///
/// # Example
///
/// ```no_run
/// use std::time::Duration;
/// use graceexec_runner::{Command, Context, Signal};
///
/// # async fn demo() -> Result<(), graceexec_runner::ExecError> {
/// let ctx = Context::with_timeout(Duration::from_secs(30));
/// let mut cmd = Command::with_context(ctx, "cargo")
///     .arg("build")
///     .interrupt(Signal::SIGINT)
///     .grace_period(Duration::from_secs(5));
/// cmd.run().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct Command {
    program: PathBuf,
    args: Vec<OsString>,
    env: Option<Vec<(OsString, OsString)>>,
    explicit_pwd: bool,
    dir: Option<PathBuf>,
    extra_files: Vec<OwnedFd>,
    process_group: Option<i32>,
    // Behind a mutex only so that `Command` is `Sync`; always reached
    // through `get_mut`.
    streams: Mutex<Streams>,
    context: Option<Context>,
    interrupt: Option<Signal>,
    grace_period: Option<Duration>,
    policy: Arc<dyn SignalPolicy>,
    local_pipes: Vec<PipeCloser>,
    started: bool,
    process: Option<Arc<dyn ProcessHandle>>,
    cell: Option<Arc<ResultCell<Outcome>>>,
    state: OnceLock<ExitStatus>,
}

impl Command {
    /// A command running `program`.
    ///
    /// A bare name such as `"ls"` is looked up on `PATH`. Anything containing
    /// a path separator is used as given. A failed lookup is reported when
    /// the command starts.
    #[must_use]
    pub fn new(program: impl AsRef<OsStr>) -> Self {
        Self {
            program: resolve_program(program.as_ref()),
            args: Vec::new(),
            env: None,
            explicit_pwd: false,
            dir: None,
            extra_files: Vec::new(),
            process_group: None,
            streams: Mutex::new(Streams::default()),
            context: None,
            interrupt: None,
            grace_period: None,
            policy: signal::platform_policy(),
            local_pipes: Vec::new(),
            started: false,
            process: None,
            cell: None,
            state: OnceLock::new(),
        }
    }

    /// A command bound to `context` that is force-killed when the context
    /// ends. Use [`Command::interrupt`] for a gentler first signal.
    #[must_use]
    pub fn with_context(context: Context, program: impl AsRef<OsStr>) -> Self {
        let mut command = Self::new(program);
        command.context = Some(context);
        command.interrupt = Some(Signal::SIGKILL);
        command
    }

    #[must_use]
    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set one environment variable. The first call snapshots the current
    /// environment, so the child sees it plus the overrides.
    #[must_use]
    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.set_env(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn envs<I, K, V>(mut self, envs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<OsString>,
        V: Into<OsString>,
    {
        for (key, value) in envs {
            self.set_env(key.into(), value.into());
        }
        self
    }

    /// Start from an empty environment.
    #[must_use]
    pub fn env_clear(mut self) -> Self {
        self.env = Some(Vec::new());
        self.explicit_pwd = false;
        self
    }

    fn set_env(&mut self, key: OsString, value: OsString) {
        self.explicit_pwd |= key == "PWD";
        let env = self
            .env
            .get_or_insert_with(|| std::env::vars_os().collect());
        match env.iter_mut().find(|(existing, _)| *existing == key) {
            Some(entry) => entry.1 = value,
            None => env.push((key, value)),
        }
    }

    /// Run the child in `dir`. The child also gets `PWD=dir` unless `PWD`
    /// was set with [`Command::env`].
    #[must_use]
    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dir = Some(dir.into());
        self
    }

    #[must_use]
    pub fn stdin(mut self, input: impl Into<Input>) -> Self {
        self.streams_mut().stdin = input.into();
        self
    }

    #[must_use]
    pub fn stdout(mut self, output: impl Into<Output>) -> Self {
        self.streams_mut().stdout = output.into();
        self
    }

    #[must_use]
    pub fn stderr(mut self, output: impl Into<Output>) -> Self {
        self.streams_mut().stderr = output.into();
        self
    }

    /// The signal sent when the context ends. Requires a context.
    #[must_use]
    pub fn interrupt(mut self, signal: Signal) -> Self {
        self.interrupt = Some(signal);
        self
    }

    /// Send nothing when the context ends.
    #[must_use]
    pub fn no_interrupt(mut self) -> Self {
        self.interrupt = None;
        self
    }

    /// How long to wait after the interrupt (or after the process exits with
    /// its pipes still open) before killing it and closing its pipes.
    /// `Duration::ZERO` kills immediately.
    #[must_use]
    pub fn grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = Some(grace_period);
        self
    }

    #[must_use]
    pub fn context(mut self, context: Context) -> Self {
        self.context = Some(context);
        self
    }

    /// Let the child inherit `fd` under its current descriptor number.
    /// The parent's copy is closed once the child has started.
    #[must_use]
    pub fn extra_file(mut self, fd: impl Into<OwnedFd>) -> Self {
        self.extra_files.push(fd.into());
        self
    }

    /// Put the child in process group `pgroup`; `0` makes it a group leader.
    #[must_use]
    pub fn process_group(mut self, pgroup: i32) -> Self {
        self.process_group = Some(pgroup);
        self
    }

    #[must_use]
    pub fn signal_policy(mut self, policy: Arc<dyn SignalPolicy>) -> Self {
        self.policy = policy;
        self
    }

    fn streams_mut(&mut self) -> &mut Streams {
        self.streams
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    #[must_use]
    pub fn program(&self) -> &Path {
        &self.program
    }

    #[must_use]
    pub fn get_args(&self) -> &[OsString] {
        &self.args
    }

    /// The OS process id, once started.
    #[must_use]
    pub fn id(&self) -> Option<u32> {
        self.process.as_ref().map(|process| process.id())
    }

    /// The exit status, once a `wait` has collected it.
    #[must_use]
    pub fn process_state(&self) -> Option<ExitStatus> {
        self.state.get().copied()
    }

    // ========================================================================
    // Caller-held pipes
    // ========================================================================

    /// A writer connected to the child's stdin.
    ///
    /// Closing (or dropping) it gives the child EOF. It is closed for you
    /// once the process has exited.
    pub fn stdin_pipe(&mut self) -> Result<PipeWriter, ExecError> {
        let started = self.started;
        if self.streams_mut().stdin.is_set() {
            return Err(ExecError::StreamAlreadySet {
                stream: StreamName::Stdin,
            });
        }
        if started {
            return Err(ExecError::PipeAfterStart {
                stream: StreamName::Stdin,
            });
        }
        let (remote, local) = pipes::input_pipe()?;
        self.local_pipes.push(local.closer());
        self.streams_mut().stdin = Input::Pipe(remote);
        Ok(local)
    }

    /// A reader of the child's stdout.
    ///
    /// The reader is closed once the process has exited, so read everything
    /// before calling [`Command::wait`].
    pub fn stdout_pipe(&mut self) -> Result<PipeReader, ExecError> {
        self.output_pipe(StreamName::Stdout)
    }

    /// A reader of the child's stderr. See [`Command::stdout_pipe`].
    pub fn stderr_pipe(&mut self) -> Result<PipeReader, ExecError> {
        self.output_pipe(StreamName::Stderr)
    }

    fn output_pipe(&mut self, stream: StreamName) -> Result<PipeReader, ExecError> {
        let started = self.started;
        let slot = match stream {
            StreamName::Stderr => &mut self.streams_mut().stderr,
            _ => &mut self.streams_mut().stdout,
        };
        if slot.is_set() {
            return Err(ExecError::StreamAlreadySet { stream });
        }
        if started {
            return Err(ExecError::PipeAfterStart { stream });
        }
        let (local, remote) = pipes::output_pipe()?;
        self.local_pipes.push(local.closer());
        match stream {
            StreamName::Stderr => self.streams_mut().stderr = Output::Pipe(remote),
            _ => self.streams_mut().stdout = Output::Pipe(remote),
        }
        Ok(local)
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Spawn the process and its supervisor.
    ///
    /// Must be called from within a Tokio runtime. On failure every pipe end
    /// opened for this command is closed and nothing keeps running.
    pub fn start(&mut self) -> Result<(), ExecError> {
        if self.started {
            return Err(ExecError::AlreadyStarted);
        }
        if let Err(err) = self.validate().and_then(|()| pipes::ensure_runtime()) {
            self.close_local_pipes();
            return Err(err);
        }
        self.started = true;

        let mut manager = PipeManager::with_adopted(std::mem::take(&mut self.local_pipes));
        let child = match self.spawn_child(&mut manager) {
            Ok(child) => child,
            Err(err) => {
                manager.close_all();
                return Err(err);
            }
        };
        // The child holds its own copies now.
        self.extra_files.clear();

        let process: Arc<dyn ProcessHandle> = Arc::new(OsProcess::new(child));
        let pid = process.id();
        let (copiers, pipes) = manager.launch();

        let escalation = Escalator::is_armed(self.interrupt, self.grace_period).then(|| {
            Escalator {
                process: Arc::clone(&process),
                context: self.context.clone(),
                interrupt: self.interrupt,
                grace_period: self.grace_period,
                pipes: pipes.clone(),
            }
            .spawn()
        });

        let cell = Arc::new(ResultCell::new());
        Supervisor {
            process: Arc::clone(&process),
            copiers,
            escalation,
            pipes,
            cell: Arc::clone(&cell),
        }
        .spawn();

        info!(pid, program = %self.program.display(), "process started");
        self.process = Some(process);
        self.cell = Some(cell);
        Ok(())
    }

    fn validate(&self) -> Result<(), ExecError> {
        if let Some(signal) = self.interrupt {
            if self.context.is_none() {
                return Err(ExecError::InterruptWithoutContext);
            }
            if signal != Signal::SIGKILL && !self.policy.supports_signal(signal) {
                return Err(self.policy.describe_unsupported(signal));
            }
        }
        Ok(())
    }

    fn close_local_pipes(&mut self) {
        for pipe in self.local_pipes.drain(..) {
            pipe.close();
        }
    }

    fn spawn_child(&mut self, manager: &mut PipeManager) -> Result<Child, ExecError> {
        let streams = std::mem::take(self.streams_mut());
        let stdin = manager.stdin(streams.stdin)?;
        let (stdout, stderr) = manager.outputs(streams.stdout, streams.stderr)?;

        let mut cmd = std::process::Command::new(&self.program);
        cmd.args(&self.args).stdin(stdin).stdout(stdout).stderr(stderr);

        if let Some(env) = &self.env {
            cmd.env_clear().envs(env.iter().map(|(k, v)| (k, v)));
        }
        if let Some(dir) = &self.dir {
            cmd.current_dir(dir);
            if !self.explicit_pwd {
                cmd.env("PWD", dir);
            }
        }
        if let Some(pgroup) = self.process_group {
            cmd.process_group(pgroup);
        }
        if !self.extra_files.is_empty() {
            inherit_fds(&mut cmd, self.extra_files.iter().map(AsRawFd::as_raw_fd).collect());
        }

        debug!(command = %self, "spawning");
        // Dropping `cmd` on return closes the child's ends of every pipe.
        cmd.spawn().map_err(|source| ExecError::Spawn {
            program: self.program.display().to_string(),
            source,
        })
    }

    fn started_cell(&self) -> Result<&Arc<ResultCell<Outcome>>, ExecError> {
        self.cell.as_ref().ok_or(ExecError::NotStarted)
    }

    /// Wait for the process and every copy task to finish.
    ///
    /// Returns `Ok` only if the process exited successfully and nothing was
    /// escalated. Exactly one caller collects the result; later or concurrent
    /// callers get [`ExecError::AlreadyCollected`].
    pub async fn wait(&self) -> Result<ExitStatus, ExecError> {
        let cell = self.started_cell()?;
        let Some(outcome) = cell.collect().await else {
            return Err(ExecError::AlreadyCollected);
        };

        if let Some(status) = outcome.status {
            let _ = self.state.set(status);
        }
        match (outcome.error, outcome.status) {
            (Some(err), _) => Err(err),
            (None, Some(status)) => Ok(status),
            (None, None) => Err(ExecError::Wait {
                source: io::Error::other("process ended without an exit status"),
            }),
        }
    }

    /// [`start`](Command::start) followed by [`wait`](Command::wait).
    pub async fn run(&mut self) -> Result<ExitStatus, ExecError> {
        self.start()?;
        self.wait().await
    }

    /// Run the command and collect stdout and stderr interleaved into one
    /// buffer.
    pub async fn combined_output(&mut self) -> Result<Vec<u8>, OutputError> {
        let preset = {
            let streams = self.streams_mut();
            if streams.stdout.is_set() {
                Some(StreamName::Stdout)
            } else if streams.stderr.is_set() {
                Some(StreamName::Stderr)
            } else {
                None
            }
        };
        if let Some(stream) = preset {
            return Err(OutputError {
                output: Vec::new(),
                source: ExecError::StreamAlreadySet { stream },
            });
        }

        let buffer = SharedBuffer::new();
        {
            let streams = self.streams_mut();
            streams.stdout = Output::writer(buffer.clone());
            streams.stderr = Output::Stdout;
        }
        match self.run().await {
            Ok(_) => Ok(buffer.take()),
            Err(source) => Err(OutputError {
                output: buffer.take(),
                source,
            }),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.display())?;
        for arg in &self.args {
            write!(f, " {}", arg.to_string_lossy())?;
        }
        Ok(())
    }
}

impl Drop for Command {
    fn drop(&mut self) {
        // Ends handed out by the pipe helpers but never used by a start.
        self.close_local_pipes();
    }
}

fn resolve_program(program: &OsStr) -> PathBuf {
    if program.as_encoded_bytes().contains(&b'/') {
        return PathBuf::from(program);
    }
    match which::which(program) {
        Ok(path) => path,
        Err(err) => {
            debug!(program = %program.to_string_lossy(), error = %err, "executable lookup failed");
            PathBuf::from(program)
        }
    }
}

/// Clear close-on-exec on `fds` in the child so they survive the exec.
fn inherit_fds(cmd: &mut std::process::Command, fds: Vec<RawFd>) {
    let hook = move || -> io::Result<()> {
        for &fd in &fds {
            // SAFETY: fcntl is async-signal-safe and `fd` is open in the
            // forked child because the parent keeps it open until spawn
            // returns.
            if unsafe { libc::fcntl(fd, libc::F_SETFD, 0) } == -1 {
                return Err(io::Error::last_os_error());
            }
        }
        Ok(())
    };
    // SAFETY: the hook only calls fcntl and does not allocate.
    unsafe {
        cmd.pre_exec(hook);
    }
}
