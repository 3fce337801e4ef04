//! Managed pipes between the supervisor and a child process
//!
//! A stream slot holding a native handle is passed to the child untouched.
//! A slot holding an async reader or writer gets an OS pipe: the remote end
//! goes to the child, the local end stays here and is serviced by one copy
//! task. Local ends can be force-closed from anywhere through a
//! [`PipeCloser`]; the first close wins and wakes whoever is parked on it.

use std::fmt;
use std::future::poll_fn;
use std::io;
use std::os::fd::{AsFd, OwnedFd};
use std::pin::Pin;
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll, Waker};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::unix::pipe;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::error::ExecError;
use crate::stdio::{BoxedReader, BoxedWriter, Input, Output};
use crate::types::StreamName;

const COPY_BUFFER_SIZE: usize = 8192;

// ============================================================================
// Closeable pipe ends
// ============================================================================

#[derive(Debug)]
struct Shared<T> {
    io: Option<T>,
    io_waker: Option<Waker>,
    close_waker: Option<Waker>,
}

#[derive(Debug)]
struct PipeEnd<T> {
    shared: Mutex<Shared<T>>,
}

impl<T> PipeEnd<T> {
    fn new(io: T) -> Self {
        Self {
            shared: Mutex::new(Shared {
                io: Some(io),
                io_waker: None,
                close_waker: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Shared<T>> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn close(&self) {
        let (io, wakers) = {
            let mut shared = self.lock();
            (
                shared.io.take(),
                [shared.io_waker.take(), shared.close_waker.take()],
            )
        };
        drop(io);
        for waker in wakers.into_iter().flatten() {
            waker.wake();
        }
    }

    fn is_closed(&self) -> bool {
        self.lock().io.is_none()
    }

    fn poll_closed(&self, cx: &mut Context<'_>) -> Poll<()> {
        let mut shared = self.lock();
        if shared.io.is_none() {
            return Poll::Ready(());
        }
        shared.close_waker = Some(cx.waker().clone());
        Poll::Pending
    }
}

trait Close: Send + Sync {
    fn close(&self);
    fn is_closed(&self) -> bool;
}

impl<T: Send> Close for PipeEnd<T> {
    fn close(&self) {
        PipeEnd::close(self);
    }

    fn is_closed(&self) -> bool {
        PipeEnd::is_closed(self)
    }
}

fn pipe_error(source: io::Error) -> ExecError {
    ExecError::Pipe { source }
}

fn closed_pipe() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "pipe closed")
}

/// The supervisor-side read end of a child's output pipe.
///
/// Reads return end-of-file once the end has been closed, including when a
/// close happens while a read is parked.
#[derive(Debug)]
pub struct PipeReader {
    end: Arc<PipeEnd<pipe::Receiver>>,
}

impl PipeReader {
    fn from_std(reader: std::io::PipeReader) -> Result<Self, ExecError> {
        let receiver = pipe::Receiver::from_owned_fd(OwnedFd::from(reader)).map_err(pipe_error)?;
        Ok(Self {
            end: Arc::new(PipeEnd::new(receiver)),
        })
    }

    /// Close this end. Later closes are no-ops.
    pub fn close(&self) {
        self.end.close();
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.end.is_closed()
    }

    pub(crate) fn closer(&self) -> PipeCloser {
        PipeCloser(Arc::clone(&self.end) as Arc<dyn Close>)
    }
}

impl AsyncRead for PipeReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let mut shared = self.end.lock();
        let Some(io) = shared.io.as_mut() else {
            return Poll::Ready(Ok(()));
        };
        let poll = Pin::new(io).poll_read(cx, buf);
        if poll.is_pending() {
            shared.io_waker = Some(cx.waker().clone());
        }
        poll
    }
}

impl Drop for PipeReader {
    fn drop(&mut self) {
        self.end.close();
    }
}

/// The supervisor-side write end of a child's stdin pipe.
///
/// Writes fail with [`io::ErrorKind::BrokenPipe`] once the end has been
/// closed. Shutting the writer down closes it, which the child sees as EOF.
#[derive(Debug)]
pub struct PipeWriter {
    end: Arc<PipeEnd<pipe::Sender>>,
}

impl PipeWriter {
    fn from_std(writer: std::io::PipeWriter) -> Result<Self, ExecError> {
        let sender = pipe::Sender::from_owned_fd(OwnedFd::from(writer)).map_err(pipe_error)?;
        Ok(Self {
            end: Arc::new(PipeEnd::new(sender)),
        })
    }

    /// Close this end. Later closes are no-ops.
    pub fn close(&self) {
        self.end.close();
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.end.is_closed()
    }

    /// Resolves once this end has been closed by anyone.
    pub async fn closed(&self) {
        poll_fn(|cx| self.end.poll_closed(cx)).await;
    }

    pub(crate) fn closer(&self) -> PipeCloser {
        PipeCloser(Arc::clone(&self.end) as Arc<dyn Close>)
    }
}

impl AsyncWrite for PipeWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let mut shared = self.end.lock();
        let Some(io) = shared.io.as_mut() else {
            return Poll::Ready(Err(closed_pipe()));
        };
        let poll = Pin::new(io).poll_write(cx, buf);
        if poll.is_pending() {
            shared.io_waker = Some(cx.waker().clone());
        }
        poll
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.end.close();
        Poll::Ready(Ok(()))
    }
}

impl Drop for PipeWriter {
    fn drop(&mut self) {
        self.end.close();
    }
}

/// A shareable handle that force-closes one local pipe end.
#[derive(Clone)]
pub struct PipeCloser(Arc<dyn Close>);

impl PipeCloser {
    pub fn close(&self) {
        self.0.close();
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.0.is_closed()
    }
}

impl fmt::Debug for PipeCloser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipeCloser")
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Every local pipe end of one started command, frozen at start.
#[derive(Debug, Clone)]
pub struct LocalPipes(Arc<[PipeCloser]>);

impl LocalPipes {
    pub fn close_all(&self) {
        for pipe in self.0.iter() {
            pipe.close();
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<PipeCloser>> for LocalPipes {
    fn from(pipes: Vec<PipeCloser>) -> Self {
        Self(pipes.into())
    }
}

// ============================================================================
// Pipe allocation for stream slots
// ============================================================================

pub(crate) fn ensure_runtime() -> Result<(), ExecError> {
    Handle::try_current()
        .map(drop)
        .map_err(|_| ExecError::NoRuntime)
}

/// A pipe for stdin: the child's read end and our write end.
pub(crate) fn input_pipe() -> Result<(std::io::PipeReader, PipeWriter), ExecError> {
    ensure_runtime()?;
    let (remote, local) = std::io::pipe().map_err(pipe_error)?;
    Ok((remote, PipeWriter::from_std(local)?))
}

/// A pipe for stdout or stderr: our read end and the child's write end.
pub(crate) fn output_pipe() -> Result<(PipeReader, std::io::PipeWriter), ExecError> {
    ensure_runtime()?;
    let (local, remote) = std::io::pipe().map_err(pipe_error)?;
    Ok((PipeReader::from_std(local)?, remote))
}

enum Copier {
    Input { source: BoxedReader, pipe: PipeWriter },
    Output { pipe: PipeReader, sink: BoxedWriter },
}

/// Turns stream slots into [`Stdio`] values for spawning, allocating a pipe
/// and a pending copy task for every slot that holds an async stream.
///
/// Copy tasks only start in [`PipeManager::launch`], after the spawn
/// succeeded. Dropping the manager instead releases every pipe it made.
#[derive(Default)]
pub(crate) struct PipeManager {
    copiers: Vec<Copier>,
    local: Vec<PipeCloser>,
}

impl PipeManager {
    /// Start from local ends the caller already holds, such as ends handed
    /// out by `stdout_pipe`, so they share the fate of the managed ones.
    pub(crate) fn with_adopted(local: Vec<PipeCloser>) -> Self {
        Self {
            copiers: Vec::new(),
            local,
        }
    }

    pub(crate) fn stdin(&mut self, input: Input) -> Result<Stdio, ExecError> {
        Ok(match input {
            Input::Null => Stdio::null(),
            Input::Inherit => Stdio::inherit(),
            Input::File(file) => Stdio::from(file),
            Input::Pipe(reader) => Stdio::from(reader),
            Input::Reader(source) => {
                let (remote, local) = std::io::pipe().map_err(pipe_error)?;
                let pipe = PipeWriter::from_std(local)?;
                self.local.push(pipe.closer());
                self.copiers.push(Copier::Input { source, pipe });
                Stdio::from(remote)
            }
        })
    }

    /// Resolve stdout and stderr together so `Output::Stdout` on stderr can
    /// share stdout's descriptor.
    pub(crate) fn outputs(
        &mut self,
        stdout: Output,
        stderr: Output,
    ) -> Result<(Stdio, Stdio), ExecError> {
        if !matches!(stderr, Output::Stdout) {
            let stdout = self.output(stdout, StreamName::Stdout)?;
            let stderr = self.output(stderr, StreamName::Stderr)?;
            return Ok((stdout, stderr));
        }

        let shared: OwnedFd = match stdout {
            Output::Null => return Ok((Stdio::null(), Stdio::null())),
            Output::Inherit => {
                let alias = io::stdout()
                    .as_fd()
                    .try_clone_to_owned()
                    .map_err(pipe_error)?;
                return Ok((Stdio::inherit(), Stdio::from(alias)));
            }
            Output::File(file) => file.into(),
            Output::Pipe(writer) => writer.into(),
            Output::Writer(sink) => self.managed_output(sink)?,
            Output::Stdout => return Err(self_alias()),
        };
        let alias = shared.try_clone().map_err(pipe_error)?;
        Ok((Stdio::from(shared), Stdio::from(alias)))
    }

    fn output(&mut self, output: Output, stream: StreamName) -> Result<Stdio, ExecError> {
        Ok(match output {
            Output::Null => Stdio::null(),
            Output::Inherit => Stdio::inherit(),
            Output::File(file) => Stdio::from(file),
            Output::Pipe(writer) => Stdio::from(writer),
            Output::Writer(sink) => Stdio::from(self.managed_output(sink)?),
            Output::Stdout if stream == StreamName::Stdout => return Err(self_alias()),
            Output::Stdout => {
                return Err(ExecError::InvalidStream {
                    stream,
                    reason: "only stderr can alias stdout".to_string(),
                });
            }
        })
    }

    fn managed_output(&mut self, sink: BoxedWriter) -> Result<OwnedFd, ExecError> {
        let (local, remote) = std::io::pipe().map_err(pipe_error)?;
        let pipe = PipeReader::from_std(local)?;
        self.local.push(pipe.closer());
        self.copiers.push(Copier::Output { pipe, sink });
        Ok(remote.into())
    }

    /// Number of copy tasks [`PipeManager::launch`] would start.
    pub(crate) fn copier_count(&self) -> usize {
        self.copiers.len()
    }

    /// Close every local end. Used when the spawn failed.
    pub(crate) fn close_all(&self) {
        for pipe in &self.local {
            pipe.close();
        }
    }

    /// Spawn one copy task per managed pipe and freeze the local ends.
    pub(crate) fn launch(self) -> (Vec<JoinHandle<()>>, LocalPipes) {
        let copiers = self
            .copiers
            .into_iter()
            .map(|copier| match copier {
                Copier::Input { source, pipe } => tokio::spawn(copy_input(source, pipe)),
                Copier::Output { pipe, sink } => tokio::spawn(copy_output(pipe, sink)),
            })
            .collect();
        (copiers, LocalPipes::from(self.local))
    }
}

fn self_alias() -> ExecError {
    ExecError::InvalidStream {
        stream: StreamName::Stdout,
        reason: "stdout cannot alias itself".to_string(),
    }
}

async fn copy_input(mut source: BoxedReader, mut pipe: PipeWriter) {
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    loop {
        let n = tokio::select! {
            read = source.read(&mut buf) => match read {
                Ok(0) => break,
                Ok(n) => n,
                Err(err) => {
                    debug!(error = %err, "stdin source failed");
                    break;
                }
            },
            () = pipe.closed() => break,
        };

        // BrokenPipe here means the child stopped reading, which is its call.
        if let Err(err) = pipe.write_all(&buf[..n]).await {
            debug!(error = %err, "stdin copy stopped");
            break;
        }
    }
    pipe.close();
}

async fn copy_output(mut pipe: PipeReader, mut sink: BoxedWriter) {
    if let Err(err) = tokio::io::copy(&mut pipe, &mut sink).await {
        debug!(error = %err, "output copy stopped");
    }
    if let Err(err) = sink.flush().await {
        debug!(error = %err, "output sink flush failed");
    }
    pipe.close();
}
