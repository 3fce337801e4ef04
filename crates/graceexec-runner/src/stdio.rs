//! Stream slot values for a child's stdin, stdout and stderr

use std::fmt;
use std::fs::File;
use std::io::Cursor;

use tokio::io::{AsyncRead, AsyncWrite};

/// A readable byte stream feeding a child's stdin through a managed pipe.
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// A writable byte stream receiving a child's output through a managed pipe.
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// What the child reads as stdin.
///
/// Native handles are passed to the child unchanged. [`Input::Reader`] is
/// copied into the child by a background task.
#[derive(Default)]
pub enum Input {
    /// `/dev/null`.
    #[default]
    Null,
    /// The supervisor's own stdin.
    Inherit,
    File(File),
    /// The read end of a pipe whose write end the caller keeps.
    Pipe(std::io::PipeReader),
    Reader(BoxedReader),
}

impl Input {
    pub fn reader(reader: impl AsyncRead + Send + Unpin + 'static) -> Self {
        Self::Reader(Box::new(reader))
    }

    /// Feed the child a fixed buffer.
    pub fn bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self::Reader(Box::new(Cursor::new(bytes.into())))
    }

    #[must_use]
    pub const fn is_set(&self) -> bool {
        !matches!(self, Self::Null)
    }
}

impl From<File> for Input {
    fn from(file: File) -> Self {
        Self::File(file)
    }
}

impl fmt::Debug for Input {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("Null"),
            Self::Inherit => f.write_str("Inherit"),
            Self::File(file) => f.debug_tuple("File").field(file).finish(),
            Self::Pipe(pipe) => f.debug_tuple("Pipe").field(pipe).finish(),
            Self::Reader(_) => f.write_str("Reader(..)"),
        }
    }
}

/// Where the child's stdout or stderr goes.
#[derive(Default)]
pub enum Output {
    /// `/dev/null`.
    #[default]
    Null,
    /// The supervisor's own stream of the same kind.
    Inherit,
    File(File),
    /// The write end of a pipe whose read end the caller keeps.
    Pipe(std::io::PipeWriter),
    Writer(BoxedWriter),
    /// Only valid for stderr: share stdout's descriptor so both streams
    /// interleave in the order the child wrote them.
    Stdout,
}

impl Output {
    pub fn writer(writer: impl AsyncWrite + Send + Unpin + 'static) -> Self {
        Self::Writer(Box::new(writer))
    }

    #[must_use]
    pub const fn is_set(&self) -> bool {
        !matches!(self, Self::Null)
    }
}

impl From<File> for Output {
    fn from(file: File) -> Self {
        Self::File(file)
    }
}

impl fmt::Debug for Output {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("Null"),
            Self::Inherit => f.write_str("Inherit"),
            Self::File(file) => f.debug_tuple("File").field(file).finish(),
            Self::Pipe(pipe) => f.debug_tuple("Pipe").field(pipe).finish(),
            Self::Writer(_) => f.write_str("Writer(..)"),
            Self::Stdout => f.write_str("Stdout"),
        }
    }
}
