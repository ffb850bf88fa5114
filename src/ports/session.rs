//! Session port
//!
//! Traits describing one authenticated transport connection and the
//! file-transfer sub-protocol channel it can open. The core never touches a
//! concrete SSH library; it drives these traits and lets adapters translate
//! transport failures into the structured [`crate::Error`] variants.

use std::path::Path;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::Result;

/// Output from a command execution.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_status: u32,
    pub duration_ms: u64,
}

/// A chunk of command output delivered while the command is still running.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputChunk {
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
}

/// Options for a single command execution.
///
/// `output` is an optional bounded channel; when set, stdout/stderr chunks
/// are delivered through it as they arrive, with backpressure from the
/// channel capacity. The collected [`CommandOutput`] is returned either way.
#[derive(Debug, Clone, Default)]
pub struct ExecOptions {
    /// Override of the configured command timeout, in seconds.
    pub timeout_secs: Option<u64>,
    /// Streaming delivery of output chunks while the command runs.
    pub output: Option<mpsc::Sender<OutputChunk>>,
}

/// What kind of object a remote path refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    File,
    Dir,
    Symlink,
    Other,
}

/// Metadata for a remote path.
#[derive(Debug, Clone)]
pub struct FileStat {
    pub kind: FileKind,
    pub size: Option<u64>,
    pub permissions: Option<u32>,
}

impl FileStat {
    #[must_use]
    pub fn is_dir(&self) -> bool {
        self.kind == FileKind::Dir
    }

    #[must_use]
    pub fn is_file(&self) -> bool {
        self.kind == FileKind::File
    }
}

/// One entry of a remote directory listing. `.` and `..` are never included.
#[derive(Debug, Clone)]
pub struct DirEntry {
    pub name: String,
    pub stat: FileStat,
}

/// One authenticated transport connection.
///
/// All methods take `&self`; implementations use interior mutability so a
/// single session can multiplex concurrent command executions. `connect` on
/// an already-connected session is a no-op, which lets two pool acquisitions
/// race on the same slot without double-connecting.
#[async_trait]
pub trait Session: Send + Sync {
    /// Establish (or re-establish) the connection.
    async fn connect(&self) -> Result<()>;

    /// Whether the connection is currently usable.
    async fn is_connected(&self) -> bool;

    /// Run a command and collect its output.
    async fn exec(&self, command: &str, options: &ExecOptions) -> Result<CommandOutput>;

    /// Open the file-transfer sub-protocol channel.
    ///
    /// Exactly one data channel is opened and closed per transfer-engine
    /// operation; channels are never shared between concurrent orders.
    async fn open_data_channel(&self) -> Result<Box<dyn DataChannel>>;

    /// Tear the connection down. Idempotent.
    async fn close(&self) -> Result<()>;
}

/// The file-transfer sub-protocol channel opened over a [`Session`].
#[async_trait]
pub trait DataChannel: Send + Sync {
    /// Stat a path, following symlinks.
    async fn stat(&self, path: &str) -> Result<FileStat>;

    /// Stat a path without following symlinks.
    async fn lstat(&self, path: &str) -> Result<FileStat>;

    /// List a directory. Fails with `NoSuchPath` if the directory is missing.
    async fn read_dir(&self, path: &str) -> Result<Vec<DirEntry>>;

    /// Create a single directory. The parent must exist.
    async fn mkdir(&self, path: &str) -> Result<()>;

    /// Remove an empty directory.
    async fn rmdir(&self, path: &str) -> Result<()>;

    /// Remove a file.
    async fn unlink(&self, path: &str) -> Result<()>;

    /// Resolve the canonical absolute form of `path`.
    ///
    /// Contract required by the mkdir_p upward probe: resolving a path that
    /// does not exist fails with `NoSuchPath` rather than returning a
    /// textually canonicalized name.
    async fn real_path(&self, path: &str) -> Result<String>;

    /// Stream a remote file into a local file, creating or truncating it.
    /// Returns the number of bytes transferred.
    async fn stream_get(&self, remote: &str, local: &Path) -> Result<u64>;

    /// Stream a local file to a remote path, creating or truncating it and
    /// applying `permissions` when the transport supports it.
    /// Returns the number of bytes transferred.
    async fn stream_put(&self, local: &Path, remote: &str, permissions: Option<u32>)
        -> Result<u64>;

    /// Close the channel. Idempotent.
    async fn close(&mut self) -> Result<()>;
}

/// Builds unconnected [`Session`] values for the connection pool.
///
/// The pool calls this only while growing below its `max_connection` cap;
/// the returned session is connected lazily by the pool itself.
#[async_trait]
pub trait SessionFactory: Send + Sync + 'static {
    type Session: Session + 'static;

    async fn open(&self) -> Result<Self::Session>;
}
