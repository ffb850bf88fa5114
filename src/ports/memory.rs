//! In-memory loopback transport.
//!
//! [`MemoryRemote`] simulates a remote host: a path-keyed filesystem plus
//! scripted fault queues. [`MemoryFactory`] hands out [`MemorySession`]s over
//! that shared remote, so pool, scheduler, and transfer behavior can be
//! exercised end to end without a network.

use std::collections::{BTreeMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::ports::{
    CommandOutput, DataChannel, DirEntry, ExecOptions, FileKind, FileStat, OutputChunk, Session,
    SessionFactory,
};

#[derive(Debug, Clone)]
enum Node {
    Dir,
    File { data: Vec<u8>, mode: u32 },
    Symlink { target: String },
}

#[derive(Default)]
struct RemoteState {
    /// Normalized absolute path -> node. "/" is always a Dir.
    fs: BTreeMap<String, Node>,
    /// Errors returned by the next connect attempts, in order.
    connect_failures: VecDeque<Error>,
    /// Errors returned by the next exec calls, in order.
    exec_failures: VecDeque<Error>,
    /// Errors returned by the next data-channel opens, in order.
    channel_failures: VecDeque<Error>,
    /// Commands that reached a connected session, in order.
    exec_log: Vec<String>,
    /// Directories created through the data channel, in order.
    mkdir_log: Vec<String>,
}

/// Collapse `.`, `..`, and repeated slashes; relative paths resolve from `/`.
fn normalize(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            p => parts.push(p),
        }
    }
    if parts.is_empty() {
        "/".to_string()
    } else {
        format!("/{}", parts.join("/"))
    }
}

fn parent_of(path: &str) -> String {
    match path.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(idx) => path[..idx].to_string(),
    }
}

fn stat_of(node: &Node) -> FileStat {
    match node {
        Node::Dir => FileStat {
            kind: FileKind::Dir,
            size: None,
            permissions: Some(0o755),
        },
        Node::File { data, mode } => FileStat {
            kind: FileKind::File,
            size: Some(data.len() as u64),
            permissions: Some(*mode),
        },
        Node::Symlink { .. } => FileStat {
            kind: FileKind::Symlink,
            size: None,
            permissions: None,
        },
    }
}

/// The simulated remote host shared by every session a test opens.
#[derive(Clone)]
pub struct MemoryRemote {
    state: Arc<Mutex<RemoteState>>,
    sessions_opened: Arc<AtomicUsize>,
    connect_attempts: Arc<AtomicUsize>,
    current_execs: Arc<AtomicUsize>,
    peak_execs: Arc<AtomicUsize>,
    /// Artificial latency per exec, to hold connections busy in tests.
    exec_delay: Arc<Mutex<Duration>>,
}

impl Default for MemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRemote {
    #[must_use]
    pub fn new() -> Self {
        let mut state = RemoteState::default();
        state.fs.insert("/".to_string(), Node::Dir);
        Self {
            state: Arc::new(Mutex::new(state)),
            sessions_opened: Arc::new(AtomicUsize::new(0)),
            connect_attempts: Arc::new(AtomicUsize::new(0)),
            current_execs: Arc::new(AtomicUsize::new(0)),
            peak_execs: Arc::new(AtomicUsize::new(0)),
            exec_delay: Arc::new(Mutex::new(Duration::ZERO)),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RemoteState> {
        self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Create a directory and any missing ancestors.
    pub fn add_dir(&self, path: &str) {
        let path = normalize(&path.replace('\\', "/"));
        let mut state = self.lock();
        let mut built = String::new();
        for part in path.split('/').filter(|p| !p.is_empty()) {
            built.push('/');
            built.push_str(part);
            state.fs.entry(built.clone()).or_insert(Node::Dir);
        }
    }

    /// Create a file (and its ancestors) with the given contents and mode.
    pub fn add_file(&self, path: &str, data: &[u8], mode: u32) {
        let path = normalize(path);
        self.add_dir(&parent_of(&path));
        self.lock().fs.insert(
            path,
            Node::File {
                data: data.to_vec(),
                mode,
            },
        );
    }

    /// Create a symlink node (target is recorded, one level is followed by stat).
    pub fn add_symlink(&self, path: &str, target: &str) {
        let path = normalize(path);
        self.add_dir(&parent_of(&path));
        self.lock().fs.insert(
            path,
            Node::Symlink {
                target: target.to_string(),
            },
        );
    }

    /// Contents of a file, if it exists.
    #[must_use]
    pub fn file_data(&self, path: &str) -> Option<Vec<u8>> {
        match self.lock().fs.get(&normalize(path)) {
            Some(Node::File { data, .. }) => Some(data.clone()),
            _ => None,
        }
    }

    #[must_use]
    pub fn exists(&self, path: &str) -> bool {
        self.lock().fs.contains_key(&normalize(path))
    }

    /// Queue an error for the next connect attempt.
    pub fn push_connect_failure(&self, error: Error) {
        self.lock().connect_failures.push_back(error);
    }

    /// Queue an error for the next exec call.
    pub fn push_exec_failure(&self, error: Error) {
        self.lock().exec_failures.push_back(error);
    }

    /// Queue an error for the next data-channel open.
    pub fn push_channel_failure(&self, error: Error) {
        self.lock().channel_failures.push_back(error);
    }

    /// Make every subsequent exec sleep before completing.
    pub fn set_exec_delay(&self, delay: Duration) {
        *self.exec_delay.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = delay;
    }

    /// Sessions handed out by the factory; a pool respecting its cap never
    /// pushes this past `max_connection`.
    #[must_use]
    pub fn sessions_opened(&self) -> usize {
        self.sessions_opened.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn connect_attempts(&self) -> usize {
        self.connect_attempts.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn exec_log(&self) -> Vec<String> {
        self.lock().exec_log.clone()
    }

    #[must_use]
    pub fn mkdir_log(&self) -> Vec<String> {
        self.lock().mkdir_log.clone()
    }

    /// Highest number of execs observed running at the same time.
    #[must_use]
    pub fn peak_execs(&self) -> usize {
        self.peak_execs.load(Ordering::SeqCst)
    }

    fn exec_delay(&self) -> Duration {
        *self.exec_delay.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// One simulated connection to a [`MemoryRemote`].
pub struct MemorySession {
    remote: MemoryRemote,
    connected: AtomicBool,
}

impl MemorySession {
    #[must_use]
    pub fn new(remote: MemoryRemote) -> Self {
        Self {
            remote,
            connected: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl Session for MemorySession {
    async fn connect(&self) -> Result<()> {
        if self.connected.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.remote.connect_attempts.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.remote.lock().connect_failures.pop_front() {
            return Err(error);
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn exec(&self, command: &str, options: &ExecOptions) -> Result<CommandOutput> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(Error::NotConnected);
        }
        let fault = self.remote.lock().exec_failures.pop_front();
        if let Some(error) = fault {
            // A dropped transport also drops the session state.
            if matches!(error, Error::NotConnected | Error::ConnectionReset) {
                self.connected.store(false, Ordering::SeqCst);
            }
            return Err(error);
        }
        let running = self.remote.current_execs.fetch_add(1, Ordering::SeqCst) + 1;
        self.remote.peak_execs.fetch_max(running, Ordering::SeqCst);
        let delay = self.remote.exec_delay();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.remote.current_execs.fetch_sub(1, Ordering::SeqCst);
        self.remote.lock().exec_log.push(command.to_string());
        let stdout = format!("{command}\n");
        if let Some(sender) = &options.output {
            let _ = sender.send(OutputChunk::Stdout(stdout.clone().into_bytes())).await;
        }
        Ok(CommandOutput {
            stdout,
            stderr: String::new(),
            exit_status: 0,
            duration_ms: delay.as_millis() as u64,
        })
    }

    async fn open_data_channel(&self) -> Result<Box<dyn DataChannel>> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(Error::NotConnected);
        }
        let fault = self.remote.lock().channel_failures.pop_front();
        if let Some(error) = fault {
            if matches!(error, Error::NotConnected | Error::ConnectionReset) {
                self.connected.store(false, Ordering::SeqCst);
            }
            return Err(error);
        }
        Ok(Box::new(MemoryDataChannel {
            remote: self.remote.clone(),
        }))
    }

    async fn close(&self) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }
}

/// Data channel over the simulated filesystem.
pub struct MemoryDataChannel {
    remote: MemoryRemote,
}

impl MemoryDataChannel {
    fn node(&self, path: &str) -> Result<Node> {
        let path = normalize(path);
        self.remote
            .lock()
            .fs
            .get(&path)
            .cloned()
            .ok_or(Error::NoSuchPath { path })
    }
}

#[async_trait]
impl DataChannel for MemoryDataChannel {
    async fn stat(&self, path: &str) -> Result<FileStat> {
        match self.node(path)? {
            Node::Symlink { target } => Ok(stat_of(&self.node(&target)?)),
            node => Ok(stat_of(&node)),
        }
    }

    async fn lstat(&self, path: &str) -> Result<FileStat> {
        Ok(stat_of(&self.node(path)?))
    }

    async fn read_dir(&self, path: &str) -> Result<Vec<DirEntry>> {
        let path = normalize(path);
        if !matches!(self.node(&path)?, Node::Dir) {
            return Err(Error::MustBeDirectory { path });
        }
        let prefix = if path == "/" { "/".to_string() } else { format!("{path}/") };
        let state = self.remote.lock();
        let mut entries = Vec::new();
        for (child, node) in state.fs.range(prefix.clone()..) {
            let Some(rest) = child.strip_prefix(&prefix) else {
                break;
            };
            if rest.is_empty() || rest.contains('/') {
                continue;
            }
            entries.push(DirEntry {
                name: rest.to_string(),
                stat: stat_of(node),
            });
        }
        Ok(entries)
    }

    async fn mkdir(&self, path: &str) -> Result<()> {
        let path = normalize(path);
        let parent = parent_of(&path);
        let mut state = self.remote.lock();
        if state.fs.contains_key(&path) {
            return Err(Error::AlreadyExists { path });
        }
        match state.fs.get(&parent) {
            Some(Node::Dir) => {}
            Some(_) => return Err(Error::MustBeDirectory { path: parent }),
            None => return Err(Error::NoSuchPath { path: parent }),
        }
        state.fs.insert(path.clone(), Node::Dir);
        state.mkdir_log.push(path);
        Ok(())
    }

    async fn rmdir(&self, path: &str) -> Result<()> {
        let path = normalize(path);
        if !matches!(self.node(&path)?, Node::Dir) {
            return Err(Error::MustBeDirectory { path });
        }
        let prefix = format!("{path}/");
        let mut state = self.remote.lock();
        if state.fs.keys().any(|k| k.starts_with(&prefix)) {
            return Err(Error::Data {
                reason: format!("directory not empty: {path}"),
            });
        }
        state.fs.remove(&path);
        Ok(())
    }

    async fn unlink(&self, path: &str) -> Result<()> {
        let path = normalize(path);
        match self.node(&path)? {
            Node::Dir => Err(Error::MustBeFile { path }),
            _ => {
                self.remote.lock().fs.remove(&path);
                Ok(())
            }
        }
    }

    async fn real_path(&self, path: &str) -> Result<String> {
        let path = normalize(path);
        // Resolving a missing path must fail so upward probes can find the
        // deepest existing ancestor.
        if !self.remote.lock().fs.contains_key(&path) {
            return Err(Error::NoSuchPath { path });
        }
        Ok(path)
    }

    async fn stream_get(&self, remote: &str, local: &Path) -> Result<u64> {
        let data = match self.node(remote)? {
            Node::File { data, .. } => data,
            _ => {
                return Err(Error::MustBeFile {
                    path: normalize(remote),
                })
            }
        };
        tokio::fs::write(local, &data).await?;
        Ok(data.len() as u64)
    }

    async fn stream_put(
        &self,
        local: &Path,
        remote: &str,
        permissions: Option<u32>,
    ) -> Result<u64> {
        let data = tokio::fs::read(local).await?;
        let remote = normalize(remote);
        let parent = parent_of(&remote);
        let mut state = self.remote.lock();
        match state.fs.get(&parent) {
            Some(Node::Dir) => {}
            Some(_) => return Err(Error::MustBeDirectory { path: parent }),
            None => return Err(Error::NoSuchPath { path: parent }),
        }
        let len = data.len() as u64;
        state.fs.insert(
            remote,
            Node::File {
                data,
                mode: permissions.unwrap_or(0o644),
            },
        );
        Ok(len)
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Factory over a shared [`MemoryRemote`]. Every open bumps the remote's
/// `sessions_opened` gauge, so tests can assert how far a pool grew.
pub struct MemoryFactory {
    remote: MemoryRemote,
}

impl MemoryFactory {
    #[must_use]
    pub fn new(remote: MemoryRemote) -> Self {
        Self { remote }
    }
}

#[async_trait]
impl SessionFactory for MemoryFactory {
    type Session = MemorySession;

    async fn open(&self) -> Result<MemorySession> {
        self.remote.sessions_opened.fetch_add(1, Ordering::SeqCst);
        Ok(MemorySession::new(self.remote.clone()))
    }
}

// ============================================================================
// Tests
// ============================================================================
