//! High-level client facade.
//!
//! [`RemoteClient`] ties the connection pool and the order scheduler together
//! behind the operations callers actually want: run a command, push or pull
//! files, list and create remote directories. Command and transfer traffic
//! goes through the scheduler so concurrency stays bounded; metadata-only
//! operations borrow a pooled session directly.

use std::path::Path;
use std::sync::Arc;

use tracing::debug;

use crate::error::{Error, Result};
use crate::pool::{ConnectionPool, PoolConfig, PoolStats, PooledSession};
use crate::ports::{CommandOutput, DataChannel, ExecOptions, Session, SessionFactory};
use crate::sched::{OrderOutcome, OrderPayload, Scheduler, SchedulerConfig};
use crate::transfer::{TransferEngine, TransferFilter, TransferSummary};

pub struct RemoteClient<F: SessionFactory> {
    pool: Arc<ConnectionPool<F>>,
    scheduler: Scheduler<F>,
}

impl<F: SessionFactory> RemoteClient<F> {
    /// Build a client over `factory`. Must be called from within a tokio
    /// runtime; the scheduler pump starts immediately.
    #[must_use]
    pub fn new(factory: F, pool_config: PoolConfig, scheduler_config: SchedulerConfig) -> Self {
        let pool = Arc::new(ConnectionPool::new(factory, pool_config));
        let scheduler = Scheduler::new(Arc::clone(&pool), scheduler_config);
        Self { pool, scheduler }
    }

    /// Run a command on the remote host and collect its output.
    pub async fn exec(&self, command: &str) -> Result<CommandOutput> {
        self.exec_with(command, ExecOptions::default()).await
    }

    /// Run a command with explicit options (timeout override, streamed
    /// output).
    pub async fn exec_with(&self, command: &str, options: ExecOptions) -> Result<CommandOutput> {
        let outcome = self
            .scheduler
            .submit(OrderPayload::Exec {
                command: command.to_string(),
                options,
            })
            .await?;
        match outcome {
            OrderOutcome::Exec(output) => Ok(output),
            OrderOutcome::Transfer(_) => Err(Error::Exec {
                reason: "transfer outcome for exec order".to_string(),
            }),
        }
    }

    /// Upload a local file or directory tree to the remote host.
    ///
    /// A local directory is walked recursively with `filter` applied to
    /// files; a local file is sent as-is. Fails with `NoSuchPath` when the
    /// local path does not exist.
    pub async fn send(
        &self,
        local: &Path,
        remote: &str,
        filter: TransferFilter,
    ) -> Result<TransferSummary> {
        let metadata =
            tokio::fs::metadata(local)
                .await
                .map_err(|_| Error::NoSuchPath {
                    path: local.display().to_string(),
                })?;

        let payload = if metadata.is_dir() {
            OrderPayload::PutRecursive {
                local: local.to_path_buf(),
                remote: remote.to_string(),
                filter,
            }
        } else {
            OrderPayload::Put {
                local: local.to_path_buf(),
                remote: remote.to_string(),
            }
        };
        self.submit_transfer(payload).await
    }

    /// Download a remote file or directory tree.
    ///
    /// The remote path is probed first; a directory is pulled recursively
    /// with `filter` applied to files.
    pub async fn recv(
        &self,
        remote: &str,
        local: &Path,
        filter: TransferFilter,
    ) -> Result<TransferSummary> {
        let remote_is_dir = {
            let (session, mut channel) = self.open_channel().await?;
            let result = TransferEngine::new(channel.as_ref()).is_dir(remote).await;
            close_channel(&mut channel).await;
            drop(session);
            result?
        };

        let payload = if remote_is_dir {
            OrderPayload::GetRecursive {
                remote: remote.to_string(),
                local: local.to_path_buf(),
                filter,
            }
        } else {
            OrderPayload::Get {
                remote: remote.to_string(),
                local: local.to_path_buf(),
            }
        };
        self.submit_transfer(payload).await
    }

    /// List a remote directory. A file yields its own name; a missing path
    /// yields an empty listing.
    pub async fn ls(&self, path: &str) -> Result<Vec<String>> {
        let (session, mut channel) = self.open_channel().await?;
        let result = TransferEngine::new(channel.as_ref()).list(path).await;
        close_channel(&mut channel).await;
        drop(session);
        result
    }

    /// Create a remote directory and any missing ancestors.
    pub async fn mkdir_p(&self, path: &str) -> Result<()> {
        let (session, mut channel) = self.open_channel().await?;
        let result = TransferEngine::new(channel.as_ref()).mkdir_p(path).await;
        close_channel(&mut channel).await;
        drop(session);
        result
    }

    /// Whether the target is currently reachable. Runs the full connect
    /// retry policy, so a transient outage shorter than the retry window
    /// still reports `true`.
    pub async fn can_connect(&self) -> bool {
        self.pool.acquire().await.is_ok()
    }

    /// Current pool occupancy.
    pub async fn stats(&self) -> PoolStats {
        self.pool.stats().await
    }

    /// Stop accepting orders, fail everything still queued, and close all
    /// pooled connections. Orders already running complete first.
    pub async fn disconnect(&self) {
        self.scheduler.shutdown().await;
        self.pool.disconnect_all().await;
    }

    async fn submit_transfer(&self, payload: OrderPayload) -> Result<TransferSummary> {
        match self.scheduler.submit(payload).await? {
            OrderOutcome::Transfer(summary) => Ok(summary),
            OrderOutcome::Exec(_) => Err(Error::Data {
                reason: "exec outcome for transfer order".to_string(),
            }),
        }
    }

    async fn open_channel(
        &self,
    ) -> Result<(PooledSession<F::Session>, Box<dyn DataChannel>)> {
        let session = self.pool.acquire().await?;
        let channel = session.open_data_channel().await?;
        Ok((session, channel))
    }
}

async fn close_channel(channel: &mut Box<dyn DataChannel>) {
    if let Err(e) = channel.close().await {
        debug!(error = %e, "data channel close error");
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::memory::{MemoryFactory, MemoryRemote};

    fn client(remote: &MemoryRemote) -> RemoteClient<MemoryFactory> {
        let pool_config = PoolConfig {
            max_connection: 2,
            connection_retry: 1,
            connection_retry_delay_ms: 1,
        };
        let scheduler_config = SchedulerConfig {
            exec_retry_delay_ms: 5,
            max_running: None,
        };
        RemoteClient::new(
            MemoryFactory::new(remote.clone()),
            pool_config,
            scheduler_config,
        )
    }

    #[tokio::test]
    async fn test_exec_returns_output() {
        let remote = MemoryRemote::new();
        let client = client(&remote);

        let output = client.exec("uname -r").await.unwrap();
        assert_eq!(output.stdout, "uname -r\n");
        assert_eq!(output.exit_status, 0);
    }

    #[tokio::test]
    async fn test_send_missing_local_path_fails() {
        let remote = MemoryRemote::new();
        let client = client(&remote);

        let err = client
            .send(
                Path::new("/definitely/not/here"),
                "/srv/app",
                TransferFilter::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NoSuchPath { .. }));
    }

    #[tokio::test]
    async fn test_send_single_file() {
        let remote = MemoryRemote::new();
        remote.add_dir("/srv");
        let client = client(&remote);

        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("app.conf");
        tokio::fs::write(&local, b"listen 8080\n").await.unwrap();

        let summary = client
            .send(&local, "/srv/app.conf", TransferFilter::default())
            .await
            .unwrap();
        assert_eq!(summary.files, 1);
        assert_eq!(remote.file_data("/srv/app.conf").unwrap(), b"listen 8080\n");
    }

    #[tokio::test]
    async fn test_recv_detects_remote_directory() {
        let remote = MemoryRemote::new();
        remote.add_file("/srv/site/index.html", b"<html/>", 0o644);
        remote.add_file("/srv/site/css/main.css", b"body{}", 0o644);
        let client = client(&remote);

        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("site");
        let summary = client
            .recv("/srv/site", &dest, TransferFilter::default())
            .await
            .unwrap();

        assert_eq!(summary.files, 2);
        assert!(dest.join("index.html").is_file());
        assert!(dest.join("css/main.css").is_file());
    }

    #[tokio::test]
    async fn test_recv_single_file() {
        let remote = MemoryRemote::new();
        remote.add_file("/var/log/app.log", b"ok\n", 0o644);
        let client = client(&remote);

        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("app.log");
        let summary = client
            .recv("/var/log/app.log", &dest, TransferFilter::default())
            .await
            .unwrap();

        assert_eq!(summary.files, 1);
        assert_eq!(tokio::fs::read(&dest).await.unwrap(), b"ok\n");
    }

    #[tokio::test]
    async fn test_ls_and_mkdir_p() {
        let remote = MemoryRemote::new();
        remote.add_file("/srv/app/a.txt", b"a", 0o644);
        remote.add_file("/srv/app/b.txt", b"b", 0o644);
        let client = client(&remote);

        let names = client.ls("/srv/app").await.unwrap();
        assert_eq!(names, vec!["a.txt".to_string(), "b.txt".to_string()]);

        client.mkdir_p("/srv/app/releases/v2").await.unwrap();
        assert!(remote.exists("/srv/app/releases/v2"));
    }

    #[tokio::test]
    async fn test_can_connect_reflects_reachability() {
        let remote = MemoryRemote::new();
        let client = client(&remote);
        assert!(client.can_connect().await);
    }

    #[tokio::test]
    async fn test_disconnect_closes_everything() {
        let remote = MemoryRemote::new();
        let client = client(&remote);

        client.exec("true").await.unwrap();
        client.disconnect().await;

        let stats = client.stats().await;
        assert_eq!(stats.total_sessions, 0);

        let err = client.exec("true").await.unwrap_err();
        assert!(matches!(err, Error::SchedulerClosed));
    }
}
