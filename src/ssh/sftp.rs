//! SFTP data channel adapter.
//!
//! Wraps a russh-sftp session behind the [`DataChannel`] port. Transfers are
//! streamed in fixed-size chunks so file size never affects memory use, and
//! SFTP status codes are translated into the structured path errors the
//! transfer engine branches on.

use std::path::Path;

use async_trait::async_trait;
use russh_sftp::client::SftpSession;
use russh_sftp::protocol::{FileAttributes, OpenFlags, StatusCode};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader, BufWriter};
use tracing::debug;

use crate::error::{Error, Result};
use crate::ports::{DataChannel, DirEntry, FileKind, FileStat};

/// SFTP-backed implementation of the data channel port.
pub struct SftpChannel {
    session: Option<SftpSession>,
    chunk_size: usize,
}

impl SftpChannel {
    #[must_use]
    pub fn new(session: SftpSession, chunk_size: usize) -> Self {
        Self {
            session: Some(session),
            chunk_size: chunk_size.max(1),
        }
    }

    fn session(&self) -> Result<&SftpSession> {
        self.session.as_ref().ok_or(Error::NotConnected)
    }
}

fn stat_from_attrs(attrs: &FileAttributes) -> FileStat {
    let kind = if attrs.is_dir() {
        FileKind::Dir
    } else if attrs.is_symlink() {
        FileKind::Symlink
    } else {
        FileKind::File
    };
    FileStat {
        kind,
        size: attrs.size,
        permissions: attrs.permissions,
    }
}

#[async_trait]
impl DataChannel for SftpChannel {
    async fn stat(&self, path: &str) -> Result<FileStat> {
        let attrs = self
            .session()?
            .metadata(path)
            .await
            .map_err(|e| map_sftp_error(e, path))?;
        Ok(stat_from_attrs(&attrs))
    }

    async fn lstat(&self, path: &str) -> Result<FileStat> {
        let attrs = self
            .session()?
            .symlink_metadata(path)
            .await
            .map_err(|e| map_sftp_error(e, path))?;
        Ok(stat_from_attrs(&attrs))
    }

    async fn read_dir(&self, path: &str) -> Result<Vec<DirEntry>> {
        let entries = self
            .session()?
            .read_dir(path)
            .await
            .map_err(|e| map_sftp_error(e, path))?;

        let mut result = Vec::new();
        for entry in entries {
            let name = entry.file_name();
            if name == "." || name == ".." {
                continue;
            }
            let file_type = entry.file_type();
            let kind = if file_type.is_dir() {
                FileKind::Dir
            } else if file_type.is_symlink() {
                FileKind::Symlink
            } else if file_type.is_file() {
                FileKind::File
            } else {
                FileKind::Other
            };
            let metadata = entry.metadata();
            result.push(DirEntry {
                name,
                stat: FileStat {
                    kind,
                    size: metadata.size,
                    permissions: metadata.permissions,
                },
            });
        }
        Ok(result)
    }

    async fn mkdir(&self, path: &str) -> Result<()> {
        self.session()?
            .create_dir(path)
            .await
            .map_err(|e| map_sftp_error(e, path))
    }

    async fn rmdir(&self, path: &str) -> Result<()> {
        self.session()?
            .remove_dir(path)
            .await
            .map_err(|e| map_sftp_error(e, path))
    }

    async fn unlink(&self, path: &str) -> Result<()> {
        self.session()?
            .remove_file(path)
            .await
            .map_err(|e| map_sftp_error(e, path))
    }

    async fn real_path(&self, path: &str) -> Result<String> {
        let session = self.session()?;
        let resolved = session
            .canonicalize(path)
            .await
            .map_err(|e| map_sftp_error(e, path))?;
        // Servers canonicalize missing paths textually without complaint, so
        // probe the resolved name to get the existence failure callers rely on.
        session
            .metadata(&resolved)
            .await
            .map_err(|e| map_sftp_error(e, path))?;
        Ok(resolved)
    }

    async fn stream_get(&self, remote: &str, local: &Path) -> Result<u64> {
        let mut remote_file = self
            .session()?
            .open(remote)
            .await
            .map_err(|e| map_sftp_error(e, remote))?;

        let local_file = File::create(local).await?;
        let mut writer = BufWriter::with_capacity(self.chunk_size, local_file);
        let mut buffer = vec![0u8; self.chunk_size];
        let mut total: u64 = 0;

        loop {
            let n = remote_file.read(&mut buffer).await.map_err(|e| Error::Data {
                reason: format!("read {remote}: {e}"),
            })?;
            if n == 0 {
                break;
            }
            writer.write_all(&buffer[..n]).await?;
            total += n as u64;
        }
        writer.flush().await?;
        Ok(total)
    }

    async fn stream_put(
        &self,
        local: &Path,
        remote: &str,
        permissions: Option<u32>,
    ) -> Result<u64> {
        let local_file = File::open(local).await?;

        let mut attrs = FileAttributes::empty();
        attrs.permissions = permissions;
        let flags = OpenFlags::CREATE | OpenFlags::TRUNCATE | OpenFlags::WRITE;
        let mut remote_file = self
            .session()?
            .open_with_flags_and_attributes(remote, flags, attrs)
            .await
            .map_err(|e| map_sftp_error(e, remote))?;

        let mut reader = BufReader::with_capacity(self.chunk_size, local_file);
        let mut buffer = vec![0u8; self.chunk_size];
        let mut total: u64 = 0;

        loop {
            let n = reader.read(&mut buffer).await?;
            if n == 0 {
                break;
            }
            remote_file
                .write_all(&buffer[..n])
                .await
                .map_err(|e| Error::Data {
                    reason: format!("write {remote}: {e}"),
                })?;
            total += n as u64;
        }
        remote_file.flush().await.map_err(|e| Error::Data {
            reason: format!("flush {remote}: {e}"),
        })?;
        remote_file.shutdown().await.map_err(|e| Error::Data {
            reason: format!("close {remote}: {e}"),
        })?;
        Ok(total)
    }

    async fn close(&mut self) -> Result<()> {
        let Some(session) = self.session.take() else {
            return Ok(());
        };
        if let Err(e) = session.close().await {
            debug!(error = %e, "sftp channel close error");
        }
        Ok(())
    }
}

fn map_sftp_error(e: russh_sftp::client::error::Error, path: &str) -> Error {
    match e {
        russh_sftp::client::error::Error::Status(status) => {
            classify_status(status.status_code, &status.error_message, path)
        }
        other => Error::Data {
            reason: other.to_string(),
        },
    }
}

/// Map an SFTP status to a path error. `Failure` is the generic catch-all
/// many servers return for collisions and quota problems, so its message
/// text is inspected.
fn classify_status(code: StatusCode, message: &str, path: &str) -> Error {
    let path = path.to_string();
    match code {
        StatusCode::NoSuchFile => Error::NoSuchPath { path },
        StatusCode::PermissionDenied => Error::PermissionDenied { path },
        StatusCode::NoConnection | StatusCode::ConnectionLost => Error::ConnectionReset,
        StatusCode::Failure => {
            let lower = message.to_lowercase();
            if lower.contains("exist") {
                Error::AlreadyExists { path }
            } else if lower.contains("space") || lower.contains("quota") {
                Error::DiskFull { path }
            } else {
                Error::Data {
                    reason: format!("{path}: {message}"),
                }
            }
        }
        _ => Error::Data {
            reason: format!("{path}: {message}"),
        },
    }
}

// ============================================================================
// Tests
// ============================================================================
