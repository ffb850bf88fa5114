//! SSH session adapter built on russh.
//!
//! One [`SshSession`] wraps one russh client handle. Connection establishment
//! is split into explicit steps (resolve, TCP connect, handshake, auth) so
//! each failure maps to the error variant the retry classifier expects:
//! DNS and auth failures are permanent, timeouts and refused connections are
//! retryable.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use russh::ChannelMsg;
use russh::client::{self, Config, Handle, Handler};
use russh::keys::key::PrivateKeyWithHashAlg;
use russh::keys::{PublicKey, load_secret_key};
use russh_sftp::client::SftpSession;
use tokio::net::TcpStream;
use tokio::sync::RwLock;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::{AuthConfig, LimitsConfig, TargetConfig};
use crate::error::{Error, Result};
use crate::ports::{CommandOutput, DataChannel, ExecOptions, OutputChunk, Session, SessionFactory};
use crate::ssh::sftp::SftpChannel;

/// russh event handler. Host key checking is accept-all; verification against
/// a known-hosts store is out of scope for this adapter.
struct ClientHandler;

impl Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        debug!(
            algorithm = %server_public_key.algorithm(),
            "accepting server host key"
        );
        Ok(true)
    }
}

/// Builds [`SshSession`] values for one configured target.
#[derive(Debug, Clone)]
pub struct SshSessionFactory {
    target: TargetConfig,
    limits: LimitsConfig,
}

impl SshSessionFactory {
    #[must_use]
    pub fn new(target: TargetConfig, limits: LimitsConfig) -> Self {
        Self { target, limits }
    }
}

#[async_trait]
impl SessionFactory for SshSessionFactory {
    type Session = SshSession;

    async fn open(&self) -> Result<SshSession> {
        Ok(SshSession::new(self.target.clone(), self.limits.clone()))
    }
}

/// One SSH connection to the target host.
///
/// The russh handle lives behind an `RwLock<Option<..>>`: command execution
/// holds a read guard for its duration, while connect and close take the
/// write side to swap the handle in or out.
pub struct SshSession {
    target: TargetConfig,
    limits: LimitsConfig,
    handle: RwLock<Option<Handle<ClientHandler>>>,
}

impl SshSession {
    #[must_use]
    pub fn new(target: TargetConfig, limits: LimitsConfig) -> Self {
        Self {
            target,
            limits,
            handle: RwLock::new(None),
        }
    }

    async fn resolve_addr(&self) -> Result<SocketAddr> {
        let host = &self.target.hostname;
        let mut addrs = tokio::net::lookup_host((host.as_str(), self.target.port))
            .await
            .map_err(|_| Error::Dns { host: host.clone() })?;
        addrs.next().ok_or_else(|| Error::Dns { host: host.clone() })
    }

    async fn establish(&self) -> Result<Handle<ClientHandler>> {
        let connect_timeout = Duration::from_secs(self.limits.connection_timeout_seconds);
        let addr = self.resolve_addr().await?;

        let stream = timeout(connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| Error::ConnectTimeout {
                seconds: self.limits.connection_timeout_seconds,
            })?
            .map_err(|e| Error::Connect {
                host: self.target.hostname.clone(),
                reason: e.to_string(),
            })?;

        let config = Arc::new(Config {
            inactivity_timeout: Some(Duration::from_secs(300)),
            keepalive_interval: Some(Duration::from_secs(30)),
            keepalive_max: 3,
            ..Default::default()
        });

        let mut handle = timeout(
            connect_timeout,
            client::connect_stream(config, stream, ClientHandler),
        )
        .await
        .map_err(|_| Error::ConnectTimeout {
            seconds: self.limits.connection_timeout_seconds,
        })?
        .map_err(|e| map_handshake_error(&e, &self.target.hostname))?;

        self.authenticate(&mut handle).await?;

        info!(
            host = %self.target.hostname,
            port = self.target.port,
            user = %self.target.user,
            "ssh connection established"
        );
        Ok(handle)
    }

    async fn authenticate(&self, handle: &mut Handle<ClientHandler>) -> Result<()> {
        let user = self.target.user.clone();
        let host = self.target.hostname.clone();

        match &self.target.auth {
            AuthConfig::Key { path, passphrase } => {
                let expanded = shellexpand::tilde(path).into_owned();
                let key_pair = load_secret_key(&expanded, passphrase.as_ref().map(|p| p.as_str()))
                    .map_err(|e| {
                        debug!(path = %expanded, error = %e, "private key load failed");
                        Error::KeyInvalid { path: expanded.clone() }
                    })?;

                let rsa_hash = handle
                    .best_supported_rsa_hash()
                    .await
                    .ok()
                    .flatten()
                    .flatten();
                let key = PrivateKeyWithHashAlg::new(Arc::new(key_pair), rsa_hash);

                let auth = handle
                    .authenticate_publickey(&user, key)
                    .await
                    .map_err(|e| map_handshake_error(&e, &host))?;
                if !auth.success() {
                    return Err(Error::Auth { user, host });
                }
            }
            AuthConfig::Password { password } => {
                let auth = handle
                    .authenticate_password(&user, password.as_str())
                    .await
                    .map_err(|e| map_handshake_error(&e, &host))?;
                if !auth.success() {
                    return Err(Error::Auth { user, host });
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Session for SshSession {
    async fn connect(&self) -> Result<()> {
        let mut guard = self.handle.write().await;
        if guard.is_some() {
            return Ok(());
        }
        let handle = self.establish().await?;
        *guard = Some(handle);
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        let guard = self.handle.read().await;
        let Some(handle) = guard.as_ref() else {
            return false;
        };
        // A live connection answers a channel-open probe quickly; a dead one
        // either errors or hangs past the probe timeout.
        matches!(
            timeout(Duration::from_secs(5), handle.channel_open_session()).await,
            Ok(Ok(_))
        )
    }

    async fn exec(&self, command: &str, options: &ExecOptions) -> Result<CommandOutput> {
        let guard = self.handle.read().await;
        let handle = guard.as_ref().ok_or(Error::NotConnected)?;

        let timeout_secs = options
            .timeout_secs
            .unwrap_or(self.limits.command_timeout_seconds);
        let started = Instant::now();

        let mut channel = handle
            .channel_open_session()
            .await
            .map_err(map_channel_open_error)?;
        channel
            .exec(true, command)
            .await
            .map_err(|e| Error::Exec {
                reason: e.to_string(),
            })?;

        let max_output = self.limits.max_output_bytes;
        let mut stdout: Vec<u8> = Vec::new();
        let mut stderr: Vec<u8> = Vec::new();
        let mut exit_status: u32 = 0;
        let mut total_bytes: usize = 0;

        let drain = async {
            loop {
                match channel.wait().await {
                    Some(ChannelMsg::Data { data }) => {
                        total_bytes += data.len();
                        if total_bytes > max_output {
                            return Err(Error::OutputTooLarge {
                                limit_bytes: max_output,
                            });
                        }
                        stdout.extend_from_slice(&data);
                        if let Some(tx) = &options.output {
                            let _ = tx.send(OutputChunk::Stdout(data.to_vec())).await;
                        }
                    }
                    Some(ChannelMsg::ExtendedData { data, ext }) if ext == 1 => {
                        total_bytes += data.len();
                        if total_bytes > max_output {
                            return Err(Error::OutputTooLarge {
                                limit_bytes: max_output,
                            });
                        }
                        stderr.extend_from_slice(&data);
                        if let Some(tx) = &options.output {
                            let _ = tx.send(OutputChunk::Stderr(data.to_vec())).await;
                        }
                    }
                    Some(ChannelMsg::ExitStatus { exit_status: code }) => {
                        exit_status = code;
                    }
                    None => break,
                    Some(_) => {}
                }
            }
            Ok(())
        };

        // bind before matching so the drain future (and its borrow of the
        // channel) is dropped before the arms touch the channel again
        let drained = timeout(Duration::from_secs(timeout_secs), drain).await;
        match drained {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let _ = channel.close().await;
                return Err(e);
            }
            Err(_) => {
                let _ = channel.close().await;
                return Err(Error::Timeout {
                    seconds: timeout_secs,
                });
            }
        }

        #[allow(clippy::cast_possible_truncation)]
        let duration_ms = started.elapsed().as_millis() as u64;
        debug!(
            host = %self.target.hostname,
            exit_status,
            duration_ms,
            "command completed"
        );

        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            exit_status,
            duration_ms,
        })
    }

    async fn open_data_channel(&self) -> Result<Box<dyn DataChannel>> {
        let guard = self.handle.read().await;
        let handle = guard.as_ref().ok_or(Error::NotConnected)?;

        let channel = handle
            .channel_open_session()
            .await
            .map_err(map_channel_open_error)?;
        channel
            .request_subsystem(true, "sftp")
            .await
            .map_err(|e| Error::ChannelOpen {
                reason: format!("sftp subsystem request failed: {e}"),
            })?;
        let sftp = SftpSession::new(channel.into_stream())
            .await
            .map_err(|e| Error::ChannelOpen {
                reason: format!("sftp init failed: {e}"),
            })?;

        Ok(Box::new(SftpChannel::new(sftp, self.limits.chunk_size)))
    }

    async fn close(&self) -> Result<()> {
        let mut guard = self.handle.write().await;
        let Some(handle) = guard.take() else {
            return Ok(());
        };
        match timeout(
            Duration::from_secs(5),
            handle.disconnect(russh::Disconnect::ByApplication, "", "en"),
        )
        .await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!(host = %self.target.hostname, error = %e, "disconnect error");
            }
            Err(_) => {
                warn!(host = %self.target.hostname, "disconnect timed out");
            }
        }
        Ok(())
    }
}

/// Handshake and auth-transport failures all mean the connection never came
/// up; keep the host in the message for the operator.
fn map_handshake_error(e: &russh::Error, host: &str) -> Error {
    match e {
        russh::Error::NoCommonAlgo { .. } => Error::UnsupportedAlgorithm {
            detail: e.to_string(),
        },
        _ => Error::Connect {
            host: host.to_string(),
            reason: e.to_string(),
        },
    }
}

/// A refused channel open is the server throttling us; anything else on an
/// established handle means the connection itself is gone.
fn map_channel_open_error(e: russh::Error) -> Error {
    match e {
        russh::Error::ChannelOpenFailure(reason) => Error::ChannelOpen {
            reason: format!("{reason:?}"),
        },
        _ => Error::NotConnected,
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorClass, classify_connect, classify_exec};

    fn target() -> TargetConfig {
        TargetConfig {
            hostname: "host.invalid".to_string(),
            port: 22,
            user: "deploy".to_string(),
            auth: AuthConfig::Password {
                password: zeroize::Zeroizing::new("secret".to_string()),
            },
        }
    }

    #[test]
    fn test_handshake_error_keeps_host() {
        let err = map_handshake_error(&russh::Error::Disconnect, "web-1");
        match err {
            Error::Connect { host, .. } => assert_eq!(host, "web-1"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_handshake_algorithm_mismatch_is_fatal() {
        let mismatch = russh::Error::NoCommonAlgo {
            kind: russh::AlgorithmKind::Kex,
            ours: vec!["curve25519-sha256".to_string()],
            theirs: vec!["diffie-hellman-group1-sha1".to_string()],
        };
        let err = map_handshake_error(&mismatch, "web-1");
        assert!(matches!(err, Error::UnsupportedAlgorithm { .. }));
        assert_eq!(classify_connect(&err), ErrorClass::ConnectFatal);
    }

    #[test]
    fn test_channel_open_error_without_failure_needs_reconnect() {
        let err = map_channel_open_error(russh::Error::Disconnect);
        assert!(matches!(err, Error::NotConnected));
        assert_eq!(classify_exec(&err), ErrorClass::NeedsReconnect);
    }

    #[tokio::test]
    async fn test_unconnected_session_rejects_exec() {
        let session = SshSession::new(target(), LimitsConfig::default());
        let err = session
            .exec("true", &ExecOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotConnected));
    }

    #[tokio::test]
    async fn test_unconnected_session_reports_disconnected() {
        let session = SshSession::new(target(), LimitsConfig::default());
        assert!(!session.is_connected().await);
    }

    #[tokio::test]
    async fn test_close_without_connection_is_ok() {
        let session = SshSession::new(target(), LimitsConfig::default());
        session.close().await.unwrap();
        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_factory_opens_unconnected_sessions() {
        let factory = SshSessionFactory::new(target(), LimitsConfig::default());
        let session = factory.open().await.unwrap();
        assert!(!session.is_connected().await);
    }
}
