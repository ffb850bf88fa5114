//! CLI runner functions
//!
//! Each function builds a client from the loaded configuration, performs one
//! operation, and tears the client down before returning. Command output goes
//! to stdout; everything else is logged to stderr.

use std::io::{self, Write};
use std::path::Path;

use tracing::info;

use crate::client::RemoteClient;
use crate::config::Config;
use crate::error::Result;
use crate::ports::ExecOptions;
use crate::ssh::SshSessionFactory;
use crate::transfer::TransferFilter;

fn build_client(config: &Config) -> RemoteClient<SshSessionFactory> {
    let factory = SshSessionFactory::new(config.target.clone(), config.limits.clone());
    RemoteClient::new(
        factory,
        config.pool.pool_config(),
        config.scheduler.scheduler_config(),
    )
}

/// Execute a command on the target host. Returns the remote exit status.
///
/// # Errors
///
/// Returns an error if the connection cannot be established or the command
/// fails to run; a command that runs and exits non-zero is not an error.
pub async fn run_exec(config: &Config, command: &str, timeout: Option<u64>) -> Result<u32> {
    let client = build_client(config);

    let options = ExecOptions {
        timeout_secs: timeout,
        output: None,
    };
    let result = client.exec_with(command, options).await;
    client.disconnect().await;
    let output = result?;

    let mut stdout = io::stdout();
    let _ = stdout.write_all(output.stdout.as_bytes());
    let _ = stdout.flush();
    if !output.stderr.is_empty() {
        let mut stderr = io::stderr();
        let _ = stderr.write_all(output.stderr.as_bytes());
        let _ = stderr.flush();
    }

    info!(
        exit_status = output.exit_status,
        duration_ms = output.duration_ms,
        "command finished"
    );
    Ok(output.exit_status)
}

/// Upload a local file or directory tree.
///
/// # Errors
///
/// Returns an error if the local path is missing, a glob pattern is invalid,
/// or the transfer fails.
pub async fn run_send(
    config: &Config,
    local: &Path,
    remote: &str,
    include: Option<&str>,
    exclude: Option<&str>,
) -> Result<()> {
    let filter = TransferFilter::from_patterns(include, exclude)?;
    let client = build_client(config);

    let result = client.send(local, remote, filter).await;
    client.disconnect().await;
    let summary = result?;

    println!(
        "sent {} file(s), {} byte(s), {} director(ies) created",
        summary.files, summary.bytes, summary.dirs
    );
    Ok(())
}

/// Download a remote file or directory tree.
///
/// # Errors
///
/// Returns an error if the remote path is missing, a glob pattern is invalid,
/// or the transfer fails.
pub async fn run_recv(
    config: &Config,
    remote: &str,
    local: &Path,
    include: Option<&str>,
    exclude: Option<&str>,
) -> Result<()> {
    let filter = TransferFilter::from_patterns(include, exclude)?;
    let client = build_client(config);

    let result = client.recv(remote, local, filter).await;
    client.disconnect().await;
    let summary = result?;

    println!(
        "received {} file(s), {} byte(s), {} director(ies) created",
        summary.files, summary.bytes, summary.dirs
    );
    Ok(())
}

/// List a remote directory.
///
/// # Errors
///
/// Returns an error if the connection cannot be established.
pub async fn run_ls(config: &Config, path: &str) -> Result<()> {
    let client = build_client(config);

    let result = client.ls(path).await;
    client.disconnect().await;

    for name in result? {
        println!("{name}");
    }
    Ok(())
}

/// Create a remote directory and any missing ancestors.
///
/// # Errors
///
/// Returns an error if an ancestor is a file or creation is denied.
pub async fn run_mkdir(config: &Config, path: &str) -> Result<()> {
    let client = build_client(config);

    let result = client.mkdir_p(path).await;
    client.disconnect().await;
    result?;

    println!("created {path}");
    Ok(())
}

/// Probe whether the target host accepts a connection. Returns `true` when
/// reachable.
pub async fn run_check(config: &Config) -> bool {
    let client = build_client(config);

    let reachable = client.can_connect().await;
    client.disconnect().await;

    if reachable {
        println!("{}: reachable", config.target.hostname);
    } else {
        println!("{}: unreachable", config.target.hostname);
    }
    reachable
}
