//! Command-line interface
//!
//! Thin subcommand layer over [`crate::client::RemoteClient`]; one target
//! host per invocation, taken from the configuration file.

mod runner;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

pub use runner::{run_check, run_exec, run_ls, run_mkdir, run_recv, run_send};

/// sshmux - pooled SSH command execution and file transfer
#[derive(Parser)]
#[command(name = "sshmux")]
#[command(about = "Resilient SSH exec and file transfer over a connection pool")]
#[command(version)]
#[command(after_help = "EXAMPLES:
    # Run a command on the configured target
    sshmux exec \"docker ps\"

    # Upload a file or directory tree
    sshmux send ./dist /srv/app/releases/v42

    # Download, keeping only matching files
    sshmux recv /var/log/app ./logs --include '**/*.log'

    # List a remote directory
    sshmux ls /srv/app

    # Create a directory chain
    sshmux mkdir /srv/app/shared/config

    # Probe reachability
    sshmux check")]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Execute a command on the target host
    Exec {
        /// Command to execute
        command: String,

        /// Timeout in seconds (overrides the configured command timeout)
        #[arg(short, long)]
        timeout: Option<u64>,
    },

    /// Upload a local file or directory tree
    Send {
        /// Local source path
        local: PathBuf,

        /// Remote destination path
        remote: String,

        /// Glob of relative paths to include (directories only)
        #[arg(long)]
        include: Option<String>,

        /// Glob of relative paths to exclude (directories only)
        #[arg(long)]
        exclude: Option<String>,
    },

    /// Download a remote file or directory tree
    Recv {
        /// Remote source path
        remote: String,

        /// Local destination path
        local: PathBuf,

        /// Glob of relative paths to include (directories only)
        #[arg(long)]
        include: Option<String>,

        /// Glob of relative paths to exclude (directories only)
        #[arg(long)]
        exclude: Option<String>,
    },

    /// List a remote directory
    Ls {
        /// Remote path
        path: String,
    },

    /// Create a remote directory and any missing ancestors
    Mkdir {
        /// Remote path
        path: String,
    },

    /// Check whether the target host is reachable
    Check,
}
