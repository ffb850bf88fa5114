use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use sshmux::cli::{Cli, Commands, run_check, run_exec, run_ls, run_mkdir, run_recv, run_send};
use sshmux::config::{default_config_path, load_config};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logging goes to stderr; stdout carries command output and listings.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let config_path = cli.config.unwrap_or_else(default_config_path);
    info!(config = %config_path.display(), "loading configuration");

    let config = load_config(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    match cli.command {
        Commands::Exec { command, timeout } => {
            let exit_status = run_exec(&config, &command, timeout).await?;
            if exit_status != 0 {
                std::process::exit(i32::try_from(exit_status).unwrap_or(1));
            }
        }
        Commands::Send {
            local,
            remote,
            include,
            exclude,
        } => {
            run_send(
                &config,
                &local,
                &remote,
                include.as_deref(),
                exclude.as_deref(),
            )
            .await?;
        }
        Commands::Recv {
            remote,
            local,
            include,
            exclude,
        } => {
            run_recv(
                &config,
                &remote,
                &local,
                include.as_deref(),
                exclude.as_deref(),
            )
            .await?;
        }
        Commands::Ls { path } => {
            run_ls(&config, &path).await?;
        }
        Commands::Mkdir { path } => {
            run_mkdir(&config, &path).await?;
        }
        Commands::Check => {
            if !run_check(&config).await {
                std::process::exit(1);
            }
        }
    }

    Ok(())
}
