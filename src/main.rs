mod args;
mod commands;

use anyhow::Context;
use args::{Cli, Commands, DaemonCommands};
use clap::Parser;
use fleet::clienv;
use std::path::Path;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let install_dir = cli.install_dir.clone().unwrap_or_else(clienv::install_dir);

    // the daemon's stdout carries the handshake, so it logs to a file
    let is_daemon = matches!(
        &cli.command,
        Commands::Daemon { command } if *command == DaemonCommands::Run
    );
    let log_file = is_daemon.then(|| clienv::daemon_log_path(&install_dir));
    init_tracing(log_file.as_deref())?;

    match cli.command {
        Commands::Daemon { command } => {
            commands::daemon::cmd_daemon(command, &install_dir).await?
        }
        Commands::Resolve { connections, json } => {
            commands::resolve::cmd_resolve(&install_dir, connections, json).await?
        }
        Commands::Refresh => commands::resolve::cmd_refresh(&install_dir).await?,
        Commands::Plugins => commands::resolve::cmd_plugins(&install_dir).await?,
        Commands::Logs { instance, lines } => {
            commands::resolve::cmd_logs(&install_dir, &instance, lines).await?
        }
    }

    Ok(())
}

fn init_tracing(log_file: Option<&Path>) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("fleet=info"));

    match log_file {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {}", path.display()))?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(std::sync::Mutex::new(file))
                .init();
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .init();
        }
    }
    Ok(())
}
