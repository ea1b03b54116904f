use super::{format_duration, print_plugins};
use crate::args::DaemonCommands;
use anyhow::{Context, Result};
use fleet::clienv;
use fleet::daemon::{DaemonClient, DaemonLifecycle, DaemonServer};
use std::path::Path;

pub(crate) async fn cmd_daemon(command: DaemonCommands, install_dir: &Path) -> Result<()> {
    match command {
        DaemonCommands::Run => cmd_daemon_run(install_dir).await,
        DaemonCommands::Start => cmd_daemon_start(install_dir).await,
        DaemonCommands::Stop => cmd_daemon_stop(install_dir).await,
        DaemonCommands::Restart => cmd_daemon_restart(install_dir).await,
        DaemonCommands::Status => cmd_daemon_status(install_dir).await,
    }
}

async fn cmd_daemon_run(install_dir: &Path) -> Result<()> {
    let server = DaemonServer::new(install_dir)?;
    server.run().await
}

fn self_exe() -> Result<std::path::PathBuf> {
    std::env::current_exe().context("Failed to resolve the fleet executable")
}

async fn cmd_daemon_start(install_dir: &Path) -> Result<()> {
    let lifecycle = DaemonLifecycle::new(install_dir);

    let state = lifecycle.state()?;
    if let Some(config) = state.reattach_config().filter(|_| state.running) {
        let status = DaemonClient::connect(&config).ping().await?;
        println!(
            "Daemon already running (v{}, pid {}, uptime: {})",
            status.version,
            state.pid,
            format_duration(status.uptime_secs)
        );
        return Ok(());
    }

    println!("Starting daemon...");
    let client = lifecycle.start_new_instance(&self_exe()?).await?;
    let status = client.ping().await?;
    println!("Daemon started (v{}, pid {})", status.version, client.pid());
    Ok(())
}

async fn cmd_daemon_stop(install_dir: &Path) -> Result<()> {
    let lifecycle = DaemonLifecycle::new(install_dir);
    if lifecycle.stop().await? {
        println!("Daemon stopped");
    } else {
        println!("Daemon is not running");
    }
    Ok(())
}

async fn cmd_daemon_restart(install_dir: &Path) -> Result<()> {
    println!("Restarting daemon...");
    let client = DaemonLifecycle::new(install_dir)
        .start_new_instance(&self_exe()?)
        .await?;
    println!("Daemon started (pid {})", client.pid());
    Ok(())
}

async fn cmd_daemon_status(install_dir: &Path) -> Result<()> {
    let lifecycle = DaemonLifecycle::new(install_dir);
    let state = lifecycle.state()?;

    println!("Daemon Status");
    let Some(config) = state.reattach_config().filter(|_| state.running) else {
        println!("  Status:   not running");
        println!("  Run `fleet daemon start` to start the daemon");
        return Ok(());
    };

    let client = DaemonClient::connect(&config);
    match client.ping().await {
        Ok(status) => {
            println!("  Status:   running");
            println!("  Version:  {}", status.version);
            println!("  PID:      {}", state.pid);
            println!("  Uptime:   {}", format_duration(status.uptime_secs));
            println!("  Address:  {}", config.addr);
            println!("  Plugins:  {} running", status.running_plugins);
            println!("  State:    {}", lifecycle.state_path().display());
            println!("  Log:      {}", clienv::daemon_log_path(install_dir).display());
            println!();
            print_plugins(&client.list_plugins().await?);
        }
        Err(e) => {
            println!("  Status:   unhealthy (pid {} alive but not responding)", state.pid);
            println!("  Error:    {}", e);
        }
    }

    Ok(())
}
