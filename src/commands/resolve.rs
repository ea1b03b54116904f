use super::print_plugins;
use anyhow::{bail, Context, Result};
use fleet::daemon::{DaemonClient, DaemonLifecycle};
use std::collections::BTreeMap;
use std::path::Path;

async fn attach(install_dir: &Path) -> Result<DaemonClient> {
    let exe = std::env::current_exe().context("Failed to resolve the fleet executable")?;
    DaemonLifecycle::new(install_dir)
        .with_executable(exe)
        .get_or_start()
        .await
}

/// Client for an already running daemon; never starts one.
fn running(install_dir: &Path) -> Result<DaemonClient> {
    let state = DaemonLifecycle::new(install_dir).state()?;
    match state.reattach_config() {
        Some(config) if state.running => Ok(DaemonClient::connect(&config)),
        _ => bail!("Daemon is not running. Start it with `fleet daemon start`"),
    }
}

pub(crate) async fn cmd_resolve(install_dir: &Path, connections: Vec<String>, json: bool) -> Result<()> {
    let client = attach(install_dir).await?;
    let response = client.resolve(connections).await?;

    let succeeded: BTreeMap<_, _> = response.succeeded.into_iter().collect();
    let failed: BTreeMap<_, _> = response.failed.into_iter().collect();

    if json {
        let out = serde_json::json!({ "succeeded": succeeded, "failed": failed });
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        for (connection, descriptor) in &succeeded {
            let addr = descriptor
                .addr
                .as_ref()
                .map(|a| a.to_string())
                .unwrap_or_else(|| "-".to_string());
            println!("{connection}\tpid {}\t{addr}", descriptor.pid);
        }
        for (instance, error) in &failed {
            eprintln!("{instance}: {error}");
        }
    }

    if !failed.is_empty() {
        bail!("{} plugin instance(s) failed to start", failed.len());
    }
    Ok(())
}

pub(crate) async fn cmd_refresh(install_dir: &Path) -> Result<()> {
    attach(install_dir).await?.refresh_connections().await?;
    println!("Configuration reload requested");
    Ok(())
}

pub(crate) async fn cmd_plugins(install_dir: &Path) -> Result<()> {
    let plugins = running(install_dir)?.list_plugins().await?;
    print_plugins(&plugins);
    Ok(())
}

pub(crate) async fn cmd_logs(install_dir: &Path, instance: &str, lines: u32) -> Result<()> {
    let logs = running(install_dir)?.plugin_logs(instance, lines).await?;
    if logs.is_empty() {
        println!("No logs available for {}", instance);
        return Ok(());
    }
    for line in logs {
        println!("{}", line);
    }
    Ok(())
}
