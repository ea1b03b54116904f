//! Start, find and stop the single daemon of an install directory.
//!
//! The daemon is a detached `fleet daemon run` process. Whoever starts it
//! records its address, pid and executable in the state file; every later
//! invocation reattaches through that record.

use super::client::DaemonClient;
use super::process;
use super::protocol::DAEMON_PROTOCOL_VERSION;
use super::state::PersistedDaemonState;
use crate::clienv;
use crate::reattach::{Handshake, WIRE_PROTOCOL};
use anyhow::{anyhow, bail, Context, Result};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

const DEFAULT_START_TIMEOUT: Duration = Duration::from_secs(30);
const SHUTDOWN_RPC_TIMEOUT: Duration = Duration::from_secs(5);
const EXIT_WAIT: Duration = Duration::from_secs(5);
const EXIT_POLL: Duration = Duration::from_millis(100);

pub struct DaemonLifecycle {
    install_dir: PathBuf,
    state_path: PathBuf,
    /// Used when no daemon was ever recorded
    executable: Option<PathBuf>,
    start_timeout: Duration,
}

impl DaemonLifecycle {
    pub fn new(install_dir: impl Into<PathBuf>) -> Self {
        let install_dir = install_dir.into();
        Self {
            state_path: clienv::daemon_state_path(&install_dir),
            install_dir,
            executable: None,
            start_timeout: DEFAULT_START_TIMEOUT,
        }
    }

    pub fn with_executable(mut self, executable: impl Into<PathBuf>) -> Self {
        self.executable = Some(executable.into());
        self
    }

    pub fn with_start_timeout(mut self, timeout: Duration) -> Self {
        self.start_timeout = timeout;
        self
    }

    pub fn state_path(&self) -> &Path {
        &self.state_path
    }

    /// Current record, verified against the process table.
    pub fn state(&self) -> Result<PersistedDaemonState> {
        PersistedDaemonState::load(&self.state_path)
    }

    /// Start a fresh daemon from `self_exe`, stopping any recorded one first.
    pub async fn start_new_instance(&self, self_exe: &Path) -> Result<DaemonClient> {
        let state = self.state()?;
        if state.running {
            info!(pid = state.pid, "Stopping running daemon before starting a new one");
            self.stop_recorded(&state).await?;
        }

        let exe = std::fs::canonicalize(self_exe)
            .with_context(|| format!("Failed to resolve executable {}", self_exe.display()))?;
        self.launch(&exe).await
    }

    /// Reattach to the recorded daemon, starting one if none is alive.
    pub async fn get_or_start(&self) -> Result<DaemonClient> {
        let state = self.state()?;
        if state.running {
            if let Some(config) = state.reattach_config() {
                debug!(pid = state.pid, addr = %config.addr, "Reattaching to daemon");
                return Ok(DaemonClient::connect(&config));
            }
            warn!(pid = state.pid, "Daemon record has no address, restarting it");
            self.stop_recorded(&state).await?;
        }

        let exe = if !state.executable.as_os_str().is_empty() {
            state.executable.clone()
        } else if let Some(exe) = &self.executable {
            std::fs::canonicalize(exe)
                .with_context(|| format!("Failed to resolve executable {}", exe.display()))?
        } else {
            bail!("No daemon executable recorded; run `fleet daemon start` first");
        };

        // one start attempt, then the record must describe a live daemon
        self.launch(&exe).await?;
        let state = self.state()?;
        match state.reattach_config() {
            Some(config) if state.running => Ok(DaemonClient::connect(&config)),
            _ => bail!("Daemon did not stay up after starting {}", exe.display()),
        }
    }

    /// Stop the recorded daemon. Returns false when none was running.
    pub async fn stop(&self) -> Result<bool> {
        let state = self.state()?;
        if !state.running {
            debug!("No running daemon recorded");
            return Ok(false);
        }
        self.stop_recorded(&state).await?;
        Ok(true)
    }

    /// Graceful RPC shutdown, then kill, then forget the record.
    async fn stop_recorded(&self, state: &PersistedDaemonState) -> Result<()> {
        if let Some(config) = state.reattach_config() {
            let client = DaemonClient::connect(&config).with_timeout(SHUTDOWN_RPC_TIMEOUT);
            match client.shutdown().await {
                Ok(()) => {
                    if wait_for_exit(state.pid).await {
                        info!(pid = state.pid, "Daemon stopped");
                    }
                }
                Err(e) => warn!(pid = state.pid, "Graceful daemon shutdown failed: {}", e),
            }
        }

        if process::is_process_running(state.pid) {
            warn!(pid = state.pid, "Killing daemon");
            process::kill_process(state.pid)
                .with_context(|| format!("Failed to kill daemon pid {}", state.pid))?;
            wait_for_exit(state.pid).await;
        }

        PersistedDaemonState::delete(&self.state_path)
    }

    async fn launch(&self, exe: &Path) -> Result<DaemonClient> {
        info!(exe = %exe.display(), install_dir = %self.install_dir.display(), "Starting daemon");

        let mut cmd = Command::new(exe);
        cmd.arg("daemon")
            .arg("run")
            .arg("--install-dir")
            .arg(&self.install_dir);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::null());
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd
            .spawn()
            .with_context(|| format!("Failed to spawn daemon {}", exe.display()))?;
        let pid = child
            .id()
            .ok_or_else(|| anyhow!("Daemon exited immediately"))?;

        let handshake = match self.read_handshake(&mut child).await {
            Ok(handshake) => handshake,
            Err(e) => {
                warn!(pid, "Daemon handshake failed: {}", e);
                let _ = child.kill().await;
                return Err(e);
            }
        };

        let state = PersistedDaemonState::new(&handshake, pid, exe.to_path_buf());
        state.save(&self.state_path)?;
        info!(pid, addr = %handshake.addr, "Daemon started");

        let config = state
            .reattach_config()
            .ok_or_else(|| anyhow!("Daemon handshake carried no address"))?;
        Ok(DaemonClient::connect(&config))
    }

    async fn read_handshake(&self, child: &mut tokio::process::Child) -> Result<Handshake> {
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("Daemon stdout not captured"))?;
        let mut lines = BufReader::new(stdout).lines();

        let line = tokio::time::timeout(self.start_timeout, lines.next_line())
            .await
            .map_err(|_| anyhow!("Daemon did not report its address within {:?}", self.start_timeout))??
            .ok_or_else(|| anyhow!("Daemon exited before reporting its address"))?;

        let handshake = Handshake::parse(&line)?;
        if handshake.protocol != WIRE_PROTOCOL || handshake.app_version != DAEMON_PROTOCOL_VERSION {
            bail!(
                "Daemon speaks {} v{}, expected {} v{}",
                handshake.protocol,
                handshake.app_version,
                WIRE_PROTOCOL,
                DAEMON_PROTOCOL_VERSION
            );
        }
        Ok(handshake)
    }
}

/// Poll the process table until `pid` is gone. Returns false on timeout.
async fn wait_for_exit(pid: u32) -> bool {
    let deadline = tokio::time::Instant::now() + EXIT_WAIT;
    while process::is_process_running(pid) {
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(EXIT_POLL).await;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reattach::NetAddr;

    #[tokio::test]
    async fn stop_without_state_is_a_noop() {
        let tmp = tempfile::tempdir().unwrap();
        let lifecycle = DaemonLifecycle::new(tmp.path());
        assert!(!lifecycle.stop().await.unwrap());
    }

    #[tokio::test]
    async fn never_started_daemon_needs_an_executable() {
        let tmp = tempfile::tempdir().unwrap();
        let lifecycle = DaemonLifecycle::new(tmp.path());
        let err = lifecycle.get_or_start().await.err().unwrap();
        assert!(err.to_string().contains("No daemon executable"));
    }

    #[tokio::test]
    async fn live_record_is_reattached() {
        let tmp = tempfile::tempdir().unwrap();
        let lifecycle = DaemonLifecycle::new(tmp.path());
        PersistedDaemonState::new(
            &Handshake::new(DAEMON_PROTOCOL_VERSION, NetAddr::unix("/tmp/fleet-test.sock")),
            std::process::id(),
            PathBuf::from("/usr/local/bin/fleet"),
        )
        .save(lifecycle.state_path())
        .unwrap();

        let client = lifecycle.get_or_start().await.unwrap();
        assert_eq!(client.pid(), std::process::id());
        assert_eq!(client.addr(), &NetAddr::unix("/tmp/fleet-test.sock"));
    }

    #[cfg(unix)]
    fn fake_daemon(dir: &Path, handshake: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let exe = dir.join("fake-fleet");
        std::fs::write(&exe, format!("#!/bin/sh\necho '{handshake}'\nexec sleep 30\n")).unwrap();
        std::fs::set_permissions(&exe, std::fs::Permissions::from_mode(0o755)).unwrap();
        exe
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn started_daemon_is_recorded_then_killed() {
        let tmp = tempfile::tempdir().unwrap();
        let exe = fake_daemon(tmp.path(), "1|1|unix|/tmp/fleet-fake.sock|fleet-rkyv");
        let lifecycle = DaemonLifecycle::new(tmp.path().join("install"));

        let client = lifecycle.start_new_instance(&exe).await.unwrap();
        let state = lifecycle.state().unwrap();
        assert!(state.running);
        assert_eq!(state.pid, client.pid());
        assert_eq!(state.executable, std::fs::canonicalize(&exe).unwrap());

        // nothing listens on the socket, so stop falls back to killing
        assert!(lifecycle.stop().await.unwrap());
        assert!(!process::is_process_running(client.pid()));
        assert!(!lifecycle.state_path().exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn wrong_protocol_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let exe = fake_daemon(tmp.path(), "1|7|unix|/tmp/fleet-fake.sock|fleet-rkyv");
        let lifecycle = DaemonLifecycle::new(tmp.path().join("install"))
            .with_start_timeout(Duration::from_secs(5));

        let err = lifecycle.start_new_instance(&exe).await.err().unwrap();
        assert!(err.to_string().contains("expected fleet-rkyv v1"));
        assert!(!lifecycle.state_path().exists());
    }
}
