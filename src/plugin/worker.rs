//! Process-backed workers: spawn, handshake, and the control protocol.
//!
//! A worker is started with stdout piped. Its first stdout line is the
//! handshake (see [`crate::reattach`]); every later stdout/stderr line is
//! captured into the [`LogBuffer`]. Control requests then go over the
//! announced socket, one framed request and response per connection.

use super::cache::CacheOptions;
use super::client::{LaunchRequest, PluginClient, PluginLauncher};
use super::connection::{ConnectionConfig, ConnectionDelta};
use super::limiter::LimiterDefinition;
use super::resolver::PluginPaths;
use crate::clienv;
use crate::daemon::log_buffer::LogBuffer;
use crate::daemon::process;
use crate::error::{FleetError, Result};
use crate::reattach::{Capabilities, Handshake};
use crate::wire;
use async_trait::async_trait;
use rkyv::{Archive, Deserialize, Serialize};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader, Lines};
use tokio::process::{Child, ChildStdout, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Env var telling a worker which instance it serves.
pub const PLUGIN_INSTANCE_ENV: &str = "FLEET_PLUGIN_INSTANCE";

const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(30);

/// Control request from the manager to a worker
#[derive(Archive, Deserialize, Serialize, Debug, Clone)]
#[rkyv(derive(Debug))]
pub enum WorkerRequest {
    GetSupportedOperations,
    GetPluginRateLimiters,
    /// Full configuration, sent once right after startup
    SetAllConnectionConfigs {
        configs: Vec<ConnectionConfig>,
        max_cache_size_mb: u64,
    },
    /// Incremental change for an already configured worker
    UpdateConnectionConfigs {
        delta: ConnectionDelta,
        max_cache_size_mb: u64,
    },
    SetCacheOptions { options: CacheOptions },
    SetRateLimiters { limiters: Vec<LimiterDefinition> },
}

/// Worker reply
#[derive(Archive, Deserialize, Serialize, Debug, Clone)]
#[rkyv(derive(Debug))]
pub enum WorkerResponse {
    Ok,
    SupportedOperations { capabilities: Capabilities },
    RateLimiters { limiters: Vec<LimiterDefinition> },
    /// Connections the worker refused, with reasons
    ConfigFailures { failures: Vec<(String, String)> },
    Error { message: String },
}

pub struct ProcessPluginClient {
    instance: String,
    pid: u32,
    handshake: Handshake,
    child: Mutex<Option<Child>>,
    rpc_timeout: Duration,
}

impl ProcessPluginClient {
    async fn call(&self, request: WorkerRequest) -> Result<WorkerResponse> {
        let frame = wire::encode(&request)?;
        debug!(instance = %self.instance, request = ?request, "Sending worker request");

        let response = tokio::time::timeout(self.rpc_timeout, self.exchange(&frame))
            .await
            .map_err(|_| {
                FleetError::Rpc(format!(
                    "worker '{}' did not answer within {:?}",
                    self.instance, self.rpc_timeout
                ))
            })??;

        match response {
            WorkerResponse::Error { message } => Err(FleetError::Rpc(message)),
            WorkerResponse::ConfigFailures { failures } if !failures.is_empty() => {
                Err(FleetError::Rpc(
                    failures
                        .iter()
                        .map(|(conn, err)| format!("{conn}: {err}"))
                        .collect::<Vec<_>>()
                        .join("; "),
                ))
            }
            other => Ok(other),
        }
    }

    async fn exchange(&self, frame: &[u8]) -> Result<WorkerResponse> {
        let addr = &self.handshake.addr;

        #[cfg(unix)]
        if addr.is_unix() {
            let mut stream = tokio::net::UnixStream::connect(&addr.address).await?;
            return round_trip(&mut stream, frame).await;
        }

        let mut stream = tokio::net::TcpStream::connect(&addr.address).await?;
        round_trip(&mut stream, frame).await
    }

    async fn expect_ok(&self, request: WorkerRequest) -> Result<()> {
        match self.call(request).await? {
            WorkerResponse::Ok | WorkerResponse::ConfigFailures { .. } => Ok(()),
            other => Err(unexpected(&other)),
        }
    }
}

async fn round_trip<S>(stream: &mut S, frame: &[u8]) -> Result<WorkerResponse>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    wire::write_frame(stream, frame).await?;
    let body = wire::read_frame(stream).await?;
    Ok(rkyv::from_bytes::<WorkerResponse, rkyv::rancor::Error>(&body)?)
}

fn unexpected(response: &WorkerResponse) -> FleetError {
    FleetError::Rpc(format!("unexpected worker response: {response:?}"))
}

#[async_trait]
impl PluginClient for ProcessPluginClient {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn handshake(&self) -> &Handshake {
        &self.handshake
    }

    fn is_running(&self) -> bool {
        // reap our own child first so an exited worker is not seen as a zombie pid
        if let Ok(mut guard) = self.child.try_lock() {
            match guard.as_mut().map(|c| c.try_wait()) {
                Some(Ok(Some(status))) => {
                    debug!(instance = %self.instance, pid = self.pid, %status, "Worker has exited");
                    return false;
                }
                None => return false,
                _ => {}
            }
        }
        process::is_process_running(self.pid)
    }

    async fn supported_operations(&self) -> Result<Capabilities> {
        match self.call(WorkerRequest::GetSupportedOperations).await? {
            WorkerResponse::SupportedOperations { capabilities } => Ok(capabilities),
            other => Err(unexpected(&other)),
        }
    }

    async fn plugin_rate_limiters(&self) -> Result<Vec<LimiterDefinition>> {
        match self.call(WorkerRequest::GetPluginRateLimiters).await? {
            WorkerResponse::RateLimiters { limiters } => Ok(limiters),
            other => Err(unexpected(&other)),
        }
    }

    async fn set_all_connection_configs(
        &self,
        configs: &[ConnectionConfig],
        max_cache_size_mb: u64,
    ) -> Result<()> {
        self.expect_ok(WorkerRequest::SetAllConnectionConfigs {
            configs: configs.to_vec(),
            max_cache_size_mb,
        })
        .await
    }

    async fn update_connection_configs(
        &self,
        delta: &ConnectionDelta,
        max_cache_size_mb: u64,
    ) -> Result<()> {
        self.expect_ok(WorkerRequest::UpdateConnectionConfigs {
            delta: delta.clone(),
            max_cache_size_mb,
        })
        .await
    }

    async fn set_cache_options(&self, options: &CacheOptions) -> Result<()> {
        self.expect_ok(WorkerRequest::SetCacheOptions {
            options: options.clone(),
        })
        .await
    }

    async fn set_rate_limiters(&self, limiters: &[LimiterDefinition]) -> Result<()> {
        self.expect_ok(WorkerRequest::SetRateLimiters {
            limiters: limiters.to_vec(),
        })
        .await
    }

    async fn kill(&self) {
        let mut guard = self.child.lock().await;
        if let Some(mut child) = guard.take() {
            info!(instance = %self.instance, pid = self.pid, "Killing plugin process");
            if let Err(e) = child.kill().await {
                warn!(instance = %self.instance, pid = self.pid, "Failed to kill plugin process: {}", e);
            }
        }
    }
}

/// Launches workers found under the install directory.
pub struct ProcessLauncher {
    paths: PluginPaths,
    log_buffer: Arc<LogBuffer>,
    rpc_timeout: Duration,
}

impl ProcessLauncher {
    pub fn new(paths: PluginPaths, log_buffer: Arc<LogBuffer>) -> Self {
        Self {
            paths,
            log_buffer,
            rpc_timeout: DEFAULT_RPC_TIMEOUT,
        }
    }

    pub fn with_rpc_timeout(mut self, timeout: Duration) -> Self {
        self.rpc_timeout = timeout;
        self
    }

    async fn await_handshake(
        &self,
        request: &LaunchRequest,
        child: &mut Child,
    ) -> Result<(Handshake, Lines<BufReader<ChildStdout>>)> {
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| FleetError::Handshake("worker stdout not captured".to_string()))?;
        let mut lines = BufReader::new(stdout).lines();

        let line = match tokio::time::timeout(request.start_timeout, lines.next_line()).await {
            Ok(Ok(Some(line))) => line,
            Ok(Ok(None)) => {
                return Err(FleetError::Handshake(
                    "worker exited before printing its handshake".to_string(),
                ))
            }
            Ok(Err(e)) => return Err(FleetError::Handshake(e.to_string())),
            Err(_) => {
                return Err(FleetError::StartTimeout {
                    instance: request.instance.clone(),
                    secs: request.start_timeout.as_secs(),
                })
            }
        };

        Ok((Handshake::parse(&line)?, lines))
    }
}

#[async_trait]
impl PluginLauncher for ProcessLauncher {
    async fn launch(&self, request: &LaunchRequest) -> Result<Arc<dyn PluginClient>> {
        let exe = self.paths.executable(&request.plugin)?;

        let mut cmd = Command::new(&exe);
        cmd.env(PLUGIN_INSTANCE_ENV, &request.instance);
        if let Some(mb) = request.memory_max_mb {
            cmd.env(clienv::PLUGIN_MEMORY_ENV, mb.to_string());
        }
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| FleetError::PluginStart {
            instance: request.instance.clone(),
            reason: format!("failed to spawn {}: {}", exe.display(), e),
        })?;
        let pid = child.id().ok_or_else(|| FleetError::PluginStart {
            instance: request.instance.clone(),
            reason: "process exited immediately".to_string(),
        })?;
        info!(instance = %request.instance, pid, exe = %exe.display(), "Spawned plugin process");

        if let Some(stderr) = child.stderr.take() {
            let buf = Arc::clone(&self.log_buffer);
            let name = request.instance.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    buf.push(&name, line);
                }
            });
        }

        let (handshake, mut stdout_lines) = match self.await_handshake(request, &mut child).await {
            Ok(ok) => ok,
            Err(e) => {
                warn!(instance = %request.instance, pid, "Plugin handshake failed: {}", e);
                let _ = child.kill().await;
                return Err(e);
            }
        };
        debug!(instance = %request.instance, addr = %handshake.addr, "Plugin handshake complete");

        let buf = Arc::clone(&self.log_buffer);
        let name = request.instance.clone();
        tokio::spawn(async move {
            while let Ok(Some(line)) = stdout_lines.next_line().await {
                buf.push(&name, line);
            }
        });

        Ok(Arc::new(ProcessPluginClient {
            instance: request.instance.clone(),
            pid,
            handshake,
            child: Mutex::new(Some(child)),
            rpc_timeout: self.rpc_timeout,
        }))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    fn install_script(dir: &std::path::Path, plugin: &str, body: &str) {
        let plugin_dir = dir.join(plugin);
        std::fs::create_dir_all(&plugin_dir).unwrap();
        let exe = plugin_dir.join(format!("{plugin}.plugin"));
        std::fs::write(&exe, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&exe, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    fn request(plugin: &str) -> LaunchRequest {
        LaunchRequest {
            instance: plugin.to_string(),
            plugin: plugin.to_string(),
            memory_max_mb: Some(512),
            start_timeout: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn launch_reads_handshake_and_captures_logs() {
        let tmp = tempfile::tempdir().unwrap();
        install_script(
            tmp.path(),
            "echo",
            "echo \"1|1|unix|/tmp/echo-$FLEET_PLUGIN_MEMORY_MAX_MB.sock|fleet-rkyv\"\necho ready >&2\nexec sleep 30",
        );

        let logs = Arc::new(LogBuffer::default());
        let launcher = ProcessLauncher::new(PluginPaths::new(tmp.path()), Arc::clone(&logs));
        let client = launcher.launch(&request("echo")).await.unwrap();

        assert_eq!(client.handshake().addr.address, "/tmp/echo-512.sock");
        assert!(client.is_running());

        for _ in 0..50 {
            if !logs.tail("echo", 10).is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(logs.tail("echo", 10), vec!["ready"]);

        client.kill().await;
        assert!(!client.is_running());
    }

    #[tokio::test]
    async fn bad_handshake_is_a_start_failure() {
        let tmp = tempfile::tempdir().unwrap();
        install_script(tmp.path(), "noisy", "echo 'hello there'\nexec sleep 30");

        let launcher = ProcessLauncher::new(
            PluginPaths::new(tmp.path()),
            Arc::new(LogBuffer::default()),
        );
        let err = launcher.launch(&request("noisy")).await.err().unwrap();
        assert!(matches!(err, FleetError::Handshake(_)));
    }

    #[tokio::test]
    async fn silent_worker_times_out() {
        let tmp = tempfile::tempdir().unwrap();
        install_script(tmp.path(), "mute", "exec sleep 30");

        let launcher = ProcessLauncher::new(
            PluginPaths::new(tmp.path()),
            Arc::new(LogBuffer::default()),
        );
        let mut req = request("mute");
        req.start_timeout = Duration::from_millis(200);
        let err = launcher.launch(&req).await.err().unwrap();
        assert!(matches!(err, FleetError::StartTimeout { .. }));
    }
}
