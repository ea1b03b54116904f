//! Client side of the daemon socket.

use super::protocol::{PluginInfo, Request, Response};
use crate::plugin::ResolveResponse;
use crate::reattach::{NetAddr, ReattachConfig};
use crate::wire;
use anyhow::{anyhow, bail, Context, Result};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::trace;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

/// Status reported by a live daemon
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonStatus {
    pub uptime_secs: u64,
    pub version: String,
    pub running_plugins: u32,
}

pub struct DaemonClient {
    addr: NetAddr,
    pid: u32,
    timeout: Duration,
}

impl DaemonClient {
    pub fn connect(config: &ReattachConfig) -> Self {
        Self {
            addr: config.addr.clone(),
            pid: config.pid,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn addr(&self) -> &NetAddr {
        &self.addr
    }

    pub async fn ping(&self) -> Result<DaemonStatus> {
        match self.request(Request::Ping).await? {
            Response::Pong {
                uptime_secs,
                version,
                running_plugins,
            } => Ok(DaemonStatus {
                uptime_secs,
                version,
                running_plugins,
            }),
            other => unexpected(other),
        }
    }

    pub async fn resolve(&self, connections: Vec<String>) -> Result<ResolveResponse> {
        match self.request(Request::Resolve { connections }).await? {
            Response::Resolved { succeeded, failed } => Ok(ResolveResponse {
                succeeded: succeeded.into_iter().collect(),
                failed: failed.into_iter().collect(),
            }),
            other => unexpected(other),
        }
    }

    /// Ask the daemon to re-read its configuration; returns before it is applied.
    pub async fn refresh_connections(&self) -> Result<()> {
        match self.request(Request::RefreshConnections).await? {
            Response::Ok => Ok(()),
            other => unexpected(other),
        }
    }

    pub async fn list_plugins(&self) -> Result<Vec<PluginInfo>> {
        match self.request(Request::ListPlugins).await? {
            Response::Plugins { list } => Ok(list),
            other => unexpected(other),
        }
    }

    pub async fn plugin_logs(&self, instance: &str, lines: u32) -> Result<Vec<String>> {
        let request = Request::PluginLogs {
            instance: instance.to_string(),
            lines,
        };
        match self.request(request).await? {
            Response::Logs { lines } => Ok(lines),
            other => unexpected(other),
        }
    }

    pub async fn shutdown(&self) -> Result<()> {
        match self.request(Request::Shutdown).await? {
            Response::Ok => Ok(()),
            other => unexpected(other),
        }
    }

    async fn request(&self, request: Request) -> Result<Response> {
        trace!(request = ?request, addr = %self.addr, "Sending daemon request");
        let frame = wire::encode(&request).map_err(|e| anyhow!("Failed to encode request: {}", e))?;

        tokio::time::timeout(self.timeout, self.exchange(&frame))
            .await
            .map_err(|_| anyhow!("Daemon did not answer within {:?}", self.timeout))?
    }

    async fn exchange(&self, frame: &[u8]) -> Result<Response> {
        #[cfg(unix)]
        if self.addr.is_unix() {
            let mut stream = tokio::net::UnixStream::connect(&self.addr.address)
                .await
                .with_context(|| format!("Failed to connect to daemon at {}", self.addr))?;
            return round_trip(&mut stream, frame).await;
        }

        if self.addr.network != "tcp" {
            bail!("Unsupported daemon network '{}'", self.addr.network);
        }
        let mut stream = tokio::net::TcpStream::connect(&self.addr.address)
            .await
            .with_context(|| format!("Failed to connect to daemon at {}", self.addr))?;
        round_trip(&mut stream, frame).await
    }
}

async fn round_trip<S>(stream: &mut S, frame: &[u8]) -> Result<Response>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    wire::write_frame(stream, frame).await?;
    let body = wire::read_frame(stream).await?;
    let response = rkyv::from_bytes::<Response, rkyv::rancor::Error>(&body)
        .map_err(|e| anyhow!("Failed to decode response: {}", e))?;

    if let Response::Error { message } = response {
        bail!("Daemon error: {}", message);
    }
    Ok(response)
}

fn unexpected<T>(response: Response) -> Result<T> {
    bail!("Unexpected daemon response: {:?}", response)
}
