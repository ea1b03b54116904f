use super::log_buffer::LogBuffer;
use super::protocol::{Request, Response, DAEMON_PROTOCOL_VERSION};
use super::state::PersistedDaemonState;
use crate::clienv;
use crate::config::FleetConfig;
use crate::plugin::{FileIntrospection, PluginManager, PluginPaths, ProcessLauncher};
use crate::reattach::{Handshake, NetAddr};
use crate::wire;
use anyhow::{anyhow, Context, Result};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

#[cfg(unix)]
type Listener = tokio::net::UnixListener;
#[cfg(not(unix))]
type Listener = tokio::net::TcpListener;

pub struct DaemonServer {
    install_dir: PathBuf,
    manager: Arc<PluginManager>,
    log_buffer: Arc<LogBuffer>,
    started_at: Instant,
    version: String,
    shutdown: CancellationToken,
}

impl DaemonServer {
    /// Build a daemon serving the configuration found under `install_dir`.
    pub fn new(install_dir: &Path) -> Result<Self> {
        let config_path = clienv::config_path(install_dir);
        let config = FleetConfig::load(&config_path)
            .with_context(|| format!("Failed to load {}", config_path.display()))?;
        let options = config.manager_options();
        info!(
            plugins = config.plugins.len(),
            connections = config.connections.len(),
            start_timeout_secs = options.start_timeout.as_secs(),
            cache_budget_mb = ?options.cache_max_size_mb,
            "Loaded fleet config"
        );

        let log_buffer = Arc::new(LogBuffer::default());
        let launcher = ProcessLauncher::new(
            PluginPaths::new(clienv::plugins_dir(install_dir)),
            Arc::clone(&log_buffer),
        );
        let introspection = FileIntrospection::new(clienv::limiter_table_path(install_dir));
        let manager = PluginManager::new(
            &config,
            options,
            Arc::new(launcher),
            Arc::new(introspection),
        );

        Ok(Self::with_manager(install_dir, manager, log_buffer))
    }

    pub fn with_manager(
        install_dir: &Path,
        manager: Arc<PluginManager>,
        log_buffer: Arc<LogBuffer>,
    ) -> Self {
        Self {
            install_dir: install_dir.to_path_buf(),
            manager,
            log_buffer,
            started_at: Instant::now(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Token that stops [`DaemonServer::run`] when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Serve until a `Shutdown` request or a termination signal.
    ///
    /// The handshake line is the only thing ever written to stdout; the
    /// launching process reads it and then closes the pipe.
    pub async fn run(self) -> Result<()> {
        info!("Fleet daemon starting (pid {})", std::process::id());

        let (listener, addr) = self.bind().await?;
        let handshake = Handshake::new(DAEMON_PROTOCOL_VERSION, addr.clone());
        {
            let mut stdout = std::io::stdout().lock();
            writeln!(stdout, "{}", handshake.to_line())?;
            stdout.flush()?;
        }
        info!("IPC server listening on {}", addr);

        if let Err(e) = self.manager.refresh_limiter_table().await {
            warn!("Failed to write limiter table: {}", e);
        }

        self.watch_signals()?;

        let server = Arc::new(self);
        info!("Fleet daemon ready");

        loop {
            tokio::select! {
                conn = listener.accept() => {
                    match conn {
                        Ok((stream, _)) => {
                            let server = Arc::clone(&server);
                            tokio::spawn(async move {
                                if let Err(e) = server.handle_connection(stream).await {
                                    error!("Connection handler error: {}", e);
                                }
                            });
                        }
                        Err(e) => error!("Accept error: {}", e),
                    }
                }
                _ = server.shutdown.cancelled() => {
                    info!("Shutdown requested");
                    break;
                }
            }
        }

        info!("Stopping all plugin instances...");
        server.manager.shutdown().await;
        server.cleanup(&addr)?;

        info!("Fleet daemon stopped");
        Ok(())
    }

    #[cfg(unix)]
    async fn bind(&self) -> Result<(Listener, NetAddr)> {
        use std::os::unix::fs::PermissionsExt;

        let socket_path = clienv::daemon_socket_path(&self.install_dir, std::process::id());
        if let Some(parent) = socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if socket_path.exists() {
            std::fs::remove_file(&socket_path)?;
        }

        let listener = Listener::bind(&socket_path)
            .with_context(|| format!("Failed to bind {}", socket_path.display()))?;
        std::fs::set_permissions(&socket_path, std::fs::Permissions::from_mode(0o600))?;

        Ok((listener, NetAddr::unix(socket_path.to_string_lossy())))
    }

    #[cfg(not(unix))]
    async fn bind(&self) -> Result<(Listener, NetAddr)> {
        let listener = Listener::bind("127.0.0.1:0").await?;
        let local = listener.local_addr()?;
        Ok((listener, NetAddr::tcp(local.to_string())))
    }

    fn watch_signals(&self) -> Result<()> {
        let token = self.shutdown.clone();

        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigterm = signal(SignalKind::terminate())?;
            let mut sigint = signal(SignalKind::interrupt())?;

            tokio::spawn(async move {
                tokio::select! {
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                    _ = sigint.recv() => info!("Received SIGINT"),
                    _ = token.cancelled() => return,
                }
                token.cancel();
            });
        }

        #[cfg(not(unix))]
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => info!("Received Ctrl+C"),
                _ = token.cancelled() => return,
            }
            token.cancel();
        });

        Ok(())
    }

    fn cleanup(&self, addr: &NetAddr) -> Result<()> {
        if addr.is_unix() {
            match std::fs::remove_file(&addr.address) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!("Failed to remove socket {}: {}", addr.address, e),
            }
        }

        // only remove the record if it still describes this process
        let state_path = clienv::daemon_state_path(&self.install_dir);
        let state = PersistedDaemonState::load(&state_path)?;
        if state.pid == std::process::id() {
            PersistedDaemonState::delete(&state_path)?;
            debug!("Removed daemon state file");
        }
        Ok(())
    }

    async fn handle_connection<S>(self: &Arc<Self>, mut stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        trace!("New connection accepted");

        let body = wire::read_frame(&mut stream).await?;
        let request = rkyv::from_bytes::<Request, rkyv::rancor::Error>(&body)
            .map_err(|e| anyhow!("Failed to deserialize request: {}", e))?;

        // run in its own task so a panic becomes an error response
        let server = Arc::clone(self);
        let response = match tokio::spawn(async move { server.handle_request(request).await }).await
        {
            Ok(response) => response,
            Err(e) if e.is_panic() => {
                error!("Request handler panicked: {}", e);
                Response::Error {
                    message: "internal error while handling request".to_string(),
                }
            }
            Err(e) => Response::Error {
                message: e.to_string(),
            },
        };

        let frame =
            wire::encode(&response).map_err(|e| anyhow!("Failed to encode response: {}", e))?;
        wire::write_frame(&mut stream, &frame).await?;

        trace!("Response sent");
        Ok(())
    }

    async fn handle_request(self: Arc<Self>, request: Request) -> Response {
        match request {
            Request::Ping => {
                debug!("Handling: Ping");
                Response::Pong {
                    uptime_secs: self.started_at.elapsed().as_secs(),
                    version: self.version.clone(),
                    running_plugins: self.manager.running_count().await as u32,
                }
            }

            Request::Shutdown => {
                info!("Handling: Shutdown");
                self.shutdown.cancel();
                Response::Ok
            }

            Request::Resolve { connections } => {
                debug!("Handling: Resolve({:?})", connections);
                match self.manager.resolve(&connections).await {
                    Ok(resolved) => Response::resolved(resolved),
                    Err(e) => Response::Error {
                        message: e.to_string(),
                    },
                }
            }

            Request::RefreshConnections => {
                info!("Handling: RefreshConnections");
                let server = Arc::clone(&self);
                tokio::spawn(async move { server.reload().await });
                Response::Ok
            }

            Request::ListPlugins => {
                debug!("Handling: ListPlugins");
                Response::Plugins {
                    list: self.manager.list_plugins().await,
                }
            }

            Request::PluginLogs { instance, lines } => {
                debug!("Handling: PluginLogs({}, lines: {})", instance, lines);
                Response::Logs {
                    lines: self.log_buffer.tail(&instance, lines as usize),
                }
            }
        }
    }

    async fn reload(&self) {
        let config_path = clienv::config_path(&self.install_dir);
        let config = match FleetConfig::load(&config_path) {
            Ok(config) => config,
            Err(e) => {
                warn!("Keeping current configuration, reload failed: {}", e);
                return;
            }
        };

        match self.manager.reload(config).await {
            Ok(()) => info!("Configuration reloaded"),
            Err(e) => warn!("Configuration reloaded with errors: {}", e),
        }
    }
}
