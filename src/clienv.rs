use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Copy)]
pub enum EnvVar {
    FleetInstallDir,
    FleetPluginStartTimeout,
    FleetCacheMaxSizeMb,
    FleetPluginMemoryMaxMb,
    FleetCache,
    FleetCacheTtl,
}

impl EnvVar {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FleetInstallDir => "FLEET_INSTALL_DIR",
            Self::FleetPluginStartTimeout => "FLEET_PLUGIN_START_TIMEOUT",
            Self::FleetCacheMaxSizeMb => "FLEET_CACHE_MAX_SIZE_MB",
            Self::FleetPluginMemoryMaxMb => "FLEET_PLUGIN_MEMORY_MAX_MB",
            Self::FleetCache => "FLEET_CACHE",
            Self::FleetCacheTtl => "FLEET_CACHE_TTL",
        }
    }
}

const FLEET_SUBDIR: &str = "fleet";
const DEFAULT_PLUGIN_START_TIMEOUT_SECS: u64 = 30;
const DEFAULT_CACHE_TTL_SECS: u64 = 300;

/// Name of the env var a worker reads its memory ceiling from.
pub const PLUGIN_MEMORY_ENV: &str = "FLEET_PLUGIN_MEMORY_MAX_MB";

fn env_opt(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: std::str::FromStr>(var: EnvVar) -> Option<T> {
    let raw = env_opt(var.as_str())?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(var = var.as_str(), value = %raw, "Ignoring unparsable env var");
            None
        }
    }
}

pub fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// Install directory ($FLEET_INSTALL_DIR or ~/.local/share/fleet)
pub fn install_dir() -> PathBuf {
    let dir = env_opt(EnvVar::FleetInstallDir.as_str())
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("~/.local/share"))
                .join(FLEET_SUBDIR)
        });
    tracing::trace!(dir = %dir.display(), "Resolved install directory");
    dir
}

/// Internal state directory (<install>/internal)
pub fn internal_dir(install_dir: &Path) -> PathBuf {
    install_dir.join("internal")
}

/// Persisted daemon state (<install>/internal/daemon.json)
pub fn daemon_state_path(install_dir: &Path) -> PathBuf {
    internal_dir(install_dir).join("daemon.json")
}

/// Limiter introspection table (<install>/internal/plugin_limiters.json)
pub fn limiter_table_path(install_dir: &Path) -> PathBuf {
    internal_dir(install_dir).join("plugin_limiters.json")
}

/// Daemon log file (<install>/logs/daemon.log)
pub fn daemon_log_path(install_dir: &Path) -> PathBuf {
    install_dir.join("logs").join("daemon.log")
}

/// Installed plugins (<install>/plugins)
pub fn plugins_dir(install_dir: &Path) -> PathBuf {
    install_dir.join("plugins")
}

/// Declarative configuration (<install>/config/fleet.toml)
pub fn config_path(install_dir: &Path) -> PathBuf {
    install_dir.join("config").join("fleet.toml")
}

/// Daemon socket (<install>/internal/daemon-<pid>.sock)
pub fn daemon_socket_path(install_dir: &Path, pid: u32) -> PathBuf {
    internal_dir(install_dir).join(format!("daemon-{pid}.sock"))
}

/// Plugin start timeout ($FLEET_PLUGIN_START_TIMEOUT seconds)
pub fn plugin_start_timeout() -> Option<Duration> {
    let secs: Option<u64> = env_parse(EnvVar::FleetPluginStartTimeout);
    tracing::trace!(value = ?secs, "FLEET_PLUGIN_START_TIMEOUT env var");
    secs.map(Duration::from_secs)
}

pub fn default_plugin_start_timeout() -> Duration {
    Duration::from_secs(DEFAULT_PLUGIN_START_TIMEOUT_SECS)
}

/// Global cache budget ($FLEET_CACHE_MAX_SIZE_MB)
pub fn cache_max_size_mb() -> Option<u64> {
    let val = env_parse(EnvVar::FleetCacheMaxSizeMb);
    tracing::trace!(value = ?val, "FLEET_CACHE_MAX_SIZE_MB env var");
    val
}

/// Per-plugin memory ceiling override ($FLEET_PLUGIN_MEMORY_MAX_MB)
pub fn plugin_memory_max_mb() -> Option<u64> {
    let val = env_parse(EnvVar::FleetPluginMemoryMaxMb);
    tracing::trace!(value = ?val, "FLEET_PLUGIN_MEMORY_MAX_MB env var");
    val
}

/// Cache enabled flag ($FLEET_CACHE)
pub fn cache_enabled() -> Option<bool> {
    let val = env_opt(EnvVar::FleetCache.as_str()).map(|v| is_truthy(&v));
    tracing::trace!(value = ?val, "FLEET_CACHE env var");
    val
}

/// Cache TTL ($FLEET_CACHE_TTL seconds)
pub fn cache_ttl() -> Option<Duration> {
    let secs: Option<u64> = env_parse(EnvVar::FleetCacheTtl);
    tracing::trace!(value = ?secs, "FLEET_CACHE_TTL env var");
    secs.map(Duration::from_secs)
}

pub fn default_cache_ttl() -> Duration {
    Duration::from_secs(DEFAULT_CACHE_TTL_SECS)
}
