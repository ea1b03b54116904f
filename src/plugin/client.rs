use super::cache::CacheOptions;
use super::connection::{ConnectionConfig, ConnectionDelta};
use super::limiter::LimiterDefinition;
use crate::error::Result;
use crate::reattach::{Capabilities, Handshake};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Control-plane connection to one spawned worker process.
#[async_trait]
pub trait PluginClient: Send + Sync {
    fn pid(&self) -> u32;

    /// Startup line the worker printed.
    fn handshake(&self) -> &Handshake;

    /// Whether the worker process still exists on this host.
    fn is_running(&self) -> bool;

    async fn supported_operations(&self) -> Result<Capabilities>;

    /// Limiters the plugin ships with.
    async fn plugin_rate_limiters(&self) -> Result<Vec<LimiterDefinition>>;

    async fn set_all_connection_configs(
        &self,
        configs: &[ConnectionConfig],
        max_cache_size_mb: u64,
    ) -> Result<()>;

    async fn update_connection_configs(
        &self,
        delta: &ConnectionDelta,
        max_cache_size_mb: u64,
    ) -> Result<()>;

    async fn set_cache_options(&self, options: &CacheOptions) -> Result<()>;

    async fn set_rate_limiters(&self, limiters: &[LimiterDefinition]) -> Result<()>;

    /// Terminate the process. Safe to call more than once.
    async fn kill(&self);
}

/// What the manager needs to start one plugin instance.
#[derive(Debug, Clone)]
pub struct LaunchRequest {
    pub instance: String,
    pub plugin: String,
    pub memory_max_mb: Option<u64>,
    pub start_timeout: Duration,
}

/// Spawns a worker and completes its handshake.
#[async_trait]
pub trait PluginLauncher: Send + Sync {
    async fn launch(&self, request: &LaunchRequest) -> Result<Arc<dyn PluginClient>>;
}
