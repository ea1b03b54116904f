//! In-memory launcher and client for exercising the manager without processes.

use super::cache::CacheOptions;
use super::client::{LaunchRequest, PluginClient, PluginLauncher};
use super::connection::{ConnectionConfig, ConnectionDelta};
use super::limiter::LimiterDefinition;
use crate::error::{FleetError, Result};
use crate::reattach::{Capabilities, Handshake, NetAddr};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub fn all_capabilities() -> Capabilities {
    Capabilities {
        multiple_connections: true,
        cache_options: true,
        rate_limiters: true,
        schema_notifications: false,
    }
}

pub struct MockClient {
    instance: String,
    pid: u32,
    handshake: Handshake,
    capabilities: Capabilities,
    declared_limiters: Vec<LimiterDefinition>,
    alive: AtomicBool,
    fail_updates: AtomicBool,
    fail_limiters: AtomicBool,
    config_delay: Duration,
    kills: AtomicUsize,
    calls: Mutex<Vec<String>>,
}

impl MockClient {
    /// Simulate the process exiting on its own.
    pub fn exit(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }

    pub fn fail_updates(&self) {
        self.fail_updates.store(true, Ordering::SeqCst);
    }

    pub fn fail_limiters(&self) {
        self.fail_limiters.store(true, Ordering::SeqCst);
    }

    pub fn kills(&self) -> usize {
        self.kills.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("MockClient lock poisoned").clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().expect("MockClient lock poisoned").push(call);
    }
}

fn names(configs: &[ConnectionConfig]) -> String {
    configs
        .iter()
        .map(|c| c.name.as_str())
        .collect::<Vec<_>>()
        .join(",")
}

#[async_trait]
impl PluginClient for MockClient {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn handshake(&self) -> &Handshake {
        &self.handshake
    }

    fn is_running(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn supported_operations(&self) -> Result<Capabilities> {
        Ok(self.capabilities)
    }

    async fn plugin_rate_limiters(&self) -> Result<Vec<LimiterDefinition>> {
        Ok(self.declared_limiters.clone())
    }

    async fn set_all_connection_configs(
        &self,
        configs: &[ConnectionConfig],
        max_cache_size_mb: u64,
    ) -> Result<()> {
        if !self.config_delay.is_zero() {
            tokio::time::sleep(self.config_delay).await;
        }
        self.record(format!("set_all:{}:{}", names(configs), max_cache_size_mb));
        Ok(())
    }

    async fn update_connection_configs(
        &self,
        delta: &ConnectionDelta,
        max_cache_size_mb: u64,
    ) -> Result<()> {
        if self.fail_updates.load(Ordering::SeqCst) {
            return Err(FleetError::Rpc("connection refused".into()));
        }
        self.record(format!(
            "update:+{}:-{}:~{}:{}",
            names(&delta.added),
            names(&delta.deleted),
            names(&delta.changed),
            max_cache_size_mb
        ));
        Ok(())
    }

    async fn set_cache_options(&self, options: &CacheOptions) -> Result<()> {
        self.record(format!("cache:{}", options.max_size_mb));
        Ok(())
    }

    async fn set_rate_limiters(&self, limiters: &[LimiterDefinition]) -> Result<()> {
        if self.fail_limiters.load(Ordering::SeqCst) {
            return Err(FleetError::Rpc("broken pipe".into()));
        }
        let mut names: Vec<_> = limiters.iter().map(|l| l.name.as_str()).collect();
        names.sort();
        self.record(format!("limiters:{}", names.join(",")));
        Ok(())
    }

    async fn kill(&self) {
        self.kills.fetch_add(1, Ordering::SeqCst);
        self.alive.store(false, Ordering::SeqCst);
    }
}

/// Launcher handing out [`MockClient`]s and counting spawns per instance.
pub struct MockLauncher {
    next_pid: AtomicU32,
    delay: Mutex<Duration>,
    config_delay: Mutex<Duration>,
    capabilities: Mutex<Capabilities>,
    failing: Mutex<HashSet<String>>,
    declared: Mutex<HashMap<String, Vec<LimiterDefinition>>>,
    spawns: Mutex<HashMap<String, usize>>,
    clients: Mutex<Vec<Arc<MockClient>>>,
}

impl Default for MockLauncher {
    fn default() -> Self {
        Self {
            next_pid: AtomicU32::new(1000),
            delay: Mutex::new(Duration::ZERO),
            config_delay: Mutex::new(Duration::ZERO),
            capabilities: Mutex::new(all_capabilities()),
            failing: Mutex::default(),
            declared: Mutex::default(),
            spawns: Mutex::default(),
            clients: Mutex::default(),
        }
    }
}

impl MockLauncher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().expect("MockLauncher lock poisoned") = delay;
    }

    /// Delay every full connection-config push of clients launched from now on.
    pub fn set_config_delay(&self, delay: Duration) {
        *self.config_delay.lock().expect("MockLauncher lock poisoned") = delay;
    }

    pub fn set_capabilities(&self, capabilities: Capabilities) {
        *self.capabilities.lock().expect("MockLauncher lock poisoned") = capabilities;
    }

    pub fn fail(&self, instance: &str) {
        self.failing
            .lock()
            .expect("MockLauncher lock poisoned")
            .insert(instance.to_string());
    }

    pub fn declare_limiters(&self, instance: &str, limiters: Vec<LimiterDefinition>) {
        self.declared
            .lock()
            .expect("MockLauncher lock poisoned")
            .insert(instance.to_string(), limiters);
    }

    pub fn spawns(&self, instance: &str) -> usize {
        self.spawns
            .lock()
            .expect("MockLauncher lock poisoned")
            .get(instance)
            .copied()
            .unwrap_or(0)
    }

    pub fn total_spawns(&self) -> usize {
        self.spawns
            .lock()
            .expect("MockLauncher lock poisoned")
            .values()
            .sum()
    }

    /// Most recently launched client of `instance`.
    pub fn client(&self, instance: &str) -> Option<Arc<MockClient>> {
        self.clients
            .lock()
            .expect("MockLauncher lock poisoned")
            .iter()
            .rev()
            .find(|c| c.instance == instance)
            .cloned()
    }

    pub fn clients(&self) -> Vec<Arc<MockClient>> {
        self.clients.lock().expect("MockLauncher lock poisoned").clone()
    }
}

#[async_trait]
impl PluginLauncher for MockLauncher {
    async fn launch(&self, request: &LaunchRequest) -> Result<Arc<dyn PluginClient>> {
        *self
            .spawns
            .lock()
            .expect("MockLauncher lock poisoned")
            .entry(request.instance.clone())
            .or_insert(0) += 1;

        let delay = *self.delay.lock().expect("MockLauncher lock poisoned");
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if self
            .failing
            .lock()
            .expect("MockLauncher lock poisoned")
            .contains(&request.instance)
        {
            return Err(FleetError::Handshake("exec format error".into()));
        }

        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        let client = Arc::new(MockClient {
            instance: request.instance.clone(),
            pid,
            handshake: Handshake::new(1, NetAddr::unix(format!("/tmp/{}-{pid}.sock", request.instance))),
            capabilities: *self.capabilities.lock().expect("MockLauncher lock poisoned"),
            declared_limiters: self
                .declared
                .lock()
                .expect("MockLauncher lock poisoned")
                .get(&request.instance)
                .cloned()
                .unwrap_or_default(),
            alive: AtomicBool::new(true),
            fail_updates: AtomicBool::new(false),
            fail_limiters: AtomicBool::new(false),
            config_delay: *self.config_delay.lock().expect("MockLauncher lock poisoned"),
            kills: AtomicUsize::new(0),
            calls: Mutex::default(),
        });
        self.clients
            .lock()
            .expect("MockLauncher lock poisoned")
            .push(Arc::clone(&client));
        Ok(client)
    }
}
