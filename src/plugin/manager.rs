//! Registry of running plugin instances.
//!
//! All registry state lives in one [`Registry`] behind a single async
//! `RwLock`. Public methods on [`PluginManager`] take the lock, call
//! `Registry` helpers, and release it before any round-trip to a worker.
//! `Registry` has no access to the lock, so a helper can never re-acquire it.

use super::aggregate::{ResolveResponse, ResponseAggregate};
use super::cache::{self, CacheOptions};
use super::client::{LaunchRequest, PluginClient, PluginLauncher};
use super::connection::{self, ConnectionConfig, ConnectionDelta, ConnectionMap};
use super::handle::{PluginState, RunningPlugin};
use super::introspection::IntrospectionSink;
use super::limiter::{self, InstanceLimiters, LimiterDefinition, LimiterSource};
use crate::clienv;
use crate::config::{FleetConfig, PluginInstanceConfig};
use crate::daemon::protocol::PluginInfo;
use crate::error::{FleetError, Result};
use crate::reattach::ReattachDescriptor;
use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinSet;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

const MAX_START_ATTEMPTS: u32 = 3;
const START_RETRY_BACKOFF: Duration = Duration::from_millis(50);

#[derive(Debug, Clone)]
pub struct ManagerOptions {
    /// Upper bound on waiting for another task's start of the same instance
    pub start_timeout: Duration,
    pub cache_enabled: bool,
    pub cache_ttl: Duration,
    /// Global cache budget; `None` leaves every instance unlimited
    pub cache_max_size_mb: Option<u64>,
    pub plugin_memory_max_mb: Option<u64>,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            start_timeout: clienv::default_plugin_start_timeout(),
            cache_enabled: true,
            cache_ttl: clienv::default_cache_ttl(),
            cache_max_size_mb: None,
            plugin_memory_max_mb: None,
        }
    }
}

enum Inserted {
    New(Arc<RunningPlugin>),
    AlreadyPresent,
}

enum Attempt {
    Ready(ReattachDescriptor),
    Retry,
}

/// Registry state. Every method here runs with the manager's lock already held.
#[derive(Default)]
struct Registry {
    running: HashMap<String, Arc<RunningPlugin>>,
    connections: ConnectionMap,
    plugins: BTreeMap<String, PluginInstanceConfig>,
    cache_budget_mb: Option<u64>,
    cache_sizes: BTreeMap<String, u64>,
    user_limiters: InstanceLimiters,
    plugin_limiters: InstanceLimiters,
}

impl Registry {
    /// Requested connection names grouped by owning instance, aggregators expanded.
    fn group_requested(&self, names: &[String]) -> Result<BTreeMap<String, Vec<String>>> {
        let mut groups: BTreeMap<String, Vec<String>> = BTreeMap::new();
        let mut seen: HashSet<&str> = HashSet::new();
        let mut pending: Vec<&str> = names.iter().rev().map(String::as_str).collect();

        while let Some(name) = pending.pop() {
            if !seen.insert(name) {
                continue;
            }
            let conn = self
                .connections
                .get(name)
                .ok_or_else(|| FleetError::UnknownConnection(name.to_string()))?;
            if conn.is_aggregator() {
                pending.extend(conn.children.iter().rev().map(String::as_str));
            } else {
                groups
                    .entry(conn.plugin_instance.clone())
                    .or_default()
                    .push(conn.name.clone());
            }
        }

        Ok(groups)
    }

    fn insert_starting(&mut self, instance: &str, plugin: &str) -> Inserted {
        match self.running.entry(instance.to_string()) {
            Entry::Occupied(_) => Inserted::AlreadyPresent,
            Entry::Vacant(slot) => {
                Inserted::New(Arc::clone(slot.insert(RunningPlugin::new(instance, plugin))))
            }
        }
    }

    /// Drop `handle` unless the slot already holds a newer one.
    fn remove_if_same(&mut self, handle: &Arc<RunningPlugin>) -> bool {
        match self.running.get(handle.instance()) {
            Some(current) if Arc::ptr_eq(current, handle) => {
                self.running.remove(handle.instance());
                true
            }
            _ => false,
        }
    }

    fn plugin_source(&self, instance: &str) -> String {
        self.plugins
            .get(instance)
            .map(|p| p.source.clone())
            .or_else(|| {
                self.connections
                    .values()
                    .find(|c| c.plugin_instance == instance)
                    .map(|c| c.plugin.clone())
            })
            .unwrap_or_else(|| instance.to_string())
    }

    fn launch_request(&self, instance: &str, options: &ManagerOptions) -> LaunchRequest {
        let configured = self.plugins.get(instance).and_then(|p| p.memory_max_mb);
        LaunchRequest {
            instance: instance.to_string(),
            plugin: self.plugin_source(instance),
            memory_max_mb: clienv::plugin_memory_max_mb()
                .or(configured)
                .or(options.plugin_memory_max_mb),
            start_timeout: options.start_timeout,
        }
    }

    fn connection_configs(&self, instance: &str) -> Vec<ConnectionConfig> {
        connection::instance_connections(&self.connections, instance)
            .into_iter()
            .cloned()
            .collect()
    }

    fn connection_names(&self, instance: &str) -> Vec<String> {
        connection::instance_connections(&self.connections, instance)
            .into_iter()
            .map(|c| c.name.clone())
            .collect()
    }

    fn cache_size(&self, instance: &str) -> u64 {
        self.cache_sizes.get(instance).copied().unwrap_or(0)
    }

    /// Recompute every share from one view of the connection map. Returns the previous shares.
    fn recompute_cache_sizes(&mut self) -> BTreeMap<String, u64> {
        let counts = connection::connection_counts(&self.connections);
        let sizes = cache::partition(self.cache_budget_mb, &counts);
        std::mem::replace(&mut self.cache_sizes, sizes)
    }

    /// Make the handle's descriptor list exactly the instance's current connections.
    fn sync_descriptor(&self, handle: &RunningPlugin) -> Option<ReattachDescriptor> {
        let names = self.connection_names(handle.instance());
        handle.update_descriptor(|d| d.sync_connections(names.iter().map(String::as_str)))
    }

    fn ready_client(&self, handle: &RunningPlugin) -> Option<Arc<dyn PluginClient>> {
        if handle.state() != PluginState::Initialized {
            return None;
        }
        handle.client()
    }

    fn user_limiters_for(&self, instance: &str) -> Vec<LimiterDefinition> {
        self.user_limiters
            .get(instance)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default()
    }

    fn store_plugin_limiters(&mut self, instance: &str, plugin: &str, declared: Vec<LimiterDefinition>) {
        if declared.is_empty() {
            self.plugin_limiters.remove(instance);
            return;
        }
        let limiters = declared
            .into_iter()
            .map(|mut l| {
                l.plugin = plugin.to_string();
                l.plugin_instance = instance.to_string();
                l.source = LimiterSource::Plugin;
                (l.name.clone(), l)
            })
            .collect();
        self.plugin_limiters.insert(instance.to_string(), limiters);
    }

    fn merged_limiters(&self) -> Vec<LimiterDefinition> {
        limiter::merge(&self.plugin_limiters, &self.user_limiters)
    }
}

/// Incremental update for one running instance.
struct ConfigPush {
    instance: String,
    client: Arc<dyn PluginClient>,
    delta: ConnectionDelta,
    cache_size: u64,
    cache: Option<CacheOptions>,
}

impl ConfigPush {
    async fn send(&self) -> Result<()> {
        if !self.delta.is_empty() {
            self.client
                .update_connection_configs(&self.delta, self.cache_size)
                .await?;
        }
        if let Some(options) = &self.cache {
            self.client.set_cache_options(options).await?;
        }
        Ok(())
    }
}

pub struct PluginManager {
    registry: RwLock<Registry>,
    /// Held across snapshot and write so the newest table is the one stored
    table_writes: tokio::sync::Mutex<()>,
    shutting_down: Mutex<bool>,
    in_flight: TaskTracker,
    launcher: Arc<dyn PluginLauncher>,
    introspection: Arc<dyn IntrospectionSink>,
    options: ManagerOptions,
}

impl PluginManager {
    pub fn new(
        config: &FleetConfig,
        options: ManagerOptions,
        launcher: Arc<dyn PluginLauncher>,
        introspection: Arc<dyn IntrospectionSink>,
    ) -> Arc<Self> {
        let mut registry = Registry {
            connections: config.connections.clone(),
            plugins: config.plugins.clone(),
            user_limiters: config.limiters.clone(),
            cache_budget_mb: options.cache_max_size_mb,
            ..Default::default()
        };
        registry.recompute_cache_sizes();

        Arc::new(Self {
            registry: RwLock::new(registry),
            table_writes: tokio::sync::Mutex::new(()),
            shutting_down: Mutex::new(false),
            in_flight: TaskTracker::new(),
            launcher,
            introspection,
            options,
        })
    }

    pub fn options(&self) -> &ManagerOptions {
        &self.options
    }

    /// Resolve connection names to running plugin processes, starting instances as needed.
    ///
    /// Only an unknown connection name fails the whole call; start failures are
    /// reported per instance in the response.
    pub async fn resolve(self: &Arc<Self>, connections: &[String]) -> Result<ResolveResponse> {
        let groups = self.registry.read().await.group_requested(connections)?;
        debug!(
            connections = connections.len(),
            instances = groups.len(),
            "Resolving connections"
        );

        let aggregate = Arc::new(ResponseAggregate::new());
        let mut tasks = Vec::with_capacity(groups.len());

        for (instance, names) in groups {
            let manager = Arc::clone(self);
            let agg = Arc::clone(&aggregate);
            let task_instance = instance.clone();
            let task = tokio::spawn(async move {
                match manager.ensure_running(&task_instance).await {
                    Ok(descriptor) => {
                        for name in names {
                            agg.add_success(name, descriptor.clone());
                        }
                    }
                    Err(e) => {
                        warn!(instance = %task_instance, "Plugin instance unavailable: {}", e);
                        agg.add_failure(task_instance, e.to_string());
                    }
                }
            });
            tasks.push((instance, task));
        }

        for (instance, task) in tasks {
            if let Err(e) = task.await {
                error!(%instance, "Plugin start task aborted: {}", e);
                aggregate.add_failure(instance, format!("plugin start task aborted: {e}"));
            }
        }

        Ok(aggregate.finish())
    }

    async fn ensure_running(&self, instance: &str) -> Result<ReattachDescriptor> {
        for attempt in 1..=MAX_START_ATTEMPTS {
            match self.try_start(instance).await? {
                Attempt::Ready(descriptor) => return Ok(descriptor),
                Attempt::Retry => {
                    debug!(instance, attempt, "Retrying plugin start");
                    tokio::time::sleep(START_RETRY_BACKOFF).await;
                }
            }
        }

        Err(FleetError::StartRetriesExhausted {
            instance: instance.to_string(),
            attempts: MAX_START_ATTEMPTS,
        })
    }

    async fn try_start(&self, instance: &str) -> Result<Attempt> {
        // token before the flag check: shutdown either sees this start or we see the flag
        let _token = self.in_flight.token();
        if self.is_shutting_down() {
            return Err(FleetError::ShuttingDown);
        }

        let existing = self.registry.read().await.running.get(instance).cloned();
        if let Some(handle) = existing {
            return self.wait_for_handle(&handle).await;
        }

        let (handle, request) = {
            let mut registry = self.registry.write().await;
            let request = registry.launch_request(instance, &self.options);
            match registry.insert_starting(instance, &request.plugin) {
                Inserted::New(handle) => (handle, request),
                Inserted::AlreadyPresent => {
                    debug!(instance, "Another task is starting this instance");
                    return Ok(Attempt::Retry);
                }
            }
        };

        match self.start_plugin(&handle, &request).await {
            Ok(descriptor) => Ok(Attempt::Ready(descriptor)),
            Err(e) => {
                self.registry.write().await.remove_if_same(&handle);
                let err = match e {
                    FleetError::ShuttingDown => FleetError::ShuttingDown,
                    other => FleetError::PluginStart {
                        instance: instance.to_string(),
                        reason: other.to_string(),
                    },
                };
                let reason = match &err {
                    FleetError::PluginStart { reason, .. } => reason.clone(),
                    other => other.to_string(),
                };
                handle.mark_failed(reason);
                Err(err)
            }
        }
    }

    async fn wait_for_handle(&self, handle: &Arc<RunningPlugin>) -> Result<Attempt> {
        let instance = handle.instance();
        let state = tokio::time::timeout(self.options.start_timeout, handle.wait())
            .await
            .map_err(|_| FleetError::StartTimeout {
                instance: instance.to_string(),
                secs: self.options.start_timeout.as_secs(),
            })?;

        match state {
            PluginState::Initialized => {}
            PluginState::Failed(reason) => {
                return Err(FleetError::PluginStart {
                    instance: instance.to_string(),
                    reason,
                })
            }
            PluginState::Starting => return Ok(Attempt::Retry),
        }

        if !handle.process_alive() {
            warn!(instance, "Plugin process has exited, discarding its handle");
            let removed = self.registry.write().await.remove_if_same(handle);
            if removed {
                if let Some(client) = handle.client() {
                    client.kill().await;
                }
            }
            return Ok(Attempt::Retry);
        }

        let registry = self.registry.read().await;
        Ok(registry
            .sync_descriptor(handle)
            .map_or(Attempt::Retry, Attempt::Ready))
    }

    async fn start_plugin(
        &self,
        handle: &Arc<RunningPlugin>,
        request: &LaunchRequest,
    ) -> Result<ReattachDescriptor> {
        info!("Starting plugin instance '{}' ({})", request.instance, request.plugin);

        let client = self.launcher.launch(request).await?;
        handle.set_client(Arc::clone(&client));

        match self.initialize(handle, client.as_ref()).await {
            Ok(descriptor) => {
                info!(
                    instance = %request.instance,
                    pid = descriptor.pid,
                    connections = descriptor.connections.len(),
                    "Plugin instance initialized"
                );
                Ok(descriptor)
            }
            Err(e) => {
                client.kill().await;
                Err(e)
            }
        }
    }

    async fn initialize(
        &self,
        handle: &RunningPlugin,
        client: &dyn PluginClient,
    ) -> Result<ReattachDescriptor> {
        let instance = handle.instance();
        if self.is_shutting_down() {
            return Err(FleetError::ShuttingDown);
        }

        let capabilities = client.supported_operations().await?;
        let (configs, cache_size, limiters) = {
            let registry = self.registry.read().await;
            (
                registry.connection_configs(instance),
                registry.cache_size(instance),
                registry.user_limiters_for(instance),
            )
        };

        if configs.len() > 1 && !capabilities.multiple_connections {
            return Err(FleetError::IncompatiblePlugin {
                instance: instance.to_string(),
                reason: format!(
                    "{} connections configured but the plugin serves only one",
                    configs.len()
                ),
            });
        }

        client.set_all_connection_configs(&configs, cache_size).await?;
        if capabilities.cache_options {
            client
                .set_cache_options(&self.cache_options(cache_size))
                .await?;
        }
        if capabilities.rate_limiters {
            let declared = client.plugin_rate_limiters().await?;
            client.set_rate_limiters(&limiters).await?;
            self.registry
                .write()
                .await
                .store_plugin_limiters(instance, handle.plugin(), declared);
        }

        // Connection changes made while the full set was in flight were dropped
        // for this starting handle. Catch the worker up until what it holds
        // matches the registry, then initialize under that same read lock so a
        // concurrent change sees either a starting handle or one it can update.
        let mut pushed = configs;
        let mut pushed_cache = cache_size;
        let descriptor = loop {
            let (current, current_cache) = {
                let registry = self.registry.read().await;
                let current = registry.connection_configs(instance);
                let current_cache = registry.cache_size(instance);
                if current == pushed && current_cache == pushed_cache {
                    let descriptor = ReattachDescriptor::new(
                        client.handshake(),
                        client.pid(),
                        registry.connection_names(instance),
                        capabilities,
                    );
                    if !handle.mark_initialized(descriptor.clone()) {
                        return Err(FleetError::Handshake(format!(
                            "instance '{instance}' finished starting twice"
                        )));
                    }
                    break descriptor;
                }
                (current, current_cache)
            };

            if current.len() > 1 && !capabilities.multiple_connections {
                return Err(FleetError::IncompatiblePlugin {
                    instance: instance.to_string(),
                    reason: format!(
                        "{} connections configured but the plugin serves only one",
                        current.len()
                    ),
                });
            }

            let delta = connection::diff(
                &connection::index_by_name(&pushed),
                &connection::index_by_name(&current),
            );
            debug!(instance, "Connections changed during start, pushing catch-up delta");
            client.update_connection_configs(&delta, current_cache).await?;
            if capabilities.cache_options && current_cache != pushed_cache {
                client
                    .set_cache_options(&self.cache_options(current_cache))
                    .await?;
            }
            pushed = current;
            pushed_cache = current_cache;
        };

        if capabilities.rate_limiters {
            if let Err(e) = self.refresh_limiter_table().await {
                warn!(instance, "Failed to refresh limiter table: {}", e);
            }
        }

        Ok(descriptor)
    }

    fn cache_options(&self, max_size_mb: u64) -> CacheOptions {
        CacheOptions::new(self.options.cache_enabled, self.options.cache_ttl, max_size_mb)
    }

    /// Replace the connection map and push per-instance deltas to running instances.
    ///
    /// Instances that are not running drop their delta; they get the full set
    /// when next started. Push failures are combined into one error after
    /// every instance has been tried.
    pub async fn apply_connection_config_change(
        &self,
        connections: ConnectionMap,
    ) -> Result<ConnectionDelta> {
        let (delta, pushes) = {
            let mut registry = self.registry.write().await;
            let delta = connection::diff(&registry.connections, &connections);
            registry.connections = connections;
            let previous_sizes = registry.recompute_cache_sizes();
            let mut grouped = connection::group_by_instance(&delta);

            let mut pushes = Vec::new();
            for (instance, handle) in &registry.running {
                let Some(client) = registry.ready_client(handle) else {
                    if grouped.remove(instance).is_some() {
                        debug!(instance = %instance, "Instance still starting, dropping connection delta");
                    }
                    continue;
                };

                let instance_delta = grouped.remove(instance).unwrap_or_default();
                let cache_size = registry.cache_size(instance);
                let resized = previous_sizes.get(instance).copied().unwrap_or(0) != cache_size;
                if instance_delta.is_empty() && !resized {
                    continue;
                }

                let capabilities = registry
                    .sync_descriptor(handle)
                    .map(|d| d.capabilities)
                    .unwrap_or_default();
                pushes.push(ConfigPush {
                    instance: instance.clone(),
                    client,
                    delta: instance_delta,
                    cache_size,
                    cache: (resized && capabilities.cache_options)
                        .then(|| self.cache_options(cache_size)),
                });
            }

            for instance in grouped.keys() {
                debug!(instance = %instance, "Instance not running, dropping connection delta");
            }
            (delta, pushes)
        };

        info!(
            added = delta.added.len(),
            deleted = delta.deleted.len(),
            changed = delta.changed.len(),
            pushes = pushes.len(),
            "Applying connection config change"
        );

        let mut tasks = JoinSet::new();
        for push in pushes {
            tasks.spawn(async move {
                let result = push.send().await;
                (push.instance, result)
            });
        }

        let mut failures = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(()))) => {}
                Ok((instance, Err(e))) => {
                    warn!(%instance, "Failed to push connection config: {}", e);
                    failures.push(format!("{instance}: {e}"));
                }
                Err(e) => failures.push(format!("push task aborted: {e}")),
            }
        }

        if failures.is_empty() {
            Ok(delta)
        } else {
            failures.sort();
            Err(FleetError::ConfigPush(failures))
        }
    }

    /// Replace the plugin instance set. Running instances that were removed,
    /// or whose source changed, are stopped. Returns the stopped instances.
    pub async fn apply_plugin_set_change(
        &self,
        plugins: BTreeMap<String, PluginInstanceConfig>,
    ) -> Result<Vec<String>> {
        let stopped = {
            let mut registry = self.registry.write().await;
            registry.plugins = plugins;

            let stale: Vec<String> = registry
                .running
                .iter()
                .filter(|(_, handle)| handle.state() != PluginState::Starting)
                .filter(|(instance, handle)| match registry.plugins.get(instance.as_str()) {
                    None => true,
                    Some(p) => p.source != handle.plugin(),
                })
                .map(|(instance, _)| instance.clone())
                .collect();

            let mut stopped = Vec::with_capacity(stale.len());
            for instance in stale {
                registry.plugin_limiters.remove(&instance);
                if let Some(handle) = registry.running.remove(&instance) {
                    stopped.push(handle);
                }
            }
            stopped
        };

        let mut names = Vec::with_capacity(stopped.len());
        for handle in stopped {
            info!("Stopping plugin instance '{}'", handle.instance());
            if let Some(client) = handle.client() {
                client.kill().await;
            }
            names.push(handle.instance().to_string());
        }
        names.sort();

        self.refresh_limiter_table().await?;
        Ok(names)
    }

    /// Replace user limiters and push fresh sets to running instances whose
    /// limiters changed. Returns the instances that received a push.
    pub async fn apply_user_limiter_change(
        &self,
        limiters: InstanceLimiters,
    ) -> Result<BTreeSet<String>> {
        let (affected, pushes) = {
            let mut registry = self.registry.write().await;
            let affected = limiter::diff(&registry.user_limiters, &limiters);
            registry.user_limiters = limiters;

            let pushes: Vec<_> = affected
                .iter()
                .filter_map(|instance| {
                    let handle = registry.running.get(instance)?;
                    let client = registry.ready_client(handle)?;
                    if !handle.descriptor()?.capabilities.rate_limiters {
                        return None;
                    }
                    Some((instance.clone(), client, registry.user_limiters_for(instance)))
                })
                .collect();
            (affected, pushes)
        };

        let mut pushed = BTreeSet::new();
        for (instance, client, limiters) in pushes {
            match client.set_rate_limiters(&limiters).await {
                Ok(()) => {
                    debug!(%instance, limiters = limiters.len(), "Pushed rate limiters");
                    pushed.insert(instance);
                }
                Err(e) => warn!(%instance, "Failed to push rate limiters: {}", e),
            }
        }

        if !affected.is_empty() {
            self.refresh_limiter_table().await?;
        }
        Ok(pushed)
    }

    /// Apply a freshly loaded configuration: plugin set, connections, then limiters.
    pub async fn reload(&self, config: FleetConfig) -> Result<()> {
        let FleetConfig {
            plugins,
            connections,
            limiters,
            ..
        } = config;

        let mut first_error = None;
        if let Err(e) = self.apply_plugin_set_change(plugins).await {
            warn!("Plugin set change failed: {}", e);
            first_error.get_or_insert(e);
        }
        if let Err(e) = self.apply_connection_config_change(connections).await {
            warn!("Connection config change failed: {}", e);
            first_error.get_or_insert(e);
        }
        if let Err(e) = self.apply_user_limiter_change(limiters).await {
            warn!("Limiter change failed: {}", e);
            first_error.get_or_insert(e);
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Rewrite the limiter introspection table from the current registry.
    pub async fn refresh_limiter_table(&self) -> Result<()> {
        let _writing = self.table_writes.lock().await;
        let rows = self.registry.read().await.merged_limiters();
        self.introspection.write_limiters(&rows).await
    }

    pub async fn list_plugins(&self) -> Vec<PluginInfo> {
        let registry = self.registry.read().await;
        let mut list: Vec<PluginInfo> = registry
            .running
            .values()
            .map(|handle| PluginInfo {
                instance: handle.instance().to_string(),
                plugin: handle.plugin().to_string(),
                state: handle.state().as_str().to_string(),
                pid: handle.client().map(|c| c.pid()),
                connections: registry.connection_names(handle.instance()),
            })
            .collect();
        list.sort_by(|a, b| a.instance.cmp(&b.instance));
        list
    }

    pub async fn running_count(&self) -> usize {
        self.registry
            .read()
            .await
            .running
            .values()
            .filter(|h| h.state() == PluginState::Initialized)
            .count()
    }

    fn is_shutting_down(&self) -> bool {
        *self
            .shutting_down
            .lock()
            .expect("PluginManager shutdown lock poisoned")
    }

    /// Refuse new starts, wait for in-flight ones, then kill every process.
    pub async fn shutdown(&self) {
        {
            let mut flag = self
                .shutting_down
                .lock()
                .expect("PluginManager shutdown lock poisoned");
            if !*flag {
                info!("Shutting down plugin manager");
            }
            *flag = true;
        }

        self.in_flight.close();
        self.in_flight.wait().await;

        let handles: Vec<_> = self
            .registry
            .write()
            .await
            .running
            .drain()
            .map(|(_, handle)| handle)
            .collect();

        for handle in handles {
            if let Some(client) = handle.client() {
                debug!(instance = handle.instance(), pid = client.pid(), "Killing plugin process");
                client.kill().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::introspection::MemoryIntrospection;
    use crate::plugin::limiter::LimiterStatus;
    use crate::plugin::testing::{all_capabilities, MockLauncher};
    use std::future::Future;

    const CONFIG: &str = r#"
[[plugin]]
instance = "P"
source = "hub/p@latest"

  [[plugin.limiter]]
  name = "list"
  max_concurrency = 2

[[plugin]]
instance = "Q"
source = "hub/q@latest"

[[connection]]
name = "a"
plugin = "P"

[[connection]]
name = "b"
plugin = "P"

[[connection]]
name = "c"
plugin = "Q"

[[connection]]
name = "all"
plugin = "P"
children = ["a", "c"]
"#;

    async fn within<F: Future>(f: F) -> F::Output {
        tokio::time::timeout(Duration::from_secs(5), f)
            .await
            .expect("operation timed out")
    }

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    struct Fixture {
        manager: Arc<PluginManager>,
        launcher: Arc<MockLauncher>,
        table: Arc<MemoryIntrospection>,
    }

    fn fixture_with(config: &FleetConfig, options: ManagerOptions) -> Fixture {
        let launcher = MockLauncher::new();
        let table = Arc::new(MemoryIntrospection::new());
        let manager = PluginManager::new(
            config,
            options,
            Arc::clone(&launcher) as Arc<dyn PluginLauncher>,
            Arc::clone(&table) as Arc<dyn IntrospectionSink>,
        );
        Fixture {
            manager,
            launcher,
            table,
        }
    }

    fn fixture() -> Fixture {
        let options = ManagerOptions {
            start_timeout: Duration::from_secs(2),
            cache_max_size_mb: Some(10),
            ..Default::default()
        };
        fixture_with(&FleetConfig::parse(CONFIG).unwrap(), options)
    }

    #[tokio::test]
    async fn resolves_each_instance_once() {
        let fx = fixture();
        let response = within(fx.manager.resolve(&names(&["a", "b", "c"])))
            .await
            .unwrap();

        assert!(response.failed.is_empty());
        assert_eq!(response.succeeded.len(), 3);
        assert_eq!(response.succeeded["a"], response.succeeded["b"]);
        assert_ne!(response.succeeded["a"].pid, response.succeeded["c"].pid);
        assert_eq!(response.succeeded["a"].connections, vec!["a", "b"]);
        assert_eq!(response.succeeded["c"].connections, vec!["c"]);
        assert_eq!(fx.launcher.spawns("P"), 1);
        assert_eq!(fx.launcher.spawns("Q"), 1);
        assert_eq!(fx.manager.running_count().await, 2);
    }

    #[tokio::test]
    async fn failed_instance_fails_all_its_connections_only() {
        let fx = fixture();
        fx.launcher.fail("P");

        let response = within(fx.manager.resolve(&names(&["a", "b"])))
            .await
            .unwrap();
        assert!(response.succeeded.is_empty());
        assert_eq!(response.failed.len(), 1);
        assert!(response.failed["P"].contains("exec format error"));

        let response = within(fx.manager.resolve(&names(&["a", "c"])))
            .await
            .unwrap();
        assert!(response.succeeded.contains_key("c"));
        assert!(response.failed.contains_key("P"));
        // a genuine start failure is not retried
        assert_eq!(fx.launcher.spawns("P"), 2);
    }

    #[tokio::test]
    async fn unknown_connection_fails_whole_call() {
        let fx = fixture();
        let err = fx.manager.resolve(&names(&["a", "nope"])).await.unwrap_err();
        assert!(matches!(err, FleetError::UnknownConnection(name) if name == "nope"));
        assert_eq!(fx.launcher.total_spawns(), 0);
    }

    #[tokio::test]
    async fn aggregator_expands_to_children() {
        let fx = fixture();
        let response = within(fx.manager.resolve(&names(&["all"]))).await.unwrap();

        let mut resolved: Vec<_> = response.succeeded.keys().cloned().collect();
        resolved.sort();
        assert_eq!(resolved, vec!["a", "c"]);
        assert!(!response.succeeded["a"].serves("all"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_resolves_spawn_one_process() {
        let fx = fixture();
        fx.launcher.set_delay(Duration::from_millis(100));

        let calls: Vec<_> = (0..16)
            .map(|_| {
                let manager = Arc::clone(&fx.manager);
                tokio::spawn(async move { manager.resolve(&names(&["a"])).await })
            })
            .collect();

        let mut pids = HashSet::new();
        for call in calls {
            let response = within(call).await.unwrap().unwrap();
            assert!(response.failed.is_empty(), "{:?}", response.failed);
            pids.insert(response.succeeded["a"].pid);
        }

        assert_eq!(fx.launcher.spawns("P"), 1);
        assert_eq!(pids.len(), 1);
    }

    #[tokio::test]
    async fn exited_process_is_restarted() {
        let fx = fixture();
        let first = within(fx.manager.resolve(&names(&["a"]))).await.unwrap();
        let old = fx.launcher.client("P").unwrap();
        old.exit();

        let second = within(fx.manager.resolve(&names(&["a"]))).await.unwrap();
        assert!(second.failed.is_empty());
        assert_ne!(first.succeeded["a"].pid, second.succeeded["a"].pid);
        assert_eq!(fx.launcher.spawns("P"), 2);
        assert_eq!(old.kills(), 1);
    }

    #[tokio::test]
    async fn single_connection_plugin_rejects_shared_instance() {
        let fx = fixture();
        fx.launcher.set_capabilities(crate::reattach::Capabilities {
            multiple_connections: false,
            ..all_capabilities()
        });

        let response = within(fx.manager.resolve(&names(&["a", "c"])))
            .await
            .unwrap();
        assert!(response.failed["P"].contains("incompatible"));
        assert!(response.succeeded.contains_key("c"));
        assert_eq!(fx.launcher.client("P").unwrap().kills(), 1);
    }

    #[tokio::test]
    async fn cache_budget_is_split_by_connection_count() {
        let fx = fixture();
        within(fx.manager.resolve(&names(&["a", "c"]))).await.unwrap();

        let p_calls = fx.launcher.client("P").unwrap().calls();
        let q_calls = fx.launcher.client("Q").unwrap().calls();
        assert!(p_calls.contains(&"set_all:a,b:7".to_string()), "{p_calls:?}");
        assert!(p_calls.contains(&"cache:7".to_string()));
        assert!(q_calls.contains(&"set_all:c:3".to_string()), "{q_calls:?}");
    }

    #[tokio::test]
    async fn descriptor_tracks_connection_changes() {
        let fx = fixture();
        within(fx.manager.resolve(&names(&["a"]))).await.unwrap();

        let mut config = FleetConfig::parse(CONFIG).unwrap();
        config.connections.remove("b");
        config
            .connections
            .insert("d".into(), ConnectionConfig::new("d", "hub/p@latest", "P"));
        let delta = within(fx.manager.apply_connection_config_change(config.connections))
            .await
            .unwrap();
        assert_eq!(delta.added.len(), 1);
        assert_eq!(delta.deleted.len(), 1);

        let response = within(fx.manager.resolve(&names(&["d"]))).await.unwrap();
        let mut served = response.succeeded["d"].connections.clone();
        served.sort();
        assert_eq!(served, vec!["a", "d"]);

        let calls = fx.launcher.client("P").unwrap().calls();
        assert!(calls.iter().any(|c| c.starts_with("update:+d:-b:~:")), "{calls:?}");
        assert_eq!(fx.launcher.spawns("P"), 1);
    }

    #[tokio::test]
    async fn deltas_for_stopped_instances_are_dropped() {
        let fx = fixture();
        let mut config = FleetConfig::parse(CONFIG).unwrap();
        config
            .connections
            .insert("e".into(), ConnectionConfig::new("e", "hub/q@latest", "Q"));
        within(fx.manager.apply_connection_config_change(config.connections))
            .await
            .unwrap();
        assert_eq!(fx.launcher.total_spawns(), 0);

        let response = within(fx.manager.resolve(&names(&["e"]))).await.unwrap();
        assert_eq!(response.succeeded["e"].connections, vec!["c", "e"]);
        let calls = fx.launcher.client("Q").unwrap().calls();
        assert!(calls[0].starts_with("set_all:c,e:"), "{calls:?}");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn connection_added_during_start_reaches_the_worker() {
        let fx = fixture();
        fx.launcher.set_config_delay(Duration::from_millis(300));

        let manager = Arc::clone(&fx.manager);
        let start = tokio::spawn(async move { manager.resolve(&names(&["c"])).await });
        tokio::time::sleep(Duration::from_millis(100)).await;

        let mut config = FleetConfig::parse(CONFIG).unwrap();
        config
            .connections
            .insert("e".into(), ConnectionConfig::new("e", "hub/q@latest", "Q"));
        within(fx.manager.apply_connection_config_change(config.connections))
            .await
            .unwrap();

        let response = within(start).await.unwrap().unwrap();
        assert_eq!(response.succeeded["c"].connections, vec!["c", "e"]);

        // the full push carried only c; e followed as a catch-up delta
        let calls = fx.launcher.client("Q").unwrap().calls();
        assert_eq!(calls[0], "set_all:c:3", "{calls:?}");
        assert!(calls.contains(&"update:+e:-:~:5".to_string()), "{calls:?}");
        assert!(calls.contains(&"cache:5".to_string()), "{calls:?}");

        let response = within(fx.manager.resolve(&names(&["e"]))).await.unwrap();
        assert_eq!(response.succeeded["e"].connections, vec!["c", "e"]);
        assert_eq!(fx.launcher.spawns("Q"), 1);
    }

    #[tokio::test]
    async fn push_failures_are_combined() {
        let fx = fixture();
        within(fx.manager.resolve(&names(&["a", "c"]))).await.unwrap();
        fx.launcher.client("P").unwrap().fail_updates();

        let mut config = FleetConfig::parse(CONFIG).unwrap();
        config.connections.get_mut("a").unwrap().config = "changed = true".into();
        config.connections.get_mut("c").unwrap().config = "changed = true".into();

        let err = within(fx.manager.apply_connection_config_change(config.connections))
            .await
            .unwrap_err();
        let FleetError::ConfigPush(failures) = err else {
            panic!("expected combined push error");
        };
        assert_eq!(failures.len(), 1);
        assert!(failures[0].starts_with("P:"));

        let q_calls = fx.launcher.client("Q").unwrap().calls();
        assert!(q_calls.iter().any(|c| c.starts_with("update:+:-:~c:")));
    }

    #[tokio::test]
    async fn limiter_changes_reach_running_instances_only() {
        let fx = fixture();
        fx.launcher.declare_limiters(
            "P",
            vec![LimiterDefinition::new("list").max_concurrency(5)],
        );
        within(fx.manager.resolve(&names(&["a"]))).await.unwrap();

        let rows = fx.table.rows();
        assert_eq!(rows.len(), 2);
        let plugin_row = rows
            .iter()
            .find(|r| r.source == LimiterSource::Plugin)
            .unwrap();
        assert_eq!(plugin_row.status, LimiterStatus::Overridden);
        assert_eq!(plugin_row.plugin_instance, "P");

        let mut limiters = InstanceLimiters::new();
        limiters.entry("Q".into()).or_default().insert(
            "get".into(),
            LimiterDefinition::new("get").for_instance("hub/q@latest", "Q").max_concurrency(1),
        );
        let pushed = within(fx.manager.apply_user_limiter_change(limiters.clone()))
            .await
            .unwrap();
        assert_eq!(pushed, BTreeSet::from(["P".to_string()]));
        assert_eq!(fx.launcher.spawns("Q"), 0);

        let calls = fx.launcher.client("P").unwrap().calls();
        assert_eq!(calls.last().map(String::as_str), Some("limiters:"));
        let rows = fx.table.rows();
        assert!(rows
            .iter()
            .all(|r| r.status == LimiterStatus::Active));

        // unchanged limiters push nothing
        let pushed = within(fx.manager.apply_user_limiter_change(limiters))
            .await
            .unwrap();
        assert!(pushed.is_empty());
    }

    #[tokio::test]
    async fn limiter_push_failure_does_not_block_other_instances() {
        let fx = fixture();
        within(fx.manager.resolve(&names(&["a", "c"]))).await.unwrap();
        fx.launcher.client("P").unwrap().fail_limiters();

        // drops P's user limiter and adds one for Q, so both need a push
        let mut limiters = InstanceLimiters::new();
        limiters.entry("Q".into()).or_default().insert(
            "get".into(),
            LimiterDefinition::new("get").for_instance("hub/q@latest", "Q").max_concurrency(1),
        );
        let pushed = within(fx.manager.apply_user_limiter_change(limiters))
            .await
            .unwrap();

        assert_eq!(pushed, BTreeSet::from(["Q".to_string()]));
        let q_calls = fx.launcher.client("Q").unwrap().calls();
        assert_eq!(q_calls.last().map(String::as_str), Some("limiters:get"));
        let p_calls = fx.launcher.client("P").unwrap().calls();
        assert_eq!(p_calls.last().map(String::as_str), Some("limiters:list"));
        assert!(fx
            .table
            .rows()
            .iter()
            .any(|r| r.plugin_instance == "Q" && r.name == "get"));
    }

    #[tokio::test]
    async fn reload_stops_removed_instances() {
        let fx = fixture();
        within(fx.manager.resolve(&names(&["a", "c"]))).await.unwrap();

        let trimmed = CONFIG.replace(
            "[[plugin]]\ninstance = \"Q\"\nsource = \"hub/q@latest\"\n",
            "",
        );
        let trimmed = trimmed.replace(
            "[[connection]]\nname = \"c\"\nplugin = \"Q\"\n",
            "",
        );
        let trimmed = trimmed.replace("children = [\"a\", \"c\"]", "children = [\"a\"]");
        within(fx.manager.reload(FleetConfig::parse(&trimmed).unwrap()))
            .await
            .unwrap();

        assert!(!fx.launcher.client("Q").unwrap().is_running());
        let plugins = fx.manager.list_plugins().await;
        assert_eq!(plugins.len(), 1);
        assert_eq!(plugins[0].instance, "P");
        assert_eq!(plugins[0].state, "initialized");
        assert_eq!(plugins[0].connections, vec!["a", "b"]);

        let err = fx.manager.resolve(&names(&["c"])).await.unwrap_err();
        assert!(matches!(err, FleetError::UnknownConnection(_)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn shutdown_waits_for_in_flight_start() {
        let fx = fixture();
        fx.launcher.set_delay(Duration::from_millis(150));

        let manager = Arc::clone(&fx.manager);
        let resolve = tokio::spawn(async move { manager.resolve(&names(&["a"])).await });
        tokio::time::sleep(Duration::from_millis(30)).await;

        within(fx.manager.shutdown()).await;

        // the start that was already spawning has finished and been killed
        let response = within(resolve).await.unwrap().unwrap();
        assert_eq!(
            response.succeeded.len() + response.failed.len(),
            1,
            "{response:?}"
        );
        for client in fx.launcher.clients() {
            assert!(!client.is_running());
        }
        assert_eq!(fx.manager.running_count().await, 0);

        // nothing spawns after shutdown
        let response = within(fx.manager.resolve(&names(&["c"]))).await.unwrap();
        assert!(response.failed["Q"].contains("shutting down"));
        assert_eq!(fx.launcher.spawns("Q"), 0);

        // idempotent
        within(fx.manager.shutdown()).await;
    }

    #[test]
    fn grouping_expands_nested_aggregators_once() {
        let mut registry = Registry::default();
        for conn in [
            ConnectionConfig::new("a", "p", "P"),
            ConnectionConfig::new("b", "p", "P"),
            ConnectionConfig::new("inner", "p", "P").with_children(["a", "b"]),
            ConnectionConfig::new("outer", "p", "P").with_children(["inner", "a"]),
        ] {
            registry.connections.insert(conn.name.clone(), conn);
        }

        let groups = registry.group_requested(&names(&["outer", "b"])).unwrap();
        assert_eq!(groups["P"], vec!["a", "b"]);
    }

    #[test]
    fn stale_handle_removal_respects_replacement() {
        let mut registry = Registry::default();
        let Inserted::New(first) = registry.insert_starting("P", "p") else {
            panic!("expected insert");
        };
        assert!(matches!(
            registry.insert_starting("P", "p"),
            Inserted::AlreadyPresent
        ));

        assert!(registry.remove_if_same(&first));
        let Inserted::New(second) = registry.insert_starting("P", "p") else {
            panic!("expected insert");
        };
        assert!(!registry.remove_if_same(&first));
        assert!(Arc::ptr_eq(&registry.running["P"], &second));
    }
}
