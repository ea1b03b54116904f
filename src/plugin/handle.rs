//! Startup state of one plugin instance.
//!
//! ```text
//! Starting ──► Initialized
//!     └──────► Failed
//! ```
//!
//! Both terminal states are final. A restart of the same instance creates a
//! fresh handle; an old one is never reset.

use super::client::PluginClient;
use crate::reattach::ReattachDescriptor;
use std::sync::{Arc, OnceLock, RwLock};
use tokio::sync::watch;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PluginState {
    Starting,
    Initialized,
    Failed(String),
}

impl PluginState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, PluginState::Starting)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PluginState::Starting => "starting",
            PluginState::Initialized => "initialized",
            PluginState::Failed(_) => "failed",
        }
    }
}

pub struct RunningPlugin {
    instance: String,
    plugin: String,
    state: watch::Sender<PluginState>,
    client: OnceLock<Arc<dyn PluginClient>>,
    descriptor: RwLock<Option<ReattachDescriptor>>,
}

impl RunningPlugin {
    pub fn new(instance: impl Into<String>, plugin: impl Into<String>) -> Arc<Self> {
        let (state, _) = watch::channel(PluginState::Starting);
        Arc::new(Self {
            instance: instance.into(),
            plugin: plugin.into(),
            state,
            client: OnceLock::new(),
            descriptor: RwLock::new(None),
        })
    }

    pub fn instance(&self) -> &str {
        &self.instance
    }

    pub fn plugin(&self) -> &str {
        &self.plugin
    }

    pub fn state(&self) -> PluginState {
        self.state.borrow().clone()
    }

    pub fn client(&self) -> Option<Arc<dyn PluginClient>> {
        self.client.get().cloned()
    }

    /// Attach the spawned process. Only the starting task calls this, once.
    pub(crate) fn set_client(&self, client: Arc<dyn PluginClient>) {
        if self.client.set(client).is_err() {
            tracing::warn!(instance = %self.instance, "Plugin client attached twice, keeping the first");
        }
    }

    pub fn descriptor(&self) -> Option<ReattachDescriptor> {
        self.descriptor
            .read()
            .expect("RunningPlugin descriptor lock poisoned")
            .clone()
    }

    /// Edit the descriptor in place. Callers must hold the manager's registry lock.
    pub(crate) fn update_descriptor<F>(&self, edit: F) -> Option<ReattachDescriptor>
    where
        F: FnOnce(&mut ReattachDescriptor),
    {
        let mut guard = self
            .descriptor
            .write()
            .expect("RunningPlugin descriptor lock poisoned");
        let desc = guard.as_mut()?;
        edit(desc);
        Some(desc.clone())
    }

    /// `Starting -> Initialized`. Returns false if the handle already finished.
    pub(crate) fn mark_initialized(&self, descriptor: ReattachDescriptor) -> bool {
        if self.state().is_terminal() {
            return false;
        }
        *self
            .descriptor
            .write()
            .expect("RunningPlugin descriptor lock poisoned") = Some(descriptor);
        self.transition(PluginState::Initialized)
    }

    /// `Starting -> Failed`. Returns false if the handle already finished.
    pub(crate) fn mark_failed(&self, error: impl Into<String>) -> bool {
        self.transition(PluginState::Failed(error.into()))
    }

    fn transition(&self, next: PluginState) -> bool {
        self.state.send_if_modified(|current| {
            if current.is_terminal() {
                return false;
            }
            *current = next;
            true
        })
    }

    /// Wait until the handle leaves `Starting`; every waiter sees the same outcome.
    pub async fn wait(&self) -> PluginState {
        let mut rx = self.state.subscribe();
        let state = match rx.wait_for(PluginState::is_terminal).await {
            Ok(state) => state.clone(),
            // the sender lives as long as `self`
            Err(_) => self.state(),
        };
        state
    }

    /// Whether the underlying process is still there.
    pub fn process_alive(&self) -> bool {
        self.client().is_some_and(|c| c.is_running())
    }
}

impl std::fmt::Debug for RunningPlugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunningPlugin")
            .field("instance", &self.instance)
            .field("plugin", &self.plugin)
            .field("state", &self.state())
            .field("pid", &self.client().map(|c| c.pid()))
            .finish()
    }
}
