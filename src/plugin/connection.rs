use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One declarative connection.
///
/// A connection with children is an aggregator: it only exists for routing
/// and is never sent to a worker process.
#[derive(
    Debug, Clone, PartialEq, Serialize, Deserialize, rkyv::Archive, rkyv::Serialize, rkyv::Deserialize,
)]
#[rkyv(derive(Debug))]
pub struct ConnectionConfig {
    pub name: String,
    /// Plugin source reference, e.g. `hub.example.com/aws@latest`
    pub plugin: String,
    pub plugin_instance: String,
    #[serde(default)]
    pub children: Vec<String>,
    /// Opaque configuration body handed to the worker.
    #[serde(default)]
    pub config: String,
}

impl ConnectionConfig {
    pub fn new(
        name: impl Into<String>,
        plugin: impl Into<String>,
        plugin_instance: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            plugin: plugin.into(),
            plugin_instance: plugin_instance.into(),
            children: Vec::new(),
            config: String::new(),
        }
    }

    pub fn with_children<I, S>(mut self, children: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.children = children.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_config(mut self, config: impl Into<String>) -> Self {
        self.config = config.into();
        self
    }

    pub fn is_aggregator(&self) -> bool {
        !self.children.is_empty()
    }
}

pub type ConnectionMap = BTreeMap<String, ConnectionConfig>;

/// Added, deleted and changed connections, either for the whole fleet or one instance.
#[derive(
    Debug,
    Clone,
    Default,
    PartialEq,
    rkyv::Archive,
    rkyv::Serialize,
    rkyv::Deserialize,
)]
#[rkyv(derive(Debug))]
pub struct ConnectionDelta {
    pub added: Vec<ConnectionConfig>,
    pub deleted: Vec<ConnectionConfig>,
    pub changed: Vec<ConnectionConfig>,
}

impl ConnectionDelta {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.deleted.is_empty() && self.changed.is_empty()
    }
}

/// Compute the change set between two connection maps.
///
/// A connection that moves to another instance, or flips between aggregator
/// and regular, is reported as a delete of the old form plus an add of the new.
pub fn diff(old: &ConnectionMap, new: &ConnectionMap) -> ConnectionDelta {
    let mut delta = ConnectionDelta::default();

    for (name, old_conn) in old {
        match new.get(name) {
            None => delta.deleted.push(old_conn.clone()),
            Some(new_conn) if new_conn == old_conn => {}
            Some(new_conn)
                if new_conn.plugin_instance != old_conn.plugin_instance
                    || new_conn.is_aggregator() != old_conn.is_aggregator() =>
            {
                delta.deleted.push(old_conn.clone());
                delta.added.push(new_conn.clone());
            }
            Some(new_conn) => delta.changed.push(new_conn.clone()),
        }
    }

    for (name, new_conn) in new {
        if !old.contains_key(name) {
            delta.added.push(new_conn.clone());
        }
    }

    delta
}

/// Split a change set per plugin instance, dropping aggregators.
pub fn group_by_instance(delta: &ConnectionDelta) -> BTreeMap<String, ConnectionDelta> {
    let mut grouped: BTreeMap<String, ConnectionDelta> = BTreeMap::new();

    let regular = |c: &&ConnectionConfig| !c.is_aggregator();
    for conn in delta.added.iter().filter(regular) {
        grouped
            .entry(conn.plugin_instance.clone())
            .or_default()
            .added
            .push(conn.clone());
    }
    for conn in delta.deleted.iter().filter(regular) {
        grouped
            .entry(conn.plugin_instance.clone())
            .or_default()
            .deleted
            .push(conn.clone());
    }
    for conn in delta.changed.iter().filter(regular) {
        grouped
            .entry(conn.plugin_instance.clone())
            .or_default()
            .changed
            .push(conn.clone());
    }

    grouped
}

/// Non-aggregator connections served by `instance`, in name order.
pub fn instance_connections<'a>(
    connections: &'a ConnectionMap,
    instance: &str,
) -> Vec<&'a ConnectionConfig> {
    connections
        .values()
        .filter(|c| !c.is_aggregator() && c.plugin_instance == instance)
        .collect()
}

/// Key a list of connections by name.
pub fn index_by_name(configs: &[ConnectionConfig]) -> ConnectionMap {
    configs.iter().map(|c| (c.name.clone(), c.clone())).collect()
}

/// Non-aggregator connection count per instance.
pub fn connection_counts(connections: &ConnectionMap) -> BTreeMap<String, usize> {
    let mut counts = BTreeMap::new();
    for conn in connections.values().filter(|c| !c.is_aggregator()) {
        *counts.entry(conn.plugin_instance.clone()).or_insert(0) += 1;
    }
    counts
}
