//! Rate limiter definitions and reconciliation between plugin defaults and
//! user overrides.
//!
//! Plugins ship default limiters; users may declare limiters for a plugin
//! instance. A plugin limiter shadowed by a user limiter of the same name is
//! kept but reported as [`LimiterStatus::Overridden`].

use crate::error::{FleetError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    rkyv::Archive,
    rkyv::Serialize,
    rkyv::Deserialize,
)]
#[serde(rename_all = "snake_case")]
#[rkyv(derive(Debug))]
pub enum LimiterSource {
    /// Declared by the plugin itself
    Plugin,
    /// Declared in user configuration
    #[default]
    Config,
}

#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    rkyv::Archive,
    rkyv::Serialize,
    rkyv::Deserialize,
)]
#[serde(rename_all = "snake_case")]
#[rkyv(derive(Debug))]
pub enum LimiterStatus {
    #[default]
    Active,
    Overridden,
}

#[derive(
    Debug, Clone, PartialEq, Serialize, Deserialize, rkyv::Archive, rkyv::Serialize, rkyv::Deserialize,
)]
#[rkyv(derive(Debug))]
pub struct LimiterDefinition {
    pub name: String,
    #[serde(default)]
    pub plugin: String,
    #[serde(default)]
    pub plugin_instance: String,
    /// Tokens added per second
    pub fill_rate: Option<f64>,
    pub bucket_size: Option<u64>,
    pub max_concurrency: Option<u64>,
    #[serde(default)]
    pub scope: Vec<String>,
    #[serde(default, rename = "where")]
    pub where_clause: Option<String>,
    #[serde(default)]
    pub source: LimiterSource,
    #[serde(default)]
    pub status: LimiterStatus,
}

impl LimiterDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            plugin: String::new(),
            plugin_instance: String::new(),
            fill_rate: None,
            bucket_size: None,
            max_concurrency: None,
            scope: Vec::new(),
            where_clause: None,
            source: LimiterSource::Config,
            status: LimiterStatus::Active,
        }
    }

    pub fn for_instance(mut self, plugin: impl Into<String>, instance: impl Into<String>) -> Self {
        self.plugin = plugin.into();
        self.plugin_instance = instance.into();
        self
    }

    pub fn throughput(mut self, fill_rate: f64, bucket_size: u64) -> Self {
        self.fill_rate = Some(fill_rate);
        self.bucket_size = Some(bucket_size);
        self
    }

    pub fn max_concurrency(mut self, max: u64) -> Self {
        self.max_concurrency = Some(max);
        self
    }

    pub fn scope<I, S>(mut self, scope: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.scope = scope.into_iter().map(Into::into).collect();
        self
    }

    pub fn where_clause(mut self, predicate: impl Into<String>) -> Self {
        self.where_clause = Some(predicate.into());
        self
    }

    pub fn source(mut self, source: LimiterSource) -> Self {
        self.source = source;
        self
    }

    /// A limiter caps throughput (fill rate + bucket size), concurrency, or both.
    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: &str| FleetError::InvalidLimiter {
            name: self.name.clone(),
            reason: reason.to_string(),
        };

        if self.name.trim().is_empty() {
            return Err(invalid("name must not be empty"));
        }
        if self.fill_rate.is_some() != self.bucket_size.is_some() {
            return Err(invalid("fill_rate and bucket_size must be set together"));
        }
        if self.fill_rate.is_none() && self.max_concurrency.is_none() {
            return Err(invalid(
                "at least one of fill_rate/bucket_size or max_concurrency must be set",
            ));
        }
        if matches!(self.fill_rate, Some(rate) if rate.is_nan() || rate <= 0.0) {
            return Err(invalid("fill_rate must be positive"));
        }
        if self.bucket_size == Some(0) || self.max_concurrency == Some(0) {
            return Err(invalid("bucket_size and max_concurrency must be positive"));
        }
        Ok(())
    }

    /// Same limiting behaviour, ignoring source/status bookkeeping. Scope is
    /// an ordered list of dimensions, so a reordered scope is a change.
    pub fn equivalent(&self, other: &Self) -> bool {
        self.name == other.name
            && self.fill_rate == other.fill_rate
            && self.bucket_size == other.bucket_size
            && self.max_concurrency == other.max_concurrency
            && self.where_clause == other.where_clause
            && self.scope == other.scope
    }
}

/// Limiters of one instance, by name.
pub type LimiterMap = BTreeMap<String, LimiterDefinition>;

/// Limiters keyed by plugin instance.
pub type InstanceLimiters = BTreeMap<String, LimiterMap>;

/// Union of plugin-declared and user-declared limiters with override status resolved.
pub fn merge(plugin_declared: &InstanceLimiters, user: &InstanceLimiters) -> Vec<LimiterDefinition> {
    let mut rows = Vec::new();

    for (instance, limiters) in plugin_declared {
        let overrides = user.get(instance);
        for (name, limiter) in limiters {
            let mut row = limiter.clone();
            row.plugin_instance = instance.clone();
            row.source = LimiterSource::Plugin;
            row.status = if overrides.is_some_and(|m| m.contains_key(name)) {
                LimiterStatus::Overridden
            } else {
                LimiterStatus::Active
            };
            rows.push(row);
        }
    }

    for (instance, limiters) in user {
        for limiter in limiters.values() {
            let mut row = limiter.clone();
            row.plugin_instance = instance.clone();
            row.source = LimiterSource::Config;
            row.status = LimiterStatus::Active;
            rows.push(row);
        }
    }

    rows
}

/// Plugin instances whose user limiter set differs between `old` and `new`.
pub fn diff(old: &InstanceLimiters, new: &InstanceLimiters) -> BTreeSet<String> {
    let instances: BTreeSet<&String> = old.keys().chain(new.keys()).collect();

    instances
        .into_iter()
        .filter(|instance| match (old.get(*instance), new.get(*instance)) {
            (Some(a), Some(b)) => !maps_equivalent(a, b),
            _ => true,
        })
        .cloned()
        .collect()
}

fn maps_equivalent(a: &LimiterMap, b: &LimiterMap) -> bool {
    a.len() == b.len()
        && a
            .iter()
            .all(|(name, la)| b.get(name).is_some_and(|lb| la.equivalent(lb)))
}

/// Group a flat list of limiters by instance, keyed by name.
pub fn by_instance<I>(limiters: I) -> InstanceLimiters
where
    I: IntoIterator<Item = LimiterDefinition>,
{
    let mut grouped = InstanceLimiters::new();
    for limiter in limiters {
        grouped
            .entry(limiter.plugin_instance.clone())
            .or_default()
            .insert(limiter.name.clone(), limiter);
    }
    grouped
}
