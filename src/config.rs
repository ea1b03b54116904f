//! Fleet configuration file (`<install>/config/fleet.toml`).
//!
//! ```toml
//! [options]
//! plugin_start_timeout_secs = 30
//! cache_max_size_mb = 1024
//!
//! [[plugin]]
//! instance = "aws_west"
//! source = "hub.example.com/aws@latest"
//! memory_max_mb = 2048
//!
//!   [[plugin.limiter]]
//!   name = "list_buckets"
//!   fill_rate = 10.0
//!   bucket_size = 20
//!
//! [[connection]]
//! name = "aws_prod"
//! plugin = "aws_west"
//! config = 'regions = ["us-west-2"]'
//!
//! [[connection]]
//! name = "aws_all"
//! plugin = "aws_west"
//! children = ["aws_prod"]
//! ```
//!
//! Env vars from [`crate::clienv`] take precedence over `[options]`.

use crate::clienv;
use crate::error::{FleetError, Result};
use crate::plugin::connection::{ConnectionConfig, ConnectionMap};
use crate::plugin::limiter::{InstanceLimiters, LimiterDefinition, LimiterSource};
use crate::plugin::ManagerOptions;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetOptions {
    pub plugin_start_timeout_secs: Option<u64>,
    pub cache_enabled: Option<bool>,
    pub cache_ttl_secs: Option<u64>,
    pub cache_max_size_mb: Option<u64>,
    pub plugin_memory_max_mb: Option<u64>,
}

/// Settings of one plugin instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginInstanceConfig {
    pub instance: String,
    pub source: String,
    pub memory_max_mb: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RawPlugin {
    instance: String,
    source: String,
    memory_max_mb: Option<u64>,
    #[serde(default, rename = "limiter")]
    limiters: Vec<LimiterDefinition>,
}

#[derive(Debug, Deserialize)]
struct RawConnection {
    name: String,
    plugin: String,
    plugin_instance: Option<String>,
    #[serde(default)]
    children: Vec<String>,
    #[serde(default)]
    config: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawConfig {
    options: FleetOptions,
    #[serde(rename = "plugin")]
    plugins: Vec<RawPlugin>,
    #[serde(rename = "connection")]
    connections: Vec<RawConnection>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FleetConfig {
    pub options: FleetOptions,
    pub plugins: BTreeMap<String, PluginInstanceConfig>,
    pub connections: ConnectionMap,
    /// User-declared limiters by plugin instance
    pub limiters: InstanceLimiters,
}

impl FleetConfig {
    pub fn load(path: &Path) -> Result<Self> {
        tracing::trace!(path = %path.display(), "Loading fleet config");

        if !path.exists() {
            tracing::trace!("Config file does not exist, using defaults");
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let raw: RawConfig = toml::from_str(content)?;
        let mut config = FleetConfig {
            options: raw.options,
            ..Default::default()
        };

        for plugin in raw.plugins {
            if config.plugins.contains_key(&plugin.instance) {
                return Err(FleetError::Config(format!(
                    "plugin instance '{}' declared twice",
                    plugin.instance
                )));
            }
            for mut limiter in plugin.limiters {
                limiter.validate()?;
                limiter.plugin = plugin.source.clone();
                limiter.plugin_instance = plugin.instance.clone();
                limiter.source = LimiterSource::Config;
                config
                    .limiters
                    .entry(plugin.instance.clone())
                    .or_default()
                    .insert(limiter.name.clone(), limiter);
            }
            config.plugins.insert(
                plugin.instance.clone(),
                PluginInstanceConfig {
                    instance: plugin.instance,
                    source: plugin.source,
                    memory_max_mb: plugin.memory_max_mb,
                },
            );
        }

        for raw_conn in raw.connections {
            if config.connections.contains_key(&raw_conn.name) {
                return Err(FleetError::Config(format!(
                    "connection '{}' declared twice",
                    raw_conn.name
                )));
            }

            let instance = raw_conn
                .plugin_instance
                .unwrap_or_else(|| raw_conn.plugin.clone());
            // `plugin` may name a declared instance or a plugin source directly
            let source = match config.plugins.get(&instance) {
                Some(p) => p.source.clone(),
                None => {
                    config.plugins.insert(
                        instance.clone(),
                        PluginInstanceConfig {
                            instance: instance.clone(),
                            source: raw_conn.plugin.clone(),
                            memory_max_mb: None,
                        },
                    );
                    raw_conn.plugin.clone()
                }
            };

            let conn = ConnectionConfig::new(&raw_conn.name, source, instance)
                .with_children(raw_conn.children)
                .with_config(raw_conn.config);
            config.connections.insert(raw_conn.name, conn);
        }

        tracing::trace!(
            plugins = config.plugins.len(),
            connections = config.connections.len(),
            "Fleet config parsed"
        );
        Ok(config)
    }

    /// Effective manager options: env var > config file > default.
    pub fn manager_options(&self) -> ManagerOptions {
        let file = &self.options;
        ManagerOptions {
            start_timeout: clienv::plugin_start_timeout()
                .or(file.plugin_start_timeout_secs.map(Duration::from_secs))
                .unwrap_or_else(clienv::default_plugin_start_timeout),
            cache_enabled: clienv::cache_enabled()
                .or(file.cache_enabled)
                .unwrap_or(true),
            cache_ttl: clienv::cache_ttl()
                .or(file.cache_ttl_secs.map(Duration::from_secs))
                .unwrap_or_else(clienv::default_cache_ttl),
            cache_max_size_mb: clienv::cache_max_size_mb().or(file.cache_max_size_mb),
            plugin_memory_max_mb: clienv::plugin_memory_max_mb().or(file.plugin_memory_max_mb),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[options]
plugin_start_timeout_secs = 12
cache_max_size_mb = 100

[[plugin]]
instance = "aws_west"
source = "hub.example.com/aws@latest"
memory_max_mb = 2048

  [[plugin.limiter]]
  name = "list_buckets"
  fill_rate = 10.0
  bucket_size = 20
  scope = ["connection"]

[[connection]]
name = "aws_prod"
plugin = "aws_west"
config = 'regions = ["us-west-2"]'

[[connection]]
name = "aws_all"
plugin = "aws_west"
children = ["aws_prod"]

[[connection]]
name = "gh"
plugin = "hub.example.com/github@latest"
"#;

    #[test]
    fn parses_instances_connections_and_limiters() {
        let config = FleetConfig::parse(SAMPLE).unwrap();

        assert_eq!(config.plugins.len(), 2);
        assert_eq!(config.plugins["aws_west"].memory_max_mb, Some(2048));

        let prod = &config.connections["aws_prod"];
        assert_eq!(prod.plugin_instance, "aws_west");
        assert_eq!(prod.plugin, "hub.example.com/aws@latest");
        assert!(config.connections["aws_all"].is_aggregator());

        // implicit instance named after the plugin source
        let gh = &config.connections["gh"];
        assert_eq!(gh.plugin_instance, "hub.example.com/github@latest");
        assert!(config.plugins.contains_key("hub.example.com/github@latest"));

        let limiter = &config.limiters["aws_west"]["list_buckets"];
        assert_eq!(limiter.plugin_instance, "aws_west");
        assert_eq!(limiter.bucket_size, Some(20));
    }

    #[test]
    fn rejects_duplicates_and_bad_limiters() {
        let dup = "[[connection]]\nname='a'\nplugin='x'\n[[connection]]\nname='a'\nplugin='y'\n";
        assert!(matches!(FleetConfig::parse(dup), Err(FleetError::Config(_))));

        let bad = "[[plugin]]\ninstance='x'\nsource='x'\n[[plugin.limiter]]\nname='l'\n";
        assert!(matches!(
            FleetConfig::parse(bad),
            Err(FleetError::InvalidLimiter { .. })
        ));
    }

    #[test]
    fn missing_file_is_empty_config() {
        let tmp = tempfile::tempdir().unwrap();
        let config = FleetConfig::load(&tmp.path().join("fleet.toml")).unwrap();
        assert_eq!(config, FleetConfig::default());
    }
}
