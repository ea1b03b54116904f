use crate::error::{FleetError, Result};
use std::path::{Component, Path, PathBuf};

const LATEST_LINK_NAME: &str = "latest";
const VERSION_FILE_NAME: &str = ".version";
const PLUGIN_EXTENSION: &str = "plugin";

/// Locates worker executables under `<install>/plugins`.
///
/// Layout: `plugins/<source>/[latest -> <version>/ | <version from .version>/]<name>.plugin`
#[derive(Debug, Clone)]
pub struct PluginPaths {
    plugins_dir: PathBuf,
}

impl PluginPaths {
    pub fn new(plugins_dir: impl Into<PathBuf>) -> Self {
        Self {
            plugins_dir: plugins_dir.into(),
        }
    }

    pub fn plugins_dir(&self) -> &Path {
        &self.plugins_dir
    }

    fn plugin_dir(&self, plugin: &str) -> Result<PathBuf> {
        let relative = Path::new(plugin);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)));
        if plugin.is_empty() || escapes {
            return Err(FleetError::Config(format!(
                "invalid plugin reference {plugin:?}"
            )));
        }
        Ok(self.plugins_dir.join(relative))
    }

    /// Directory of the active version of `plugin`.
    pub fn resolve_dir(&self, plugin: &str) -> Result<PathBuf> {
        let plugin_dir = self.plugin_dir(plugin)?;

        let latest_link = plugin_dir.join(LATEST_LINK_NAME);
        if latest_link.is_symlink() {
            if let Ok(resolved) = std::fs::canonicalize(&latest_link) {
                tracing::trace!(plugin = %plugin, dir = %resolved.display(), "Resolved via latest symlink");
                return Ok(resolved);
            }
        }

        let version_file = plugin_dir.join(VERSION_FILE_NAME);
        if let Ok(version) = std::fs::read_to_string(&version_file) {
            let versioned_dir = plugin_dir.join(version.trim());
            if !version.trim().is_empty() && versioned_dir.is_dir() {
                tracing::trace!(plugin = %plugin, version = %version.trim(), dir = %versioned_dir.display(), "Resolved via .version file");
                return Ok(versioned_dir);
            }
        }

        if !plugin_dir.is_dir() {
            return Err(FleetError::PluginStart {
                instance: plugin.to_string(),
                reason: format!("plugin is not installed ({})", plugin_dir.display()),
            });
        }

        tracing::trace!(plugin = %plugin, dir = %plugin_dir.display(), "Using plugin directory directly");
        Ok(plugin_dir)
    }

    /// The single `*.plugin` executable of the active version.
    pub fn executable(&self, plugin: &str) -> Result<PathBuf> {
        let dir = self.resolve_dir(plugin)?;

        let mut candidates: Vec<PathBuf> = std::fs::read_dir(&dir)?
            .flatten()
            .map(|entry| entry.path())
            .filter(|p| p.is_file() && p.extension().is_some_and(|e| e == PLUGIN_EXTENSION))
            .collect();
        candidates.sort();

        match candidates.len() {
            1 => Ok(candidates.remove(0)),
            0 => Err(FleetError::PluginStart {
                instance: plugin.to_string(),
                reason: format!("no *.{PLUGIN_EXTENSION} executable in {}", dir.display()),
            }),
            n => Err(FleetError::PluginStart {
                instance: plugin.to_string(),
                reason: format!("{n} *.{PLUGIN_EXTENSION} executables in {}", dir.display()),
            }),
        }
    }
}
