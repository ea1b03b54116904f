//! Reattach record of the running daemon, persisted as one JSON object.
//!
//! ```json
//! {"protocol":"fleet-rkyv","protocol_version":1,
//!  "addr":{"network":"unix","address":"/.../daemon-4242.sock"},
//!  "pid":4242,"executable":"/usr/local/bin/fleet","struct_version":1}
//! ```
//!
//! Loading heals itself: a record that does not parse, was written by a
//! different struct version, or names a pid that no longer exists is deleted
//! and reported as "not running".

use super::process;
use crate::reattach::{Handshake, NetAddr, ReattachConfig};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, info, trace, warn};

pub const STATE_STRUCT_VERSION: u32 = 1;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistedDaemonState {
    pub protocol: String,
    pub protocol_version: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub addr: Option<NetAddr>,
    pub pid: u32,
    pub executable: PathBuf,
    pub struct_version: u32,
    /// Computed on load, never persisted
    #[serde(skip)]
    pub running: bool,
}

impl PersistedDaemonState {
    pub fn new(handshake: &Handshake, pid: u32, executable: PathBuf) -> Self {
        Self {
            protocol: handshake.protocol.clone(),
            protocol_version: handshake.app_version,
            addr: Some(handshake.addr.clone()),
            pid,
            executable,
            struct_version: STATE_STRUCT_VERSION,
            running: true,
        }
    }

    /// Load and verify the record at `path`.
    ///
    /// Only I/O errors other than "not found" are returned; every other
    /// problem yields a not-running state.
    pub fn load(path: &Path) -> Result<Self> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                trace!(path = %path.display(), "No daemon state file");
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Failed to read daemon state {}", path.display()))
            }
        };

        let mut state: Self = match serde_json::from_str(&content) {
            Ok(state) => state,
            Err(e) => {
                warn!(path = %path.display(), "Discarding unparsable daemon state: {}", e);
                Self::delete(path)?;
                return Ok(Self::default());
            }
        };

        if state.struct_version != STATE_STRUCT_VERSION {
            warn!(
                found = state.struct_version,
                expected = STATE_STRUCT_VERSION,
                "Discarding daemon state written by another version"
            );
            Self::delete(path)?;
            return Ok(Self::default());
        }

        if state
            .addr
            .as_ref()
            .is_some_and(|a| a.network.is_empty() || a.address.is_empty())
        {
            state.addr = None;
        }

        state.running = process::is_process_running(state.pid);
        if !state.running {
            info!(pid = state.pid, "Recorded daemon is gone, removing state file");
            Self::delete(path)?;
        }

        debug!(pid = state.pid, running = state.running, "Loaded daemon state");
        Ok(state)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory {}", parent.display()))?;
        }

        let content = serde_json::to_string_pretty(self).context("Failed to serialize daemon state")?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, content)
            .with_context(|| format!("Failed to write daemon state {}", tmp.display()))?;
        std::fs::rename(&tmp, path)
            .with_context(|| format!("Failed to move daemon state into {}", path.display()))?;

        debug!(path = %path.display(), pid = self.pid, "Saved daemon state");
        Ok(())
    }

    pub fn delete(path: &Path) -> Result<()> {
        match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to delete {}", path.display())),
        }
    }

    /// `None` when no address was recorded.
    pub fn reattach_config(&self) -> Option<ReattachConfig> {
        let addr = self.addr.clone()?;
        Some(ReattachConfig {
            protocol: self.protocol.clone(),
            protocol_version: self.protocol_version,
            addr,
            pid: self.pid,
        })
    }
}
