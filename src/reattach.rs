//! Cross-process identity of a running worker or daemon.
//!
//! A process announces itself with a single handshake line on stdout:
//!
//! ```text
//! CORE_VERSION|APP_VERSION|NETWORK|ADDRESS|PROTOCOL
//! 1|1|unix|/home/me/.local/share/fleet/internal/daemon-4242.sock|fleet-rkyv
//! ```
//!
//! The parsed [`Handshake`] plus the pid is enough for a different process
//! to reconnect ([`ReattachConfig`]).

use crate::error::{FleetError, Result};
use serde::{Deserialize, Serialize};

pub const CORE_PROTOCOL_VERSION: u32 = 1;
pub const WIRE_PROTOCOL: &str = "fleet-rkyv";

/// Network location of a listening process.
#[derive(
    Debug,
    Clone,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    rkyv::Archive,
    rkyv::Serialize,
    rkyv::Deserialize,
)]
#[rkyv(derive(Debug))]
pub struct NetAddr {
    /// `unix` or `tcp`
    pub network: String,
    #[serde(alias = "string")]
    pub address: String,
}

impl NetAddr {
    pub fn unix(path: impl Into<String>) -> Self {
        Self {
            network: "unix".to_string(),
            address: path.into(),
        }
    }

    pub fn tcp(addr: impl Into<String>) -> Self {
        Self {
            network: "tcp".to_string(),
            address: addr.into(),
        }
    }

    pub fn is_unix(&self) -> bool {
        self.network == "unix"
    }
}

impl std::fmt::Display for NetAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.network, self.address)
    }
}

/// Everything needed to reconnect to an already running process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReattachConfig {
    pub protocol: String,
    pub protocol_version: u32,
    pub addr: NetAddr,
    pub pid: u32,
}

/// Control-plane operations a worker declares support for.
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
#[rkyv(derive(Debug))]
pub struct Capabilities {
    pub multiple_connections: bool,
    pub cache_options: bool,
    pub rate_limiters: bool,
    pub schema_notifications: bool,
}

/// Reattach information for one plugin instance plus the connections it serves.
///
/// `connections` always mirrors the connections currently assigned to the
/// instance; it is edited in place, only while the manager's registry lock
/// is held.
#[derive(
    Debug, Clone, PartialEq, Serialize, Deserialize, rkyv::Archive, rkyv::Serialize, rkyv::Deserialize,
)]
#[rkyv(derive(Debug))]
pub struct ReattachDescriptor {
    pub protocol: String,
    pub protocol_version: u32,
    pub addr: Option<NetAddr>,
    pub pid: u32,
    pub connections: Vec<String>,
    pub capabilities: Capabilities,
}

impl ReattachDescriptor {
    pub fn new(
        handshake: &Handshake,
        pid: u32,
        connections: Vec<String>,
        capabilities: Capabilities,
    ) -> Self {
        Self {
            protocol: handshake.protocol.clone(),
            protocol_version: handshake.app_version,
            addr: Some(handshake.addr.clone()),
            pid,
            connections,
            capabilities,
        }
    }

    /// `None` when the address is missing; such a descriptor cannot be reattached to.
    pub fn reattach_config(&self) -> Option<ReattachConfig> {
        let addr = self.addr.clone()?;
        Some(ReattachConfig {
            protocol: self.protocol.clone(),
            protocol_version: self.protocol_version,
            addr,
            pid: self.pid,
        })
    }

    pub fn serves(&self, connection: &str) -> bool {
        self.connections.iter().any(|c| c == connection)
    }

    pub fn add_connection(&mut self, connection: &str) {
        if !self.serves(connection) {
            self.connections.push(connection.to_string());
        }
    }

    pub fn remove_connection(&mut self, connection: &str) {
        self.connections.retain(|c| c != connection);
    }

    /// Make the connection list equal to `required`, keeping existing order.
    pub fn sync_connections<'a, I>(&mut self, required: I)
    where
        I: IntoIterator<Item = &'a str>,
    {
        let required: Vec<&str> = required.into_iter().collect();
        self.connections.retain(|c| required.contains(&c.as_str()));
        for name in required {
            self.add_connection(name);
        }
    }
}

/// Parsed startup line of a worker or daemon process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub core_version: u32,
    pub app_version: u32,
    pub addr: NetAddr,
    pub protocol: String,
}

impl Handshake {
    pub fn new(app_version: u32, addr: NetAddr) -> Self {
        Self {
            core_version: CORE_PROTOCOL_VERSION,
            app_version,
            addr,
            protocol: WIRE_PROTOCOL.to_string(),
        }
    }

    pub fn parse(line: &str) -> Result<Self> {
        let parts: Vec<&str> = line.trim().split('|').collect();
        if parts.len() != 5 {
            return Err(FleetError::Handshake(format!(
                "expected 5 '|'-separated fields, got {}: {:?}",
                parts.len(),
                line.trim()
            )));
        }

        let core_version: u32 = parts[0]
            .parse()
            .map_err(|_| FleetError::Handshake(format!("bad core version {:?}", parts[0])))?;
        if core_version != CORE_PROTOCOL_VERSION {
            return Err(FleetError::Handshake(format!(
                "unsupported core protocol version {core_version} (want {CORE_PROTOCOL_VERSION})"
            )));
        }

        let app_version: u32 = parts[1]
            .parse()
            .map_err(|_| FleetError::Handshake(format!("bad app version {:?}", parts[1])))?;

        let network = parts[2];
        if network != "unix" && network != "tcp" {
            return Err(FleetError::Handshake(format!("unknown network {network:?}")));
        }
        if parts[3].is_empty() {
            return Err(FleetError::Handshake("empty address".to_string()));
        }
        if parts[4] != WIRE_PROTOCOL {
            return Err(FleetError::Handshake(format!(
                "unsupported protocol {:?}",
                parts[4]
            )));
        }

        Ok(Self {
            core_version,
            app_version,
            addr: NetAddr {
                network: network.to_string(),
                address: parts[3].to_string(),
            },
            protocol: parts[4].to_string(),
        })
    }

    pub fn to_line(&self) -> String {
        format!(
            "{}|{}|{}|{}|{}",
            self.core_version, self.app_version, self.addr.network, self.addr.address, self.protocol
        )
    }
}
