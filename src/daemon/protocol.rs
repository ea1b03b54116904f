//! IPC Protocol types using rkyv for zero-copy serialization
//!
//! Frames are produced by [`crate::wire`]; the server reads requests in
//! archived form without deserializing them.

use crate::plugin::ResolveResponse;
use crate::reattach::ReattachDescriptor;
use rkyv::{Archive, Deserialize, Serialize};

/// App protocol version announced in the daemon handshake
pub const DAEMON_PROTOCOL_VERSION: u32 = 1;

/// IPC request from client to daemon
#[derive(Archive, Deserialize, Serialize, Debug, Clone)]
#[rkyv(derive(Debug))]
pub enum Request {
    /// Check if daemon is alive
    Ping,
    /// Shutdown the daemon, stopping every plugin process
    Shutdown,
    /// Resolve connection names to running plugin processes
    Resolve { connections: Vec<String> },
    /// Re-read configuration in the background
    RefreshConnections,
    /// List plugin instances known to the manager
    ListPlugins,
    /// Captured worker output
    PluginLogs {
        instance: String,
        /// Number of lines to return
        lines: u32,
    },
}

/// IPC response from daemon to client
#[derive(Archive, Deserialize, Serialize, Debug, Clone)]
#[rkyv(derive(Debug))]
pub enum Response {
    /// Response to Ping
    Pong {
        uptime_secs: u64,
        version: String,
        running_plugins: u32,
    },
    /// Generic success
    Ok,
    /// Error occurred
    Error { message: String },
    /// Outcome of a resolve, per connection and per failed instance
    Resolved {
        succeeded: Vec<(String, ReattachDescriptor)>,
        failed: Vec<(String, String)>,
    },
    Plugins { list: Vec<PluginInfo> },
    /// Log lines
    Logs { lines: Vec<String> },
}

impl Response {
    pub fn resolved(response: ResolveResponse) -> Self {
        let mut succeeded: Vec<_> = response.succeeded.into_iter().collect();
        succeeded.sort_by(|a, b| a.0.cmp(&b.0));
        let mut failed: Vec<_> = response.failed.into_iter().collect();
        failed.sort();
        Response::Resolved { succeeded, failed }
    }
}

/// One registry entry as reported to clients
#[derive(Archive, Deserialize, Serialize, Debug, Clone, PartialEq)]
#[rkyv(derive(Debug))]
pub struct PluginInfo {
    pub instance: String,
    pub plugin: String,
    /// starting / initialized / failed
    pub state: String,
    pub pid: Option<u32>,
    pub connections: Vec<String>,
}
