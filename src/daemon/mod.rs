//! Fleet daemon - long-lived process hosting the plugin manager
//!
//! One daemon runs per install directory. Invocations of `fleet` find it
//! through the persisted state file and talk to it over a local socket
//! using rkyv frames.
//!
//! ```text
//! fleet resolve a b ──► DaemonLifecycle::get_or_start ──► state.json
//!                               │
//!                               ▼
//! ┌──────────────────────────────────────────┐
//! │               fleet daemon               │
//! ├──────────────────────────────────────────┤
//! │  IPC Server (socket)  │  PluginManager   │
//! ├──────────────────────────────────────────┤
//! │  worker P │ worker Q │ ...               │
//! └──────────────────────────────────────────┘
//! ```

pub mod client;
pub mod lifecycle;
pub mod log_buffer;
pub mod process;
pub mod protocol;
pub mod server;
pub mod state;

pub use client::{DaemonClient, DaemonStatus};
pub use lifecycle::DaemonLifecycle;
pub use log_buffer::LogBuffer;
pub use protocol::{PluginInfo, Request, Response};
pub use server::DaemonServer;
pub use state::PersistedDaemonState;
