//! Plugin worker processes and the manager that owns them.
//!
//! ```text
//! resolve(["a", "b", "c"])
//!   └─► group by instance ──► P: [a, b]   Q: [c]
//!         └─► one task per instance: existing handle? wait : spawn + configure
//!               └─► ResponseAggregate { succeeded: conn -> descriptor, failed: instance -> error }
//! ```

pub mod aggregate;
pub mod cache;
pub mod client;
pub mod connection;
pub mod handle;
pub mod introspection;
pub mod limiter;
pub mod manager;
pub mod resolver;
pub mod worker;

#[cfg(test)]
pub(crate) mod testing;

pub use aggregate::{ResolveResponse, ResponseAggregate};
pub use client::{LaunchRequest, PluginClient, PluginLauncher};
pub use connection::{ConnectionConfig, ConnectionDelta, ConnectionMap};
pub use handle::{PluginState, RunningPlugin};
pub use introspection::{FileIntrospection, IntrospectionSink};
pub use limiter::LimiterDefinition;
pub use manager::{ManagerOptions, PluginManager};
pub use resolver::PluginPaths;
pub use worker::ProcessLauncher;
