pub mod clienv;
pub mod config;
pub mod daemon;
pub mod error;
pub mod plugin;
pub mod reattach;
pub mod wire;

pub use config::FleetConfig;
pub use error::{FleetError, Result};
pub use plugin::{PluginManager, ResolveResponse};
