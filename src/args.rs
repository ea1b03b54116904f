use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "fleet")]
#[command(version)]
#[command(about = "Plugin process manager for the query engine", long_about = None)]
pub(crate) struct Cli {
    /// Install directory. Can also be set via FLEET_INSTALL_DIR env var.
    #[arg(long, global = true)]
    pub install_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub(crate) enum Commands {
    /// Manage the background daemon
    Daemon {
        #[command(subcommand)]
        command: DaemonCommands,
    },

    /// Resolve connections to running plugin processes, starting them if needed
    Resolve {
        /// Connection names (aggregators expand to their children)
        #[arg(required = true)]
        connections: Vec<String>,

        /// Print the result as JSON
        #[arg(long)]
        json: bool,
    },

    /// Re-read fleet.toml in the daemon
    Refresh,

    /// List plugin instances known to the daemon
    Plugins,

    /// Show captured output of a plugin instance
    Logs {
        /// Plugin instance name
        instance: String,

        /// Number of recent lines to show
        #[arg(short = 'n', long, default_value = "50")]
        lines: u32,
    },
}

#[derive(Subcommand, PartialEq, Eq)]
pub(crate) enum DaemonCommands {
    /// Run the daemon in the foreground (used by `daemon start`)
    #[command(hide = true)]
    Run,

    /// Start the daemon if it is not running
    Start,

    /// Stop the daemon and every plugin process
    Stop,

    /// Stop the running daemon and start a fresh one
    Restart,

    /// Show daemon status and plugin instances
    Status,
}
