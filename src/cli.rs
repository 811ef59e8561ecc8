//! CLI argument parsing module
//!
//! Uses clap derive macros to declaratively define commands and arguments.
//! This approach ensures type safety and automatically generates --help and --version.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// tunl - Multi-backend tunnel supervisor
#[derive(Parser, Debug)]
#[command(
    name = "tunl",
    about = "Multi-backend tunnel supervisor with automatic failover",
    long_about = r#"
tunl supervises a pool of tunnel connections and keeps one healthy
PRIMARY carrying user traffic, failing over to a backup when the primary
degrades and recovering when a higher-priority tunnel returns.

Core operations:
  tunl check    # Validate configuration and probe tunnel endpoints
  tunl status   # Observe daemon state and configured tunnels

Service control:
  tunl start    # Start in foreground mode
  tunl start -d # Start as background daemon
  tunl stop     # Stop running daemon
  tunl graceful # Reload config without downtime
"#,
    version = env!("CARGO_PKG_VERSION"),
    author = "tunl contributors"
)]
pub struct Cli {
    /// Subcommand (start, stop, graceful, check, status)
    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the tunnel supervisor
    #[command(name = "start", about = "Start the tunnel supervisor")]
    Start {
        /// Configuration file path (optional)
        #[arg(short, long, value_name = "FILE", help = "Configuration file path")]
        config: Option<PathBuf>,

        /// Run as daemon in background
        #[arg(short, long, help = "Run as daemon in background")]
        daemon: bool,
    },

    /// Stop running daemon
    #[command(name = "stop", about = "Stop running daemon")]
    Stop,

    /// Reload configuration without downtime (graceful reload)
    #[command(name = "graceful", about = "Reload configuration without downtime")]
    Graceful,

    /// Validate configuration and probe tunnel endpoints
    #[command(name = "check", about = "Validate configuration and probe tunnel endpoints")]
    Check {
        /// Configuration file path to validate
        #[arg(
            short,
            long,
            value_name = "FILE",
            help = "Configuration file path to validate"
        )]
        config: Option<PathBuf>,

        /// Treat warnings as errors (non-zero exit)
        #[arg(long, help = "Return non-zero when warnings are present")]
        strict: bool,

        /// Print check report in JSON format
        #[arg(long, help = "Print check report in JSON format")]
        json: bool,

        /// Print detailed check output
        #[arg(long, help = "Print detailed check output")]
        verbose: bool,
    },

    /// Observe daemon state and configured tunnels
    #[command(name = "status", about = "Observe daemon state and configured tunnels")]
    Status {
        /// Configuration file path used for the tunnel summary
        #[arg(
            short,
            long,
            value_name = "FILE",
            help = "Configuration file path for status summary"
        )]
        config: Option<PathBuf>,

        /// Print status in JSON format
        #[arg(long, help = "Print status in JSON format")]
        json: bool,

        /// Print detailed status output
        #[arg(long, help = "Print detailed status output")]
        verbose: bool,
    },
}

impl Cli {
    /// Parse CLI arguments and create Cli struct
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
