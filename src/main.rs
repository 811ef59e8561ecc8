//! tunl - Multi-backend tunnel supervisor
//!
//! tunl keeps a pool of tunnel connections alive through pluggable
//! backends and routes user traffic through one healthy PRIMARY:
//! - Automatic failover to a healthy backup when the primary degrades
//! - Auto-recovery to higher-priority tunnels when they return
//! - Active TCP latency probing with smoothed per-connection history
//! - Non-blocking event stream for lifecycle and failover events
//! - Zero-downtime config reload (arc-swap based hot reload)

use anyhow::Result;
use daemonize::Daemonize;

mod backend;
mod check;
mod cli;
mod config;
mod connection;
mod constants;
mod error;
mod events;
mod failover;
mod logging;
mod manager;
mod metrics;
mod process;
mod ssh;
mod status;
mod supervisor;

use cli::{Cli, Commands};
use config::Settings;

/// Fork and detach process to run as daemon
/// Note: PID file is created by supervisor::run_daemon, not here
fn fork_daemon() -> Result<()> {
    let daemonize = Daemonize::new().working_directory("/tmp").umask(0o027);

    match daemonize.start() {
        Ok(_) => {
            // Child process continues - parent has exited
            Ok(())
        }
        Err(e) => {
            eprintln!("Failed to daemonize: {}", e);
            std::process::exit(1);
        }
    }
}

/// Run async logic with the pre-parsed command
async fn run_with_command(command: Commands, daemon_mode: bool) -> Result<()> {
    // For Start command, load config first to get log_level
    let log_level = match &command {
        Commands::Start {
            config: cli_config, ..
        } => match Settings::resolve_config_path(cli_config.as_deref()) {
            Ok(config_path) => match Settings::load_from_file(&config_path).await {
                Ok(settings) => settings.log_level,
                Err(_) => "info".to_string(), // Default if config fails to load
            },
            Err(_) => "info".to_string(), // Default if no config found
        },
        _ => "info".to_string(), // Default for non-start commands
    };

    // Initialize logging system with config's log_level
    logging::init_logging(&log_level, daemon_mode)?;

    log::info!("{} v{} starting", constants::APP_NAME, constants::VERSION);

    // Dispatch subcommands
    match command {
        Commands::Start { config, daemon } => {
            if daemon {
                // Already forked, run daemon logic
                log::info!("Starting in daemon mode");
                supervisor::run_daemon(config.as_deref()).await?;
            } else {
                // Run in foreground
                log::info!("Starting in foreground mode");
                supervisor::run_foreground(config.as_deref()).await?;
            }
        }
        Commands::Stop => {
            log::info!("Stopping running tunl supervisor");
            process::stop_daemon()?;
        }
        Commands::Graceful => {
            // Zero-downtime config reload (send SIGHUP signal)
            log::info!("Reloading configuration gracefully");
            process::reload_daemon()?;
        }
        Commands::Check {
            config,
            strict,
            json,
            verbose,
        } => {
            log::info!("Running configuration check");
            check::run_and_print(config, strict, json, verbose).await?;
        }
        Commands::Status {
            config,
            json,
            verbose,
        } => {
            log::info!("Showing tunl status");
            status::run_and_print(config, json, verbose).await?;
        }
    }

    Ok(())
}

/// Application entry point
/// Parses CLI arguments and dispatches to appropriate subcommands.
fn main() -> Result<()> {
    // Parse CLI arguments first (before any potential fork)
    let cli = Cli::parse_args();

    // Determine if running in daemon mode
    let daemon_mode = matches!(cli.command, Commands::Start { daemon: true, .. });

    // Fork to background if daemon mode (BEFORE initializing tokio runtime)
    if daemon_mode {
        fork_daemon()?;
    }

    // Create tokio runtime manually after potential fork
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run_with_command(cli.command, daemon_mode))
}
