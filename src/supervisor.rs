//! Supervisor module
//!
//! Manages the daemon lifecycle: loads configuration, builds the
//! connection manager, starts the configured tunnels, and coordinates
//! signal handling, hot config reload and graceful shutdown.

use anyhow::{Context, Result};
use arc_swap::ArcSwap;
use log::{error, info, warn};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio::time::{sleep, timeout, Duration};

use crate::config::Settings;
use crate::constants::{get_home_config_path, EVENT_LOG_CAPACITY, GRACEFUL_SHUTDOWN_TIMEOUT_SECS};
use crate::error::ResultExt;
use crate::events::{EventLogger, EventType};
use crate::logging;
use crate::manager::{ConnectionManager, ManagerConfig};
use crate::process::DaemonSlot;
use crate::ssh::SshForwardBackend;

/// Configuration as loaded from disk, hot-swappable via arc-swap
pub struct RuntimeConfig {
    pub settings: Settings,
    pub config_path: PathBuf,
}

/// Load and validate a configuration file into a RuntimeConfig.
async fn load_runtime_config(path: &Path) -> Result<RuntimeConfig> {
    let settings = Settings::load_from_file(path)
        .await
        .context_config(&format!("Load failed for {}", path.display()))?;

    Ok(RuntimeConfig {
        settings,
        config_path: path.to_path_buf(),
    })
}

/// Load initial configuration
///
/// Loads the configuration file at startup, or creates the default
/// template if no file exists yet.
async fn load_initial_config(cli_path: Option<&Path>) -> Result<RuntimeConfig> {
    let path = if let Some(p) = cli_path {
        if !p.exists() {
            anyhow::bail!("Specified configuration file does not exist: {}", p.display());
        }
        p.to_path_buf()
    } else {
        let home_path = get_home_config_path();
        if home_path.exists() {
            home_path
        } else {
            info!("No configuration file found. Creating default template.");
            Settings::init_default_file().await?
        }
    };

    info!("Loading configuration file: {}", path.display());
    load_runtime_config(&path).await
}

/// Supervisor
///
/// Manages daemon process main loop, signal handling, and task orchestration.
pub struct Supervisor;

impl Supervisor {
    /// Run as daemon
    ///
    /// 1. Claim the supervisor slot (PID file)
    /// 2. Load initial configuration
    /// 3. Build manager, register backends, start tunnels
    /// 4. Main loop (signals / reload)
    pub async fn run_daemon(cli_config_path: Option<&Path>) -> Result<()> {
        // One supervisor per pool; a stale slot from a crashed run is evicted
        let _slot = DaemonSlot::claim().context("Could not claim the supervisor slot")?;

        info!("tunl daemon starting (PID: {})", std::process::id());
        Self::run(cli_config_path).await
    }

    /// Run in foreground (no PID file, logs to stdout)
    pub async fn run_foreground(cli_config_path: Option<&Path>) -> Result<()> {
        info!("tunl starting in foreground (PID: {})", std::process::id());
        Self::run(cli_config_path).await
    }

    async fn run(cli_config_path: Option<&Path>) -> Result<()> {
        let runtime = load_initial_config(cli_config_path).await?;

        info!("Configuration loaded: {}", runtime.config_path.display());
        info!("  - Tunnels: {}", runtime.settings.tunnels.join(", "));
        info!("  - Metrics: {}", runtime.settings.enable_metrics);
        info!("  - Failover: {}", runtime.settings.enable_failover);

        let manager = ConnectionManager::new(ManagerConfig::from(&runtime.settings));
        manager.register_backend(Arc::new(SshForwardBackend::new()));

        let config = ArcSwap::new(Arc::new(runtime));

        // Mirror lifecycle and failover events into the JSON log and the
        // bounded event history.
        let event_log = Arc::new(EventLogger::new(EVENT_LOG_CAPACITY));
        let mut event_rx = manager.event_bus().subscribe("supervisor", None);
        let tap_log = Arc::clone(&event_log);
        let tap_handle = tokio::spawn(async move {
            while let Some(event) = event_rx.recv().await {
                // Event-tagged target: the log line's `event` field carries
                // the event type instead of a generic "log".
                info!(
                    target: &logging::event_target(event.event_type),
                    "{} [{}]", event.message, event.conn_id
                );
                tap_log.log(event);
            }
        });

        // Startup tunnel establishment keeps the daemon alive even on
        // total failure; the operator can fix the config and SIGHUP.
        {
            let runtime = config.load_full();
            if let Err(e) = Self::start_tunnels(&manager, &runtime).await {
                error!("Tunnel startup failed: {:#}", e);
                warn!("Running without tunnels; fix configuration and send SIGHUP");
            }
        }

        // Register signal handlers
        let mut sigterm =
            signal(SignalKind::terminate()).context("Failed to register SIGTERM handler")?;
        let mut sigint =
            signal(SignalKind::interrupt()).context("Failed to register SIGINT handler")?;
        let mut sighup =
            signal(SignalKind::hangup()).context("Failed to register SIGHUP handler")?;

        info!("Signal handlers registered (SIGTERM, SIGINT, SIGHUP)");

        // Main loop
        loop {
            tokio::select! {
                // SIGTERM (stop command)
                _ = sigterm.recv() => {
                    info!("SIGTERM received - starting graceful shutdown");
                    break;
                }

                // SIGINT (Ctrl+C)
                _ = sigint.recv() => {
                    info!("SIGINT received - starting graceful shutdown");
                    break;
                }

                // SIGHUP (graceful reload)
                _ = sighup.recv() => {
                    info!("SIGHUP received - reloading configuration");
                    if let Err(e) = Self::reload_config(&manager, &config).await {
                        error!("Configuration reload failed: {:#}", e);
                    }
                }
            }
        }

        // Graceful shutdown
        info!("Starting graceful shutdown...");
        Self::graceful_shutdown(&manager).await?;

        let failovers = event_log.by_type(EventType::Failover).len();
        if failovers > 0 {
            info!("Observed {} failover(s) this run", failovers);
        }

        // The event tap ends once the bus closes.
        if let Err(e) = tap_handle.await {
            error!("Event tap task termination error: {}", e);
        }

        info!("tunl shutdown complete");
        Ok(())
    }

    /// Establish the configured tunnel set, retrying transient failures.
    ///
    /// Partial success is success; total failure is retried
    /// `retry_attempts` times with `retry_delay` between attempts.
    async fn start_tunnels(
        manager: &Arc<ConnectionManager>,
        runtime: &RuntimeConfig,
    ) -> Result<()> {
        let settings = &runtime.settings;
        let attempts = settings.connection.retry_attempts.max(1);

        let mut last_error = None;
        for attempt in 1..=attempts {
            match manager
                .start_multiple(&settings.tunnels, settings.connection.clone())
                .await
            {
                Ok(conns) => {
                    info!(
                        "Started {}/{} tunnels",
                        conns.len(),
                        settings.tunnels.len()
                    );
                    if conns.len() < settings.tunnels.len() {
                        warn!("Some tunnels failed to start; failover pool is reduced");
                    }
                    return Ok(());
                }
                Err(e) => {
                    warn!(
                        "Tunnel startup attempt {}/{} failed: {:#}",
                        attempt, attempts, e
                    );
                    last_error = Some(e);
                    if attempt < attempts {
                        sleep(settings.connection.retry_delay()).await;
                    }
                }
            }
        }

        Err(last_error.expect("at least one attempt was made"))
    }

    /// Perform configuration hot-swap
    ///
    /// 1. Load and validate the new configuration file
    /// 2. Atomically replace via arc-swap
    /// 3. Rebuild the supervised tunnel set
    async fn reload_config(
        manager: &Arc<ConnectionManager>,
        config: &ArcSwap<RuntimeConfig>,
    ) -> Result<()> {
        let current = config.load_full();
        let path = current.config_path.clone();

        info!("Configuration reload starting: {}", path.display());

        let new_runtime = match load_runtime_config(&path).await {
            Ok(runtime) => runtime,
            Err(e) => {
                warn!(
                    "Configuration reload rejected. Keeping previous runtime configuration: {:#}",
                    e
                );
                return Err(e);
            }
        };

        // Engine construction parameters cannot be swapped in place.
        let old = &current.settings;
        let new = &new_runtime.settings;
        if old.enable_metrics != new.enable_metrics
            || old.enable_failover != new.enable_failover
            || old.metrics_interval_secs != new.metrics_interval_secs
            || old.event_buffer_size != new.event_buffer_size
            || old.failover != new.failover
        {
            warn!("Engine settings changed. They will apply on the next restart.");
        }

        config.store(Arc::new(new_runtime));
        drop(current);

        // Rebuild the tunnel set under the new configuration.
        if let Err(e) = manager.stop_all().await {
            warn!("Some tunnels did not stop cleanly during reload: {:#}", e);
        }

        let runtime = config.load_full();
        Self::start_tunnels(manager, &runtime).await?;

        info!("Configuration successfully reloaded");
        Ok(())
    }

    /// Shut the manager down, bounded by the graceful shutdown timeout.
    async fn graceful_shutdown(manager: &Arc<ConnectionManager>) -> Result<()> {
        let result = timeout(
            Duration::from_secs(GRACEFUL_SHUTDOWN_TIMEOUT_SECS),
            manager.shutdown(),
        )
        .await;

        match result {
            Ok(Ok(())) => {
                info!("All tunnels torn down successfully");
            }
            Ok(Err(e)) => {
                warn!("Shutdown finished with errors: {:#}", e);
            }
            Err(_) => {
                warn!(
                    "Graceful shutdown timeout ({} seconds). Force stopping.",
                    GRACEFUL_SHUTDOWN_TIMEOUT_SECS
                );
            }
        }

        Ok(())
    }
}

/// Public API for main.rs
pub async fn run_daemon(cli_config_path: Option<&Path>) -> Result<()> {
    Supervisor::run_daemon(cli_config_path).await
}

pub async fn run_foreground(cli_config_path: Option<&Path>) -> Result<()> {
    Supervisor::run_foreground(cli_config_path).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::testing::MockBackend;
    use crate::backend::TunnelBackend;
    use crate::config::ConnectionConfig;

    fn runtime_with(tunnels: &[&str], retry_attempts: u32) -> RuntimeConfig {
        let connection = ConnectionConfig {
            retry_attempts,
            retry_delay_secs: 0,
            ..ConnectionConfig::default()
        };
        RuntimeConfig {
            settings: Settings {
                log_level: "info".to_string(),
                enable_metrics: true,
                enable_failover: true,
                metrics_interval_secs: 600,
                event_buffer_size: 64,
                failover: Default::default(),
                connection,
                tunnels: tunnels.iter().map(|s| s.to_string()).collect(),
            },
            config_path: PathBuf::from("/tmp/tunl-test.yaml"),
        }
    }

    fn quiet_manager() -> Arc<ConnectionManager> {
        let mut config = ManagerConfig::default();
        config.metrics_interval = Duration::from_secs(600);
        config.failover.health_check_interval = Duration::from_secs(600);
        ConnectionManager::new(config)
    }

    #[tokio::test]
    async fn start_tunnels_succeeds_first_try() {
        let manager = quiet_manager();
        manager.register_backend(Arc::new(MockBackend::new("mock")));

        let runtime = runtime_with(&["mock"], 3);
        Supervisor::start_tunnels(&manager, &runtime).await.unwrap();
        assert_eq!(manager.connection_count(), 1);

        manager.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn start_tunnels_retries_total_failure() {
        let manager = quiet_manager();
        let backend = Arc::new(MockBackend::failing("mock"));
        manager.register_backend(Arc::clone(&backend) as Arc<dyn TunnelBackend>);

        let runtime = runtime_with(&["mock"], 3);
        let err = Supervisor::start_tunnels(&manager, &runtime)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("No tunnel could be started"));

        // One connect per attempt.
        assert_eq!(
            backend.connects.load(std::sync::atomic::Ordering::SeqCst),
            3
        );

        manager.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn partial_success_does_not_retry() {
        let manager = quiet_manager();
        let good = Arc::new(MockBackend::new("good"));
        let bad = Arc::new(MockBackend::failing("bad"));
        manager.register_backend(Arc::clone(&good) as Arc<dyn TunnelBackend>);
        manager.register_backend(Arc::clone(&bad) as Arc<dyn TunnelBackend>);

        let runtime = runtime_with(&["good", "bad"], 3);
        Supervisor::start_tunnels(&manager, &runtime).await.unwrap();

        assert_eq!(manager.connection_count(), 1);
        assert_eq!(good.connects.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(bad.connects.load(std::sync::atomic::Ordering::SeqCst), 1);

        manager.shutdown().await.unwrap();
    }
}
