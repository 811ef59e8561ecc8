//! Constants definition module
//!
//! Centralizes constants used throughout the application.
//! This improves maintainability by requiring changes in only one place.

use std::path::PathBuf;
use std::time::Duration;

/// Application basic settings
pub const APP_NAME: &str = "tunl";
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Health evaluation defaults
///
/// The failover sweep marks a tunnel unhealthy after FAILURE_THRESHOLD
/// consecutive failed checks and healthy again after RECOVERY_THRESHOLD
/// consecutive good ones.
pub const DEFAULT_HEALTH_CHECK_INTERVAL_SECS: u64 = 10;
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 3;
pub const DEFAULT_RECOVERY_THRESHOLD: u32 = 2;
pub const DEFAULT_MAX_LATENCY_MS: u64 = 2_000;

/// Latency collection defaults
///
/// Probe timeout is a hard dial deadline - too short flags slow but working
/// tunnels, too long delays unhealthy detection by a full sweep.
pub const DEFAULT_METRICS_INTERVAL_SECS: u64 = 10;
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Number of latency samples retained per connection. The exposed latency
/// is the mean of the valid samples in this window.
pub const LATENCY_WINDOW_SIZE: usize = 10;

/// Event bus defaults
pub const DEFAULT_EVENT_BUFFER_SIZE: usize = 100;
pub const EVENT_LOG_CAPACITY: usize = 256;

/// Graceful shutdown settings
///
/// Maximum time to wait for backend teardown and sweep tasks to exit.
/// Forces shutdown after this time to prevent infinite waits.
pub const GRACEFUL_SHUTDOWN_TIMEOUT_SECS: u64 = 30;

/// File and directory settings
pub const PID_FILENAME: &str = "tunl.pid";
pub const LOG_FILENAME: &str = "tunl.log";
pub const CONFIG_FILENAME: &str = "config.yaml";

/// Probe target used when a connection has no usable remote endpoint and
/// its method is not in the fallback table below. DNS-over-TCP on a public
/// anycast resolver answers from everywhere and accepts plain TCP dials.
pub const GENERIC_PROBE_ADDR: &str = "1.1.1.1:53";

/// Provider-specific probe fallback table.
///
/// Used when a connection carries no remote endpoint of its own. Each entry
/// is a publicly reachable ingress the provider operates, so time-to-SYN-ACK
/// approximates the tunnel's path latency.
pub fn fallback_probe_addr(method: &str) -> &'static str {
    match method {
        "cloudflare" => "region1.v2.argotunnel.com:7844",
        "ngrok" => "connect.ngrok-agent.com:443",
        "tailscale" => "controlplane.tailscale.com:443",
        "wireguard" => "engage.cloudflareclient.com:2408",
        "ssh" => GENERIC_PROBE_ADDR,
        _ => GENERIC_PROBE_ADDR,
    }
}

/// Configuration file priority (higher = more priority)
/// 1. Path specified via CLI argument
/// 2. $HOME/.tunl/config.yaml
/// 3. /etc/tunl/config.yaml
pub fn get_home_config_path() -> PathBuf {
    dirs::home_dir()
        .map(|home| home.join(".tunl").join(CONFIG_FILENAME))
        .unwrap_or_else(|| PathBuf::from(CONFIG_FILENAME))
}

pub fn get_system_config_path() -> PathBuf {
    PathBuf::from("/etc/tunl").join(CONFIG_FILENAME)
}

/// PID file path ($HOME/.tunl/tunl.pid)
pub fn get_pid_file_path() -> PathBuf {
    dirs::home_dir()
        .map(|home| home.join(".tunl").join(PID_FILENAME))
        .unwrap_or_else(|| PathBuf::from(PID_FILENAME))
}

/// Log file path ($HOME/.tunl/tunl.log)
pub fn get_log_file_path() -> PathBuf {
    dirs::home_dir()
        .map(|home| home.join(".tunl").join(LOG_FILENAME))
        .unwrap_or_else(|| PathBuf::from(LOG_FILENAME))
}

/// Runtime directory path ($HOME/.tunl/)
pub fn get_runtime_dir() -> PathBuf {
    dirs::home_dir()
        .map(|home| home.join(".tunl"))
        .unwrap_or_else(|| PathBuf::from("."))
}
