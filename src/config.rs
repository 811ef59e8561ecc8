//! Configuration file management module
//!
//! Handles YAML configuration file parsing, validation, and default values.
//! Uses Serde to declaratively define configuration structure with
//! strong validation.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;

use crate::constants::{
    get_home_config_path, get_system_config_path, DEFAULT_EVENT_BUFFER_SIZE,
    DEFAULT_FAILURE_THRESHOLD, DEFAULT_HEALTH_CHECK_INTERVAL_SECS, DEFAULT_MAX_LATENCY_MS,
    DEFAULT_METRICS_INTERVAL_SECS, DEFAULT_RECOVERY_THRESHOLD,
};

/// Per-connection configuration handed to backends on connect
///
/// `provider_configs` is an opaque per-method payload; the supervisor
/// carries it by reference and never looks inside.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Remote endpoint host (may be empty for providers with fixed ingress)
    #[serde(default)]
    pub remote_host: String,
    /// Remote endpoint port (0 = unset)
    #[serde(default)]
    pub remote_port: u16,
    /// Local port the tunnel exposes
    #[serde(default)]
    pub local_port: u16,
    /// SSH private key path (ssh backend)
    #[serde(default)]
    pub ssh_key: Option<PathBuf>,
    /// SSH user name (ssh backend)
    #[serde(default)]
    pub ssh_user: Option<String>,
    /// Per-attempt connect timeout in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Connect attempts before the supervisor gives up at startup
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    /// Delay between startup connect attempts in seconds
    #[serde(default = "default_retry_delay_secs")]
    pub retry_delay_secs: u64,
    /// Per-connection health check interval hint in seconds
    #[serde(default = "default_health_interval_secs")]
    pub health_check_interval_secs: u64,
    /// Opaque provider-specific settings keyed by method name
    #[serde(default)]
    pub provider_configs: HashMap<String, serde_yaml::Value>,
}

fn default_timeout_secs() -> u64 {
    10
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_delay_secs() -> u64 {
    5
}

fn default_health_interval_secs() -> u64 {
    DEFAULT_HEALTH_CHECK_INTERVAL_SECS
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            remote_host: String::new(),
            remote_port: 0,
            local_port: 0,
            ssh_key: None,
            ssh_user: None,
            timeout_secs: default_timeout_secs(),
            retry_attempts: default_retry_attempts(),
            retry_delay_secs: default_retry_delay_secs(),
            health_check_interval_secs: default_health_interval_secs(),
            provider_configs: HashMap::new(),
        }
    }
}

impl ConnectionConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }

    /// Remote endpoint as host:port, if both parts are configured.
    pub fn remote_addr(&self) -> Option<String> {
        if self.remote_host.is_empty() || self.remote_port == 0 {
            return None;
        }
        Some(format!("{}:{}", self.remote_host, self.remote_port))
    }

    /// Opaque provider payload for one method, if present.
    pub fn provider_config(&self, method: &str) -> Option<&serde_yaml::Value> {
        self.provider_configs.get(method)
    }
}

/// Failover engine configuration block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailoverSettings {
    /// Master switch for the failover engine
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Seconds between health evaluation sweeps
    #[serde(default = "default_health_interval_secs")]
    pub health_check_interval_secs: u64,
    /// Consecutive failed checks before a connection is marked unhealthy
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Consecutive successful checks before a connection is marked healthy
    #[serde(default = "default_recovery_threshold")]
    pub recovery_threshold: u32,
    /// Probe latency above this many milliseconds counts as a failed check
    #[serde(default = "default_max_latency_ms")]
    pub max_latency_ms: u64,
    /// Migrate primary back to higher-priority connections when they recover
    #[serde(default = "default_true")]
    pub auto_recover: bool,
}

fn default_true() -> bool {
    true
}

fn default_failure_threshold() -> u32 {
    DEFAULT_FAILURE_THRESHOLD
}

fn default_recovery_threshold() -> u32 {
    DEFAULT_RECOVERY_THRESHOLD
}

fn default_max_latency_ms() -> u64 {
    DEFAULT_MAX_LATENCY_MS
}

impl Default for FailoverSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            health_check_interval_secs: DEFAULT_HEALTH_CHECK_INTERVAL_SECS,
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            recovery_threshold: DEFAULT_RECOVERY_THRESHOLD,
            max_latency_ms: DEFAULT_MAX_LATENCY_MS,
            auto_recover: true,
        }
    }
}

impl FailoverSettings {
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }

    pub fn max_latency(&self) -> Duration {
        Duration::from_millis(self.max_latency_ms)
    }
}

/// Complete configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Log level (debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Enable the latency collector
    #[serde(default = "default_true")]
    pub enable_metrics: bool,

    /// Enable the failover engine
    #[serde(default = "default_true")]
    pub enable_failover: bool,

    /// Seconds between latency probe sweeps
    #[serde(default = "default_metrics_interval_secs")]
    pub metrics_interval_secs: u64,

    /// Per-subscriber event queue capacity
    #[serde(default = "default_event_buffer_size")]
    pub event_buffer_size: usize,

    /// Failover engine configuration
    #[serde(default)]
    pub failover: FailoverSettings,

    /// Shared per-connection configuration for all tunnels
    #[serde(default)]
    pub connection: ConnectionConfig,

    /// Backend methods to start, highest priority first
    pub tunnels: Vec<String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_interval_secs() -> u64 {
    DEFAULT_METRICS_INTERVAL_SECS
}

fn default_event_buffer_size() -> usize {
    DEFAULT_EVENT_BUFFER_SIZE
}

impl Settings {
    pub fn metrics_interval(&self) -> Duration {
        Duration::from_secs(self.metrics_interval_secs)
    }

    /// Resolve configuration file path
    ///
    /// Uses CLI specified path if available, otherwise searches default paths.
    /// Priority:
    /// 1. Path specified via CLI argument
    /// 2. $HOME/.tunl/config.yaml
    /// 3. /etc/tunl/config.yaml
    pub fn resolve_config_path(cli_path: Option<&Path>) -> Result<PathBuf> {
        if let Some(path) = cli_path {
            return Ok(path.to_path_buf());
        }

        let home_path = get_home_config_path();
        if home_path.exists() {
            return Ok(home_path);
        }

        let system_path = get_system_config_path();
        if system_path.exists() {
            return Ok(system_path);
        }

        // Return home directory path as default (file may not exist)
        Ok(home_path)
    }

    /// Load configuration from file
    pub async fn load_from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .with_context(|| format!("Cannot read configuration file: {}", path.display()))?;

        let settings: Settings = serde_yaml::from_str(&content)
            .with_context(|| format!("Configuration file parsing failed: {}", path.display()))?;

        settings.validate()?;
        Ok(settings)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.tunnels.is_empty() {
            bail!("At least one tunnel method is required");
        }

        let mut seen = HashSet::new();
        for method in &self.tunnels {
            if method.is_empty() {
                bail!("Tunnel method name must not be empty");
            }
            if !seen.insert(method.clone()) {
                bail!("Duplicate tunnel method: {}", method);
            }
        }

        if self.metrics_interval_secs == 0 {
            bail!("metrics_interval_secs must be at least 1");
        }

        if self.failover.health_check_interval_secs == 0 {
            bail!("failover.health_check_interval_secs must be at least 1");
        }

        if self.failover.failure_threshold == 0 || self.failover.recovery_threshold == 0 {
            bail!("failover thresholds must be at least 1");
        }

        if self.event_buffer_size == 0 {
            bail!("event_buffer_size must be at least 1");
        }

        Ok(())
    }

    /// Generate default configuration file template
    pub fn default_template() -> String {
        r#"# tunl log level (debug, info, warn, error)
log_level: "info"

# Latency collector and failover engine switches
enable_metrics: true
enable_failover: true

# Seconds between latency probe sweeps
metrics_interval_secs: 10

failover:
  enabled: true
  health_check_interval_secs: 10
  failure_threshold: 3
  recovery_threshold: 2
  max_latency_ms: 2000
  auto_recover: true

# Shared connection settings for every tunnel
connection:
  remote_host: "example.com"
  remote_port: 22
  local_port: 8080
  ssh_user: "tunnel"
  # ssh_key: "/home/user/.ssh/id_ed25519"

# Backend methods to start, highest priority first.
# The first healthy entry carries user traffic.
tunnels:
  - "ssh"
"#
        .to_string()
    }

    /// Initialize default configuration file (create if not exists)
    pub async fn init_default_file() -> Result<PathBuf> {
        let path = get_home_config_path();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await.with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        if !path.exists() {
            fs::write(&path, Self::default_template())
                .await
                .with_context(|| {
                    format!("Failed to create default config file: {}", path.display())
                })?;
            log::info!("Default configuration file created: {}", path.display());
        }

        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn minimal_yaml() -> &'static str {
        r#"
tunnels:
  - "ssh"
"#
    }

    #[test]
    fn minimal_config_gets_defaults() {
        let settings: Settings = serde_yaml::from_str(minimal_yaml()).unwrap();
        settings.validate().unwrap();

        assert!(settings.enable_metrics);
        assert!(settings.enable_failover);
        assert_eq!(settings.metrics_interval_secs, 10);
        assert_eq!(settings.event_buffer_size, 100);
        assert_eq!(settings.failover.failure_threshold, 3);
        assert_eq!(settings.failover.recovery_threshold, 2);
        assert_eq!(settings.connection.timeout_secs, 10);
    }

    #[test]
    fn duplicate_tunnel_methods_rejected() {
        let yaml = r#"
tunnels:
  - "ssh"
  - "ssh"
"#;
        let settings: Settings = serde_yaml::from_str(yaml).unwrap();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn empty_tunnel_list_rejected() {
        let yaml = "tunnels: []\n";
        let settings: Settings = serde_yaml::from_str(yaml).unwrap();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn remote_addr_requires_host_and_port() {
        let mut config = ConnectionConfig::default();
        assert!(config.remote_addr().is_none());

        config.remote_host = "example.com".to_string();
        assert!(config.remote_addr().is_none());

        config.remote_port = 443;
        assert_eq!(config.remote_addr().as_deref(), Some("example.com:443"));
    }

    #[test]
    fn provider_configs_are_opaque_per_method() {
        let yaml = r#"
connection:
  provider_configs:
    cloudflare:
      token: "abc"
    ngrok:
      region: "eu"
tunnels:
  - "cloudflare"
"#;
        let settings: Settings = serde_yaml::from_str(yaml).unwrap();
        assert!(settings.connection.provider_config("cloudflare").is_some());
        assert!(settings.connection.provider_config("ngrok").is_some());
        assert!(settings.connection.provider_config("ssh").is_none());
    }

    #[test]
    fn default_template_parses_and_validates() {
        let settings: Settings = serde_yaml::from_str(&Settings::default_template()).unwrap();
        settings.validate().unwrap();
        assert_eq!(settings.tunnels, vec!["ssh".to_string()]);
    }

    #[tokio::test]
    async fn load_from_file_reads_and_validates() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{}", minimal_yaml()).unwrap();

        let settings = Settings::load_from_file(file.path()).await.unwrap();
        assert_eq!(settings.tunnels.len(), 1);
    }

    #[tokio::test]
    async fn load_from_file_rejects_invalid_yaml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "tunnels: {{not valid").unwrap();

        assert!(Settings::load_from_file(file.path()).await.is_err());
    }
}
