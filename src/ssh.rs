//! SSH port-forward backend
//!
//! Drives a plain `ssh -N -R` reverse forward: the local service becomes
//! reachable on the remote host's forwarded port. The ssh child process is
//! supervised per connection and torn down on disconnect.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

use crate::backend::{allocate_conn_id, TunnelBackend};
use crate::config::ConnectionConfig;
use crate::connection::{Connection, ConnectionState};
use crate::process;

/// Grace period after spawn during which an early ssh exit is treated as
/// a failed connect.
const STARTUP_SETTLE: Duration = Duration::from_millis(1500);

/// How long disconnect waits for ssh to honour SIGTERM before SIGKILL.
const TERMINATE_TIMEOUT: Duration = Duration::from_secs(5);

/// Reverse port-forward backend shelling out to the system ssh client
pub struct SshForwardBackend {
    children: Mutex<HashMap<String, Child>>,
}

impl SshForwardBackend {
    pub fn new() -> Self {
        Self {
            children: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for SshForwardBackend {
    fn default() -> Self {
        Self::new()
    }
}

/// Build the ssh argument vector for one forward.
///
/// Kept separate from process spawning so the invocation is testable.
fn forward_args(config: &ConnectionConfig) -> Result<Vec<String>> {
    if config.remote_host.is_empty() {
        bail!("ssh backend requires remote_host");
    }
    if config.remote_port == 0 {
        bail!("ssh backend requires remote_port");
    }
    if config.local_port == 0 {
        bail!("ssh backend requires local_port");
    }

    let mut args = vec![
        "-N".to_string(),
        "-R".to_string(),
        format!("{}:127.0.0.1:{}", config.remote_port, config.local_port),
        "-o".to_string(),
        "BatchMode=yes".to_string(),
        "-o".to_string(),
        "ExitOnForwardFailure=yes".to_string(),
        "-o".to_string(),
        "StrictHostKeyChecking=accept-new".to_string(),
        "-o".to_string(),
        format!("ConnectTimeout={}", config.timeout_secs.max(1)),
        "-o".to_string(),
        "ServerAliveInterval=15".to_string(),
    ];

    if let Some(key) = &config.ssh_key {
        args.push("-i".to_string());
        args.push(key.display().to_string());
    }

    // Opaque provider payload: an optional list of extra ssh arguments.
    if let Some(provider) = config.provider_config("ssh") {
        if let Some(extra) = provider.get("extra_args").and_then(|v| v.as_sequence()) {
            for value in extra {
                if let Some(arg) = value.as_str() {
                    args.push(arg.to_string());
                }
            }
        }
    }

    let destination = match &config.ssh_user {
        Some(user) => format!("{}@{}", user, config.remote_host),
        None => config.remote_host.clone(),
    };
    args.push(destination);

    Ok(args)
}

#[async_trait]
impl TunnelBackend for SshForwardBackend {
    fn name(&self) -> &'static str {
        "ssh"
    }

    async fn connect(
        &self,
        cancel: CancellationToken,
        config: &ConnectionConfig,
    ) -> Result<Arc<Connection>> {
        let args = forward_args(config)?;
        debug!("Spawning ssh {}", args.join(" "));

        let mut child = Command::new("ssh")
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .context("Failed to spawn ssh client")?;

        // An early exit inside the settle window means the forward never
        // came up (auth failure, unreachable host, port in use).
        let settle = STARTUP_SETTLE.min(config.timeout());
        tokio::select! {
            status = child.wait() => {
                let status = status.context("ssh wait failed")?;
                bail!("ssh exited during startup: {}", status);
            }
            _ = cancel.cancelled() => {
                let _ = child.start_kill();
                bail!("ssh connect cancelled");
            }
            _ = sleep(settle) => {}
        }

        let pid = child.id().unwrap_or(0);
        let conn = Arc::new(Connection::new(
            allocate_conn_id("ssh"),
            "ssh",
            config.clone(),
            cancel,
        ));
        conn.mark_connected(pid);

        self.children
            .lock()
            .unwrap()
            .insert(conn.id.clone(), child);

        info!(
            "ssh forward up: remote {}:{} -> local {} (pid {})",
            config.remote_host, config.remote_port, config.local_port, pid
        );
        Ok(conn)
    }

    async fn disconnect(&self, conn: &Connection) -> Result<()> {
        let child = self.children.lock().unwrap().remove(&conn.id);

        let Some(mut child) = child else {
            // Nothing to tear down (already reaped or never tracked).
            warn!("ssh disconnect without a tracked child: {}", conn.id);
            conn.mark_disconnected();
            return Ok(());
        };

        if let Some(pid) = child.id() {
            // Ask nicely first so ssh can close the forward.
            if let Err(e) = process::terminate(pid as i32) {
                debug!("Terminating ssh for {} failed: {}", conn.id, e);
            }
        }

        match timeout(TERMINATE_TIMEOUT, child.wait()).await {
            Ok(status) => {
                status.context("ssh wait failed during disconnect")?;
            }
            Err(_) => {
                warn!("ssh pid for {} ignored SIGTERM, killing", conn.id);
                let _ = child.start_kill();
                child
                    .wait()
                    .await
                    .context("ssh wait failed after kill")?;
            }
        }

        conn.mark_disconnected();
        info!("ssh forward for {} torn down", conn.id);
        Ok(())
    }

    fn is_healthy(&self, conn: &Connection) -> bool {
        if conn.state() != ConnectionState::Connected {
            return false;
        }
        let pid = conn.pid();
        pid != 0 && process::pid_alive(pid as i32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn forward_config() -> ConnectionConfig {
        ConnectionConfig {
            remote_host: "tunnel.example.com".to_string(),
            remote_port: 8022,
            local_port: 3000,
            ssh_user: Some("relay".to_string()),
            ..ConnectionConfig::default()
        }
    }

    #[test]
    fn args_describe_a_reverse_forward() {
        let args = forward_args(&forward_config()).unwrap();

        assert_eq!(args[0], "-N");
        assert_eq!(args[1], "-R");
        assert_eq!(args[2], "8022:127.0.0.1:3000");
        assert_eq!(args.last().unwrap(), "relay@tunnel.example.com");
        assert!(args.contains(&"ExitOnForwardFailure=yes".to_string()));
    }

    #[test]
    fn args_include_identity_file_when_configured() {
        let mut config = forward_config();
        config.ssh_key = Some(PathBuf::from("/home/relay/.ssh/id_ed25519"));

        let args = forward_args(&config).unwrap();
        let key_pos = args.iter().position(|a| a == "-i").unwrap();
        assert_eq!(args[key_pos + 1], "/home/relay/.ssh/id_ed25519");
    }

    #[test]
    fn args_without_user_use_bare_host() {
        let mut config = forward_config();
        config.ssh_user = None;

        let args = forward_args(&config).unwrap();
        assert_eq!(args.last().unwrap(), "tunnel.example.com");
    }

    #[test]
    fn provider_config_extra_args_are_appended() {
        let mut config = forward_config();
        let payload: serde_yaml::Value =
            serde_yaml::from_str("extra_args:\n  - \"-4\"\n  - \"-C\"\n").unwrap();
        config.provider_configs.insert("ssh".to_string(), payload);

        let args = forward_args(&config).unwrap();
        assert!(args.contains(&"-4".to_string()));
        assert!(args.contains(&"-C".to_string()));
        // Destination stays last.
        assert_eq!(args.last().unwrap(), "relay@tunnel.example.com");
    }

    #[test]
    fn incomplete_endpoint_is_rejected() {
        let mut config = forward_config();
        config.remote_host.clear();
        assert!(forward_args(&config).is_err());

        let mut config = forward_config();
        config.remote_port = 0;
        assert!(forward_args(&config).is_err());

        let mut config = forward_config();
        config.local_port = 0;
        assert!(forward_args(&config).is_err());
    }

    #[test]
    fn health_requires_connected_state_and_live_pid() {
        let backend = SshForwardBackend::new();
        let conn = Connection::new(
            "ssh-1",
            "ssh",
            forward_config(),
            CancellationToken::new(),
        );

        // Connecting, no pid.
        assert!(!backend.is_healthy(&conn));

        // Our own pid is certainly alive.
        conn.mark_connected(std::process::id());
        assert!(backend.is_healthy(&conn));

        conn.mark_disconnected();
        assert!(!backend.is_healthy(&conn));
    }
}
