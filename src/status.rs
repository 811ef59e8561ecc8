//! Status reporting module
//!
//! Observes the local daemon (via the PID file) and summarizes the
//! configured tunnel set. The daemon's live connection table is not
//! reachable from another process; event history lives in the JSON log.

use anyhow::Result;
use serde::Serialize;
use std::path::PathBuf;

use crate::config::Settings;
use crate::constants::get_log_file_path;
use crate::process::{self, DaemonState};

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub running: bool,
    pub pid: Option<i32>,
    /// A PID file exists but its process is gone (crashed supervisor)
    pub stale: bool,
    pub config_path: String,
    pub tunnels: Vec<String>,
    pub failover_enabled: bool,
    pub metrics_enabled: bool,
    pub log_file: String,
}

impl StatusReport {
    pub fn to_plain_text(&self, verbose: bool) -> String {
        let daemon = match (self.running, self.stale, self.pid) {
            (true, _, Some(pid)) => format!("running (PID {})", pid),
            (false, true, Some(pid)) => format!("not running (stale PID file from {})", pid),
            _ => "not running".to_string(),
        };

        let mut lines = vec![
            "tunl status".to_string(),
            format!("  daemon: {}", daemon),
            format!("  tunnels: {}", self.tunnels.join(", ")),
        ];

        if !verbose {
            if !self.running {
                lines.push("  next: run 'tunl start'".to_string());
            }
            return lines.join("\n");
        }

        lines.push(format!("  config: {}", self.config_path));
        lines.push(format!("  failover: {}", on_off(self.failover_enabled)));
        lines.push(format!("  metrics: {}", on_off(self.metrics_enabled)));
        lines.push(format!("  log: {}", self.log_file));

        lines.join("\n")
    }
}

fn on_off(value: bool) -> &'static str {
    if value {
        "enabled"
    } else {
        "disabled"
    }
}

/// Build the status report from the PID file and configuration.
pub async fn build_report(cli_config: Option<PathBuf>) -> Result<StatusReport> {
    let path = Settings::resolve_config_path(cli_config.as_deref())?;

    let (tunnels, failover_enabled, metrics_enabled) = match Settings::load_from_file(&path).await {
        Ok(settings) => (
            settings.tunnels.clone(),
            settings.enable_failover && settings.failover.enabled,
            settings.enable_metrics,
        ),
        Err(_) => (Vec::new(), false, false),
    };

    let (running, stale, pid) = match process::daemon_state() {
        DaemonState::Running(pid) => (true, false, Some(pid)),
        DaemonState::Stale(pid) => (false, true, Some(pid)),
        DaemonState::Stopped => (false, false, None),
    };

    Ok(StatusReport {
        running,
        pid,
        stale,
        config_path: path.display().to_string(),
        tunnels,
        failover_enabled,
        metrics_enabled,
        log_file: get_log_file_path().display().to_string(),
    })
}

/// Print the status report as plain text or JSON.
pub async fn run_and_print(cli_config: Option<PathBuf>, json: bool, verbose: bool) -> Result<()> {
    let report = build_report(cli_config).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("{}", report.to_plain_text(verbose));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(running: bool) -> StatusReport {
        StatusReport {
            running,
            pid: running.then_some(4242),
            stale: false,
            config_path: "/home/user/.tunl/config.yaml".to_string(),
            tunnels: vec!["ssh".to_string(), "cloudflare".to_string()],
            failover_enabled: true,
            metrics_enabled: true,
            log_file: "/home/user/.tunl/tunl.log".to_string(),
        }
    }

    #[test]
    fn running_daemon_shows_pid() {
        let text = report(true).to_plain_text(false);
        assert!(text.contains("running (PID 4242)"));
        assert!(text.contains("ssh, cloudflare"));
    }

    #[test]
    fn stopped_daemon_suggests_start() {
        let text = report(false).to_plain_text(false);
        assert!(text.contains("not running"));
        assert!(text.contains("tunl start"));
    }

    #[test]
    fn stale_slot_is_called_out() {
        let mut stale = report(false);
        stale.stale = true;
        stale.pid = Some(4242);

        let text = stale.to_plain_text(false);
        assert!(text.contains("stale PID file from 4242"));
    }

    #[test]
    fn verbose_output_includes_engine_switches() {
        let text = report(true).to_plain_text(true);
        assert!(text.contains("failover: enabled"));
        assert!(text.contains("metrics: enabled"));
        assert!(text.contains("config:"));
    }
}
