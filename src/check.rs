//! Configuration check module
//!
//! Static validation of the configuration file plus reachability probes
//! against each tunnel's effective probe target, reported as plain text
//! or JSON for operators.

use anyhow::{bail, Result};
use serde::Serialize;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

use crate::config::Settings;
use crate::constants::fallback_probe_addr;
use crate::metrics;

/// Backend methods this build ships a driver for. Other methods can still
/// be registered programmatically, so unknown names are a warning only.
const BUILTIN_METHODS: &[&str] = &["ssh"];

#[derive(Debug, Clone, Serialize)]
pub struct EndpointProbe {
    pub method: String,
    pub target: String,
    pub reachable: bool,
    pub latency_ms: Option<u64>,
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckReport {
    pub config_path: String,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub tunnel_count: usize,
    pub probes: Vec<EndpointProbe>,
}

impl CheckReport {
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn has_warnings(&self) -> bool {
        !self.warnings.is_empty()
    }

    pub fn to_plain_text(&self, verbose: bool) -> String {
        let mut lines = vec![
            "tunl check".to_string(),
            format!(
                "  result: {}",
                if self.has_errors() { "FAILED" } else { "OK" }
            ),
            format!("  tunnels: {}", self.tunnel_count),
            format!("  warnings: {}", self.warnings.len()),
        ];

        if !verbose {
            if self.has_errors() {
                lines.push("  next: run 'tunl check --verbose' and fix listed errors".to_string());
            } else if self.has_warnings() {
                lines.push("  next: inspect warnings with 'tunl check --verbose'".to_string());
            } else {
                lines.push("  next: run 'tunl start'".to_string());
            }
            return lines.join("\n");
        }

        lines.push(format!("  config: {}", self.config_path));

        if self.errors.is_empty() {
            lines.push("  errors: none".to_string());
        } else {
            lines.push("  errors:".to_string());
            for error in &self.errors {
                lines.push(format!("    - {}", error));
            }
        }

        if self.warnings.is_empty() {
            lines.push("  warnings: none".to_string());
        } else {
            lines.push("  warnings:".to_string());
            for warning in &self.warnings {
                lines.push(format!("    - {}", warning));
            }
        }

        if !self.probes.is_empty() {
            lines.push("  probes:".to_string());
            for probe in &self.probes {
                let outcome = match (probe.reachable, probe.latency_ms) {
                    (true, Some(ms)) => format!("reachable ({} ms)", ms),
                    (true, None) => "reachable".to_string(),
                    (false, _) => format!(
                        "unreachable{}",
                        probe
                            .detail
                            .as_deref()
                            .map(|d| format!(": {}", d))
                            .unwrap_or_default()
                    ),
                };
                lines.push(format!("    - {} [{}] {}", probe.target, probe.method, outcome));
            }
        }

        lines.join("\n")
    }
}

/// Build the check report for one configuration file.
pub async fn build_report(cli_config: Option<PathBuf>) -> Result<CheckReport> {
    let path = Settings::resolve_config_path(cli_config.as_deref())?;
    let mut report = CheckReport {
        config_path: path.display().to_string(),
        errors: Vec::new(),
        warnings: Vec::new(),
        tunnel_count: 0,
        probes: Vec::new(),
    };

    let settings = match Settings::load_from_file(&path).await {
        Ok(settings) => settings,
        Err(e) => {
            report.errors.push(format!("{:#}", e));
            return Ok(report);
        }
    };

    report.tunnel_count = settings.tunnels.len();

    for method in &settings.tunnels {
        if !BUILTIN_METHODS.contains(&method.as_str()) {
            report.warnings.push(format!(
                "Method '{}' has no built-in driver; a backend must be registered at runtime",
                method
            ));
        }
    }

    if settings.connection.remote_addr().is_none() {
        report.warnings.push(
            "No remote endpoint configured; latency probes will use provider fallback targets"
                .to_string(),
        );
    }

    if settings.tunnels.iter().any(|m| m == "ssh") && settings.connection.local_port == 0 {
        report
            .warnings
            .push("ssh tunnel configured without local_port".to_string());
    }

    // Reachability of each tunnel's effective probe target.
    let cancel = CancellationToken::new();
    for method in &settings.tunnels {
        let target = settings
            .connection
            .remote_addr()
            .unwrap_or_else(|| fallback_probe_addr(method).to_string());

        match metrics::probe(&target, &cancel).await {
            Ok(latency) => report.probes.push(EndpointProbe {
                method: method.clone(),
                target,
                reachable: true,
                latency_ms: Some(latency.as_millis() as u64),
                detail: None,
            }),
            Err(e) => {
                report.warnings.push(format!(
                    "Probe target {} for '{}' is unreachable",
                    target, method
                ));
                report.probes.push(EndpointProbe {
                    method: method.clone(),
                    target,
                    reachable: false,
                    latency_ms: None,
                    detail: Some(e.to_string()),
                });
            }
        }
    }

    Ok(report)
}

/// Run the check and print the report; exit code semantics for scripts.
pub async fn run_and_print(
    cli_config: Option<PathBuf>,
    strict: bool,
    json: bool,
    verbose: bool,
) -> Result<()> {
    let report = build_report(cli_config).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("{}", report.to_plain_text(verbose));
    }

    if report.has_errors() {
        bail!("Configuration check failed");
    }
    if strict && report.has_warnings() {
        bail!("Configuration check produced warnings (strict mode)");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn unreadable_config_reports_error_not_panic() {
        let report = build_report(Some(PathBuf::from("/nonexistent/tunl.yaml")))
            .await
            .unwrap();
        assert!(report.has_errors());
        assert_eq!(report.tunnel_count, 0);
        assert!(report.to_plain_text(true).contains("FAILED"));
    }

    #[tokio::test]
    async fn reachable_local_endpoint_probes_clean() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let yaml = format!(
            r#"
connection:
  remote_host: "{}"
  remote_port: {}
  local_port: 3000
tunnels:
  - "ssh"
"#,
            addr.ip(),
            addr.port()
        );
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{}", yaml).unwrap();

        let report = build_report(Some(file.path().to_path_buf())).await.unwrap();
        assert!(!report.has_errors());
        assert_eq!(report.tunnel_count, 1);
        assert_eq!(report.probes.len(), 1);
        assert!(report.probes[0].reachable);
        assert!(report.probes[0].latency_ms.is_some());
    }

    #[tokio::test]
    async fn dead_endpoint_becomes_a_warning() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let yaml = format!(
            r#"
connection:
  remote_host: "{}"
  remote_port: {}
  local_port: 3000
tunnels:
  - "ssh"
"#,
            addr.ip(),
            addr.port()
        );
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{}", yaml).unwrap();

        let report = build_report(Some(file.path().to_path_buf())).await.unwrap();
        assert!(!report.has_errors());
        assert!(report.has_warnings());
        assert!(!report.probes[0].reachable);
    }

    #[tokio::test]
    async fn unknown_method_is_flagged() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let yaml = format!(
            r#"
connection:
  remote_host: "{}"
  remote_port: {}
  local_port: 3000
tunnels:
  - "zerotier"
"#,
            addr.ip(),
            addr.port()
        );
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{}", yaml).unwrap();

        let report = build_report(Some(file.path().to_path_buf())).await.unwrap();
        assert!(report
            .warnings
            .iter()
            .any(|w| w.contains("zerotier") && w.contains("no built-in driver")));
    }
}
