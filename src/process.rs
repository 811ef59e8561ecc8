//! Daemon control module
//!
//! Tracks the tunnel supervisor process through a PID file in the runtime
//! directory and drives it with signals: SIGTERM drains the tunnel pool
//! and exits, SIGHUP rebuilds it from fresh configuration. A PID file
//! left behind by a crashed supervisor is treated as stale and cleaned
//! up instead of blocking the next start.

use anyhow::{bail, Result};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::fs;
use std::path::{Path, PathBuf};

use crate::constants::{get_pid_file_path, get_runtime_dir};
use crate::error::ResultExt;

/// Observed state of the supervisor process, judged from the PID file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonState {
    /// PID file present and the process answers signals
    Running(i32),
    /// PID file present but the process is gone (crash leftover)
    Stale(i32),
    /// No readable PID file
    Stopped,
}

/// True when `pid` still exists. Signal 0 probes delivery without
/// touching the process; the ssh backend uses the same check on its
/// forward children.
pub fn pid_alive(pid: i32) -> bool {
    signal::kill(Pid::from_raw(pid), None).is_ok()
}

/// Ask `pid` to exit via SIGTERM. Shared by daemon stop and the ssh
/// backend's tunnel teardown.
pub fn terminate(pid: i32) -> Result<()> {
    signal::kill(Pid::from_raw(pid), Signal::SIGTERM)
        .map_err(|e| anyhow::anyhow!("SIGTERM to process {} failed: {}", pid, e))
}

fn read_pid(path: &Path) -> Result<i32> {
    let content = fs::read_to_string(path)
        .context_process(&format!("Failed to read PID file: {}", path.display()))?;
    content
        .trim()
        .parse::<i32>()
        .map_err(|e| anyhow::anyhow!("PID file {} is corrupt: {}", path.display(), e))
}

fn state_at(path: &Path) -> DaemonState {
    match read_pid(path) {
        Ok(pid) if pid_alive(pid) => DaemonState::Running(pid),
        Ok(pid) => DaemonState::Stale(pid),
        Err(_) => DaemonState::Stopped,
    }
}

/// Where the supervisor stands right now.
pub fn daemon_state() -> DaemonState {
    state_at(&get_pid_file_path())
}

/// RAII claim on the single-supervisor slot
///
/// Writes this process's PID on claim and removes the file on drop, so
/// one pool has at most one supervisor. Claiming over a live supervisor
/// fails; claiming over a stale file evicts it.
pub struct DaemonSlot {
    path: PathBuf,
}

impl DaemonSlot {
    pub fn claim() -> Result<Self> {
        let runtime_dir = get_runtime_dir();
        fs::create_dir_all(&runtime_dir).context_process(&format!(
            "Failed to create runtime directory: {}",
            runtime_dir.display()
        ))?;
        Self::claim_at(get_pid_file_path())
    }

    fn claim_at(path: PathBuf) -> Result<Self> {
        match state_at(&path) {
            DaemonState::Running(pid) => {
                bail!(
                    "Another tunl supervisor owns this pool (PID {}). Run 'tunl stop' first.",
                    pid
                );
            }
            DaemonState::Stale(pid) => {
                log::warn!("Removing stale PID file left by supervisor {}", pid);
                let _ = fs::remove_file(&path);
            }
            DaemonState::Stopped => {}
        }

        fs::write(&path, format!("{}\n", std::process::id()))
            .context_process(&format!("Failed to write PID file: {}", path.display()))?;

        log::debug!(
            "Supervisor slot claimed: {} (PID {})",
            path.display(),
            std::process::id()
        );
        Ok(Self { path })
    }
}

impl Drop for DaemonSlot {
    fn drop(&mut self) {
        if self.path.exists() {
            if let Err(e) = fs::remove_file(&self.path) {
                log::error!(
                    "Failed to release supervisor slot {}: {}",
                    self.path.display(),
                    e
                );
            }
        }
    }
}

/// Stop the running supervisor. SIGTERM triggers its graceful shutdown:
/// sweeps stop, every tunnel is torn down, the event bus closes.
pub fn stop_daemon() -> Result<()> {
    match daemon_state() {
        DaemonState::Running(pid) => {
            terminate(pid)?;
            log::info!("Asked supervisor {} to drain its tunnels and exit", pid);
            Ok(())
        }
        DaemonState::Stale(pid) => {
            let _ = fs::remove_file(get_pid_file_path());
            bail!("Supervisor {} is gone; cleaned up its stale PID file", pid);
        }
        DaemonState::Stopped => bail!("No tunl supervisor is running"),
    }
}

/// Reload the running supervisor. SIGHUP makes it re-validate its
/// configuration and rebuild the tunnel pool without a restart.
pub fn reload_daemon() -> Result<()> {
    match daemon_state() {
        DaemonState::Running(pid) => {
            signal::kill(Pid::from_raw(pid), Signal::SIGHUP)
                .map_err(|e| anyhow::anyhow!("SIGHUP to process {} failed: {}", pid, e))?;
            log::info!("Asked supervisor {} to rebuild the tunnel pool", pid);
            Ok(())
        }
        DaemonState::Stale(pid) => {
            bail!("Supervisor {} is gone; nothing to reload", pid)
        }
        DaemonState::Stopped => bail!("No tunl supervisor is running"),
    }
}
