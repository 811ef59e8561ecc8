//! Connection state module
//!
//! Runtime state of one supervised tunnel. Counters and flags use Atomic
//! types for lock-free sharing; the state/instant cluster sits behind a
//! small RwLock so readers never observe a half-applied transition.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::{Duration, SystemTime};
use tokio_util::sync::CancellationToken;

use crate::config::ConnectionConfig;

/// Lifecycle states of a tunnel connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Failed => "failed",
        };
        write!(f, "{}", name)
    }
}

/// State cluster that must transition atomically
#[derive(Debug, Clone)]
struct Runtime {
    state: ConnectionState,
    started_at: Option<SystemTime>,
    pid: u32,
}

/// Traffic and latency counters for one connection
///
/// Byte counters are backend-supplied and stay 0 for providers that do not
/// report traffic. Latency 0 means "unmeasured".
#[derive(Debug)]
pub struct ConnectionMetrics {
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    latency_us: AtomicU64,
    last_active: RwLock<Option<SystemTime>>,
    failure_count: AtomicU32,
    last_error: RwLock<Option<String>>,
}

impl ConnectionMetrics {
    fn new() -> Self {
        Self {
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            latency_us: AtomicU64::new(0),
            last_active: RwLock::new(None),
            failure_count: AtomicU32::new(0),
            last_error: RwLock::new(None),
        }
    }

    /// Current smoothed latency; zero when unmeasured.
    pub fn latency(&self) -> Duration {
        Duration::from_micros(self.latency_us.load(Ordering::Relaxed))
    }

    /// Store the smoothed latency computed by the collector.
    pub fn set_latency(&self, latency: Duration) {
        self.latency_us
            .store(latency.as_micros() as u64, Ordering::Relaxed);
    }

    /// Record a successful probe instant.
    pub fn touch_last_active(&self) {
        *self.last_active.write().unwrap() = Some(SystemTime::now());
    }

    /// Record a probe failure and the error it surfaced.
    pub fn record_failure(&self, error: &str) {
        self.failure_count.fetch_add(1, Ordering::Relaxed);
        *self.last_error.write().unwrap() = Some(error.to_string());
    }

    /// Add backend-reported traffic counters.
    pub fn add_traffic(&self, sent: u64, received: u64) {
        self.bytes_sent.fetch_add(sent, Ordering::Relaxed);
        self.bytes_received.fetch_add(received, Ordering::Relaxed);
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count.load(Ordering::Relaxed)
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.read().unwrap().clone()
    }

    pub fn last_active(&self) -> Option<SystemTime> {
        *self.last_active.read().unwrap()
    }
}

/// One supervised tunnel connection
///
/// Shared as `Arc<Connection>` between the manager, the failover engine
/// and the metrics collector; all mutation goes through interior
/// mutability so every holder observes the same state.
#[derive(Debug)]
pub struct Connection {
    /// Opaque unique id, backend-suggested (e.g. "ssh-1699...")
    pub id: String,
    /// Backend method that produced this connection
    pub method: String,
    /// Local port the tunnel exposes
    pub local_port: u16,
    /// Remote endpoint host (may be empty)
    pub remote_host: String,
    /// Remote endpoint port (0 = unset)
    pub remote_port: u16,
    /// Backend-opaque configuration this connection was started with
    pub config: ConnectionConfig,

    runtime: RwLock<Runtime>,
    priority: AtomicU32,
    ranked: AtomicBool,
    is_primary: AtomicBool,
    cancel: CancellationToken,
    pub metrics: ConnectionMetrics,
}

impl Connection {
    pub fn new(
        id: impl Into<String>,
        method: impl Into<String>,
        config: ConnectionConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            id: id.into(),
            method: method.into(),
            local_port: config.local_port,
            remote_host: config.remote_host.clone(),
            remote_port: config.remote_port,
            config,
            runtime: RwLock::new(Runtime {
                state: ConnectionState::Connecting,
                started_at: None,
                pid: 0,
            }),
            priority: AtomicU32::new(0),
            ranked: AtomicBool::new(false),
            is_primary: AtomicBool::new(false),
            cancel,
            metrics: ConnectionMetrics::new(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.runtime.read().unwrap().state
    }

    pub fn set_state(&self, state: ConnectionState) {
        self.runtime.write().unwrap().state = state;
    }

    /// Transition to Connected, stamping start instant and process id.
    pub fn mark_connected(&self, pid: u32) {
        let mut runtime = self.runtime.write().unwrap();
        runtime.state = ConnectionState::Connected;
        runtime.started_at = Some(SystemTime::now());
        runtime.pid = pid;
    }

    /// Transition to Disconnected, clearing the process id.
    pub fn mark_disconnected(&self) {
        let mut runtime = self.runtime.write().unwrap();
        runtime.state = ConnectionState::Disconnected;
        runtime.pid = 0;
    }

    pub fn pid(&self) -> u32 {
        self.runtime.read().unwrap().pid
    }

    pub fn started_at(&self) -> Option<SystemTime> {
        self.runtime.read().unwrap().started_at
    }

    /// Time since the last successful connect; zero unless Connected.
    pub fn uptime(&self) -> Duration {
        let runtime = self.runtime.read().unwrap();
        if runtime.state != ConnectionState::Connected {
            return Duration::ZERO;
        }
        runtime
            .started_at
            .and_then(|t| t.elapsed().ok())
            .unwrap_or(Duration::ZERO)
    }

    pub fn is_primary(&self) -> bool {
        self.is_primary.load(Ordering::SeqCst)
    }

    pub fn set_primary(&self, primary: bool) {
        self.is_primary.store(primary, Ordering::SeqCst);
    }

    /// Lower value = more preferred. Meaningful only once ranked.
    pub fn priority(&self) -> u32 {
        self.priority.load(Ordering::Relaxed)
    }

    /// Whether this connection was explicitly ranked. Ad-hoc single starts
    /// stay unranked and are skipped by recovery migration.
    pub fn is_ranked(&self) -> bool {
        self.ranked.load(Ordering::Relaxed)
    }

    pub fn set_priority(&self, priority: u32) {
        self.priority.store(priority, Ordering::Relaxed);
        self.ranked.store(true, Ordering::Relaxed);
    }

    /// One-shot cancellation handle aborting in-flight backend work.
    pub fn cancel_handle(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Deep-copied point-in-time view, safe to hold indefinitely.
    pub fn snapshot(&self) -> ConnectionSnapshot {
        let runtime = self.runtime.read().unwrap().clone();
        let uptime = if runtime.state == ConnectionState::Connected {
            runtime
                .started_at
                .and_then(|t| t.elapsed().ok())
                .unwrap_or(Duration::ZERO)
        } else {
            Duration::ZERO
        };

        ConnectionSnapshot {
            id: self.id.clone(),
            method: self.method.clone(),
            state: runtime.state,
            priority: self.priority(),
            ranked: self.is_ranked(),
            is_primary: self.is_primary(),
            local_port: self.local_port,
            remote_host: self.remote_host.clone(),
            remote_port: self.remote_port,
            pid: runtime.pid,
            started_at: runtime.started_at.map(DateTime::<Utc>::from),
            metrics: MetricsSnapshot {
                bytes_sent: self.metrics.bytes_sent(),
                bytes_received: self.metrics.bytes_received(),
                latency_ms: self.metrics.latency().as_millis() as u64,
                uptime_seconds: uptime.as_secs(),
                last_active: self.metrics.last_active().map(DateTime::<Utc>::from),
                failure_count: self.metrics.failure_count(),
                last_error: self.metrics.last_error(),
            },
        }
    }
}

/// Point-in-time copy of a connection's observable state
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionSnapshot {
    pub id: String,
    pub method: String,
    pub state: ConnectionState,
    pub priority: u32,
    pub ranked: bool,
    pub is_primary: bool,
    pub local_port: u16,
    pub remote_host: String,
    pub remote_port: u16,
    pub pid: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub metrics: MetricsSnapshot,
}

/// Point-in-time copy of one connection's counters
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub latency_ms: u64,
    pub uptime_seconds: u64,
    pub last_active: Option<DateTime<Utc>>,
    pub failure_count: u32,
    pub last_error: Option<String>,
}
