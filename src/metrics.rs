//! Latency collection module
//!
//! Periodically probes each registered connection's remote endpoint over
//! TCP and keeps a smoothed latency on the connection's metrics. Probes
//! run in parallel per sweep, like the failover health checks.

use anyhow::{bail, Result};
use log::{debug, error, info};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout};
use tokio_util::sync::CancellationToken;

use crate::connection::{Connection, ConnectionState};
use crate::constants::{fallback_probe_addr, LATENCY_WINDOW_SIZE, PROBE_TIMEOUT};
use crate::events::{Event, EventBus, EventType};

/// Bounded ring of recent probe samples for one connection
///
/// Failed probes are recorded as zero so they age valid samples out of
/// the window; the exposed latency is the mean of the valid samples only.
#[derive(Debug)]
pub struct LatencyWindow {
    samples: std::collections::VecDeque<Duration>,
    capacity: usize,
}

impl LatencyWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: std::collections::VecDeque::with_capacity(capacity.max(1)),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&mut self, sample: Duration) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    /// Arithmetic mean of the valid (non-zero) samples; zero if none.
    pub fn average(&self) -> Duration {
        let valid = self.samples.iter().filter(|s| !s.is_zero()).count();
        if valid == 0 {
            return Duration::ZERO;
        }
        let total: Duration = self.samples.iter().filter(|s| !s.is_zero()).sum();
        total / valid as u32
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

struct ConnEntry {
    conn: Arc<Connection>,
    window: Mutex<LatencyWindow>,
}

/// Latency collector
///
/// Owns one background sweep task; stop waits for the task to exit and
/// leaves the collector restart-ready.
pub struct MetricsCollector {
    interval: Duration,
    entries: RwLock<HashMap<String, Arc<ConnEntry>>>,
    bus: Arc<EventBus>,
    running: AtomicBool,
    cancel: Mutex<Option<CancellationToken>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl MetricsCollector {
    pub fn new(interval: Duration, bus: Arc<EventBus>) -> Self {
        Self {
            interval,
            entries: RwLock::new(HashMap::new()),
            bus,
            running: AtomicBool::new(false),
            cancel: Mutex::new(None),
            task: Mutex::new(None),
        }
    }

    /// Track a connection for latency probing.
    pub fn register(&self, conn: Arc<Connection>) {
        let mut entries = self.entries.write().unwrap();
        entries.insert(
            conn.id.clone(),
            Arc::new(ConnEntry {
                conn,
                window: Mutex::new(LatencyWindow::new(LATENCY_WINDOW_SIZE)),
            }),
        );
    }

    pub fn unregister(&self, id: &str) {
        let mut entries = self.entries.write().unwrap();
        entries.remove(id);
    }

    pub fn is_registered(&self, id: &str) -> bool {
        self.entries.read().unwrap().contains_key(id)
    }

    pub fn registered_count(&self) -> usize {
        self.entries.read().unwrap().len()
    }

    /// Start the periodic probe sweep under the given parent token.
    pub fn start(self: &Arc<Self>, parent: &CancellationToken) {
        if self.running.swap(true, Ordering::SeqCst) {
            debug!("Metrics collector already running");
            return;
        }

        let cancel = parent.child_token();
        *self.cancel.lock().unwrap() = Some(cancel.clone());

        let collector = Arc::clone(self);
        let handle = tokio::spawn(async move {
            collector.run(cancel).await;
        });
        *self.task.lock().unwrap() = Some(handle);

        info!(
            "Metrics collector started: {}s interval, {}-sample window",
            self.interval.as_secs(),
            LATENCY_WINDOW_SIZE
        );
    }

    /// Stop the sweep task and wait for it to exit.
    ///
    /// Leaves the collector restart-ready: a later start spawns a fresh
    /// sweep with a fresh child token.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }

        if let Some(cancel) = self.cancel.lock().unwrap().take() {
            cancel.cancel();
        }

        let handle = self.task.lock().unwrap().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!("Metrics sweep task join error: {}", e);
            }
        }

        info!("Metrics collector stopped");
    }

    async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = interval(self.interval);

        // First tick fires immediately; consume it so sweeps are spaced a
        // full interval apart.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.sweep().await;
                }
                _ = cancel.cancelled() => {
                    debug!("Metrics collector received shutdown signal");
                    break;
                }
            }
        }
    }

    /// Probe every Connected registration in parallel and fold the results
    /// into each connection's smoothed latency.
    pub async fn sweep(&self) {
        let targets: Vec<Arc<ConnEntry>> = {
            let entries = self.entries.read().unwrap();
            entries
                .values()
                .filter(|e| e.conn.state() == ConnectionState::Connected)
                .cloned()
                .collect()
        };

        if targets.is_empty() {
            return;
        }

        let mut handles = Vec::with_capacity(targets.len());
        for entry in targets {
            let handle = tokio::spawn(async move {
                probe_entry(&entry).await;
            });
            handles.push(handle);
        }

        let probed = handles.len();
        for handle in handles {
            if let Err(e) = handle.await {
                error!("Latency probe task error: {}", e);
            }
        }

        self.bus.publish(Event::new(
            EventType::MetricsUpdate,
            "",
            format!("Latency sweep probed {} connections", probed),
            serde_json::json!({ "probed": probed }),
        ));
    }

    /// Stable export layout for external telemetry.
    ///
    /// Keys and units (`latencyMs`, `uptimeSeconds`) are contractual; the
    /// returned value is a snapshot and never mutates.
    pub fn export(&self) -> serde_json::Value {
        let entries = self.entries.read().unwrap();
        let connections: Vec<serde_json::Value> = entries
            .values()
            .map(|entry| {
                let snap = entry.conn.snapshot();
                serde_json::json!({
                    "id": snap.id,
                    "method": snap.method,
                    "state": snap.state.to_string(),
                    "bytesSent": snap.metrics.bytes_sent,
                    "bytesReceived": snap.metrics.bytes_received,
                    "latencyMs": snap.metrics.latency_ms,
                    "uptimeSeconds": snap.metrics.uptime_seconds,
                    "isPrimary": snap.is_primary,
                    "priority": snap.priority,
                })
            })
            .collect();

        serde_json::json!({
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "totalConnections": connections.len(),
            "connections": connections,
        })
    }
}

/// Pick the probe target for one connection.
///
/// The connection's own remote endpoint wins; otherwise the per-method
/// fallback table decides.
fn probe_target(conn: &Connection) -> String {
    if !conn.remote_host.is_empty() && conn.remote_port > 0 {
        return format!("{}:{}", conn.remote_host, conn.remote_port);
    }
    fallback_probe_addr(&conn.method).to_string()
}

/// One TCP dial: time-to-established is the latency sample.
///
/// Aborts on the connection's cancellation handle or the fixed dial
/// deadline, whichever fires first.
pub async fn probe(addr: &str, cancel: &CancellationToken) -> Result<Duration> {
    let started = Instant::now();

    tokio::select! {
        result = timeout(PROBE_TIMEOUT, TcpStream::connect(addr)) => {
            match result {
                Ok(Ok(_stream)) => Ok(started.elapsed().max(Duration::from_micros(1))),
                Ok(Err(e)) => bail!("probe dial {} failed: {}", addr, e),
                Err(_) => bail!("probe dial {} timed out", addr),
            }
        }
        _ = cancel.cancelled() => {
            bail!("probe dial {} cancelled", addr)
        }
    }
}

async fn probe_entry(entry: &ConnEntry) {
    let addr = probe_target(&entry.conn);

    match probe(&addr, entry.conn.cancel_handle()).await {
        Ok(sample) => {
            let average = {
                let mut window = entry.window.lock().unwrap();
                window.push(sample);
                window.average()
            };
            entry.conn.metrics.set_latency(average);
            entry.conn.metrics.touch_last_active();
            debug!(
                "Probe {} -> {}: {:?} (avg {:?})",
                entry.conn.id, addr, sample, average
            );
        }
        Err(e) => {
            // Zero samples age valid ones out of the window.
            let average = {
                let mut window = entry.window.lock().unwrap();
                window.push(Duration::ZERO);
                window.average()
            };
            entry.conn.metrics.set_latency(average);
            entry.conn.metrics.record_failure(&e.to_string());
            debug!("Probe {} -> {} failed: {}", entry.conn.id, addr, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionConfig;
    use crate::constants::GENERIC_PROBE_ADDR;
    use tokio::net::TcpListener;

    fn connection_to(addr: std::net::SocketAddr) -> Arc<Connection> {
        let config = ConnectionConfig {
            remote_host: addr.ip().to_string(),
            remote_port: addr.port(),
            ..ConnectionConfig::default()
        };
        let conn = Arc::new(Connection::new(
            "probe-1",
            "mock",
            config,
            CancellationToken::new(),
        ));
        conn.mark_connected(0);
        conn
    }

    #[test]
    fn window_average_ignores_failed_samples() {
        let mut window = LatencyWindow::new(10);
        window.push(Duration::from_millis(100));
        window.push(Duration::ZERO);
        window.push(Duration::from_millis(200));

        assert_eq!(window.average(), Duration::from_millis(150));
    }

    #[test]
    fn window_average_zero_when_no_valid_samples() {
        let mut window = LatencyWindow::new(4);
        assert_eq!(window.average(), Duration::ZERO);

        window.push(Duration::ZERO);
        window.push(Duration::ZERO);
        assert_eq!(window.average(), Duration::ZERO);
    }

    #[test]
    fn window_evicts_oldest_sample() {
        let mut window = LatencyWindow::new(3);
        window.push(Duration::from_millis(300));
        window.push(Duration::from_millis(100));
        window.push(Duration::from_millis(100));
        window.push(Duration::from_millis(100));

        assert_eq!(window.len(), 3);
        assert_eq!(window.average(), Duration::from_millis(100));
    }

    #[test]
    fn mean_drifts_as_valid_samples_age_out() {
        let mut window = LatencyWindow::new(10);
        for _ in 0..10 {
            window.push(Duration::from_millis(100));
        }
        assert_eq!(window.average(), Duration::from_millis(100));

        // Listener gone: failures push zeros, valid samples age out one
        // per sweep until none are left.
        for remaining in (0..10).rev() {
            window.push(Duration::ZERO);
            if remaining > 0 {
                assert_eq!(window.average(), Duration::from_millis(100));
            } else {
                assert_eq!(window.average(), Duration::ZERO);
            }
        }
    }

    #[test]
    fn probe_target_prefers_remote_endpoint() {
        let config = ConnectionConfig {
            remote_host: "example.com".to_string(),
            remote_port: 443,
            ..ConnectionConfig::default()
        };
        let conn = Connection::new("c-1", "cloudflare", config, CancellationToken::new());
        assert_eq!(probe_target(&conn), "example.com:443");
    }

    #[test]
    fn probe_target_falls_back_by_method() {
        let conn = Connection::new(
            "c-2",
            "cloudflare",
            ConnectionConfig::default(),
            CancellationToken::new(),
        );
        assert_eq!(
            probe_target(&conn),
            fallback_probe_addr("cloudflare").to_string()
        );

        let conn = Connection::new(
            "c-3",
            "unknown-provider",
            ConnectionConfig::default(),
            CancellationToken::new(),
        );
        assert_eq!(probe_target(&conn), GENERIC_PROBE_ADDR.to_string());
    }

    #[tokio::test]
    async fn probe_measures_established_dial() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let latency = probe(&addr.to_string(), &CancellationToken::new())
            .await
            .unwrap();
        assert!(latency > Duration::ZERO);
        assert!(latency < PROBE_TIMEOUT);
    }

    #[tokio::test]
    async fn probe_cancellation_aborts_dial() {
        let cancel = CancellationToken::new();
        cancel.cancel();

        // Reserved TEST-NET address blackholes the SYN; only cancellation
        // can end the dial this fast.
        let started = Instant::now();
        let result = probe("192.0.2.1:81", &cancel).await;
        assert!(result.is_err());
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn sweep_updates_latency_and_last_active() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let bus = Arc::new(EventBus::new(16));
        let collector = Arc::new(MetricsCollector::new(Duration::from_secs(60), bus));
        let conn = connection_to(addr);
        collector.register(Arc::clone(&conn));

        collector.sweep().await;

        assert!(conn.metrics.latency() > Duration::ZERO);
        assert!(conn.metrics.last_active().is_some());
        assert_eq!(conn.metrics.failure_count(), 0);
    }

    #[tokio::test]
    async fn sweep_records_failures_when_listener_is_gone() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let bus = Arc::new(EventBus::new(16));
        let collector = Arc::new(MetricsCollector::new(Duration::from_secs(60), bus));
        let conn = connection_to(addr);
        collector.register(Arc::clone(&conn));

        collector.sweep().await;

        assert_eq!(conn.metrics.latency(), Duration::ZERO);
        assert_eq!(conn.metrics.failure_count(), 1);
        assert!(conn.metrics.last_error().is_some());
    }

    #[tokio::test]
    async fn sweep_skips_disconnected_connections() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let bus = Arc::new(EventBus::new(16));
        let collector = Arc::new(MetricsCollector::new(Duration::from_secs(60), bus));
        let conn = connection_to(addr);
        conn.mark_disconnected();
        collector.register(Arc::clone(&conn));

        collector.sweep().await;

        assert_eq!(conn.metrics.latency(), Duration::ZERO);
        assert!(conn.metrics.last_active().is_none());
    }

    #[tokio::test]
    async fn export_has_contractual_keys() {
        let bus = Arc::new(EventBus::new(16));
        let collector = Arc::new(MetricsCollector::new(Duration::from_secs(60), bus));

        let conn = Arc::new(Connection::new(
            "exp-1",
            "ssh",
            ConnectionConfig::default(),
            CancellationToken::new(),
        ));
        conn.mark_connected(42);
        conn.metrics.set_latency(Duration::from_millis(12));
        collector.register(conn);

        let export = collector.export();
        assert_eq!(export["totalConnections"], 1);
        assert!(export["timestamp"].is_string());

        let record = &export["connections"][0];
        assert_eq!(record["id"], "exp-1");
        assert_eq!(record["method"], "ssh");
        assert_eq!(record["latencyMs"], 12);
        assert_eq!(record["isPrimary"], false);
        assert_eq!(record["priority"], 0);
        assert!(record["uptimeSeconds"].is_u64());
    }

    #[tokio::test]
    async fn collector_restarts_after_stop() {
        let bus = Arc::new(EventBus::new(16));
        let collector = Arc::new(MetricsCollector::new(Duration::from_millis(50), bus));
        let root = CancellationToken::new();

        collector.start(&root);
        collector.stop().await;

        // Restart must spawn a fresh sweep with a fresh child token.
        collector.start(&root);
        assert!(collector.running.load(Ordering::SeqCst));
        collector.stop().await;
    }

    #[tokio::test]
    async fn unregister_stops_tracking() {
        let bus = Arc::new(EventBus::new(16));
        let collector = Arc::new(MetricsCollector::new(Duration::from_secs(60), bus));

        let conn = Arc::new(Connection::new(
            "gone-1",
            "ssh",
            ConnectionConfig::default(),
            CancellationToken::new(),
        ));
        collector.register(conn);
        assert!(collector.is_registered("gone-1"));

        collector.unregister("gone-1");
        assert!(!collector.is_registered("gone-1"));
        assert_eq!(collector.registered_count(), 0);
    }
}
