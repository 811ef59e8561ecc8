//! Connection manager module
//!
//! Lifecycle supervisor for the pool of tunnel connections. Creates
//! connections through registered backends, keeps the authoritative
//! connection table, registers each connection with the latency collector
//! and the failover engine, and publishes lifecycle events.

use anyhow::{bail, Result};
use log::{error, info, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio_util::sync::CancellationToken;

use crate::backend::TunnelBackend;
use crate::config::{ConnectionConfig, Settings};
use crate::connection::{Connection, ConnectionSnapshot};
use crate::constants::{DEFAULT_EVENT_BUFFER_SIZE, DEFAULT_METRICS_INTERVAL_SECS};
use crate::error::{ResultExt, TunlError};
use crate::events::{Event, EventBus, EventFilter, EventType};
use crate::failover::{FailoverConfig, FailoverEngine};
use crate::metrics::MetricsCollector;

/// Construction options for the connection manager
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub enable_metrics: bool,
    pub enable_failover: bool,
    pub metrics_interval: Duration,
    pub event_buffer_size: usize,
    pub failover: FailoverConfig,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            enable_metrics: true,
            enable_failover: true,
            metrics_interval: Duration::from_secs(DEFAULT_METRICS_INTERVAL_SECS),
            event_buffer_size: DEFAULT_EVENT_BUFFER_SIZE,
            failover: FailoverConfig::default(),
        }
    }
}

impl From<&Settings> for ManagerConfig {
    fn from(settings: &Settings) -> Self {
        Self {
            enable_metrics: settings.enable_metrics,
            enable_failover: settings.enable_failover,
            metrics_interval: settings.metrics_interval(),
            event_buffer_size: settings.event_buffer_size,
            failover: FailoverConfig::from(&settings.failover),
        }
    }
}

/// Connection manager
///
/// Sole owner of the connection table. The failover engine and metrics
/// collector hold per-id registrations that this manager keeps in lockstep
/// with the table: every tracked connection has exactly one entry in each.
pub struct ConnectionManager {
    backends: RwLock<HashMap<String, Arc<dyn TunnelBackend>>>,
    connections: RwLock<HashMap<String, Arc<Connection>>>,
    bus: Arc<EventBus>,
    metrics: Option<Arc<MetricsCollector>>,
    failover: Option<Arc<FailoverEngine>>,
    root_cancel: CancellationToken,
    shut_down: AtomicBool,
}

impl ConnectionManager {
    /// Build the manager and start the enabled background sweeps.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(config: ManagerConfig) -> Arc<Self> {
        let bus = Arc::new(EventBus::new(config.event_buffer_size));
        let root_cancel = CancellationToken::new();

        let metrics = config
            .enable_metrics
            .then(|| Arc::new(MetricsCollector::new(config.metrics_interval, Arc::clone(&bus))));
        let failover = config
            .enable_failover
            .then(|| Arc::new(FailoverEngine::new(config.failover.clone(), Arc::clone(&bus))));

        let manager = Arc::new(Self {
            backends: RwLock::new(HashMap::new()),
            connections: RwLock::new(HashMap::new()),
            bus,
            metrics,
            failover,
            root_cancel,
            shut_down: AtomicBool::new(false),
        });

        if let Some(collector) = &manager.metrics {
            collector.start(&manager.root_cancel);
        }
        if let Some(engine) = &manager.failover {
            engine.start(&manager.root_cancel);
        }

        manager
    }

    /// Register a backend under its method name. Later registrations under
    /// the same name replace earlier ones.
    pub fn register_backend(&self, backend: Arc<dyn TunnelBackend>) {
        let name = backend.name().to_string();
        self.backends.write().unwrap().insert(name, backend);
    }

    pub fn backend_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.backends.read().unwrap().keys().cloned().collect();
        names.sort();
        names
    }

    fn ensure_open(&self) -> Result<()> {
        if self.shut_down.load(Ordering::SeqCst) {
            bail!(TunlError::ShutDown);
        }
        Ok(())
    }

    /// Establish a new connection through the named backend.
    ///
    /// On success the connection is tracked, registered with the enabled
    /// engines and a Connected event is published. On failure nothing is
    /// registered and the backend error is surfaced.
    pub async fn start(&self, method: &str, config: ConnectionConfig) -> Result<Arc<Connection>> {
        self.ensure_open()?;

        let backend = self
            .backends
            .read()
            .unwrap()
            .get(method)
            .cloned()
            .ok_or_else(|| TunlError::BackendNotRegistered(method.to_string()))?;

        let cancel = self.root_cancel.child_token();
        let conn = backend
            .connect(cancel, &config)
            .await
            .context_backend(&format!("{} connect failed", method))?;

        {
            let mut conns = self.connections.write().unwrap();
            conns.insert(conn.id.clone(), Arc::clone(&conn));
        }

        if let Some(collector) = &self.metrics {
            collector.register(Arc::clone(&conn));
        }
        if let Some(engine) = &self.failover {
            engine.register(Arc::clone(&conn));
        }

        info!("Connection {} established via {}", conn.id, method);
        self.bus.publish(Event::new(
            EventType::Connected,
            conn.id.clone(),
            format!("Connection {} established via {}", conn.id, method),
            serde_json::json!({
                "method": method,
                "local_port": conn.local_port,
                "pid": conn.pid(),
            }),
        ));

        Ok(conn)
    }

    /// Tear down one connection and forget it.
    ///
    /// The entry is removed from every table even when the backend's
    /// disconnect fails; the error is surfaced after cleanup so no zombie
    /// entry survives a misbehaving provider.
    pub async fn stop(&self, id: &str) -> Result<()> {
        self.ensure_open()?;
        self.stop_inner(id).await
    }

    async fn stop_inner(&self, id: &str) -> Result<()> {
        let conn = self
            .connections
            .read()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| TunlError::ConnectionNotFound(id.to_string()))?;

        // Abort any in-flight backend work tied to this connection.
        conn.cancel_handle().cancel();

        let backend = self.backends.read().unwrap().get(&conn.method).cloned();
        let disconnect_result = match backend {
            Some(backend) => backend
                .disconnect(&conn)
                .await
                .context_backend(&format!("{} disconnect failed for {}", conn.method, id)),
            None => Err(anyhow::Error::new(TunlError::BackendNotRegistered(
                conn.method.clone(),
            ))),
        };

        if let Some(engine) = &self.failover {
            engine.unregister(id);
        }
        if let Some(collector) = &self.metrics {
            collector.unregister(id);
        }
        self.connections.write().unwrap().remove(id);

        info!("Connection {} stopped", id);
        self.bus.publish(Event::new(
            EventType::Disconnected,
            id,
            format!("Connection {} stopped", id),
            serde_json::json!({ "method": conn.method }),
        ));

        disconnect_result
    }

    /// Stop a connection and start a replacement through the same backend
    /// with the same configuration.
    ///
    /// The replacement gets a fresh id; subscribers filtering on the old
    /// id see its Disconnected event and then nothing. When the new start
    /// fails the old connection stays removed.
    pub async fn restart(&self, id: &str) -> Result<Arc<Connection>> {
        self.ensure_open()?;

        let (method, config) = {
            let conns = self.connections.read().unwrap();
            let conn = conns
                .get(id)
                .ok_or_else(|| TunlError::ConnectionNotFound(id.to_string()))?;
            (conn.method.clone(), conn.config.clone())
        };

        self.stop_inner(id).await?;
        let conn = self.start(&method, config).await?;

        self.bus.publish(Event::new(
            EventType::Reconnecting,
            conn.id.clone(),
            format!("Connection {} restarted as {}", id, conn.id),
            serde_json::json!({ "old": id, "new": conn.id }),
        ));

        Ok(conn)
    }

    /// Deep-copied snapshot of one connection.
    pub fn status(&self, id: &str) -> Result<ConnectionSnapshot> {
        let conns = self.connections.read().unwrap();
        let conn = conns
            .get(id)
            .ok_or_else(|| TunlError::ConnectionNotFound(id.to_string()))?;
        Ok(conn.snapshot())
    }

    /// Start one connection per method, in parallel.
    ///
    /// Each successful connection's priority is its position in the input
    /// (0 = most preferred). The connection for the first method, if it
    /// started, becomes the primary. Partial success is success; an error
    /// is returned only when every method failed.
    pub async fn start_multiple(
        self: &Arc<Self>,
        methods: &[String],
        config: ConnectionConfig,
    ) -> Result<Vec<Arc<Connection>>> {
        self.ensure_open()?;

        if methods.is_empty() {
            return Ok(Vec::new());
        }

        let mut handles = Vec::with_capacity(methods.len());
        for method in methods {
            let manager = Arc::clone(self);
            let method = method.clone();
            let config = config.clone();
            handles.push(tokio::spawn(async move {
                manager.start(&method, config).await
            }));
        }

        let mut started: Vec<Option<Arc<Connection>>> = vec![None; methods.len()];
        let mut errors = Vec::new();
        for (index, handle) in handles.into_iter().enumerate() {
            match handle.await {
                Ok(Ok(conn)) => {
                    conn.set_priority(index as u32);
                    started[index] = Some(conn);
                }
                Ok(Err(e)) => {
                    warn!("Tunnel {} failed to start: {:#}", methods[index], e);
                    errors.push(format!("{}: {}", methods[index], e));
                }
                Err(e) => {
                    error!("Tunnel {} start task panicked: {}", methods[index], e);
                    errors.push(format!("{}: start task failed: {}", methods[index], e));
                }
            }
        }

        let preferred_id = started[0].as_ref().map(|c| c.id.clone());
        let connections: Vec<Arc<Connection>> = started.into_iter().flatten().collect();

        if connections.is_empty() {
            bail!("No tunnel could be started: {}", errors.join("; "));
        }

        if let Some(id) = preferred_id {
            match &self.failover {
                Some(engine) => {
                    if let Err(e) = engine.set_primary(&id) {
                        warn!("Could not record primary {}: {}", id, e);
                    }
                }
                None => {
                    // No engine to track the designation; set the flag on
                    // the connection itself.
                    if let Some(conn) = self.connections.read().unwrap().get(&id).cloned() {
                        conn.set_primary(true);
                    }
                }
            }
        }

        Ok(connections)
    }

    /// Stop every tracked connection in parallel, collecting all errors.
    pub async fn stop_all(self: &Arc<Self>) -> Result<()> {
        self.ensure_open()?;
        self.stop_all_inner().await
    }

    async fn stop_all_inner(self: &Arc<Self>) -> Result<()> {
        let ids: Vec<String> = self.connections.read().unwrap().keys().cloned().collect();
        if ids.is_empty() {
            return Ok(());
        }

        let mut handles = Vec::with_capacity(ids.len());
        for id in ids {
            let manager = Arc::clone(self);
            handles.push(tokio::spawn(async move {
                (manager.stop_inner(&id).await, id)
            }));
        }

        let mut errors = Vec::new();
        for handle in handles {
            match handle.await {
                Ok((Ok(()), _)) => {}
                Ok((Err(e), id)) => errors.push(format!("{}: {}", id, e)),
                Err(e) => errors.push(format!("stop task failed: {}", e)),
            }
        }

        if !errors.is_empty() {
            bail!(
                "{} connections failed to stop cleanly: {}",
                errors.len(),
                errors.join("; ")
            );
        }
        Ok(())
    }

    /// Snapshot of every tracked connection, most preferred first.
    pub fn list(&self) -> Vec<ConnectionSnapshot> {
        let conns = self.connections.read().unwrap();
        let mut snapshots: Vec<ConnectionSnapshot> = conns.values().map(|c| c.snapshot()).collect();
        snapshots.sort_by(|a, b| (a.priority, &a.id).cmp(&(b.priority, &b.id)));
        snapshots
    }

    /// Event stream carrying only events for one connection id.
    pub fn monitor(&self, id: &str) -> Result<tokio::sync::mpsc::Receiver<Event>> {
        self.ensure_open()?;

        let target = id.to_string();
        let filter: EventFilter = Box::new(move |event: &Event| event.conn_id == target);

        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        Ok(self
            .bus
            .subscribe(format!("monitor-{}-{}", id, nanos), Some(filter)))
    }

    /// Unconditionally designate the primary connection.
    pub fn set_primary(&self, id: &str) -> Result<()> {
        self.ensure_open()?;
        match &self.failover {
            Some(engine) => Ok(engine.set_primary(id)?),
            None => bail!("Failover engine is disabled"),
        }
    }

    /// Snapshot of the current primary connection.
    pub fn get_primary(&self) -> Result<ConnectionSnapshot> {
        if let Some(engine) = &self.failover {
            let id = engine.primary_id().ok_or(TunlError::NoPrimary)?;
            return self.status(&id);
        }

        let conns = self.connections.read().unwrap();
        conns
            .values()
            .find(|c| c.is_primary())
            .map(|c| c.snapshot())
            .ok_or_else(|| TunlError::NoPrimary.into())
    }

    /// Toggle automatic failover at runtime.
    pub fn enable_auto_failover(&self, enabled: bool) -> Result<()> {
        self.ensure_open()?;
        match &self.failover {
            Some(engine) => {
                engine.set_enabled(enabled);
                Ok(())
            }
            None => bail!("Failover engine is disabled"),
        }
    }

    /// The event publisher external consumers subscribe through.
    pub fn event_bus(&self) -> Arc<EventBus> {
        Arc::clone(&self.bus)
    }

    pub fn failover_engine(&self) -> Option<&Arc<FailoverEngine>> {
        self.failover.as_ref()
    }

    pub fn metrics_collector(&self) -> Option<&Arc<MetricsCollector>> {
        self.metrics.as_ref()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.read().unwrap().len()
    }

    /// Stop everything: sweeps first, then every connection, then the
    /// event bus. Later API calls fail fast with a shut-down error.
    pub async fn shutdown(self: &Arc<Self>) -> Result<()> {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        info!("Connection manager shutting down");

        if let Some(engine) = &self.failover {
            engine.stop().await;
        }
        if let Some(collector) = &self.metrics {
            collector.stop().await;
        }

        let result = self.stop_all_inner().await;

        self.bus.close();
        self.root_cancel.cancel();

        info!("Connection manager shutdown complete");
        result
    }
}
