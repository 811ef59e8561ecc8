//! Failover engine module
//!
//! Periodically evaluates every supervised connection's health from its
//! state and smoothed latency, keeps exactly one healthy PRIMARY, demotes
//! a degraded primary to the best healthy backup, and opportunistically
//! migrates back to higher-priority connections when they recover.

use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, SystemTime};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;

use crate::config::FailoverSettings;
use crate::connection::{Connection, ConnectionState};
use crate::constants::{
    DEFAULT_FAILURE_THRESHOLD, DEFAULT_HEALTH_CHECK_INTERVAL_SECS, DEFAULT_MAX_LATENCY_MS,
    DEFAULT_RECOVERY_THRESHOLD,
};
use crate::error::TunlError;
use crate::events::{Event, EventBus, EventType};

/// Runtime configuration of the failover engine
#[derive(Debug, Clone)]
pub struct FailoverConfig {
    pub enabled: bool,
    pub health_check_interval: Duration,
    pub failure_threshold: u32,
    pub recovery_threshold: u32,
    pub max_latency: Duration,
    pub auto_recover: bool,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            health_check_interval: Duration::from_secs(DEFAULT_HEALTH_CHECK_INTERVAL_SECS),
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            recovery_threshold: DEFAULT_RECOVERY_THRESHOLD,
            max_latency: Duration::from_millis(DEFAULT_MAX_LATENCY_MS),
            auto_recover: true,
        }
    }
}

impl From<&FailoverSettings> for FailoverConfig {
    fn from(settings: &FailoverSettings) -> Self {
        Self {
            enabled: settings.enabled,
            health_check_interval: settings.health_check_interval(),
            failure_threshold: settings.failure_threshold,
            recovery_threshold: settings.recovery_threshold,
            max_latency: settings.max_latency(),
            auto_recover: settings.auto_recover,
        }
    }
}

/// Health tracking state for one connection
///
/// Healthiness flips only at threshold crossings: a connection becomes
/// unhealthy after `failure_threshold` consecutive failed checks and
/// healthy after `recovery_threshold` consecutive good ones.
#[derive(Debug)]
pub struct HealthStatus {
    consecutive_failures: AtomicU32,
    consecutive_successes: AtomicU32,
    healthy: AtomicBool,
    last_check: RwLock<Option<SystemTime>>,
    last_error: RwLock<Option<String>>,
}

impl HealthStatus {
    fn new() -> Self {
        Self {
            consecutive_failures: AtomicU32::new(0),
            consecutive_successes: AtomicU32::new(0),
            healthy: AtomicBool::new(false),
            last_check: RwLock::new(None),
            last_error: RwLock::new(None),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }

    pub fn consecutive_successes(&self) -> u32 {
        self.consecutive_successes.load(Ordering::Relaxed)
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.read().unwrap().clone()
    }

    /// Record a successful check. Returns true when the connection just
    /// crossed the recovery threshold and flipped healthy.
    pub fn mark_success(&self, recovery_threshold: u32) -> bool {
        let successes = self.consecutive_successes.fetch_add(1, Ordering::SeqCst) + 1;
        self.consecutive_failures.store(0, Ordering::SeqCst);
        *self.last_check.write().unwrap() = Some(SystemTime::now());

        if successes >= recovery_threshold && !self.healthy.swap(true, Ordering::SeqCst) {
            *self.last_error.write().unwrap() = None;
            return true;
        }
        false
    }

    /// Record a failed check. Returns true when the connection just
    /// crossed the failure threshold and flipped unhealthy.
    pub fn mark_failure(&self, failure_threshold: u32, error: &str) -> bool {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
        self.consecutive_successes.store(0, Ordering::SeqCst);
        *self.last_check.write().unwrap() = Some(SystemTime::now());
        *self.last_error.write().unwrap() = Some(error.to_string());

        failures >= failure_threshold && self.healthy.swap(false, Ordering::SeqCst)
    }
}

#[derive(Clone)]
struct Entry {
    conn: Arc<Connection>,
    health: Arc<HealthStatus>,
}

/// Registration table and primary designation, mutated under one lock so
/// no reader can observe the primary id and the `is_primary` flags out of
/// sync.
struct EngineState {
    entries: HashMap<String, Entry>,
    primary_id: Option<String>,
}

/// Failover engine
///
/// Owns one background sweep task; stop waits for the task to exit and
/// leaves the engine restart-ready.
pub struct FailoverEngine {
    config: FailoverConfig,
    enabled: AtomicBool,
    state: RwLock<EngineState>,
    bus: Arc<EventBus>,
    running: AtomicBool,
    cancel: Mutex<Option<CancellationToken>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl FailoverEngine {
    pub fn new(config: FailoverConfig, bus: Arc<EventBus>) -> Self {
        let enabled = config.enabled;
        Self {
            config,
            enabled: AtomicBool::new(enabled),
            state: RwLock::new(EngineState {
                entries: HashMap::new(),
                primary_id: None,
            }),
            bus,
            running: AtomicBool::new(false),
            cancel: Mutex::new(None),
            task: Mutex::new(None),
        }
    }

    /// Track a connection. Its health starts unknown (unhealthy) until
    /// `recovery_threshold` good checks accumulate.
    pub fn register(&self, conn: Arc<Connection>) {
        let mut state = self.state.write().unwrap();
        state.entries.insert(
            conn.id.clone(),
            Entry {
                conn,
                health: Arc::new(HealthStatus::new()),
            },
        );
    }

    /// Stop tracking a connection. When the departing connection was the
    /// primary, a replacement is selected under the same lock acquisition.
    pub fn unregister(&self, id: &str) {
        let mut events = Vec::new();
        {
            let mut state = self.state.write().unwrap();
            let removed = state.entries.remove(id);

            if let Some(entry) = &removed {
                entry.conn.set_primary(false);
            }

            if state.primary_id.as_deref() == Some(id) {
                state.primary_id = None;
                let candidate = select_candidate(&state.entries, None)
                    .map(|(new_id, conn)| (new_id, Arc::clone(conn)));
                if let Some((new_id, conn)) = candidate {
                    conn.set_primary(true);
                    state.primary_id = Some(new_id.clone());
                    events.push(Event::new(
                        EventType::PrimaryChange,
                        new_id.clone(),
                        format!("Primary reassigned to {} after {} left the pool", new_id, id),
                        serde_json::json!({ "old": id, "new": new_id }),
                    ));
                }
            }
        }

        for event in events {
            self.bus.publish(event);
        }
    }

    pub fn is_registered(&self, id: &str) -> bool {
        self.state.read().unwrap().entries.contains_key(id)
    }

    pub fn registered_count(&self) -> usize {
        self.state.read().unwrap().entries.len()
    }

    /// Health view for one connection, if registered.
    pub fn health_status(&self, id: &str) -> Option<Arc<HealthStatus>> {
        let state = self.state.read().unwrap();
        state.entries.get(id).map(|e| Arc::clone(&e.health))
    }

    /// Current primary id, if one is designated.
    pub fn primary_id(&self) -> Option<String> {
        self.state.read().unwrap().primary_id.clone()
    }

    /// Unconditionally designate the primary. Does not consult health; a
    /// subsequent sweep may immediately fail over an unhealthy target.
    pub fn set_primary(&self, id: &str) -> Result<(), TunlError> {
        let event = {
            let mut state = self.state.write().unwrap();
            if !state.entries.contains_key(id) {
                return Err(TunlError::ConnectionNotFound(id.to_string()));
            }

            let old = state.primary_id.take();
            if let Some(old_id) = &old {
                if let Some(entry) = state.entries.get(old_id) {
                    entry.conn.set_primary(false);
                }
            }

            if let Some(entry) = state.entries.get(id) {
                entry.conn.set_primary(true);
            }
            state.primary_id = Some(id.to_string());

            Event::new(
                EventType::PrimaryChange,
                id,
                format!("Primary set to {}", id),
                serde_json::json!({ "old": old, "new": id }),
            )
        };

        self.bus.publish(event);
        Ok(())
    }

    /// Runtime master switch. While disabled, sweeps skip evaluation and
    /// the primary designation is left untouched.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
        info!(
            "Automatic failover {}",
            if enabled { "enabled" } else { "disabled" }
        );
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Start the periodic health sweep under the given parent token.
    pub fn start(self: &Arc<Self>, parent: &CancellationToken) {
        if self.running.swap(true, Ordering::SeqCst) {
            debug!("Failover engine already running");
            return;
        }

        let cancel = parent.child_token();
        *self.cancel.lock().unwrap() = Some(cancel.clone());

        let engine = Arc::clone(self);
        let handle = tokio::spawn(async move {
            engine.run(cancel).await;
        });
        *self.task.lock().unwrap() = Some(handle);

        info!(
            "Failover engine started: {}s interval, thresholds {}/{} (fail/recover), max latency {:?}",
            self.config.health_check_interval.as_secs(),
            self.config.failure_threshold,
            self.config.recovery_threshold,
            self.config.max_latency
        );
    }

    /// Stop the sweep task and wait for it to exit. Restart-ready.
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
                error!("Failover sweep task join error: {}", e);
            }
        }

        info!("Failover engine stopped");
    }

    async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = interval(self.config.health_check_interval);

        // First tick fires immediately; consume it so sweeps are spaced a
        // full interval apart.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.sweep().await;
                }
                _ = cancel.cancelled() => {
                    debug!("Failover engine received shutdown signal");
                    break;
                }
            }
        }
    }

    /// One health evaluation pass: check every connection in parallel,
    /// then evaluate the primary designation.
    pub async fn sweep(&self) {
        if !self.is_enabled() {
            return;
        }

        let checks: Vec<Entry> = {
            let state = self.state.read().unwrap();
            state.entries.values().cloned().collect()
        };

        let mut handles = Vec::with_capacity(checks.len());
        for entry in checks {
            let bus = Arc::clone(&self.bus);
            let failure_threshold = self.config.failure_threshold;
            let recovery_threshold = self.config.recovery_threshold;
            let max_latency = self.config.max_latency;

            let handle = tokio::spawn(async move {
                check_connection(
                    &entry,
                    failure_threshold,
                    recovery_threshold,
                    max_latency,
                    &bus,
                );
            });
            handles.push(handle);
        }

        for handle in handles {
            if let Err(e) = handle.await {
                error!("Health check task error: {}", e);
            }
        }

        self.evaluate();
    }

    /// Decide whether the primary must change, under the engine's write
    /// lock. Events are published after the lock is released.
    fn evaluate(&self) {
        let mut events = Vec::new();
        {
            let mut state = self.state.write().unwrap();

            match state.primary_id.clone() {
                None => {
                    let candidate = select_candidate(&state.entries, None)
                        .map(|(new_id, conn)| (new_id, Arc::clone(conn)));
                    if let Some((new_id, conn)) = candidate {
                        conn.set_primary(true);
                        state.primary_id = Some(new_id.clone());
                        info!("Primary selected: {}", new_id);
                        events.push(Event::new(
                            EventType::PrimaryChange,
                            new_id.clone(),
                            format!("Primary selected: {}", new_id),
                            serde_json::json!({ "old": null, "new": new_id }),
                        ));
                    }
                }
                Some(primary_id) => {
                    let primary_ok = state
                        .entries
                        .get(&primary_id)
                        .map(|e| e.health.is_healthy())
                        .unwrap_or(false);

                    if !primary_ok {
                        events.extend(fail_over(&mut state, &primary_id));
                    } else if self.config.auto_recover {
                        events.extend(recover(&mut state, &primary_id));
                    }
                }
            }
        }

        for event in events {
            self.bus.publish(event);
        }
    }
}

/// Evaluate one connection's health from its state and smoothed latency.
fn check_connection(
    entry: &Entry,
    failure_threshold: u32,
    recovery_threshold: u32,
    max_latency: Duration,
    bus: &EventBus,
) {
    let conn = &entry.conn;

    let failure = if conn.state() != ConnectionState::Connected {
        Some(format!("connection state is {}", conn.state()))
    } else {
        let latency = conn.metrics.latency();
        if latency > max_latency {
            Some(format!(
                "latency {:?} exceeds limit {:?}",
                latency, max_latency
            ))
        } else {
            None
        }
    };

    match failure {
        None => {
            if entry.health.mark_success(recovery_threshold) {
                info!("Connection {} recovered to healthy", conn.id);
            }
        }
        Some(reason) => {
            if entry.health.mark_failure(failure_threshold, &reason) {
                warn!("Connection {} marked unhealthy: {}", conn.id, reason);
                bus.publish(Event::new(
                    EventType::Error,
                    conn.id.clone(),
                    format!("Connection {} marked unhealthy: {}", conn.id, reason),
                    serde_json::json!({ "reason": reason }),
                ));
            }
        }
    }
}

/// Best failover/selection candidate: healthy, Connected, lowest priority
/// value, excluding the outgoing primary if any. Ties break by id for
/// deterministic selection.
fn select_candidate<'a>(
    entries: &'a HashMap<String, Entry>,
    exclude: Option<&str>,
) -> Option<(String, &'a Arc<Connection>)> {
    entries
        .iter()
        .filter(|(id, _)| Some(id.as_str()) != exclude)
        .filter(|(_, e)| e.health.is_healthy() && e.conn.state() == ConnectionState::Connected)
        .min_by_key(|(id, e)| (e.conn.priority(), id.as_str()))
        .map(|(id, e)| (id.clone(), &e.conn))
}

/// Demote the degraded primary and promote the best healthy backup.
fn fail_over(state: &mut EngineState, old_id: &str) -> Vec<Event> {
    if let Some(entry) = state.entries.get(old_id) {
        entry.conn.set_primary(false);
    }

    match select_candidate(&state.entries, Some(old_id)) {
        Some((new_id, conn)) => {
            conn.set_primary(true);
            state.primary_id = Some(new_id.clone());
            warn!("Failover: {} -> {}", old_id, new_id);
            vec![Event::new(
                EventType::Failover,
                new_id.clone(),
                format!("Failover from {} to {}", old_id, new_id),
                serde_json::json!({ "old": old_id, "new": new_id }),
            )]
        }
        None => {
            state.primary_id = None;
            error!("Primary {} is unhealthy and no backup is available", old_id);
            vec![Event::new(
                EventType::Error,
                old_id,
                format!("Primary {} unhealthy, no healthy backup available", old_id),
                serde_json::json!({ "old": old_id }),
            )]
        }
    }
}

/// Migrate primary back to a recovered connection with strictly higher
/// preference. Only explicitly-ranked connections participate.
fn recover(state: &mut EngineState, primary_id: &str) -> Vec<Event> {
    let primary_priority = match state.entries.get(primary_id) {
        Some(entry) => entry.conn.priority(),
        None => return Vec::new(),
    };

    let better = state
        .entries
        .iter()
        .filter(|(id, _)| id.as_str() != primary_id)
        .filter(|(_, e)| e.health.is_healthy() && e.conn.state() == ConnectionState::Connected)
        .filter(|(_, e)| e.conn.is_ranked() && e.conn.priority() < primary_priority)
        .min_by_key(|(id, e)| (e.conn.priority(), id.as_str()))
        .map(|(id, e)| (id.clone(), Arc::clone(&e.conn)));

    match better {
        Some((new_id, conn)) => {
            if let Some(entry) = state.entries.get(primary_id) {
                entry.conn.set_primary(false);
            }
            conn.set_primary(true);
            state.primary_id = Some(new_id.clone());
            info!("Auto-recovery: primary migrated {} -> {}", primary_id, new_id);
            vec![Event::new(
                EventType::PrimaryChange,
                new_id.clone(),
                format!("Recovered higher-priority connection {} promoted", new_id),
                serde_json::json!({ "old": primary_id, "new": new_id }),
            )]
        }
        None => Vec::new(),
    }
}
