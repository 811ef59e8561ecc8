//! Backend contract module
//!
//! The pluggable abstraction through which a concrete tunnel provider is
//! driven. Backends are registered by name with the connection manager;
//! the manager calls into backends and backends never call back.

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio_util::sync::CancellationToken;

use crate::config::ConnectionConfig;
use crate::connection::{Connection, ConnectionState};

/// Driver for one concrete tunnel provider
#[async_trait]
pub trait TunnelBackend: Send + Sync {
    /// Stable identifier, used as the connection's `method`.
    fn name(&self) -> &'static str;

    /// Establish the tunnel. Blocks until the provider is up or fails,
    /// and must abort promptly when `cancel` fires. On success the
    /// returned connection is Connected with its start instant stamped
    /// and, for providers that spawn a process, a pid.
    async fn connect(
        &self,
        cancel: CancellationToken,
        config: &ConnectionConfig,
    ) -> Result<Arc<Connection>>;

    /// Tear the tunnel down. Blocks until the provider is gone; on
    /// success the connection is Disconnected with its pid cleared.
    async fn disconnect(&self, conn: &Connection) -> Result<()>;

    /// Cheap local sanity check; never probes the network.
    fn is_healthy(&self, conn: &Connection) -> bool {
        conn.state() == ConnectionState::Connected
    }
}

/// Suggest a process-unique connection id for a method.
///
/// Nanosecond wall-clock suffix keeps ids unique across restarts of the
/// same method within one process.
pub fn allocate_conn_id(method: &str) -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    format!("{}-{}", method, nanos)
}

#[cfg(test)]
pub(crate) mod testing {
    //! Mock backend for manager/failover/metrics tests.

    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::time::Duration;

    /// Scriptable backend: always succeeds or always fails, with an
    /// optional connect delay for cancellation tests.
    pub struct MockBackend {
        name: &'static str,
        fail_connect: AtomicBool,
        fail_disconnect: AtomicBool,
        connect_delay: Duration,
        pub connects: AtomicU32,
        pub disconnects: AtomicU32,
    }

    impl MockBackend {
        pub fn new(name: &'static str) -> Self {
            Self {
                name,
                fail_connect: AtomicBool::new(false),
                fail_disconnect: AtomicBool::new(false),
                connect_delay: Duration::ZERO,
                connects: AtomicU32::new(0),
                disconnects: AtomicU32::new(0),
            }
        }

        pub fn failing(name: &'static str) -> Self {
            let backend = Self::new(name);
            backend.fail_connect.store(true, Ordering::SeqCst);
            backend
        }

        pub fn with_connect_delay(mut self, delay: Duration) -> Self {
            self.connect_delay = delay;
            self
        }

        pub fn set_fail_connect(&self, fail: bool) {
            self.fail_connect.store(fail, Ordering::SeqCst);
        }

        pub fn set_fail_disconnect(&self, fail: bool) {
            self.fail_disconnect.store(fail, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl TunnelBackend for MockBackend {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn connect(
            &self,
            cancel: CancellationToken,
            config: &ConnectionConfig,
        ) -> Result<Arc<Connection>> {
            self.connects.fetch_add(1, Ordering::SeqCst);

            if !self.connect_delay.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(self.connect_delay) => {}
                    _ = cancel.cancelled() => {
                        anyhow::bail!("{} connect cancelled", self.name);
                    }
                }
            }

            if self.fail_connect.load(Ordering::SeqCst) {
                anyhow::bail!("{} backend connect refused", self.name);
            }

            let conn = Arc::new(Connection::new(
                allocate_conn_id(self.name),
                self.name,
                config.clone(),
                cancel,
            ));
            conn.mark_connected(0);
            Ok(conn)
        }

        async fn disconnect(&self, conn: &Connection) -> Result<()> {
            self.disconnects.fetch_add(1, Ordering::SeqCst);

            if self.fail_disconnect.load(Ordering::SeqCst) {
                anyhow::bail!("{} backend disconnect failed", self.name);
            }

            conn.mark_disconnected();
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::MockBackend;
    use super::*;
    use std::time::Duration;

    #[test]
    fn conn_ids_are_unique_per_call() {
        let a = allocate_conn_id("ssh");
        let b = allocate_conn_id("ssh");
        assert!(a.starts_with("ssh-"));
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn mock_connect_produces_connected_connection() {
        let backend = MockBackend::new("mock");
        let conn = backend
            .connect(CancellationToken::new(), &ConnectionConfig::default())
            .await
            .unwrap();

        assert_eq!(conn.state(), ConnectionState::Connected);
        assert_eq!(conn.method, "mock");
        assert!(backend.is_healthy(&conn));

        backend.disconnect(&conn).await.unwrap();
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert!(!backend.is_healthy(&conn));
    }

    #[tokio::test]
    async fn mock_connect_honours_cancellation() {
        let backend = MockBackend::new("slow").with_connect_delay(Duration::from_secs(30));
        let cancel = CancellationToken::new();

        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            backend.connect(token, &ConnectionConfig::default()).await
        });

        cancel.cancel();
        let result = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("connect should abort promptly")
            .unwrap();
        assert!(result.is_err());
    }
}
