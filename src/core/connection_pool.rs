use crate::config::{ConnectionPoolConfig, Credentials};
use crate::core::connection::{Connection, ConnectionError, ConnectionSettings, ServerAddress};
use crate::core::metrics::{AtomicServerMetrics, ServerMetrics};
use deadpool::managed::{self, Metrics, RecycleError, RecycleResult};
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Connection manager for deadpool that creates authenticated connections
/// to one cache server
#[derive(Debug)]
pub struct ConnectionManager {
    address: ServerAddress,
    settings: ConnectionSettings,
    credentials: Option<Credentials>,
    idle_timeout: Duration,
    max_lifetime: Duration,
    /// Bumped by `disconnect_all`; older connections are never reused
    generation: Arc<AtomicU64>,
    metrics: Arc<AtomicServerMetrics>,
}

impl ConnectionManager {
    pub fn new(
        address: ServerAddress,
        settings: ConnectionSettings,
        credentials: Option<Credentials>,
        config: &ConnectionPoolConfig,
        metrics: Arc<AtomicServerMetrics>,
    ) -> Self {
        Self {
            address,
            settings,
            credentials,
            idle_timeout: Duration::from_secs(config.idle_timeout_secs),
            max_lifetime: Duration::from_secs(config.max_lifetime_secs),
            generation: Arc::new(AtomicU64::new(0)),
            metrics,
        }
    }

    async fn establish(&self, conn: &mut Connection) -> Result<(), ConnectionError> {
        conn.connect().await?;
        conn.authenticate(self.credentials.as_ref()).await
    }
}

impl managed::Manager for ConnectionManager {
    type Type = Connection;
    type Error = ConnectionError;

    async fn create(&self) -> Result<Connection, ConnectionError> {
        self.metrics.record_connection_attempt();
        let start = Instant::now();

        let mut conn = Connection::new(self.address.clone(), self.settings);
        conn.set_generation(self.generation.load(Ordering::Acquire));

        match self.establish(&mut conn).await {
            Ok(()) => {
                self.metrics.record_connection_success(start.elapsed());
                conn.attach_metrics(Arc::clone(&self.metrics));
                debug!(
                    "Opened connection to {} in {:?}",
                    self.address,
                    start.elapsed()
                );
                Ok(conn)
            }
            Err(e) => {
                self.metrics.record_connection_failure();
                warn!("Failed to open connection to {}: {}", self.address, e);
                conn.close();
                Err(e)
            }
        }
    }

    async fn recycle(
        &self,
        conn: &mut Connection,
        metrics: &Metrics,
    ) -> RecycleResult<ConnectionError> {
        if !conn.is_reusable() {
            return Err(RecycleError::Backend(ConnectionError::InvalidState(
                conn.state(),
            )));
        }
        if conn.generation() != self.generation.load(Ordering::Acquire) {
            return Err(RecycleError::Message(
                "connection predates disconnect_all".into(),
            ));
        }
        if metrics.last_used() > self.idle_timeout {
            return Err(RecycleError::Message("connection idle too long".into()));
        }
        if metrics.age() > self.max_lifetime {
            return Err(RecycleError::Message(
                "connection exceeded its max lifetime".into(),
            ));
        }
        Ok(())
    }
}

/// Pool of authenticated connections to one server
///
/// Each operation leases exactly one connection through [`PooledConnection`];
/// the guard returns it on drop, or closes it when it is no longer usable.
#[derive(Clone)]
pub struct ConnectionPool {
    address: ServerAddress,
    pool: managed::Pool<ConnectionManager>,
    generation: Arc<AtomicU64>,
}

impl ConnectionPool {
    /// Create a pool; connections are opened lazily on first use
    pub fn new(
        manager: ConnectionManager,
        config: &ConnectionPoolConfig,
    ) -> Result<Self, PoolError> {
        let address = manager.address.clone();
        let generation = Arc::clone(&manager.generation);

        let pool = managed::Pool::builder(manager)
            .max_size(config.max_connections)
            .wait_timeout(config.wait_timeout_secs.map(Duration::from_secs))
            .runtime(deadpool::Runtime::Tokio1)
            .build()
            .map_err(|e| PoolError::PoolCreationFailed(e.to_string()))?;

        Ok(Self {
            address,
            pool,
            generation,
        })
    }

    pub fn address(&self) -> &ServerAddress {
        &self.address
    }

    /// Lease one healthy connection, creating it if none is idle
    pub async fn get(&self) -> Result<PooledConnection, PoolError> {
        match self.pool.get().await {
            Ok(object) => Ok(PooledConnection {
                object: Some(object),
                generation: Arc::clone(&self.generation),
            }),
            Err(managed::PoolError::Backend(e)) => Err(PoolError::Connection(e)),
            Err(managed::PoolError::Timeout(_)) => Err(PoolError::WaitTimeout),
            Err(e) => Err(PoolError::PoolGetFailed(e.to_string())),
        }
    }

    /// Close every idle connection now and every leased one when it returns
    pub fn disconnect_all(&self) {
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let _ = self.pool.retain(|_, _| false);
        info!(
            "Disconnected all connections to {} (generation {})",
            self.address, generation
        );
    }

    /// Connections currently owned by the pool, idle and leased
    pub fn size(&self) -> usize {
        self.pool.status().size
    }

    pub fn max_size(&self) -> usize {
        self.pool.status().max_size
    }
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("address", &self.address)
            .field("size", &self.size())
            .field("generation", &self.generation.load(Ordering::Relaxed))
            .finish()
    }
}

/// A connection leased from a [`ConnectionPool`] for one operation
///
/// On drop a reusable connection goes back to the idle set. Anything else is
/// detached from the pool and closed, so the pool never holds dead slots.
pub struct PooledConnection {
    object: Option<managed::Object<ConnectionManager>>,
    generation: Arc<AtomicU64>,
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        self.object.as_ref().expect("object is only taken on drop")
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Connection {
        self.object.as_mut().expect("object is only taken on drop")
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        let Some(object) = self.object.take() else {
            return;
        };

        let current = self.generation.load(Ordering::Acquire);
        if object.is_reusable() && object.generation() == current {
            // Dropping the object returns it to the idle set
            return;
        }

        if !object.is_reusable() {
            warn!(
                "Discarding connection to {} in state {:?}",
                object.address(),
                object.state()
            );
        } else {
            debug!(
                "Closing connection to {} leased before disconnect_all",
                object.address()
            );
        }
        let mut conn = managed::Object::take(object);
        conn.close();
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("Connection pool creation failed: {0}")]
    PoolCreationFailed(String),
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error("Timed out waiting for a pooled connection")]
    WaitTimeout,
    #[error("Failed to get connection from pool: {0}")]
    PoolGetFailed(String),
}
