// Bounded database connection pool with lazy creation and timed acquisition

use crate::config::DatabaseConfig;
use crate::db::driver::ConnectionFactory;
use crate::db::postgres::PgConnector;
use crate::db::Connection;
use crate::errors::{PoolError, ReleaseError};
use crate::telemetry::{record_pool_size, record_pool_timeout};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Default time a caller waits for a free connection
pub const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_connections: usize,
    pub acquire_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 3,
            acquire_timeout: DEFAULT_ACQUIRE_TIMEOUT,
        }
    }
}

impl From<&DatabaseConfig> for PoolConfig {
    fn from(config: &DatabaseConfig) -> Self {
        Self {
            max_connections: config.max_connections as usize,
            acquire_timeout: Duration::from_secs(config.acquire_timeout_seconds),
        }
    }
}

/// Point-in-time view of the pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    pub max_connections: usize,
    pub connections_created: usize,
    pub available: usize,
    pub checked_out: usize,
}

struct PoolState {
    connections_created: usize,
    /// Idle connections; the last one released is reused first
    available: Vec<Connection>,
    checked_out: HashSet<Uuid>,
    closed: bool,
}

enum Checkout {
    Idle(Connection),
    /// A capacity slot was reserved; the caller opens the connection
    Reserved,
    Exhausted,
}

/// Database connection pool
///
/// Callers must hand every connection from [`get_connection`](Self::get_connection)
/// back through [`release_connection`](Self::release_connection); nothing is
/// returned automatically.
pub struct ConnectionPool {
    factory: Arc<dyn ConnectionFactory>,
    config: PoolConfig,
    state: Mutex<PoolState>,
    released: Notify,
}

impl ConnectionPool {
    pub fn new(factory: Arc<dyn ConnectionFactory>, config: PoolConfig) -> Self {
        info!(
            max_connections = config.max_connections,
            acquire_timeout_ms = config.acquire_timeout.as_millis() as u64,
            "Database connection pool created"
        );

        Self {
            factory,
            config,
            state: Mutex::new(PoolState {
                connections_created: 0,
                available: Vec::new(),
                checked_out: HashSet::new(),
                closed: false,
            }),
            released: Notify::new(),
        }
    }

    /// Create a pool of PostgreSQL connections. Connections open lazily.
    pub fn connect_postgres(config: &DatabaseConfig) -> Self {
        let factory = Arc::new(PgConnector::new(
            config.url.clone(),
            Duration::from_secs(config.connect_timeout_seconds),
        ));
        Self::new(factory, PoolConfig::from(config))
    }

    pub fn max_connections(&self) -> usize {
        self.config.max_connections
    }

    /// Check out a connection, waiting up to the acquire timeout
    ///
    /// Idle connections are reused most-recently-released first. A new
    /// connection is opened only while fewer than `max_connections` exist.
    #[instrument(skip(self), fields(max_connections = self.config.max_connections))]
    pub async fn get_connection(&self) -> Result<Connection, PoolError> {
        let deadline = Instant::now() + self.config.acquire_timeout;

        loop {
            // Register interest before inspecting state so a release in
            // between is not missed.
            let notified = self.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.try_checkout()? {
                Checkout::Idle(connection) => {
                    debug!(connection_id = %connection.id(), "Reusing idle connection");
                    return Ok(connection);
                }
                Checkout::Reserved => return self.open_reserved().await,
                Checkout::Exhausted => {}
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                warn!(
                    waited_ms = self.config.acquire_timeout.as_millis() as u64,
                    "Timed out waiting for a database connection"
                );
                record_pool_timeout();
                return Err(PoolError::Timeout {
                    waited: self.config.acquire_timeout,
                    max_connections: self.config.max_connections,
                });
            }
        }
    }

    fn try_checkout(&self) -> Result<Checkout, PoolError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(PoolError::Closed);
        }

        if let Some(connection) = state.available.pop() {
            state.checked_out.insert(connection.id());
            return Ok(Checkout::Idle(connection));
        }

        if state.connections_created < self.config.max_connections {
            state.connections_created += 1;
            record_pool_size(state.connections_created);
            return Ok(Checkout::Reserved);
        }

        Ok(Checkout::Exhausted)
    }

    async fn open_reserved(&self) -> Result<Connection, PoolError> {
        // Frees the slot if connecting fails or this future is dropped
        let reservation = SlotReservation { pool: self };

        let raw = self.factory.connect().await.map_err(|e| {
            warn!(error = %e, "Failed to open database connection");
            PoolError::ConnectionFailed(e.to_string())
        })?;
        std::mem::forget(reservation);

        let connection = Connection::new(raw);
        let connections_created = {
            let mut state = self.state.lock();
            state.checked_out.insert(connection.id());
            state.connections_created
        };
        info!(
            connection_id = %connection.id(),
            connections_created,
            "Opened new database connection"
        );
        Ok(connection)
    }

    fn free_slot(&self) {
        {
            let mut state = self.state.lock();
            state.connections_created = state.connections_created.saturating_sub(1);
            record_pool_size(state.connections_created);
        }
        // A waiter may now open a connection in the freed slot
        self.released.notify_one();
    }

    /// Return a checked-out connection to the pool
    ///
    /// Connections that were not checked out from this pool are rejected and
    /// handed back inside the `ReleaseError`. A connection the caller already
    /// closed gives its capacity slot back instead of being reused.
    #[instrument(skip(self, connection), fields(connection_id = %connection.id()))]
    pub async fn release_connection(&self, mut connection: Connection) -> Result<(), ReleaseError> {
        let pool_closed = {
            let mut state = self.state.lock();

            if !state.checked_out.remove(&connection.id()) {
                warn!("Rejected release of a connection not checked out from this pool");
                return Err(ReleaseError::not_checked_out(connection));
            }

            if state.closed || connection.is_closed() {
                state.connections_created = state.connections_created.saturating_sub(1);
                record_pool_size(state.connections_created);
                debug!("Connection discarded on release");
                state.closed
            } else {
                state.available.push(connection);
                debug!(available = state.available.len(), "Connection released");
                self.released.notify_one();
                return Ok(());
            }
        };

        if pool_closed {
            connection.close().await;
        } else {
            self.released.notify_one();
        }
        Ok(())
    }

    pub fn status(&self) -> PoolStatus {
        let state = self.state.lock();
        PoolStatus {
            max_connections: self.config.max_connections,
            connections_created: state.connections_created,
            available: state.available.len(),
            checked_out: state.checked_out.len(),
        }
    }

    /// Close idle connections and refuse further checkouts
    ///
    /// Checked-out connections are closed when they are released.
    #[instrument(skip(self))]
    pub async fn close(&self) {
        let idle = {
            let mut state = self.state.lock();
            state.closed = true;
            let idle = std::mem::take(&mut state.available);
            state.connections_created = state.connections_created.saturating_sub(idle.len());
            record_pool_size(state.connections_created);
            idle
        };

        info!(idle = idle.len(), "Closing database connection pool");
        for mut connection in idle {
            connection.close().await;
        }
        self.released.notify_waiters();
    }
}

/// Capacity slot held while a new connection is being opened
struct SlotReservation<'a> {
    pool: &'a ConnectionPool,
}

impl Drop for SlotReservation<'_> {
    fn drop(&mut self) {
        self.pool.free_slot();
    }
}
