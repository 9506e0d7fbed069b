// Transport between the store client and a Redis-compatible server

use crate::config::StoreConfig;
use crate::errors::StoreError;
use async_trait::async_trait;
use parking_lot::RwLock;
use redis::aio::ConnectionManager;
use redis::{Client, Cmd, ErrorKind, IntoConnectionInfo, RedisError, RedisResult, Value};
use std::io;
use std::time::Duration;
use tracing::{debug, error, info, instrument};

/// Sends one command and returns the raw reply
#[async_trait]
pub trait StoreTransport: Send + Sync {
    async fn send(&self, cmd: &Cmd) -> RedisResult<Value>;

    /// Drop the underlying connections. Later sends fail.
    async fn disconnect(&self) -> RedisResult<()>;
}

/// Multiplexed, auto-reconnecting connection to a Redis server
pub struct RedisTransport {
    manager: RwLock<Option<ConnectionManager>>,
    response_timeout: Duration,
}

impl RedisTransport {
    /// Open the connection, bounded by the configured connect timeout
    #[instrument(skip(config), fields(host = %config.host, port = config.port, db = config.db))]
    pub async fn connect(config: &StoreConfig) -> Result<Self, StoreError> {
        let mut info = config
            .url()
            .into_connection_info()
            .map_err(|e| StoreError::InvalidConfig(e.to_string()))?;
        info.redis.username = config.username.clone();
        info.redis.password = config.password.clone();

        let client = Client::open(info)
            .map_err(|e| StoreError::Unavailable(format!("Failed to create Redis client: {}", e)))?;

        let manager = tokio::time::timeout(
            config.socket_connect_timeout(),
            ConnectionManager::new(client),
        )
        .await
        .map_err(|_| {
            error!(timeout = ?config.socket_connect_timeout(), "Timed out connecting to Redis");
            StoreError::Unavailable(format!(
                "Timed out after {:?} connecting to Redis",
                config.socket_connect_timeout()
            ))
        })?
        .map_err(|e| {
            error!(error = %e, "Failed to create Redis connection manager");
            StoreError::Unavailable(format!("Failed to connect to Redis: {}", e))
        })?;

        info!("Redis transport connected");
        Ok(Self {
            manager: RwLock::new(Some(manager)),
            response_timeout: config.socket_timeout(),
        })
    }
}

#[async_trait]
impl StoreTransport for RedisTransport {
    async fn send(&self, cmd: &Cmd) -> RedisResult<Value> {
        // ConnectionManager clones share one multiplexed connection
        let mut conn = self.manager.read().clone().ok_or_else(|| {
            RedisError::from((ErrorKind::ClientError, "Redis transport is disconnected"))
        })?;

        match tokio::time::timeout(self.response_timeout, cmd.query_async::<_, Value>(&mut conn)).await
        {
            Ok(reply) => reply,
            Err(_) => Err(RedisError::from(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("no reply within {:?}", self.response_timeout),
            ))),
        }
    }

    async fn disconnect(&self) -> RedisResult<()> {
        if self.manager.write().take().is_some() {
            debug!("Redis transport disconnected");
        }
        Ok(())
    }
}
