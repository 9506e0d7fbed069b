// Key-value store client with retry, value encoding and connection limits

use crate::config::StoreConfig;
use crate::errors::StoreError;
use crate::retry::{retry, ExponentialBackoff, RetryError};
use crate::store::codec::{DecodedValue, SetMember, StoreValue};
use crate::store::transport::{RedisTransport, StoreTransport};
use crate::telemetry::{record_best_effort_failure, record_store_failure};
use redis::{Cmd, ErrorKind, FromRedisValue, RedisError, RedisResult, Value};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Semaphore, SemaphorePermit};
use tracing::{debug, error, info, instrument};

/// Options for [`ResilientStoreClient::set`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SetOptions {
    /// Expire the key after this many seconds
    pub expire_seconds: Option<u64>,
    /// Only write when the key does not exist yet
    pub only_if_absent: bool,
}

impl SetOptions {
    pub fn expire_in(seconds: u64) -> Self {
        Self {
            expire_seconds: Some(seconds),
            ..Self::default()
        }
    }

    pub fn if_absent() -> Self {
        Self {
            only_if_absent: true,
            ..Self::default()
        }
    }
}

/// Client for a Redis-compatible key-value store
///
/// Every remote operation is retried with exponential backoff while it fails
/// with a connectivity error. At most `max_connections` operations are in
/// flight at once; further callers wait for a permit. Share one client
/// between tasks with an `Arc`.
pub struct ResilientStoreClient {
    config: StoreConfig,
    transport: Arc<dyn StoreTransport>,
    policy: ExponentialBackoff,
    permits: Semaphore,
    closed: AtomicBool,
}

impl ResilientStoreClient {
    /// Connect to the configured server and verify it answers a ping
    #[instrument(skip(config), fields(host = %config.host, port = config.port, db = config.db))]
    pub async fn connect(config: StoreConfig) -> Result<Self, StoreError> {
        config.validate().map_err(StoreError::InvalidConfig)?;
        let transport = RedisTransport::connect(&config).await?;
        let client = Self::build(config, Arc::new(transport));

        if let Err(e) = client.transport.send(&redis::cmd("PING")).await {
            error!(error = %e, "Redis did not answer the initial ping");
            return Err(StoreError::Unavailable(format!("Failed to connect to Redis: {}", e)));
        }

        info!("Redis connection established successfully");
        Ok(client)
    }

    /// Build a client over an existing transport without contacting it
    pub fn with_transport(
        config: StoreConfig,
        transport: Arc<dyn StoreTransport>,
    ) -> Result<Self, StoreError> {
        config.validate().map_err(StoreError::InvalidConfig)?;
        Ok(Self::build(config, transport))
    }

    fn build(config: StoreConfig, transport: Arc<dyn StoreTransport>) -> Self {
        let policy = ExponentialBackoff::new(
            config.max_retries,
            config.retry_delay(),
            config.backoff_factor,
        )
        .with_jitter(config.retry_jitter);
        let permits = Semaphore::new(config.max_connections as usize);

        Self {
            config,
            transport,
            policy,
            permits,
            closed: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    async fn acquire_permit(&self) -> Result<SemaphorePermit<'_>, StoreError> {
        if self.is_closed() {
            return Err(closed_error());
        }
        self.permits.acquire().await.map_err(|_| closed_error())
    }

    async fn attempt<T: FromRedisValue>(&self, cmd: &Cmd) -> RedisResult<T> {
        let value = self.transport.send(cmd).await?;
        redis::from_redis_value(&value)
    }

    /// Run one command under the retry policy and convert its reply
    #[instrument(level = "debug", skip(self, cmd))]
    async fn execute<T: FromRedisValue>(
        &self,
        operation: &'static str,
        target: &str,
        cmd: &Cmd,
    ) -> Result<T, StoreError> {
        let _permit = self.acquire_permit().await?;
        let retry_on_timeout = self.config.retry_on_timeout;

        retry(
            &self.policy,
            operation,
            |e: &RedisError| is_transient(e, retry_on_timeout),
            move || self.attempt::<T>(cmd),
        )
        .await
        .map_err(|e| translate(operation, target, e))
    }

    /// Write a value. Returns false when `only_if_absent` kept an existing key.
    pub async fn set(
        &self,
        key: &str,
        value: impl Into<StoreValue>,
        options: SetOptions,
    ) -> Result<bool, StoreError> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value.into().encode()?);
        if let Some(seconds) = options.expire_seconds {
            cmd.arg("EX").arg(seconds);
        }
        if options.only_if_absent {
            cmd.arg("NX");
        }

        let reply: Option<String> = self.execute("SET", key, &cmd).await?;
        Ok(reply.is_some())
    }

    pub async fn get(&self, key: &str, decode_json: bool) -> Result<Option<DecodedValue>, StoreError> {
        let mut cmd = redis::cmd("GET");
        cmd.arg(key);
        let reply: Option<Vec<u8>> = self.execute("GET", key, &cmd).await?;
        Ok(reply.map(|bytes| DecodedValue::decode(&bytes, decode_json)))
    }

    /// Delete keys, returning how many existed
    pub async fn delete(&self, keys: &[&str]) -> Result<i64, StoreError> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut cmd = redis::cmd("DEL");
        cmd.arg(keys);
        self.execute("DEL", &keys.join(" "), &cmd).await
    }

    pub async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let mut cmd = redis::cmd("EXISTS");
        cmd.arg(key);
        let count: i64 = self.execute("EXISTS", key, &cmd).await?;
        Ok(count > 0)
    }

    /// Set a timeout on a key. Returns false when the key does not exist.
    pub async fn expire(&self, key: &str, seconds: i64) -> Result<bool, StoreError> {
        let mut cmd = redis::cmd("EXPIRE");
        cmd.arg(key).arg(seconds);
        self.execute("EXPIRE", key, &cmd).await
    }

    /// Remaining time to live in seconds; -1 without expiry, -2 when missing
    pub async fn ttl(&self, key: &str) -> Result<i64, StoreError> {
        let mut cmd = redis::cmd("TTL");
        cmd.arg(key);
        self.execute("TTL", key, &cmd).await
    }

    /// Set a hash field, returning 1 if the field is new
    pub async fn hset(
        &self,
        key: &str,
        field: &str,
        value: impl Into<StoreValue>,
    ) -> Result<i64, StoreError> {
        let mut cmd = redis::cmd("HSET");
        cmd.arg(key).arg(field).arg(value.into().encode()?);
        self.execute("HSET", key, &cmd).await
    }

    pub async fn hget(
        &self,
        key: &str,
        field: &str,
        decode_json: bool,
    ) -> Result<Option<DecodedValue>, StoreError> {
        let mut cmd = redis::cmd("HGET");
        cmd.arg(key).arg(field);
        let reply: Option<Vec<u8>> = self.execute("HGET", key, &cmd).await?;
        Ok(reply.map(|bytes| DecodedValue::decode(&bytes, decode_json)))
    }

    pub async fn hgetall(
        &self,
        key: &str,
        decode_json: bool,
    ) -> Result<HashMap<String, DecodedValue>, StoreError> {
        let mut cmd = redis::cmd("HGETALL");
        cmd.arg(key);
        let reply: HashMap<String, Vec<u8>> = self.execute("HGETALL", key, &cmd).await?;
        Ok(reply
            .into_iter()
            .map(|(field, bytes)| (field, DecodedValue::decode(&bytes, decode_json)))
            .collect())
    }

    pub async fn hdel(&self, key: &str, fields: &[&str]) -> Result<i64, StoreError> {
        if fields.is_empty() {
            return Ok(0);
        }
        let mut cmd = redis::cmd("HDEL");
        cmd.arg(key).arg(fields);
        self.execute("HDEL", key, &cmd).await
    }

    /// Prepend values, returning the new list length
    pub async fn lpush(&self, key: &str, values: &[StoreValue]) -> Result<i64, StoreError> {
        self.push("LPUSH", key, values).await
    }

    /// Append values, returning the new list length
    pub async fn rpush(&self, key: &str, values: &[StoreValue]) -> Result<i64, StoreError> {
        self.push("RPUSH", key, values).await
    }

    async fn push(
        &self,
        operation: &'static str,
        key: &str,
        values: &[StoreValue],
    ) -> Result<i64, StoreError> {
        if values.is_empty() {
            return self.llen(key).await;
        }
        let mut cmd = redis::cmd(operation);
        cmd.arg(key);
        for value in values {
            cmd.arg(value.encode()?);
        }
        self.execute(operation, key, &cmd).await
    }

    pub async fn lpop(&self, key: &str, decode_json: bool) -> Result<Option<DecodedValue>, StoreError> {
        self.pop("LPOP", key, decode_json).await
    }

    pub async fn rpop(&self, key: &str, decode_json: bool) -> Result<Option<DecodedValue>, StoreError> {
        self.pop("RPOP", key, decode_json).await
    }

    async fn pop(
        &self,
        operation: &'static str,
        key: &str,
        decode_json: bool,
    ) -> Result<Option<DecodedValue>, StoreError> {
        let mut cmd = redis::cmd(operation);
        cmd.arg(key);
        let reply: Option<Vec<u8>> = self.execute(operation, key, &cmd).await?;
        Ok(reply.map(|bytes| DecodedValue::decode(&bytes, decode_json)))
    }

    pub async fn llen(&self, key: &str) -> Result<i64, StoreError> {
        let mut cmd = redis::cmd("LLEN");
        cmd.arg(key);
        self.execute("LLEN", key, &cmd).await
    }

    /// Add members, returning how many were not already present
    pub async fn sadd(&self, key: &str, values: &[StoreValue]) -> Result<i64, StoreError> {
        self.set_update("SADD", key, values).await
    }

    /// Remove members, returning how many were present
    pub async fn srem(&self, key: &str, values: &[StoreValue]) -> Result<i64, StoreError> {
        self.set_update("SREM", key, values).await
    }

    async fn set_update(
        &self,
        operation: &'static str,
        key: &str,
        values: &[StoreValue],
    ) -> Result<i64, StoreError> {
        if values.is_empty() {
            return Ok(0);
        }
        let mut cmd = redis::cmd(operation);
        cmd.arg(key);
        for value in values {
            cmd.arg(value.encode()?);
        }
        self.execute(operation, key, &cmd).await
    }

    pub async fn smembers(&self, key: &str, decode_json: bool) -> Result<HashSet<SetMember>, StoreError> {
        let mut cmd = redis::cmd("SMEMBERS");
        cmd.arg(key);
        let reply: Vec<Vec<u8>> = self.execute("SMEMBERS", key, &cmd).await?;
        Ok(reply
            .iter()
            .map(|bytes| SetMember::from(DecodedValue::decode(bytes, decode_json)))
            .collect())
    }

    /// Key names matching a glob pattern such as `user:*`
    pub async fn keys(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        let mut cmd = redis::cmd("KEYS");
        cmd.arg(pattern);
        self.execute("KEYS", pattern, &cmd).await
    }

    /// Remove every key of the selected database
    pub async fn flushdb(&self) -> Result<bool, StoreError> {
        let reply: String = self.execute("FLUSHDB", "", &redis::cmd("FLUSHDB")).await?;
        Ok(reply == "OK")
    }

    pub async fn ping(&self) -> Result<bool, StoreError> {
        let reply: String = self.execute("PING", "", &redis::cmd("PING")).await?;
        Ok(reply == "PONG")
    }

    /// Whether the server answers a ping right now. Never fails.
    #[instrument(skip(self))]
    pub async fn health_check(&self) -> bool {
        if self.is_closed() {
            debug!("Health check on a closed store client");
            return false;
        }

        match self.transport.send(&redis::cmd("PING")).await {
            Ok(_) => true,
            Err(e) => {
                error!(error = %e, "Redis health check failed");
                record_best_effort_failure("store_health_check");
                false
            }
        }
    }

    /// Borrow a connection permit for commands outside the typed surface
    ///
    /// The permit goes back to the client when the guard is dropped.
    pub async fn connection(&self) -> Result<StoreConnection<'_>, StoreError> {
        let permit = self.acquire_permit().await?;
        Ok(StoreConnection {
            transport: self.transport.as_ref(),
            _permit: permit,
        })
    }

    /// Disconnect from the server. Later operations fail with
    /// [`StoreError::Unavailable`]. Errors are logged, not returned.
    #[instrument(skip(self))]
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.permits.close();

        match self.transport.disconnect().await {
            Ok(()) => info!("Redis connection closed"),
            Err(e) => {
                error!(error = %e, "Error closing Redis connection");
                record_best_effort_failure("store_close");
            }
        }
    }
}

/// A connection permit with raw command access
pub struct StoreConnection<'a> {
    transport: &'a dyn StoreTransport,
    _permit: SemaphorePermit<'a>,
}

impl StoreConnection<'_> {
    /// Send one command without retrying and convert the reply
    pub async fn query<T: FromRedisValue>(&self, cmd: &Cmd) -> Result<T, StoreError> {
        let value = self.send(cmd).await?;
        redis::from_redis_value(&value).map_err(|e| StoreError::operation("query", e))
    }

    pub async fn send(&self, cmd: &Cmd) -> Result<Value, StoreError> {
        self.transport.send(cmd).await.map_err(|e| {
            if is_transient(&e, true) {
                StoreError::ConnectionFailed {
                    attempts: 1,
                    source: e,
                }
            } else {
                StoreError::operation("query", e)
            }
        })
    }
}

/// Connectivity failures worth retrying
fn is_transient(err: &RedisError, retry_on_timeout: bool) -> bool {
    if err.is_timeout() {
        return retry_on_timeout;
    }
    err.kind() == ErrorKind::IoError
        || err.is_io_error()
        || err.is_connection_refusal()
        || err.is_connection_dropped()
}

fn translate(operation: &'static str, target: &str, err: RetryError<RedisError>) -> StoreError {
    let description = if target.is_empty() {
        operation.to_string()
    } else {
        format!("{} {}", operation, target)
    };

    match err {
        RetryError::Exhausted { attempts, last } => {
            // The retry loop already logged the final failure
            record_store_failure(operation, "connection");
            StoreError::ConnectionFailed {
                attempts,
                source: last,
            }
        }
        RetryError::Permanent { error: e, .. } => {
            error!(operation = %description, error = %e, "Store operation failed");
            record_store_failure(operation, "operation");
            StoreError::operation(description, e)
        }
    }
}

fn closed_error() -> StoreError {
    StoreError::Unavailable("store client is closed".to_string())
}
