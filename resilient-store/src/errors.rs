// Error handling framework for the database pool and the key-value client

use crate::db::Connection;
use parking_lot::Mutex;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Connection pool errors
#[derive(Error, Debug)]
pub enum PoolError {
    #[error("No connection available within {waited:?} (max_connections = {max_connections})")]
    Timeout {
        waited: Duration,
        max_connections: usize,
    },

    #[error("Failed to open database connection: {0}")]
    ConnectionFailed(String),

    #[error("Connection pool is closed")]
    Closed,
}

/// A release the pool refused
///
/// Carries the rejected connection back to the caller, which still owns it.
/// The connection sits behind a lock so the error stays `Sync`.
#[derive(Error, Debug)]
#[error("Connection {connection_id} is not checked out from this pool")]
pub struct ReleaseError {
    connection_id: Uuid,
    connection: Mutex<Connection>,
}

impl ReleaseError {
    pub(crate) fn not_checked_out(connection: Connection) -> Self {
        Self {
            connection_id: connection.id(),
            connection: Mutex::new(connection),
        }
    }

    pub fn connection_id(&self) -> Uuid {
        self.connection_id
    }

    pub fn into_connection(self) -> Connection {
        self.connection.into_inner()
    }
}

/// Database-specific errors
#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("Database connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Query execution failed: {0}")]
    QueryFailed(String),

    #[error("Transaction failed: {0}")]
    TransactionFailed(String),

    #[error("Connection is closed")]
    ConnectionClosed,

    #[error("Duplicate key violation: {0}")]
    DuplicateKey(String),

    #[error("Foreign key violation: {0}")]
    ForeignKeyViolation(String),
}

/// Key-value store errors
#[derive(Error, Debug)]
pub enum StoreError {
    /// Transient failures persisted through every retry attempt.
    #[error("Store connection failed after {attempts} attempts: {source}")]
    ConnectionFailed {
        attempts: u32,
        #[source]
        source: redis::RedisError,
    },

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Store operation '{operation}' failed: {reason}")]
    OperationFailed { operation: String, reason: String },

    #[error("Value serialization failed: {0}")]
    Serialization(String),

    #[error("Invalid store configuration: {0}")]
    InvalidConfig(String),
}

impl StoreError {
    pub fn operation(operation: impl Into<String>, reason: impl ToString) -> Self {
        StoreError::OperationFailed {
            operation: operation.into(),
            reason: reason.to_string(),
        }
    }

    /// Whether the error came from connectivity rather than the request itself
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            StoreError::ConnectionFailed { .. } | StoreError::Unavailable(_)
        )
    }
}

// Implement From for common external errors
impl From<sqlx::Error> for DatabaseError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Database(db_err) => {
                // Check for specific database error codes
                if let Some(code) = db_err.code() {
                    match code.as_ref() {
                        "23505" => DatabaseError::DuplicateKey(db_err.message().to_string()),
                        "23503" => DatabaseError::ForeignKeyViolation(db_err.message().to_string()),
                        _ => DatabaseError::QueryFailed(db_err.message().to_string()),
                    }
                } else {
                    DatabaseError::QueryFailed(db_err.message().to_string())
                }
            }
            sqlx::Error::Io(e) => DatabaseError::ConnectionFailed(e.to_string()),
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
                DatabaseError::ConnectionFailed(err.to_string())
            }
            _ => DatabaseError::QueryFailed(err.to_string()),
        }
    }
}

impl From<bincode::error::EncodeError> for StoreError {
    fn from(err: bincode::error::EncodeError) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}
