// Driver-level capabilities the connection layer is built on

use crate::db::Row;
use crate::errors::DatabaseError;
use async_trait::async_trait;
use serde_json::Value;

/// A statement handle borrowed from a raw connection
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RawCursor: Send {
    /// Run one statement with positional parameters
    async fn execute(&mut self, query: &str, params: &[Value]) -> Result<(), DatabaseError>;

    /// Rows produced by the last statement
    async fn fetch_all(&mut self) -> Result<Vec<Row>, DatabaseError>;

    async fn close(&mut self) -> Result<(), DatabaseError>;
}

/// One open database session
#[async_trait]
pub trait RawConnection: Send {
    async fn cursor(&mut self) -> Result<Box<dyn RawCursor + '_>, DatabaseError>;

    async fn commit(&mut self) -> Result<(), DatabaseError>;

    async fn rollback(&mut self) -> Result<(), DatabaseError>;

    async fn close(self: Box<Self>) -> Result<(), DatabaseError>;
}

/// Opens raw connections on demand for the pool
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn RawConnection>, DatabaseError>;
}
