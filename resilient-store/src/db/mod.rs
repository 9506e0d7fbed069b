// Database layer: pooled connections, statement execution and transactions

pub mod connection;
pub mod driver;
pub mod pool;
pub mod postgres;
pub mod query_result;
pub mod transaction;

pub use connection::{Connection, ConnectionState};
pub use driver::{ConnectionFactory, RawConnection, RawCursor};
pub use pool::{ConnectionPool, PoolConfig, PoolStatus};
pub use postgres::PgConnector;
pub use query_result::QueryResult;
pub use transaction::Transaction;

/// One result row: column name to value
pub type Row = serde_json::Map<String, serde_json::Value>;
