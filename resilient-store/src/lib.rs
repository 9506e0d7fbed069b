// Bounded database connection pool and resilient key-value store client

pub mod config;
pub mod db;
pub mod errors;
pub mod retry;
pub mod store;
pub mod telemetry;

pub use config::{DatabaseConfig, Settings, StoreConfig};
pub use db::{Connection, ConnectionPool, PoolConfig, QueryResult, Transaction};
pub use errors::{DatabaseError, PoolError, ReleaseError, StoreError};
pub use store::{DecodedValue, ResilientStoreClient, SetOptions, StoreValue};
