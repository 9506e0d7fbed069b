// PostgreSQL driver for the connection pool, built on sqlx

use crate::db::driver::{ConnectionFactory, RawConnection, RawCursor};
use crate::db::Row;
use crate::errors::DatabaseError;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use sqlx::postgres::{PgArguments, PgRow};
use sqlx::query::Query;
use sqlx::{Column as _, Connection as _, PgConnection, Postgres, Row as _};
use std::time::Duration;
use tracing::{debug, instrument};

/// Opens one `PgConnection` per pooled connection
pub struct PgConnector {
    url: String,
    connect_timeout: Duration,
}

impl PgConnector {
    pub fn new(url: impl Into<String>, connect_timeout: Duration) -> Self {
        Self {
            url: url.into(),
            connect_timeout,
        }
    }
}

#[async_trait]
impl ConnectionFactory for PgConnector {
    #[instrument(skip(self), fields(connect_timeout_ms = self.connect_timeout.as_millis() as u64))]
    async fn connect(&self) -> Result<Box<dyn RawConnection>, DatabaseError> {
        let conn = tokio::time::timeout(self.connect_timeout, PgConnection::connect(&self.url))
            .await
            .map_err(|_| {
                DatabaseError::ConnectionFailed(format!(
                    "Timed out after {:?} connecting to PostgreSQL",
                    self.connect_timeout
                ))
            })?
            .map_err(|e| {
                tracing::error!(error = %e, "Failed to connect to PostgreSQL");
                DatabaseError::ConnectionFailed(e.to_string())
            })?;

        debug!("PostgreSQL connection established");
        Ok(Box::new(PgRawConnection {
            conn,
            in_transaction: false,
        }))
    }
}

/// A PostgreSQL session with an implicit transaction
///
/// The first statement after connect, commit or rollback opens a transaction,
/// so every change waits for an explicit commit.
pub struct PgRawConnection {
    conn: PgConnection,
    in_transaction: bool,
}

impl PgRawConnection {
    async fn begin_if_needed(&mut self) -> Result<(), DatabaseError> {
        if !self.in_transaction {
            sqlx::query("BEGIN").execute(&mut self.conn).await?;
            self.in_transaction = true;
        }
        Ok(())
    }

    async fn finish(&mut self, statement: &'static str) -> Result<(), DatabaseError> {
        if !self.in_transaction {
            return Ok(());
        }
        // The transaction is over on the server even if the reply is lost
        self.in_transaction = false;
        sqlx::query(statement)
            .execute(&mut self.conn)
            .await
            .map_err(|e| DatabaseError::TransactionFailed(e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl RawConnection for PgRawConnection {
    async fn cursor(&mut self) -> Result<Box<dyn RawCursor + '_>, DatabaseError> {
        Ok(Box::new(PgCursor {
            session: self,
            rows: Vec::new(),
        }))
    }

    async fn commit(&mut self) -> Result<(), DatabaseError> {
        self.finish("COMMIT").await
    }

    async fn rollback(&mut self) -> Result<(), DatabaseError> {
        self.finish("ROLLBACK").await
    }

    async fn close(self: Box<Self>) -> Result<(), DatabaseError> {
        self.conn.close().await?;
        Ok(())
    }
}

/// Buffers the rows of the last statement run through it
struct PgCursor<'c> {
    session: &'c mut PgRawConnection,
    rows: Vec<PgRow>,
}

#[async_trait]
impl RawCursor for PgCursor<'_> {
    async fn execute(&mut self, query: &str, params: &[Value]) -> Result<(), DatabaseError> {
        self.session.begin_if_needed().await?;

        let statement = params
            .iter()
            .fold(sqlx::query(query), |statement, param| bind_param(statement, param));
        self.rows = statement.fetch_all(&mut self.session.conn).await?;
        Ok(())
    }

    async fn fetch_all(&mut self) -> Result<Vec<Row>, DatabaseError> {
        Ok(std::mem::take(&mut self.rows).iter().map(row_to_map).collect())
    }

    async fn close(&mut self) -> Result<(), DatabaseError> {
        self.rows.clear();
        Ok(())
    }
}

/// Bind one JSON parameter
///
/// PostgreSQL infers nothing from these binds: `null` and strings are sent as
/// TEXT. Placeholders that target other column types need an explicit cast,
/// e.g. `$1::uuid`, `$1::int` or `$1::timestamptz`.
fn bind_param<'q>(
    statement: Query<'q, Postgres, PgArguments>,
    param: &'q Value,
) -> Query<'q, Postgres, PgArguments> {
    match param {
        Value::Null => statement.bind(None::<String>),
        Value::Bool(b) => statement.bind(*b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => statement.bind(i),
            None => statement.bind(n.as_f64()),
        },
        Value::String(s) => statement.bind(s.as_str()),
        Value::Array(_) | Value::Object(_) => statement.bind(sqlx::types::Json(param)),
    }
}

fn row_to_map(row: &PgRow) -> Row {
    let mut map = Row::new();

    for (i, column) in row.columns().iter().enumerate() {
        // Try to get value as different types
        let value: Value = if let Ok(v) = row.try_get::<String, _>(i) {
            json!(v)
        } else if let Ok(v) = row.try_get::<i16, _>(i) {
            json!(v)
        } else if let Ok(v) = row.try_get::<i32, _>(i) {
            json!(v)
        } else if let Ok(v) = row.try_get::<i64, _>(i) {
            json!(v)
        } else if let Ok(v) = row.try_get::<f32, _>(i) {
            json!(v)
        } else if let Ok(v) = row.try_get::<f64, _>(i) {
            json!(v)
        } else if let Ok(v) = row.try_get::<bool, _>(i) {
            json!(v)
        } else if let Ok(v) = row.try_get::<uuid::Uuid, _>(i) {
            json!(v.to_string())
        } else if let Ok(v) = row.try_get::<chrono::NaiveDateTime, _>(i) {
            json!(v.to_string())
        } else if let Ok(v) = row.try_get::<chrono::DateTime<Utc>, _>(i) {
            json!(v.to_rfc3339())
        } else if let Ok(v) = row.try_get::<Value, _>(i) {
            v
        } else {
            // NULL or a type without a JSON mapping
            Value::Null
        };

        map.insert(column.name().to_string(), value);
    }

    map
}
