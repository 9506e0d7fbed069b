// Single database connection: statement execution normalized into QueryResult

use crate::db::driver::{RawConnection, RawCursor};
use crate::db::{QueryResult, Row};
use crate::errors::DatabaseError;
use crate::telemetry::record_best_effort_failure;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::fmt;
use tracing::{debug, error, instrument, warn};
use uuid::Uuid;

/// Lifecycle of a connection's raw handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Opened but no statement has run yet
    NeverActivated,
    Active,
    /// Closed; the raw handle is gone
    Inactive,
}

/// A database connection owned either by the pool (idle) or by one caller
pub struct Connection {
    id: Uuid,
    state: ConnectionState,
    last_used: Option<DateTime<Utc>>,
    raw: Option<Box<dyn RawConnection>>,
}

impl Connection {
    pub fn new(raw: Box<dyn RawConnection>) -> Self {
        Self {
            id: Uuid::new_v4(),
            state: ConnectionState::NeverActivated,
            last_used: None,
            raw: Some(raw),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn last_used(&self) -> Option<DateTime<Utc>> {
        self.last_used
    }

    pub fn is_closed(&self) -> bool {
        self.raw.is_none()
    }

    /// Execute one statement
    ///
    /// Rows are only fetched for statements starting with `select`; anything
    /// else is treated as a mutation that the caller commits explicitly.
    /// Driver failures are captured in the returned [`QueryResult`]. The
    /// cursor is closed on every path.
    ///
    /// With the PostgreSQL driver `null` and string parameters are sent as
    /// TEXT, so placeholders for other column types need a cast such as
    /// `$1::uuid` or `$1::int`.
    #[instrument(skip(self, query, params), fields(connection_id = %self.id))]
    pub async fn execute(&mut self, query: &str, params: &[Value]) -> QueryResult {
        let Some(raw) = self.raw.as_mut() else {
            warn!("Execute called on a closed connection");
            return QueryResult::failure(DatabaseError::ConnectionClosed.to_string());
        };
        self.state = ConnectionState::Active;

        let mut cursor = match raw.cursor().await {
            Ok(cursor) => cursor,
            Err(e) => {
                error!(error = %e, "Failed to open cursor");
                return QueryResult::failure(e.to_string());
            }
        };

        let outcome = run_statement(&mut *cursor, query, params).await;

        if let Err(e) = cursor.close().await {
            warn!(error = %e, "Failed to close cursor");
            record_best_effort_failure("cursor_close");
        }
        drop(cursor);
        self.last_used = Some(Utc::now());

        match outcome {
            Ok(rows) => {
                debug!(row_count = rows.len(), "Statement executed");
                QueryResult::success(rows)
            }
            Err(e) => {
                error!(error = %e, "Error executing query");
                QueryResult::failure(e.to_string())
            }
        }
    }

    pub async fn try_commit(&mut self) -> Result<(), DatabaseError> {
        let raw = self.raw.as_mut().ok_or(DatabaseError::ConnectionClosed)?;
        raw.commit().await
    }

    /// Commit the open transaction; failures are logged, not returned
    pub async fn commit(&mut self) {
        if let Err(e) = self.try_commit().await {
            error!(connection_id = %self.id, error = %e, "Commit failed");
            record_best_effort_failure("commit");
        }
    }

    pub async fn try_rollback(&mut self) -> Result<(), DatabaseError> {
        let raw = self.raw.as_mut().ok_or(DatabaseError::ConnectionClosed)?;
        raw.rollback().await
    }

    /// Roll back the open transaction; failures are logged, not returned
    pub async fn rollback(&mut self) {
        if let Err(e) = self.try_rollback().await {
            error!(connection_id = %self.id, error = %e, "Rollback failed");
            record_best_effort_failure("rollback");
        }
    }

    /// Close the raw handle. Closing twice is a no-op.
    pub async fn try_close(&mut self) -> Result<(), DatabaseError> {
        self.state = ConnectionState::Inactive;
        match self.raw.take() {
            Some(raw) => raw.close().await,
            None => Ok(()),
        }
    }

    pub async fn close(&mut self) {
        if let Err(e) = self.try_close().await {
            error!(connection_id = %self.id, error = %e, "Close failed");
            record_best_effort_failure("close");
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("last_used", &self.last_used)
            .finish_non_exhaustive()
    }
}

async fn run_statement<C>(
    cursor: &mut C,
    query: &str,
    params: &[Value],
) -> Result<Vec<Row>, DatabaseError>
where
    C: RawCursor + ?Sized,
{
    let mut rows = Vec::new();
    cursor.execute(query, params).await?;
    if is_select(query) {
        rows = cursor.fetch_all().await?;
    }
    Ok(rows)
}

fn is_select(query: &str) -> bool {
    query
        .trim()
        .get(..6)
        .is_some_and(|prefix| prefix.eq_ignore_ascii_case("select"))
}
