// Unit of work over a borrowed connection

use crate::db::{Connection, QueryResult};
use crate::telemetry::record_best_effort_failure;
use serde_json::Value;
use tracing::{error, info, instrument};
use uuid::Uuid;

/// Groups statements against a connection the caller acquired from the pool.
///
/// A transaction never closes or releases its connection; that stays with
/// whoever checked it out.
pub struct Transaction<'c> {
    id: Uuid,
    connection: &'c mut Connection,
}

impl<'c> Transaction<'c> {
    pub fn new(connection: &'c mut Connection) -> Self {
        Self {
            id: Uuid::new_v4(),
            connection,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn connection_id(&self) -> Uuid {
        self.connection.id()
    }

    /// Execute a statement inside this transaction.
    ///
    /// Failures are logged and returned so the caller can decide to roll back.
    #[instrument(skip(self, query, params), fields(transaction_id = %self.id))]
    pub async fn execute(&mut self, query: &str, params: &[Value]) -> QueryResult {
        let result = self.connection.execute(query, params).await;
        if !result.is_success() {
            error!(
                transaction_id = %self.id,
                error = %result.error_message(),
                "Error executing transaction statement"
            );
        }
        result
    }

    pub async fn commit(self) {
        if let Err(e) = self.connection.try_commit().await {
            error!(transaction_id = %self.id, error = %e, "Error committing transaction");
            record_best_effort_failure("transaction_commit");
            return;
        }
        info!(transaction_id = %self.id, "Transaction committed");
    }

    pub async fn rollback(self) {
        if let Err(e) = self.connection.try_rollback().await {
            error!(transaction_id = %self.id, error = %e, "Error rolling back transaction");
            record_best_effort_failure("transaction_rollback");
            return;
        }
        info!(transaction_id = %self.id, "Transaction rolled back");
    }
}
