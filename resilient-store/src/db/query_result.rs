use crate::db::Row;
use serde::Serialize;

/// Outcome of a single statement
///
/// Failures are captured here instead of being returned as errors, so a
/// caller can inspect them and decide whether to roll back.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryResult {
    rows: Vec<Row>,
    success: bool,
    error_message: String,
}

impl QueryResult {
    pub fn success(rows: Vec<Row>) -> Self {
        Self {
            rows,
            success: true,
            error_message: String::new(),
        }
    }

    pub fn failure(error_message: impl Into<String>) -> Self {
        Self {
            rows: Vec::new(),
            success: false,
            error_message: error_message.into(),
        }
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn into_rows(self) -> Vec<Row> {
        self.rows
    }

    pub fn is_success(&self) -> bool {
        self.success
    }

    /// Empty when the statement succeeded
    pub fn error_message(&self) -> &str {
        &self.error_message
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }
}
