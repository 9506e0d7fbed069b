// Structured logging setup and metric helpers shared by the pool and the store client

use anyhow::Result;
use metrics::{counter, describe_counter, describe_gauge, gauge};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Initialize structured logging
///
/// The filter comes from `RUST_LOG` when set, otherwise from `log_level`.
/// `json` selects JSON lines with span context; otherwise human-readable output.
pub fn init_logging(log_level: &str, json: bool) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .map_err(|e| anyhow::anyhow!("Failed to create env filter: {}", e))?;

    let layer = if json {
        fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
            .with_filter(env_filter)
            .boxed()
    } else {
        fmt::layer().with_target(true).with_filter(env_filter).boxed()
    };

    tracing_subscriber::registry()
        .with(layer)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialize tracing subscriber: {}", e))?;

    tracing::info!(log_level = log_level, json = json, "Structured logging initialized");

    Ok(())
}

/// Register metric descriptions with whichever recorder the application installed
pub fn describe_metrics() {
    describe_gauge!(
        "db_pool_connections_created",
        "Number of database connections currently owned by the pool"
    );
    describe_counter!(
        "db_pool_acquire_timeouts_total",
        "Connection acquisitions that timed out"
    );
    describe_counter!(
        "store_retries_total",
        "Key-value operations retried after a transient failure"
    );
    describe_counter!(
        "store_operation_failures_total",
        "Key-value operations that failed after retry handling"
    );
    describe_counter!(
        "best_effort_failures_total",
        "Failures swallowed by best-effort cleanup operations"
    );
}

/// Record a failure swallowed by a best-effort operation (commit, rollback, close, ...)
#[inline]
pub fn record_best_effort_failure(operation: &'static str) {
    counter!("best_effort_failures_total", "operation" => operation).increment(1);
}

#[inline]
pub fn record_pool_size(created: usize) {
    gauge!("db_pool_connections_created").set(created as f64);
}

#[inline]
pub fn record_pool_timeout() {
    counter!("db_pool_acquire_timeouts_total").increment(1);
}

#[inline]
pub fn record_store_retry(operation: &str) {
    counter!("store_retries_total", "operation" => operation.to_string()).increment(1);
}

#[inline]
pub fn record_store_failure(operation: &str, kind: &'static str) {
    counter!(
        "store_operation_failures_total",
        "operation" => operation.to_string(),
        "kind" => kind
    )
    .increment(1);
}
