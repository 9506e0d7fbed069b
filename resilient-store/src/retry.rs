// Retry strategy implementation with exponential backoff and optional jitter

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::{error, warn};

/// Upper bound for a single backoff sleep
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(60);

/// Retry strategy trait for calculating retry delays
pub trait RetryStrategy: Send + Sync {
    /// Calculate the delay before the next retry attempt
    /// Returns None if max retries exceeded
    fn next_delay(&self, attempt: u32) -> Option<Duration>;

    /// Get the maximum number of retries (attempts after the first one)
    fn max_retries(&self) -> u32;

    /// Check if more retries are allowed
    fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries()
    }
}

/// Exponential backoff: `base_delay * backoff_factor^attempt`, attempt indexed from 0
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    max_retries: u32,
    base_delay: Duration,
    backoff_factor: f64,
    max_delay: Duration,
    /// Jitter factor (0.0 to 1.0); 0.0 keeps delays deterministic
    jitter_factor: f64,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(100),
            backoff_factor: 2.0,
            max_delay: DEFAULT_MAX_DELAY,
            jitter_factor: 0.0,
        }
    }
}

impl ExponentialBackoff {
    pub fn new(max_retries: u32, base_delay: Duration, backoff_factor: f64) -> Self {
        Self {
            max_retries,
            base_delay,
            backoff_factor: if backoff_factor.is_finite() {
                backoff_factor.max(1.0)
            } else {
                1.0
            },
            ..Self::default()
        }
    }

    pub fn with_jitter(mut self, jitter_factor: f64) -> Self {
        self.jitter_factor = jitter_factor.clamp(0.0, 1.0);
        self
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Calculate exponential delay without jitter
    fn calculate_base_delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let secs = self.base_delay.as_secs_f64() * self.backoff_factor.powi(exponent);
        Duration::try_from_secs_f64(secs)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Add random jitter to prevent thundering herd
    fn add_jitter(&self, delay: Duration) -> Duration {
        if self.jitter_factor == 0.0 {
            return delay;
        }

        let jitter_range_ms = (delay.as_millis() as f64 * self.jitter_factor) as u64;
        let jitter_ms = if jitter_range_ms > 0 {
            rand::thread_rng().gen_range(0..=jitter_range_ms)
        } else {
            0
        };

        delay + Duration::from_millis(jitter_ms)
    }
}

impl RetryStrategy for ExponentialBackoff {
    fn next_delay(&self, attempt: u32) -> Option<Duration> {
        if !self.should_retry(attempt) {
            return None;
        }
        Some(self.add_jitter(self.calculate_base_delay(attempt)))
    }

    fn max_retries(&self) -> u32 {
        self.max_retries
    }
}

/// Outcome of an operation that did not succeed under [`retry`]
#[derive(Debug)]
pub enum RetryError<E> {
    /// Every attempt failed transiently; `last` is the final failure
    Exhausted { attempts: u32, last: E },
    /// A non-transient failure, returned on the attempt that produced it
    Permanent { attempts: u32, error: E },
}

/// Run `operation` until it succeeds, fails permanently, or the strategy runs
/// out of retries. `is_transient` decides which failures are worth retrying.
pub async fn retry<S, T, E, F, Fut, P>(
    strategy: &S,
    operation_name: &str,
    is_transient: P,
    mut operation: F,
) -> Result<T, RetryError<E>>
where
    S: RetryStrategy + ?Sized,
    E: std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
{
    let max_attempts = strategy.max_retries().saturating_add(1);
    let mut attempt = 0u32;

    loop {
        let err = match operation().await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        if !is_transient(&err) {
            return Err(RetryError::Permanent {
                attempts: attempt + 1,
                error: err,
            });
        }

        match strategy.next_delay(attempt) {
            Some(delay) => {
                warn!(
                    operation = operation_name,
                    attempt = attempt + 1,
                    max_attempts,
                    retry_in_ms = delay.as_millis() as u64,
                    error = %err,
                    "Operation failed, retrying"
                );
                crate::telemetry::record_store_retry(operation_name);
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            None => {
                error!(
                    operation = operation_name,
                    attempts = attempt + 1,
                    error = %err,
                    "Operation failed after all attempts"
                );
                return Err(RetryError::Exhausted {
                    attempts: attempt + 1,
                    last: err,
                });
            }
        }
    }
}
