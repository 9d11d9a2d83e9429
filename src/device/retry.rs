//! Bounded retry with backoff for flaky device reads.
//!
//! Device property queries occasionally come back empty on a perfectly
//! healthy device. Callers wrap such reads in `retry_with_backoff`, which
//! repeats only transient failures and gives up after a fixed number of
//! attempts.

use crate::error::Result;
use log::{debug, warn};
use std::thread;
use std::time::Duration;

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total number of attempts, including the first one
    pub max_attempts: u32,
    /// Initial delay between attempts in milliseconds
    pub initial_delay_ms: u64,
    /// Multiplier for exponential backoff (typically 2.0)
    pub backoff_multiplier: f64,
    /// Maximum delay between attempts in milliseconds
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 250,
            backoff_multiplier: 2.0,
            max_delay_ms: 2000,
        }
    }
}

impl RetryConfig {
    /// Creates a new retry configuration.
    pub fn new(max_attempts: u32, initial_delay_ms: u64) -> Self {
        Self {
            max_attempts,
            initial_delay_ms,
            backoff_multiplier: 2.0,
            max_delay_ms: 2000,
        }
    }

    /// Calculates the delay before the given retry (0-based).
    fn calculate_delay(&self, retry: u32) -> Duration {
        let delay_ms = (self.initial_delay_ms as f64 * self.backoff_multiplier.powi(retry as i32))
            .min(self.max_delay_ms as f64) as u64;

        Duration::from_millis(delay_ms)
    }
}

/// Retries an operation while it fails with a transient error.
///
/// Non-transient errors are returned immediately. Once `max_attempts`
/// attempts have failed, the last error is returned and no further attempt
/// is made.
pub fn retry_with_backoff<T, F>(config: &RetryConfig, mut operation: F, operation_name: &str) -> Result<T>
where
    F: FnMut() -> Result<T>,
{
    let attempts = config.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match operation() {
            Ok(result) => {
                if attempt > 1 {
                    debug!("{} succeeded on attempt {}", operation_name, attempt);
                }
                return Ok(result);
            }
            Err(e) if !e.is_transient() => return Err(e),
            Err(e) if attempt >= attempts => {
                warn!("{} failed after {} attempts: {}", operation_name, attempt, e);
                return Err(e);
            }
            Err(e) => {
                let delay = config.calculate_delay(attempt - 1);
                debug!(
                    "{} failed on attempt {}/{}: {}; retrying after {:?}",
                    operation_name, attempt, attempts, e, delay
                );
                thread::sleep(delay);
                attempt += 1;
            }
        }
    }
}
