//! Exponential backoff with jitter for transient external failures.

use std::time::Duration;

use rand::Rng;
use tracing::{error, warn};

#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Total attempts including the first one (minimum 1).
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    /// Apply 0.5x..1.5x jitter to each delay.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Un-jittered delay before retry number `retry` (1-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exp = self
            .backoff_multiplier
            .max(1.0)
            .powi(retry.saturating_sub(1) as i32);
        let ms = (self.initial_delay.as_millis() as f64 * exp).min(self.max_delay.as_millis() as f64);
        Duration::from_millis(ms.max(0.0).round() as u64)
    }
}

/// Retry `operation` while `is_transient` holds, up to `config.max_attempts`.
///
/// Permanent errors are returned immediately without sleeping.
pub async fn retry_with_backoff<F, Fut, T, E, P>(
    config: &RetryConfig,
    operation_name: &str,
    is_transient: P,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) if !is_transient(&err) => return Err(err),
            Err(err) if attempt >= max_attempts => {
                error!(
                    operation = %operation_name,
                    attempt,
                    error = %err,
                    "operation failed after max retries"
                );
                return Err(err);
            }
            Err(err) => {
                let base = config.delay_for(attempt);
                let delay = if config.jitter {
                    let jitter = rand::rng().random_range(0.5..1.5);
                    Duration::from_secs_f64(base.as_secs_f64() * jitter)
                } else {
                    base
                };
                warn!(
                    operation = %operation_name,
                    attempt,
                    error = %err,
                    delay_ms = delay.as_millis() as u64,
                    "operation failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}
