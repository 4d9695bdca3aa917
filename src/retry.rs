//! Bounded exponential backoff for transient failures.
//!
//! Only errors for which [`VaultError::is_transient`] holds are retried. Everything else
//! (auth failures, encryption errors, conflicts) fails on the first attempt.

use crate::{Result, VaultError};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::{error, info, warn};

/// Retry configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first
    pub max_attempts: usize,
    /// Initial delay between attempts
    #[serde(with = "duration_ms")]
    pub initial_delay: Duration,
    /// Upper bound for the delay
    #[serde(with = "duration_ms")]
    pub max_delay: Duration,
    /// Backoff multiplier
    pub backoff_multiplier: f64,
    /// Add up to 10% jitter to each delay
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// No delay between attempts. Used by tests and in-process backends.
    pub fn immediate(max_attempts: usize) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            jitter: false,
        }
    }
}

/// Retry executor
#[derive(Debug, Clone)]
pub struct RetryExecutor {
    config: RetryConfig,
}

impl RetryExecutor {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Execute an operation, retrying transient failures with backoff.
    pub async fn execute<F, Fut, T>(&self, operation_name: &str, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 0;
        let mut delay = self.config.initial_delay;

        loop {
            attempt += 1;

            match operation().await {
                Ok(result) => {
                    if attempt > 1 {
                        info!(operation = operation_name, attempts = attempt, "Operation succeeded after retry");
                    }
                    return Ok(result);
                }
                Err(err) if err.is_transient() && attempt < max_attempts => {
                    let actual_delay = self.with_jitter(delay);
                    warn!(
                        operation = operation_name,
                        attempt = attempt,
                        error = %err,
                        delay_ms = actual_delay.as_millis() as u64,
                        "Transient failure, retrying"
                    );
                    tokio::time::sleep(actual_delay).await;
                    delay = self.next_delay(delay);
                }
                Err(err) => {
                    if err.is_transient() {
                        error!(operation = operation_name, attempts = attempt, error = %err, "Max retry attempts exceeded");
                    }
                    return Err(err);
                }
            }
        }
    }

    fn with_jitter(&self, delay: Duration) -> Duration {
        if !self.config.jitter || delay.is_zero() {
            return delay;
        }
        let jitter_ms = (delay.as_millis() as f64 * rand::random::<f64>() * 0.1) as u64;
        delay + Duration::from_millis(jitter_ms)
    }

    fn next_delay(&self, delay: Duration) -> Duration {
        let next = delay.as_secs_f64() * self.config.backoff_multiplier;
        Duration::from_secs_f64(next).min(self.config.max_delay)
    }
}

impl Default for RetryExecutor {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

/// Helper so an operation can flag itself as transient from a plain I/O error.
pub fn transient(context: &str, err: impl std::fmt::Display) -> VaultError {
    VaultError::TransientIo(format!("{}: {}", context, err))
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
