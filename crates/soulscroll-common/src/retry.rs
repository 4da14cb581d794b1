//! Backoff schedules and a timeout wrapper.

use std::future::Future;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::time::sleep;
use tracing::{debug, warn};

/// Exponential backoff schedule.
///
/// Attempt 1 runs immediately; attempt `n` waits
/// `initial_delay * backoff_multiplier^(n - 2)`, never more than `max_delay`.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: u32,
    /// Stretch each delay by up to a quarter.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
            backoff_multiplier: 2,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Replays of a failed background sync: 30s, then 60s, then give up.
    pub fn background_sync() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(300),
            backoff_multiplier: 2,
            jitter: false,
        }
    }

    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let Some(step) = attempt.checked_sub(2) else {
            return Duration::ZERO;
        };
        let factor = self.backoff_multiplier.checked_pow(step).unwrap_or(u32::MAX);
        let delay = self.initial_delay.saturating_mul(factor).min(self.max_delay);

        if self.jitter {
            delay + delay.mul_f64(clock_fraction() / 4.0)
        } else {
            delay
        }
    }

    pub fn allows_another(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}

// Sub-second clock noise mapped into 0.0..1.0.
fn clock_fraction() -> f64 {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    f64::from(nanos) / 1_000_000_000.0
}

/// Run `operation` until it succeeds or the schedule is exhausted, returning
/// the last error. Always makes at least one attempt.
pub async fn retry_with_backoff<T, E, F, Fut>(config: &RetryConfig, mut operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 1;
    loop {
        let error = match operation().await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };

        if !config.allows_another(attempt) {
            warn!(attempt, error = %error, "Giving up");
            return Err(error);
        }

        attempt += 1;
        let delay = config.delay_for_attempt(attempt);
        debug!(attempt, ?delay, error = %error, "Retrying");
        sleep(delay).await;
    }
}

/// Bound `operation` by `timeout`.
pub async fn with_timeout<T>(timeout: Duration, operation: impl Future<Output = T>) -> crate::Result<T> {
    tokio::time::timeout(timeout, operation)
        .await
        .map_err(|_| crate::SoulScrollError::Timeout(timeout))
}
