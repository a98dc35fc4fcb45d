//! Exponential backoff with jitter for stream resubscription

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Backoff policy for retrying a failed stream
///
/// Controls how a failed subscription is re-established: each attempt waits
/// `base · multiplier^attempt` (capped), plus uniform jitter drawn from a
/// small fraction of the computed delay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// Initial delay in milliseconds (default: 250ms)
    pub base_delay_ms: u64,
    /// Delay multiplier per attempt (default: 1.5)
    pub multiplier: f64,
    /// Maximum delay in milliseconds (default: 10000ms)
    pub max_delay_ms: u64,
    /// Maximum number of attempts before giving up (default: 8)
    pub max_attempts: u32,
    /// Jitter as a fraction of the computed delay (default: 0.25)
    pub jitter_fraction: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: 250,
            multiplier: 1.5,
            max_delay_ms: 10_000,
            max_attempts: 8,
            jitter_fraction: 0.25,
        }
    }
}

impl BackoffPolicy {
    /// Policy suited to unit tests: near-zero delays, few attempts
    pub fn fast() -> Self {
        Self {
            base_delay_ms: 1,
            multiplier: 1.5,
            max_delay_ms: 5,
            max_attempts: 3,
            jitter_fraction: 0.0,
        }
    }

    /// Calculate the delay before the given attempt (0-indexed)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let raw = (self.base_delay_ms as f64) * self.multiplier.powi(attempt as i32);
        let capped = raw.min(self.max_delay_ms as f64);

        let jittered = if self.jitter_fraction > 0.0 {
            capped + rand::random::<f64>() * capped * self.jitter_fraction
        } else {
            capped
        };

        Duration::from_millis(jittered as u64)
    }

    /// Check if another attempt is allowed
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

/// Run `op` until it succeeds, waiting with exponential backoff between
/// failures
///
/// The attempt counter starts at zero and is consumed only by failures, so a
/// caller that loops over successive successful values gets a fresh budget on
/// every success. Terminates with the last error once the policy's attempt
/// budget is exhausted.
pub async fn retry_with_backoff<T, F, Fut>(
    policy: &BackoffPolicy,
    label: &str,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt: u32 = 0;

    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if !err.is_retryable() => return Err(err),
            Err(err) => {
                if !policy.should_retry(attempt + 1) {
                    warn!(
                        target = label,
                        attempts = attempt + 1,
                        error = %err,
                        "retry budget exhausted"
                    );
                    return Err(err);
                }
                let delay = policy.delay_for(attempt);
                debug!(
                    target = label,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "retrying after backoff"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
