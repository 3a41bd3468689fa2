//! Retry with exponential backoff for transient transport failures.
//!
//! Only errors for which [`UploadError::is_retryable`] holds are retried.
//! Everything else is returned on the first attempt. The backoff sleep is
//! abandoned as soon as the cancellation token fires.

use crate::error::{Result, UploadError};
use crate::transport::Transport;
use crate::types::Batch;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    #[serde(with = "millis")]
    pub initial_backoff: Duration,
    #[serde(with = "millis")]
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Single attempt, no retries
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Delay after failed attempt `attempt` (counting from 1)
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }
}

/// Send `batch`, retrying while the transport reports itself unavailable.
///
/// `on_retry` is told about every failed attempt that will be retried, with
/// the delay before the next one. Returns the number of attempts used.
pub async fn send_with_retry<F>(
    transport: &mut dyn Transport,
    batch: &Batch,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    mut on_retry: F,
) -> Result<u32>
where
    F: FnMut(u32, &UploadError, Duration) + Send,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;
        match transport.send(batch).await {
            Ok(()) => {
                if attempt > 1 {
                    log::info!(
                        "Batch {} delivered via {} after {} attempts",
                        batch.sequence,
                        transport.name(),
                        attempt
                    );
                }
                return Ok(attempt);
            }
            Err(err) if err.is_retryable() && attempt < max_attempts => {
                let delay = policy.backoff_delay(attempt);
                log::warn!(
                    "Sending batch {} failed (attempt {}/{}): {}; retrying in {:?}",
                    batch.sequence,
                    attempt,
                    max_attempts,
                    err,
                    delay
                );
                on_retry(attempt, &err, delay);
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(UploadError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            Err(err) => {
                if err.is_retryable() {
                    log::error!(
                        "Giving up on batch {} after {} attempts: {}",
                        batch.sequence,
                        attempt,
                        err
                    );
                }
                return Err(err);
            }
        }
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
