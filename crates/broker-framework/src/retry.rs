//! Bounded exponential backoff for broker connections.

use crate::error::BrokerError;
use std::future::Future;
use std::time::Duration;
use tracing::{info, warn};

pub const INITIAL_RETRY_DELAY: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            initial_delay: INITIAL_RETRY_DELAY,
            max_delay,
        }
    }

    pub fn with_initial_delay(mut self, initial_delay: Duration) -> Self {
        self.initial_delay = initial_delay;
        self
    }

    /// Delay to wait after the failed `attempt` (1-based): `initial * 2^(attempt-1)`,
    /// capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.initial_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }
}

/// Runs `connect` against `endpoint` until it succeeds, sleeping between attempts.
///
/// Non-transient errors are returned immediately. After `policy.max_attempts` transient
/// failures the result is [`BrokerError::ConnectExhausted`].
pub async fn connect_with_retry<T, F, Fut>(
    policy: RetryPolicy,
    endpoint: &str,
    mut connect: F,
) -> Result<T, BrokerError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, BrokerError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;
        match connect().await {
            Ok(connection) => {
                if attempt > 1 {
                    info!(endpoint, attempt, "Broker connection established after retry");
                }
                return Ok(connection);
            }
            Err(e) if !e.is_transient() => return Err(e),
            Err(e) if attempt >= max_attempts => {
                return Err(BrokerError::ConnectExhausted {
                    attempts: attempt,
                    last_error: e.to_string(),
                });
            }
            Err(e) => {
                let delay = policy.delay_for(attempt);
                warn!(
                    endpoint,
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    "Broker connection failed, retrying: {e}"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}
