use crate::config::ConcurrencyConfig;
use crate::core::Result;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{Level, event};

/// Bounded retry with exponential backoff and random jitter for deadlocks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&ConcurrencyConfig::default())
    }
}

impl From<&ConcurrencyConfig> for RetryPolicy {
    fn from(config: &ConcurrencyConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: Duration::from_millis(config.retry_base_delay_ms),
            max_delay: Duration::from_millis(config.retry_max_delay_ms),
            jitter: Duration::from_millis(config.retry_jitter_ms),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration, jitter: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay: base_delay.saturating_mul(1 << 5),
            jitter,
        }
    }

    /// No sleeping between attempts; used by tests and tight local loops.
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            max_retries,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter: Duration::ZERO,
        }
    }

    /// Deterministic part of the delay before retry number `retry` (1-based).
    pub fn backoff(&self, retry: u32) -> Duration {
        let cap = self.max_delay.max(self.base_delay);
        let mut backoff = self.base_delay;
        for _ in 1..retry {
            backoff = backoff.saturating_mul(2).min(cap);
        }
        backoff.min(cap)
    }

    fn delay_with_jitter(&self, retry: u32) -> Duration {
        let jitter_ms = self.jitter.as_millis() as u64;
        if jitter_ms == 0 {
            return self.backoff(retry);
        }
        let extra = rand::thread_rng().gen_range(0..jitter_ms);
        self.backoff(retry) + Duration::from_millis(extra)
    }
}

/// Runs `operation`, retrying it while it fails with a deadlock.
///
/// Every other error returns immediately. After `max_retries` retries the last
/// deadlock is returned, labelled with the number of attempts made.
pub async fn with_deadlock_retry<T, F, Fut>(policy: &RetryPolicy, mut operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        match operation().await {
            Ok(value) => {
                if attempt > 1 {
                    event!(Level::INFO, attempt, "operation succeeded after deadlock retry");
                }
                return Ok(value);
            }
            Err(err) if err.is_deadlock() => {
                if attempt > policy.max_retries {
                    event!(
                        Level::ERROR,
                        attempt,
                        max_retries = policy.max_retries,
                        error = %err,
                        "deadlock retries exhausted"
                    );
                    return Err(err.with_attempts(attempt));
                }
                let delay = policy.delay_with_jitter(attempt);
                event!(
                    Level::WARN,
                    attempt,
                    max_retries = policy.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    "deadlock detected, retrying"
                );
                sleep(delay).await;
            }
            Err(err) => return Err(err),
        }
    }
}
