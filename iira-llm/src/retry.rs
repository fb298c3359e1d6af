use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

const MAX_DELAY: Duration = Duration::from_secs(30);

/// Bounded exponential backoff.
///
/// Attempt `n` (1-based) that fails waits `base_delay * 2^(n-1)`, capped at
/// 30 seconds, before attempt `n + 1`. After `max_attempts` failures the last
/// error is returned to the caller.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
        }
    }

    /// No retries, no waiting. Used by tests and one-shot CLI commands.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
        }
    }

    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        self.base_delay
            .checked_mul(1u32 << exp)
            .unwrap_or(MAX_DELAY)
            .min(MAX_DELAY)
    }

    pub async fn run<T, E, F, Fut>(&self, label: &str, op: F) -> Result<T, (u32, E)>
    where
        E: Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.run_while(label, op, |_| true).await
    }

    /// Like [`RetryPolicy::run`], but an error for which `retryable` is false
    /// is returned at once.
    pub async fn run_while<T, E, F, Fut, P>(
        &self,
        label: &str,
        mut op: F,
        retryable: P,
    ) -> Result<T, (u32, E)>
    where
        E: Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) if !retryable(&e) => {
                    tracing::warn!(label, attempt, error = %e, "upstream call failed permanently");
                    return Err((attempt, e));
                }
                Err(e) if attempt >= max_attempts => {
                    tracing::error!(label, attempt, error = %e, "giving up after retries");
                    return Err((attempt, e));
                }
                Err(e) => {
                    let delay = self.delay_for(attempt);
                    tracing::warn!(
                        label,
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "upstream call failed; retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}
