use std::future::Future;
use std::time::Duration;

use crate::config::EmbeddingConfig;
use crate::error::{RagError, Result};

/// Hard ceiling on attempts regardless of configuration.
pub const MAX_ATTEMPTS: u32 = 3;

/// Bounded exponential backoff for provider calls.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: MAX_ATTEMPTS,
            base_delay: Duration::from_millis(200),
        }
    }
}

impl From<&EmbeddingConfig> for RetryPolicy {
    fn from(config: &EmbeddingConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.clamp(1, MAX_ATTEMPTS),
            base_delay: Duration::from_millis(config.backoff_base_ms),
        }
    }
}

impl RetryPolicy {
    /// Delay before attempt `attempt + 1` (attempts count from 1).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        self.base_delay
            .checked_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
            .unwrap_or(Duration::MAX)
    }

    /// Run `op` until it succeeds, fails terminally, or attempts run out.
    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max = self.max_attempts.clamp(1, MAX_ATTEMPTS);
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) if e.is_transient() && attempt < max => {
                    let delay = self.delay_after(attempt);
                    tracing::warn!(
                        "{label} failed (attempt {attempt}/{max}), retrying in {}ms: {e}",
                        delay.as_millis()
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(RagError::Provider { message, .. }) if attempt > 1 => {
                    return Err(RagError::terminal(format!(
                        "{label} failed after {attempt} attempts: {message}"
                    )));
                }
                Err(e) => return Err(e),
            }
        }
    }
}
