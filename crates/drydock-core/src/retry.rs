//! Bounded retry with exponential backoff for transient infrastructure errors.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::domain::error::{DrydockError, Result};

/// Retry budget shared by scan, push and cluster calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryPolicy {
    /// Total attempts including the first (1 = no retries).
    pub max_attempts: u32,
    /// Delay after the first failed attempt; doubles on each further failure.
    pub backoff_base_ms: u64,
    /// Upper bound for a single delay.
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base_ms: 500,
            max_backoff_ms: 10_000,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff_base_ms: u64) -> Self {
        Self {
            max_attempts,
            backoff_base_ms,
            ..Self::default()
        }
    }

    /// Single attempt, no backoff.
    pub fn none() -> Self {
        Self::new(1, 0)
    }

    /// Delay after failed attempt `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
        let ms = self
            .backoff_base_ms
            .saturating_mul(factor)
            .min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }
}

/// Which errors a retry loop may retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryOn {
    /// Only `TransientInfra`; everything else fails fast.
    Transient,
    /// Every error. Used for scanner invocations.
    AnyError,
}

impl RetryOn {
    fn allows(&self, err: &DrydockError) -> bool {
        match self {
            RetryOn::Transient => err.is_transient(),
            RetryOn::AnyError => !matches!(err, DrydockError::Aborted),
        }
    }
}

/// Result of a retried operation together with the attempts it took.
#[derive(Debug)]
pub struct Attempted<T> {
    pub result: Result<T>,
    pub attempts: u32,
}

/// Run `op` until it succeeds, fails with a non-retryable error, or the
/// budget is spent. An exhausted budget yields `DrydockError::RetryExhausted`.
pub async fn retry<T, F, Fut>(
    policy: &RetryPolicy,
    operation: &str,
    retry_on: RetryOn,
    mut op: F,
) -> Attempted<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match op(attempt).await {
            Ok(value) => {
                return Attempted {
                    result: Ok(value),
                    attempts: attempt,
                }
            }
            Err(err) if !retry_on.allows(&err) => {
                return Attempted {
                    result: Err(err),
                    attempts: attempt,
                }
            }
            Err(err) if attempt >= max_attempts => {
                return Attempted {
                    result: Err(DrydockError::RetryExhausted {
                        operation: operation.to_string(),
                        attempts: attempt,
                        last: Box::new(err),
                    }),
                    attempts: attempt,
                }
            }
            Err(err) => {
                let delay = policy.backoff(attempt);
                warn!(
                    event = "retry_scheduled",
                    operation,
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "transient failure, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
