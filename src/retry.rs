//! Exponential backoff for transient store failures.
//!
//! All retry state (attempt number, last error, next delay) lives on the
//! stack of one [`retry_transient`] call.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use serde::Serialize;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Delay before the first retry; doubles for each further retry.
    pub base_delay: Duration,
    /// Cap for a single delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (0 = first retry): `base * 2^retry`.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = 1u32.checked_shl(retry).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}

#[derive(Debug)]
pub enum RetryError<E> {
    /// Classified permanent on first sight; not retried.
    Permanent(E),
    /// Every attempt failed transiently.
    Exhausted { attempts: u32, last: E },
}

/// Run `op` until it succeeds, fails permanently, or the policy runs out.
/// `op` receives the zero-based attempt number.
pub async fn retry_transient<T, E, F, Fut, P>(
    policy: &RetryPolicy,
    is_permanent: P,
    mut op: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    E: Display,
{
    let mut attempt = 0u32;
    loop {
        let err = match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) if is_permanent(&err) => return Err(RetryError::Permanent(err)),
            Err(err) => err,
        };
        if attempt >= policy.max_retries {
            return Err(RetryError::Exhausted {
                attempts: attempt + 1,
                last: err,
            });
        }
        let delay = policy.delay_for(attempt);
        warn!(
            attempt = attempt + 1,
            max_attempts = policy.max_attempts(),
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "transient failure, retrying"
        );
        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}
