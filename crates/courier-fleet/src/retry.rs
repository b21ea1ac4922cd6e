//! Bounded retry of busy fleet-manager calls.
//!
//! Only [`FleetError::Busy`] is retried; a hard failure is surfaced
//! immediately. Attempts are bounded and delays come from the injected
//! [`Clock`], so a retry loop never spins forever and tests never wait.

use std::{future::Future, time::Duration};

use courier_core::Clock;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{FleetError, ReconcileError};

/// Strategy for spacing retry attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackoffStrategy {
    /// Same delay before every retry.
    Fixed,
    /// Delay doubles each attempt, capped at `max_delay`.
    Exponential,
}

/// Retry policy for busy fleet-manager responses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first one.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub delay: Duration,
    /// Upper bound for exponential delays.
    pub max_delay: Duration,
    /// How delays grow between attempts.
    pub backoff: BackoffStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(30),
            backoff: BackoffStrategy::Fixed,
        }
    }
}

impl RetryPolicy {
    /// Policy that never retries.
    pub fn no_retry() -> Self {
        Self { max_attempts: 1, ..Self::default() }
    }

    /// Delay to wait after the given failed attempt (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        match self.backoff {
            BackoffStrategy::Fixed => self.delay,
            BackoffStrategy::Exponential => {
                let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
                self.delay.saturating_mul(factor).min(self.max_delay)
            },
        }
    }
}

/// Runs `op` until it succeeds, fails hard, or stays busy for every attempt.
///
/// Cancellation is honoured between attempts only.
///
/// # Errors
///
/// - `ReconcileError::Failed` on the first hard failure
/// - `ReconcileError::Busy` once `policy.max_attempts` busy answers were seen
/// - `ReconcileError::Cancelled` when `cancel` fires while waiting to retry
pub async fn retry_busy<T, F, Fut>(
    policy: &RetryPolicy,
    clock: &dyn Clock,
    cancel: &CancellationToken,
    name: &str,
    mut op: F,
) -> Result<T, ReconcileError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, FleetError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(FleetError::Failed { message, .. }) => {
                return Err(ReconcileError::failed(name, message));
            },
            Err(FleetError::Busy { .. }) if attempt >= max_attempts => {
                return Err(ReconcileError::Busy { name: name.to_string(), attempts: attempt });
            },
            Err(FleetError::Busy { .. }) => {
                let delay = policy.delay_after(attempt);
                let delay_ms = delay.as_millis();
                debug!(reader = name, attempt, delay_ms, "fleet busy, retrying");
                if cancel.is_cancelled() {
                    return Err(ReconcileError::Cancelled);
                }
                tokio::select! {
                    () = clock.sleep(delay) => {},
                    () = cancel.cancelled() => return Err(ReconcileError::Cancelled),
                }
            },
        }
    }
}
