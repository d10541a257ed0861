use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use super::clock::Sleeper;
use super::shutdown::Shutdown;

// ============================================================================
// Bounded Retry with Backoff
// ============================================================================
//
// Local, in-process retry for transient failures. The loop is bounded by a
// retry budget, sleeps through an injectable Sleeper, and gives up as soon
// as the shutdown signal fires.
//
// Delay for the n-th retry (1-based):
//   schedule given  -> schedule[min(n, len) - 1]
//   otherwise       -> min(initial_delay * multiplier^(n-1), max_delay)
//
// ============================================================================

#[derive(Clone, Debug, PartialEq)]
pub struct Backoff {
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Upper bound for any computed delay
    pub max_delay: Duration,
    /// Growth factor between retries; 1.0 keeps the delay constant
    pub multiplier: f64,
    /// Explicit per-retry delays. Takes precedence when non-empty.
    pub schedule: Vec<Duration>,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
            schedule: Vec::new(),
        }
    }
}

impl Backoff {
    pub fn constant(delay: Duration) -> Self {
        Self {
            initial_delay: delay,
            max_delay: delay,
            multiplier: 1.0,
            schedule: Vec::new(),
        }
    }

    pub fn exponential(initial_delay: Duration, multiplier: f64, max_delay: Duration) -> Self {
        Self {
            initial_delay,
            max_delay,
            multiplier,
            schedule: Vec::new(),
        }
    }

    pub fn with_schedule(schedule: Vec<Duration>) -> Self {
        Self {
            schedule,
            ..Self::default()
        }
    }

    pub fn delay_for(&self, retry: u32) -> Duration {
        if let Some(last) = self.schedule.last() {
            let index = retry.saturating_sub(1) as usize;
            return self.schedule.get(index).copied().unwrap_or(*last);
        }

        let exponent = retry.saturating_sub(1).min(i32::MAX as u32) as i32;
        let factor = self.multiplier.max(1.0).powi(exponent);
        let millis = (self.initial_delay.as_millis() as f64) * factor;
        let capped = millis.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }
}

/// Result of a retry operation
#[derive(Debug)]
pub enum RetryResult<T, E> {
    /// Operation succeeded
    Success { value: T, attempts: u32 },
    /// Operation kept failing transiently until the budget ran out
    Exhausted { error: E, attempts: u32 },
    /// Operation failed in a way retrying cannot fix
    PermanentFailure { error: E, attempts: u32 },
    /// Shutdown fired before the operation could succeed
    Cancelled { last_error: Option<E>, attempts: u32 },
}

/// Check if an error is transient (should retry) or permanent (should not retry)
pub trait IsTransient {
    fn is_transient(&self) -> bool;
}

/// Run `operation` until it succeeds, fails permanently, uses up `retries`
/// extra attempts, or shutdown is signalled.
///
/// The operation receives the 1-based attempt number.
pub async fn retry_on_transient<F, Fut, T, E>(
    retries: u32,
    backoff: &Backoff,
    sleeper: &dyn Sleeper,
    shutdown: &Shutdown,
    mut operation: F,
) -> RetryResult<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display + IsTransient,
{
    let mut attempt: u32 = 0;
    let mut last_error: Option<E> = None;

    loop {
        if shutdown.is_cancelled() {
            return RetryResult::Cancelled {
                last_error,
                attempts: attempt,
            };
        }

        attempt += 1;

        match operation(attempt).await {
            Ok(value) => {
                if attempt > 1 {
                    tracing::info!(attempt = attempt, "Operation succeeded after retry");
                }
                return RetryResult::Success {
                    value,
                    attempts: attempt,
                };
            }
            Err(error) => {
                if !error.is_transient() {
                    tracing::error!(
                        attempt = attempt,
                        error = %error,
                        "Permanent failure detected, not retrying"
                    );
                    return RetryResult::PermanentFailure {
                        error,
                        attempts: attempt,
                    };
                }

                if attempt > retries {
                    tracing::warn!(
                        attempt = attempt,
                        retries = retries,
                        error = %error,
                        "Local retry budget exhausted"
                    );
                    return RetryResult::Exhausted {
                        error,
                        attempts: attempt,
                    };
                }

                let delay = backoff.delay_for(attempt);
                tracing::warn!(
                    attempt = attempt,
                    error = %error,
                    delay_ms = delay.as_millis() as u64,
                    "Transient failure, retrying after delay"
                );

                tokio::select! {
                    _ = sleeper.sleep(delay) => {
                        last_error = Some(error);
                    }
                    _ = shutdown.cancelled() => {
                        tracing::warn!(attempt = attempt, "Retry delay interrupted by shutdown");
                        return RetryResult::Cancelled {
                            last_error: Some(error),
                            attempts: attempt,
                        };
                    }
                }
            }
        }
    }
}
