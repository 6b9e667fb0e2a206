//! Bounded polling with linear backoff
//!
//! Used to wait for state owned by another process, such as the overlay
//! interface that the Netmaker agent creates asynchronously. The delay after
//! failed attempt `k` is `min(base_delay * k, max_delay)`, and every wait is
//! cancellable so shutdown is never held up by the remaining retry budget.
//!
//! # Example
//!
//! ```ignore
//! use netmaker_common::retry::{poll_with_backoff, LinearBackoff, PollOutcome};
//!
//! let outcome = poll_with_backoff(&LinearBackoff::default(), "find_interface", &cancel, |_| async {
//!     lookup_interface()
//! })
//! .await;
//! ```

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Linear backoff schedule with an upper bound on attempts and delay
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LinearBackoff {
    /// Maximum number of attempts (0 means the operation is never tried)
    pub max_attempts: u32,
    /// Delay unit, multiplied by the attempt number
    pub base_delay: Duration,
    /// Cap applied to every individual delay
    pub max_delay: Duration,
}

impl Default for LinearBackoff {
    fn default() -> Self {
        Self {
            max_attempts: 20,
            base_delay: Duration::from_secs(3),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl LinearBackoff {
    /// Delay to wait after failed attempt `attempt` (1-based) before the next one
    pub fn delay_after(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(attempt).min(self.max_delay)
    }

    /// Total time spent waiting when every attempt fails
    pub fn total_wait(&self) -> Duration {
        (1..self.max_attempts).map(|a| self.delay_after(a)).sum()
    }
}

/// Result of [`poll_with_backoff`]
#[derive(Debug, PartialEq, Eq)]
pub enum PollOutcome<T> {
    /// The operation produced a value
    Ready(T),
    /// Every attempt came back empty
    Exhausted,
    /// The cancellation token fired before a value was produced
    Cancelled,
}

impl<T> PollOutcome<T> {
    /// The produced value, if any
    pub fn ready(self) -> Option<T> {
        match self {
            PollOutcome::Ready(v) => Some(v),
            PollOutcome::Exhausted | PollOutcome::Cancelled => None,
        }
    }
}

/// Poll `operation` until it yields a value, attempts run out, or `cancel` fires.
///
/// The operation receives the 1-based attempt number. There is no delay before
/// the first attempt.
pub async fn poll_with_backoff<F, Fut, T>(
    backoff: &LinearBackoff,
    operation_name: &str,
    cancel: &CancellationToken,
    mut operation: F,
) -> PollOutcome<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Option<T>>,
{
    for attempt in 1..=backoff.max_attempts {
        if cancel.is_cancelled() {
            return PollOutcome::Cancelled;
        }

        debug!(
            operation = %operation_name,
            attempt,
            max_attempts = backoff.max_attempts,
            "Polling"
        );

        if let Some(value) = operation(attempt).await {
            return PollOutcome::Ready(value);
        }

        if attempt < backoff.max_attempts {
            let delay = backoff.delay_after(attempt);
            info!(
                operation = %operation_name,
                delay_secs = delay.as_secs_f64(),
                next_attempt = attempt + 1,
                "Waiting before retry"
            );

            tokio::select! {
                _ = cancel.cancelled() => {
                    info!(operation = %operation_name, attempt, "Polling cancelled");
                    return PollOutcome::Cancelled;
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    error!(
        operation = %operation_name,
        max_attempts = backoff.max_attempts,
        "Operation did not succeed after all attempts"
    );
    PollOutcome::Exhausted
}
