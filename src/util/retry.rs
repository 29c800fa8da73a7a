use std::time::Duration;

use futures_retry::{ErrorHandler, RetryPolicy};
use tracing::debug;

use crate::error::StoreError;

/// Retries transient store failures a fixed number of times with a fixed
/// delay. Anything else is forwarded immediately.
pub(crate) struct FixedCountWithDelayStrategy {
    max_attempts: usize,
    delay: Duration,
}

impl FixedCountWithDelayStrategy {
    pub(crate) fn new(max_attempts: usize, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
        }
    }
}

impl ErrorHandler<StoreError> for FixedCountWithDelayStrategy {
    type OutError = StoreError;

    fn handle(&mut self, attempt: usize, e: StoreError) -> RetryPolicy<StoreError> {
        if attempt >= self.max_attempts {
            return RetryPolicy::ForwardError(e);
        }

        if e.is_retryable() {
            debug!(attempt, error = %e, "retrying lease store call");
            RetryPolicy::WaitRetry(self.delay)
        } else {
            RetryPolicy::ForwardError(e)
        }
    }
}
