//! Purpose: Retry transient transport/service failures with capped exponential backoff.
//! Exports: `RetryPolicy`.
//! Role: Shared by session creation, status, range reads, block replays, and commit.
//! Invariants: Only `Error::is_retryable` failures are retried; callers see one terminal error.
//! Invariants: Backoff sleeps honor the call context (cancel and deadline).
#![allow(clippy::result_large_err)]

use std::time::Duration;

use tracing::warn;

use crate::core::context::CallContext;
use crate::core::error::Error;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_backoff = initial;
        self.max_backoff = max.max(initial);
        self
    }

    /// Delay before attempt `attempt + 1`; attempt numbering starts at zero.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = 1u32 << attempt.min(16);
        self.initial_backoff
            .saturating_mul(exp)
            .min(self.max_backoff)
    }

    /// Runs `op` until it succeeds, fails terminally, or runs out of attempts. The closure
    /// receives the zero-based attempt number.
    pub fn run<T, F>(&self, ctx: &CallContext, op: &str, mut call: F) -> Result<T, Error>
    where
        F: FnMut(u32) -> Result<T, Error>,
    {
        let mut attempt = 0u32;
        loop {
            ctx.check()?;
            let err = match call(attempt) {
                Ok(value) => return Ok(value),
                Err(err) => ctx.classify(err),
            };
            if !err.is_retryable() || attempt + 1 >= self.max_attempts {
                return Err(err);
            }
            let delay = self.backoff(attempt);
            warn!(
                op,
                attempt = attempt + 1,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "retrying tunnel request"
            );
            ctx.sleep(delay)?;
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::RetryPolicy;
    use crate::core::context::{CallContext, CancelToken};
    use crate::core::error::{Error, ErrorCode, ErrorKind};
    use std::time::Duration;

    fn quick() -> RetryPolicy {
        RetryPolicy::default().with_backoff(Duration::from_millis(1), Duration::from_millis(4))
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy =
            RetryPolicy::default().with_backoff(Duration::from_millis(100), Duration::from_secs(1));
        assert_eq!(policy.backoff(0), Duration::from_millis(100));
        assert_eq!(policy.backoff(1), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(800));
        assert_eq!(policy.backoff(4), Duration::from_secs(1));
        assert_eq!(policy.backoff(40), Duration::from_secs(1));
    }

    #[test]
    fn retries_transient_failures() {
        let mut calls = 0;
        let value = quick()
            .run(&CallContext::new(), "status", |attempt| {
                calls += 1;
                if attempt < 2 {
                    Err(Error::new(ErrorKind::Service).with_status(503))
                } else {
                    Ok(attempt)
                }
            })
            .expect("eventually succeeds");
        assert_eq!(value, 2);
        assert_eq!(calls, 3);
    }

    #[test]
    fn fatal_errors_are_not_retried() {
        let mut calls = 0;
        let err = quick()
            .run(&CallContext::new(), "commit", |_| -> Result<(), Error> {
                calls += 1;
                Err(Error::from_code(ErrorCode::IncompleteBlock))
            })
            .expect_err("fatal");
        assert_eq!(err.code(), Some(ErrorCode::IncompleteBlock));
        assert_eq!(calls, 1);
    }

    #[test]
    fn gives_up_after_max_attempts() {
        let mut calls = 0;
        let err = quick()
            .with_max_attempts(3)
            .run(&CallContext::new(), "create", |_| -> Result<(), Error> {
                calls += 1;
                Err(Error::new(ErrorKind::Transport))
            })
            .expect_err("exhausted");
        assert_eq!(err.kind(), ErrorKind::Transport);
        assert_eq!(calls, 3);
    }

    #[test]
    fn cancelled_context_stops_before_calling() {
        let token = CancelToken::new();
        token.cancel();
        let ctx = CallContext::new().with_cancel(token);
        let err = quick()
            .run(&ctx, "create", |_| -> Result<(), Error> {
                panic!("must not be called")
            })
            .expect_err("cancelled");
        assert_eq!(err.kind(), ErrorKind::Cancelled);
    }
}
