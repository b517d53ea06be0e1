// Cancellation tokens and deadlines threaded through every blocking call.
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crate::core::error::{Error, ErrorKind};

// Sleeps are sliced so cancellation is observed promptly.
const SLEEP_SLICE: Duration = Duration::from_millis(20);

#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

#[derive(Clone, Debug, Default)]
pub struct CallContext {
    cancel: Option<CancelToken>,
    deadline: Option<Instant>,
}

impl CallContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_cancel(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(CancelToken::is_cancelled)
    }

    pub fn is_expired(&self) -> bool {
        self.deadline.is_some_and(|deadline| Instant::now() >= deadline)
    }

    /// Cancellation wins over an elapsed deadline.
    pub fn check(&self) -> Result<(), Error> {
        if self.is_cancelled() {
            return Err(Error::new(ErrorKind::Cancelled).with_message("operation cancelled"));
        }
        if self.is_expired() {
            return Err(Error::new(ErrorKind::Timeout).with_message("operation deadline exceeded"));
        }
        Ok(())
    }

    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    /// Clamps a per-request timeout to whatever is left of the deadline.
    pub fn clamp(&self, timeout: Option<Duration>) -> Option<Duration> {
        match (timeout, self.remaining()) {
            (Some(timeout), Some(remaining)) => Some(timeout.min(remaining)),
            (None, remaining) => remaining,
            (timeout, None) => timeout,
        }
    }

    /// Rewrites a failure that raced the deadline or a cancel into the caller's terms.
    pub fn classify(&self, err: Error) -> Error {
        match self.check() {
            Err(ctx_err) if err.kind() == ErrorKind::Transport => ctx_err.with_source(err),
            _ => err,
        }
    }

    pub fn sleep(&self, duration: Duration) -> Result<(), Error> {
        let until = Instant::now() + duration;
        loop {
            self.check()?;
            let now = Instant::now();
            if now >= until {
                return Ok(());
            }
            let mut step = (until - now).min(SLEEP_SLICE);
            if let Some(remaining) = self.remaining() {
                step = step.min(remaining.max(Duration::from_millis(1)));
            }
            std::thread::sleep(step);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{CallContext, CancelToken};
    use crate::core::error::{Error, ErrorKind};
    use std::time::Duration;

    #[test]
    fn default_context_never_fails() {
        let ctx = CallContext::new();
        assert!(ctx.check().is_ok());
        assert_eq!(ctx.remaining(), None);
        assert_eq!(ctx.clamp(Some(Duration::from_secs(3))), Some(Duration::from_secs(3)));
    }

    #[test]
    fn cancel_takes_precedence_over_timeout() {
        let token = CancelToken::new();
        let ctx = CallContext::new()
            .with_timeout(Duration::ZERO)
            .with_cancel(token.clone());
        assert_eq!(ctx.check().expect_err("expired").kind(), ErrorKind::Timeout);
        token.cancel();
        assert_eq!(ctx.check().expect_err("cancelled").kind(), ErrorKind::Cancelled);
    }

    #[test]
    fn sleep_stops_at_deadline() {
        let ctx = CallContext::new().with_timeout(Duration::from_millis(30));
        let err = ctx.sleep(Duration::from_secs(5)).expect_err("deadline");
        assert_eq!(err.kind(), ErrorKind::Timeout);
    }

    #[test]
    fn classify_only_rewrites_transport_errors() {
        let ctx = CallContext::new().with_timeout(Duration::ZERO);
        let err = ctx.classify(Error::new(ErrorKind::Transport));
        assert_eq!(err.kind(), ErrorKind::Timeout);
        let err = ctx.classify(Error::new(ErrorKind::State));
        assert_eq!(err.kind(), ErrorKind::State);
        let live = CallContext::new();
        assert_eq!(
            live.classify(Error::new(ErrorKind::Transport)).kind(),
            ErrorKind::Transport
        );
    }
}
