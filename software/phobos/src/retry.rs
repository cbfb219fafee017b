//! Retry-with-backoff combinator used by the register access layer.
//!
//! The policy is separated from the I/O so the retry behavior is testable
//! on its own: the combinator decides *whether* and *when* to run another
//! attempt, the closure decides *what* an attempt is.

use std::time::Duration;

use crate::error::{DeviceError, Result};

/// Attempt count and inter-attempt delay
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: usize,
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn new(attempts: usize, backoff: Duration) -> Self {
        Self { attempts, backoff }
    }
}

/// Run `attempt` up to `policy.attempts` times, sleeping `policy.backoff`
/// between tries.
///
/// The closure receives the zero-based attempt index so it can do
/// first-attempt-only or recovery-only work (the PDI layer drains stray
/// answers on every attempt after the first). Errors for which
/// [`DeviceError::is_retryable`] is false abort immediately. When the
/// budget runs out the last failure is wrapped in
/// [`DeviceError::RetriesExhausted`].
pub fn with_backoff<T>(
    policy: RetryPolicy,
    mut attempt: impl FnMut(usize) -> Result<T>,
) -> Result<T> {
    if policy.attempts == 0 {
        return Err(DeviceError::config("retry policy allows zero attempts"));
    }

    let mut last = None;
    for i in 0..policy.attempts {
        if i > 0 {
            std::thread::sleep(policy.backoff);
        }
        match attempt(i) {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() => {
                tracing::debug!("attempt {} failed: {e}", i + 1);
                last = Some(e);
            }
            Err(e) => return Err(e),
        }
    }

    Err(DeviceError::RetriesExhausted {
        attempts: policy.attempts,
        last: Box::new(last.expect("at least one attempt ran")),
    })
}

#[cfg(test)]
mod test {
    use super::*;

    fn quick(attempts: usize) -> RetryPolicy {
        RetryPolicy::new(attempts, Duration::from_millis(1))
    }

    #[test]
    fn test_first_success_returns() {
        let mut calls = 0;
        let out = with_backoff(quick(5), |_| {
            calls += 1;
            Ok(42)
        })
        .unwrap();
        assert_eq!(out, 42);
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_retries_then_succeeds() {
        let mut calls = 0;
        let out = with_backoff(quick(5), |i| {
            calls += 1;
            if i < 2 {
                Err(DeviceError::Timeout(10))
            } else {
                Ok("done")
            }
        })
        .unwrap();
        assert_eq!(out, "done");
        assert_eq!(calls, 3);
    }

    #[test]
    fn test_budget_exhausted_wraps_last_error() {
        let mut calls = 0;
        let err = with_backoff::<()>(quick(3), |_| {
            calls += 1;
            Err(DeviceError::protocol("wrong answer length"))
        })
        .unwrap_err();
        assert_eq!(calls, 3);
        match err {
            DeviceError::RetriesExhausted { attempts, last } => {
                assert_eq!(attempts, 3);
                assert!(matches!(*last, DeviceError::Protocol(_)));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_non_retryable_aborts_immediately() {
        let mut calls = 0;
        let err = with_backoff::<()>(quick(5), |_| {
            calls += 1;
            Err(DeviceError::consistency("mismatched readback"))
        })
        .unwrap_err();
        assert_eq!(calls, 1);
        assert!(matches!(err, DeviceError::Consistency(_)));
    }
}
