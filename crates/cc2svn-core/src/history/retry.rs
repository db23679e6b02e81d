//! Bounded retry with exponential backoff for transient source failures.

use tracing::{debug, warn};

use crate::config::RetryPolicy;
use crate::errors::{ConvertError, ConvertResult};

/// Run `op` until it succeeds, fails with a non-transient error, or the
/// policy's attempts are exhausted.  Exhausted transient failures surface as
/// `SourceUnavailable`; not-found / access-denied map to their own variants.
pub fn run<T>(
    policy: &RetryPolicy,
    operation: &str,
    mut op: impl FnMut() -> ConvertResult<T>,
) -> ConvertResult<T> {
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match op() {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt < max_attempts => {
                let delay = policy.backoff(attempt);
                debug!(operation, attempt, ?delay, error = %err, "retrying after transient failure");
                if !delay.is_zero() {
                    std::thread::sleep(delay);
                }
            }
            Err(ConvertError::Source(source)) => {
                if source.is_retryable() {
                    warn!(operation, attempts = attempt, error = %source, "giving up after retries");
                }
                return Err(ConvertError::from_source(operation, attempt, source));
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::SourceError;

    #[test]
    fn succeeds_after_transient_failures() {
        let mut calls = 0;
        let result = run(&RetryPolicy::no_backoff(3), "get", || {
            calls += 1;
            if calls < 3 {
                Err(SourceError::Transient("flaky".into()).into())
            } else {
                Ok(calls)
            }
        });
        assert_eq!(result.unwrap(), 3);
    }

    #[test]
    fn exhausted_transient_is_source_unavailable() {
        let mut calls = 0;
        let result: ConvertResult<()> = run(&RetryPolicy::no_backoff(2), "lshistory", || {
            calls += 1;
            Err(SourceError::Transient("down".into()).into())
        });
        assert_eq!(calls, 2);
        match result {
            Err(ConvertError::SourceUnavailable {
                operation,
                attempts,
                ..
            }) => {
                assert_eq!(operation, "lshistory");
                assert_eq!(attempts, 2);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn not_found_is_not_retried() {
        let mut calls = 0;
        let result: ConvertResult<()> = run(&RetryPolicy::no_backoff(5), "get", || {
            calls += 1;
            Err(SourceError::NotFound("a.txt".into()).into())
        });
        assert_eq!(calls, 1);
        assert!(matches!(result, Err(ConvertError::ElementNotFound(_))));
    }

    #[test]
    fn other_errors_pass_through() {
        let result: ConvertResult<()> = run(&RetryPolicy::no_backoff(5), "parse", || {
            Err(ConvertError::MalformedHistoryEvent("bad".into()))
        });
        assert!(matches!(result, Err(ConvertError::MalformedHistoryEvent(_))));
    }
}
