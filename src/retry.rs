use std::future::Future;
use std::time::Duration;

use log::{info, warn};

use crate::config::RetryPolicy;
use crate::error::Retryable;
use crate::pipeline::CancelFlag;

const CANCEL_POLL: Duration = Duration::from_millis(100);

/// Runs `op` until it succeeds, fails with a non-retryable error, or
/// `policy.max_attempts` attempts have been made.
///
/// A cancelled flag stops further attempts; the last error is returned and
/// the caller decides how to report the interrupt.
pub async fn with_backoff<T, E, F, Fut>(
    policy: &RetryPolicy,
    label: &str,
    cancel: &CancelFlag,
    mut op: F,
) -> Result<T, E>
where
    E: Retryable + std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        let error = match op().await {
            Ok(value) => {
                if attempt > 1 {
                    info!("{} succeeded on attempt {}", label, attempt);
                }
                return Ok(value);
            }
            Err(e) => e,
        };

        if !error.is_retryable() {
            return Err(error);
        }
        if attempt >= max_attempts {
            warn!("{} failed after {} attempts: {}", label, attempt, error);
            return Err(error);
        }

        let delay = policy.delay_for(attempt);
        warn!(
            "{} failed (attempt {}/{}): {}. Retrying in {:?}",
            label, attempt, max_attempts, error, delay
        );
        if !sleep_unless_cancelled(delay, cancel).await {
            return Err(error);
        }
        attempt += 1;
    }
}

/// Returns false when the flag was raised before the delay elapsed.
async fn sleep_unless_cancelled(delay: Duration, cancel: &CancelFlag) -> bool {
    let deadline = tokio::time::Instant::now() + delay;
    loop {
        if cancel.is_cancelled() {
            return false;
        }
        let now = tokio::time::Instant::now();
        if now >= deadline {
            return true;
        }
        tokio::time::sleep((deadline - now).min(CANCEL_POLL)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SynthesisError;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay_ms: 0,
            max_delay_ms: 0,
        }
    }

    #[tokio::test]
    async fn retries_until_success() {
        let calls = AtomicU32::new(0);
        let result = with_backoff(&fast_policy(3), "synth", &CancelFlag::new(), || async {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(SynthesisError::Transient("503".into()))
            } else {
                Ok(42)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_backoff(&fast_policy(3), "synth", &CancelFlag::new(), || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(SynthesisError::Quota("429".into()))
        })
        .await;

        assert!(matches!(result, Err(SynthesisError::Quota(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn fatal_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_backoff(&fast_policy(5), "synth", &CancelFlag::new(), || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(SynthesisError::Auth("403".into()))
        })
        .await;

        assert!(matches!(result, Err(SynthesisError::Auth(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancellation_stops_the_backoff() {
        let cancel = CancelFlag::new();
        cancel.cancel();
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay_ms: 60_000,
            max_delay_ms: 60_000,
        };

        let result: Result<(), _> = with_backoff(&policy, "synth", &cancel, || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(SynthesisError::Transient("503".into()))
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
