// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Retry policy for state backend operations.
//!
//! Backend reads and writes are retried with exponential backoff; lock
//! acquisition never is (holder collisions must fail fast). Retries are
//! invisible to callers until they exhaust, at which point the last error
//! surfaces as `BackendOperationFailed`.

use crate::error::{BackendError, Error, Result};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio_retry::Retry;

/// Exponential backoff configuration for backend operations.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries after the first attempt. `0` disables retrying.
    pub max_retries: usize,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Growth factor between consecutive delays.
    pub multiplier: f64,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(100),
            multiplier: 2.0,
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries; useful in tests.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// The concrete delay sequence this policy produces.
    pub fn delays(&self) -> Vec<Duration> {
        let mut delays = Vec::with_capacity(self.max_retries);
        let mut current = self.initial_delay;
        for _ in 0..self.max_retries {
            delays.push(current.min(self.max_delay));
            let next = current.as_secs_f64() * self.multiplier;
            current = Duration::from_secs_f64(next.min(self.max_delay.as_secs_f64()));
        }
        delays
    }
}

/// Run `f` under `policy`, wrapping the final failure with the logical
/// operation name.
pub(crate) async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    operation: &'static str,
    mut f: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, BackendError>>,
{
    let attempts = policy.max_retries + 1;
    Retry::spawn(policy.delays().into_iter(), || f())
        .await
        .map_err(|source| {
            tracing::warn!(operation, attempts, error = %source, "backend operation exhausted retries");
            Error::BackendOperationFailed {
                operation,
                attempts,
                source,
            }
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn fast_policy(max_retries: usize) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            initial_delay: Duration::from_millis(1),
            multiplier: 2.0,
            max_delay: Duration::from_millis(4),
        }
    }

    #[test]
    fn delays_grow_and_cap() {
        let policy = RetryPolicy {
            max_retries: 5,
            initial_delay: Duration::from_millis(100),
            multiplier: 2.0,
            max_delay: Duration::from_millis(450),
        };
        assert_eq!(
            policy.delays(),
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(400),
                Duration::from_millis(450),
                Duration::from_millis(450),
            ]
        );
    }

    #[tokio::test]
    async fn retries_until_success() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_in = Arc::clone(&calls);
        let result = with_retry(&fast_policy(5), "get_state", move || {
            let calls = Arc::clone(&calls_in);
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(BackendError::Other("transient".into()))
                } else {
                    Ok(42u32)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhaustion_reports_attempts() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_in = Arc::clone(&calls);
        let result: Result<()> = with_retry(&fast_policy(2), "save_state", move || {
            let calls = Arc::clone(&calls_in);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(BackendError::Other("down".into()))
            }
        })
        .await;
        let err = result.unwrap_err();
        assert_eq!(err.code(), "BACKEND_OPERATION_FAILED");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        match err {
            Error::BackendOperationFailed {
                operation,
                attempts,
                ..
            } => {
                assert_eq!(operation, "save_state");
                assert_eq!(attempts, 3);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }
}
