//! Retry with exponential backoff for transient failures

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::control::TransferControl;
use crate::error::TransferError;

/// Retry configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of retry attempts after the first one
    pub max_retries: u32,

    /// Initial backoff in milliseconds
    pub initial_backoff_ms: u64,

    /// Backoff multiplier for each retry
    pub backoff_multiplier: f64,

    /// Maximum backoff in milliseconds
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff_ms: 1000,
            backoff_multiplier: 2.0,
            max_backoff_ms: 30_000,
        }
    }
}

impl RetryConfig {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Default::default()
        }
    }

    /// Never retry
    pub fn disabled() -> Self {
        Self::new(0)
    }

    pub fn with_backoff(mut self, initial_ms: u64, multiplier: f64, max_ms: u64) -> Self {
        self.initial_backoff_ms = initial_ms;
        self.backoff_multiplier = multiplier;
        self.max_backoff_ms = max_ms;
        self
    }
}

/// Backoff delay before retry number `attempt` (0-based)
pub fn calculate_backoff(attempt: u32, config: &RetryConfig) -> Duration {
    let delay_ms = (config.initial_backoff_ms as f64
        * config.backoff_multiplier.powi(attempt as i32))
    .min(config.max_backoff_ms as f64);

    Duration::from_millis(delay_ms as u64)
}

/// Boxed attempt future borrowing the caller's state for `'a`
pub type AttemptFuture<'a, T> =
    Pin<Box<dyn Future<Output = Result<T, TransferError>> + Send + 'a>>;

/// Outcome of [`retry_transient`]
#[derive(Debug)]
pub struct Retried<T> {
    pub result: Result<T, TransferError>,
    /// Attempts made, including the first one
    pub attempts: u32,
}

/// Run `op` until it succeeds, fails with a non-transient error, or the
/// retry budget is spent. Cancellation during backoff ends with `Cancelled`.
///
/// `state` is lent to every attempt so the operation can use the session
/// mutably between retries.
pub async fn retry_transient<S, T, F>(
    what: &str,
    config: &RetryConfig,
    control: &TransferControl,
    state: &mut S,
    mut op: F,
) -> Retried<T>
where
    S: ?Sized,
    F: for<'a> FnMut(&'a mut S) -> AttemptFuture<'a, T>,
{
    let mut attempt: u32 = 0;
    loop {
        if control.is_cancelled() {
            return Retried {
                result: Err(TransferError::Cancelled),
                attempts: attempt,
            };
        }

        attempt += 1;
        let error = match op(&mut *state).await {
            Ok(value) => {
                return Retried {
                    result: Ok(value),
                    attempts: attempt,
                }
            }
            Err(e) => e,
        };

        if !error.is_transient() || attempt > config.max_retries {
            if error.is_transient() {
                warn!("{} failed after {} attempts: {}", what, attempt, error);
            }
            return Retried {
                result: Err(error),
                attempts: attempt,
            };
        }

        let delay = calculate_backoff(attempt - 1, config);
        info!("{} failed, retrying in {:?}: {}", what, delay, error);

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = control.cancelled() => {
                info!("{} cancelled during backoff", what);
                return Retried {
                    result: Err(TransferError::Cancelled),
                    attempts: attempt,
                };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn fast() -> RetryConfig {
        RetryConfig::new(3).with_backoff(1, 2.0, 5)
    }

    #[test]
    fn test_calculate_backoff() {
        let config = RetryConfig::default();
        assert_eq!(calculate_backoff(0, &config), Duration::from_secs(1));
        assert_eq!(calculate_backoff(1, &config), Duration::from_secs(2));
        assert_eq!(calculate_backoff(2, &config), Duration::from_secs(4));
        // Capped
        assert_eq!(calculate_backoff(5, &config), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_success_after_transient_failures() {
        let control = TransferControl::new();
        let mut calls = 0u32;

        let retried = retry_transient("upload", &fast(), &control, &mut calls, |calls| {
            Box::pin(async move {
                *calls += 1;
                if *calls < 3 {
                    Err(TransferError::ConnectionReset("peer".into()))
                } else {
                    Ok(42u64)
                }
            })
        })
        .await;

        assert_eq!(retried.result.unwrap(), 42);
        assert_eq!(retried.attempts, 3);
    }

    #[tokio::test]
    async fn test_non_transient_error_is_not_retried() {
        let control = TransferControl::new();
        let mut calls = 0u32;

        let retried: Retried<()> =
            retry_transient("delete", &fast(), &control, &mut calls, |calls| {
                Box::pin(async move {
                    *calls += 1;
                    Err(TransferError::PermissionDenied("/x".into()))
                })
            })
            .await;

        assert!(matches!(
            retried.result,
            Err(TransferError::PermissionDenied(_))
        ));
        assert_eq!(calls, 1);
    }

    #[tokio::test]
    async fn test_budget_exhausted() {
        let control = TransferControl::new();
        let retried: Retried<()> = retry_transient("read", &fast(), &control, &mut (), |_| {
            Box::pin(async { Err(TransferError::Timeout("read".into())) })
        })
        .await;

        assert!(matches!(retried.result, Err(TransferError::Timeout(_))));
        assert_eq!(retried.attempts, 4);
    }

    #[tokio::test]
    async fn test_cancel_during_backoff() {
        let control = Arc::new(TransferControl::new());
        let slow = RetryConfig::new(5).with_backoff(60_000, 1.0, 60_000);

        let canceller = {
            let control = control.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                control.cancel();
            })
        };

        let retried: Retried<()> = retry_transient("write", &slow, &control, &mut (), |_| {
            Box::pin(async { Err(TransferError::Timeout("write".into())) })
        })
        .await;
        canceller.await.unwrap();

        assert!(matches!(retried.result, Err(TransferError::Cancelled)));
        assert_eq!(retried.attempts, 1);
    }
}
