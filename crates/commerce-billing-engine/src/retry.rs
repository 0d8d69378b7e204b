//! Activity execution with a start-to-close timeout and bounded retries.
//!
//! Only infrastructure failures ([`BillingError::is_retryable`]) are retried. Business
//! failures, such as an invoice that could not be collected, are reported to the caller on
//! the first attempt; scheduling those is the dunning workflow's job.

use std::future::Future;
use std::sync::Arc;

use tokio::task;
use tokio::time::{sleep, timeout};

use commerce_billing_core::{BillingError, Result};

use crate::config::ActivityOptions;

/// Run `op` until it succeeds, fails with a non-retryable error, or runs out of attempts.
///
/// Each attempt is bounded by `options.start_to_close_timeout`; an attempt that overruns
/// fails with `ActivityTimeout`, which is retryable.
///
/// # Errors
///
/// Returns the last attempt's error.
pub async fn run_activity<T, F, Fut>(
    name: &str,
    options: &ActivityOptions,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_attempts = options.retry.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        let outcome = match timeout(options.start_to_close_timeout, op()).await {
            Ok(result) => result,
            Err(_) => Err(BillingError::ActivityTimeout {
                activity: name.to_string(),
            }),
        };

        match outcome {
            Ok(value) => {
                if attempt > 1 {
                    tracing::info!(activity = name, attempt, "Activity succeeded after retry");
                }
                return Ok(value);
            }
            Err(e) if e.is_retryable() && attempt < max_attempts => {
                let backoff = options.retry.backoff(attempt);
                tracing::warn!(
                    activity = name,
                    attempt,
                    max_attempts,
                    backoff_ms = u64::try_from(backoff.as_millis()).unwrap_or(u64::MAX),
                    error = %e,
                    "Activity failed, retrying"
                );
                sleep(backoff).await;
                attempt += 1;
            }
            Err(e) => {
                if e.is_retryable() {
                    tracing::error!(
                        activity = name,
                        attempt,
                        error = %e,
                        "Activity retries exhausted"
                    );
                } else {
                    tracing::debug!(activity = name, error = %e, "Activity failed");
                }
                return Err(e);
            }
        }
    }
}

/// Run a synchronous activity on the blocking pool under [`run_activity`].
///
/// Each attempt is a fresh `spawn_blocking` task, so a stalled store call or burner trips the
/// start-to-close timeout instead of holding the workflow task. An overrun attempt is
/// abandoned, not cancelled: it finishes in the background while the retry runs.
///
/// # Errors
///
/// Returns the last attempt's error. A panicking attempt surfaces as a retryable
/// `BillingError::External`.
pub async fn run_blocking_activity<T, F>(
    name: &str,
    options: &ActivityOptions,
    op: F,
) -> Result<T>
where
    F: Fn() -> Result<T> + Send + Sync + 'static,
    T: Send + 'static,
{
    let op = Arc::new(op);
    run_activity(name, options, || {
        let op = Arc::clone(&op);
        async move {
            task::spawn_blocking(move || op())
                .await
                .map_err(|e| BillingError::external("activity", e.to_string()))?
        }
    })
    .await
}
