//! Retry-once policy for transient failures.
//!
//! Process exits, spawn failures and HTTP transport errors get exactly one
//! more attempt. Parse, logic and cancellation errors are returned as-is.

use std::future::Future;
use std::time::Duration;

use backon::{ConstantBuilder, Retryable};

use crate::error::{FirstFailError, Result};

/// Pause between the failed attempt and the retry.
pub const RETRY_DELAY: Duration = Duration::from_millis(500);

/// Run `operation`, retrying once if it fails with a retryable error.
pub async fn retry_once<F, Fut, T>(what: &str, operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let backoff = ConstantBuilder::default()
        .with_delay(RETRY_DELAY)
        .with_max_times(1);

    operation
        .retry(backoff)
        .when(FirstFailError::is_retryable)
        .notify(|err: &FirstFailError, dur: Duration| {
            tracing::error!("{what} failed: {err}, trying again in {dur:?}");
        })
        .await
}
