//! Cancellation- and deadline-aware futures.
//!
//! Every blocking call in firstfail (flashing, test execution, tag queries,
//! manifest downloads) runs under one `CancellationToken` threaded from the
//! caller and, usually, a deadline. `OrCancelExt` races a future against both
//! and reports which one won.

use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Why a future did not run to completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelErr {
    /// The token was cancelled before the future completed.
    Cancelled,
    /// The deadline elapsed before the future completed.
    DeadlineExceeded(Duration),
}

impl std::fmt::Display for CancelErr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CancelErr::Cancelled => f.write_str("operation cancelled"),
            CancelErr::DeadlineExceeded(d) => write!(f, "deadline of {d:?} exceeded"),
        }
    }
}

impl std::error::Error for CancelErr {}

/// Extension trait for making futures cancellable.
///
/// Allows any future to race against a `CancellationToken`, returning
/// `Err(CancelErr::Cancelled)` if the token is cancelled before the
/// future completes.
#[async_trait]
pub trait OrCancelExt: Sized {
    type Output;

    /// Race this future against the cancellation token.
    async fn or_cancel(self, token: &CancellationToken) -> Result<Self::Output, CancelErr>;

    /// Race this future against the token and a deadline.
    ///
    /// An already-cancelled token wins even if the future is ready.
    async fn or_cancel_within(
        self,
        token: &CancellationToken,
        deadline: Duration,
    ) -> Result<Self::Output, CancelErr>;
}

#[async_trait]
impl<F> OrCancelExt for F
where
    F: Future + Send,
    F::Output: Send,
{
    type Output = F::Output;

    async fn or_cancel(self, token: &CancellationToken) -> Result<Self::Output, CancelErr> {
        tokio::select! {
            biased;
            _ = token.cancelled() => Err(CancelErr::Cancelled),
            res = self => Ok(res),
        }
    }

    async fn or_cancel_within(
        self,
        token: &CancellationToken,
        deadline: Duration,
    ) -> Result<Self::Output, CancelErr> {
        tokio::select! {
            biased;
            _ = token.cancelled() => Err(CancelErr::Cancelled),
            _ = tokio::time::sleep(deadline) => Err(CancelErr::DeadlineExceeded(deadline)),
            res = self => Ok(res),
        }
    }
}

/// Sleep for `duration` unless the token is cancelled first.
///
/// Returns `false` when the sleep was cut short.
pub async fn sleep_or_cancel(duration: Duration, token: &CancellationToken) -> bool {
    tokio::time::sleep(duration).or_cancel(token).await.is_ok()
}
