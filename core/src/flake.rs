//! Separates persistent failures from flaky ones.

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::{FirstFailError, Result};
use crate::tester::Tester;

/// Default number of re-runs after an initial failure.
pub const DEFAULT_RETRIES: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    /// Every re-run failed.
    Fail,
    /// At least one re-run passed.
    OccasionalFail,
}

#[derive(Debug, Clone, Copy)]
pub struct FlakeClassifier {
    retries: u32,
}

impl Default for FlakeClassifier {
    fn default() -> Self {
        Self::new(DEFAULT_RETRIES)
    }
}

impl FlakeClassifier {
    pub fn new(retries: u32) -> Self {
        Self { retries }
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// Re-run `case` on the currently flashed build.
    ///
    /// Stops at the first pass. A failed execution uses up an attempt just
    /// like a failing run; cancellation is returned immediately.
    pub async fn classify(
        &self,
        tester: &dyn Tester,
        case: &str,
        device: &str,
        cancel: &CancellationToken,
    ) -> Result<Verdict> {
        for attempt in 1..=self.retries {
            if cancel.is_cancelled() {
                return Err(FirstFailError::Cancelled);
            }
            match tester.run_one(device, case, cancel).await {
                Ok(result) if result.passed() => {
                    tracing::warn!("{case} passed on retry {attempt}, treating as occasional");
                    return Ok(Verdict::OccasionalFail);
                }
                Ok(_) => {
                    tracing::info!("{case} failed again on retry {attempt}/{}", self.retries);
                }
                Err(err) if err.is_cancelled() => return Err(err),
                Err(err) => {
                    tracing::error!("retry {attempt} of {case} did not run: {err}");
                }
            }
        }
        Ok(Verdict::Fail)
    }
}
