//! Search for the first build at which a test case starts failing.
//!
//! The search is a binary search over the steps between a passing and a
//! failing build. That is only sound if a case that fails on some step also
//! fails on every later one; a flaky case can land on the wrong step.
//!
//! The failing boundary build is never re-tested: it is the upper bound of
//! the search and the answer when no step reproduces the failure.

use std::collections::HashMap;

use tokio_util::sync::CancellationToken;

use crate::error::{FirstFailError, Result};
use crate::pkg::PackageManager;
use crate::tester::{TestStatus, Tester};

/// Where a regression was introduced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirstFail {
    pub build: String,
    /// Change refs of `build`, or the error text of a failed search.
    pub issue: String,
}

/// Runs searches on one device. Observations are cached per (build, case)
/// for the lifetime of the bisector, so a batch of searches sharing steps
/// flashes each build at most once.
pub struct Bisector<'a> {
    manager: &'a dyn PackageManager,
    tester: &'a dyn Tester,
    device: &'a str,
    observations: HashMap<(String, String), TestStatus>,
    flashed: Option<String>,
}

impl<'a> Bisector<'a> {
    pub fn new(manager: &'a dyn PackageManager, tester: &'a dyn Tester, device: &'a str) -> Self {
        Self {
            manager,
            tester,
            device,
            observations: HashMap::new(),
            flashed: None,
        }
    }

    /// Build currently on the device, as far as this bisector knows.
    pub fn flashed(&self) -> Option<&str> {
        self.flashed.as_deref()
    }

    /// Find the first build after `good` on which `case` fails.
    ///
    /// `skip` lists other cases regressed in the same batch; they are run
    /// alongside `case` on every tested build so later searches can reuse
    /// the results.
    pub async fn find_first_fail(
        &mut self,
        case: &str,
        good: &str,
        bad: &str,
        skip: &[String],
        cancel: &CancellationToken,
    ) -> Result<FirstFail> {
        let steps = self.manager.steps(good, bad, cancel).await?;
        tracing::info!("bisecting {case} between {good} and {bad}: {} steps", steps.len());

        let mut lo = 0;
        let mut hi = steps.len();
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if self.fails_on(&steps[mid], case, skip, cancel).await? {
                hi = mid;
            } else {
                lo = mid + 1;
            }
        }

        let build = steps.get(hi).map_or(bad, String::as_str).to_string();
        let issue = self.manager.last_issue(&build)?;
        tracing::info!("first failing build of {case} is {build} ({issue})");
        Ok(FirstFail { build, issue })
    }

    /// Like [`Self::find_first_fail`], but a failed search yields `bad` with
    /// the error text as its issue. An expired deadline is a failed search;
    /// only cancellation of `cancel` is returned as an error.
    pub async fn find_first_fail_text(
        &mut self,
        case: &str,
        good: &str,
        bad: &str,
        skip: &[String],
        cancel: &CancellationToken,
    ) -> Result<FirstFail> {
        match self.find_first_fail(case, good, bad, skip, cancel).await {
            Ok(found) => Ok(found),
            Err(err) if cancel.is_cancelled() || matches!(err, FirstFailError::Cancelled) => {
                Err(err)
            }
            Err(err) => {
                tracing::error!("bisecting {case} failed: {err}");
                Ok(FirstFail {
                    build: bad.to_string(),
                    issue: err.to_string(),
                })
            }
        }
    }

    async fn fails_on(
        &mut self,
        build: &str,
        case: &str,
        skip: &[String],
        cancel: &CancellationToken,
    ) -> Result<bool> {
        if let Some(status) = self.observation(build, case) {
            tracing::debug!("{case} on {build}: {status:?} (cached)");
            return Ok(status == TestStatus::Fail);
        }

        self.ensure_flashed(build, cancel).await?;

        let mut cases = vec![case.to_string()];
        for other in skip {
            if !cases.contains(other) && self.observation(build, other).is_none() {
                cases.push(other.clone());
            }
        }
        let results = if cases.len() == 1 {
            vec![self.tester.run_one(self.device, case, cancel).await?]
        } else {
            self.tester.run_many(self.device, &cases, cancel).await?
        };
        for result in results {
            self.observations
                .insert((build.to_string(), result.test_case), result.status);
        }

        let status = self.observation(build, case).ok_or_else(|| {
            FirstFailError::Logic(format!("tester reported no result for {case} on {build}"))
        })?;
        tracing::info!("{case} on {build}: {status:?}");
        Ok(status == TestStatus::Fail)
    }

    fn observation(&self, build: &str, case: &str) -> Option<TestStatus> {
        self.observations
            .get(&(build.to_string(), case.to_string()))
            .copied()
    }

    async fn ensure_flashed(&mut self, build: &str, cancel: &CancellationToken) -> Result<()> {
        if self.flashed.as_deref() == Some(build) {
            return Ok(());
        }
        self.flashed = None;
        self.manager.flash(self.device, build, cancel).await?;
        self.tester
            .prepare(&self.manager.pkg_dir(build), self.device, cancel)
            .await?;
        self.flashed = Some(build.to_string());
        Ok(())
    }
}
