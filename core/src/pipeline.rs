//! The automation loop tying the engine together.
//!
//! One cycle: wait for a newer package, flash it, run the suite, update the
//! records, bisect every new regression and persist the outcome. Records are
//! only saved once bisection is done. The package last handled is kept in
//! `last_handled.rec` so a restart resumes after it.

use std::path::{Path, PathBuf};
use std::time::Duration;

use firstfail_async_utils::sleep_or_cancel;
use tokio_util::sync::CancellationToken;

use crate::bisect::{Bisector, FirstFail};
use crate::config::Config;
use crate::error::{FirstFailError, Result};
use crate::flake::FlakeClassifier;
use crate::fs_util::{atomic_write, read_optional};
use crate::pkg::PackageManager;
use crate::record::{FailOutcome, RECORDS_FILE, Record, RecordStore};
use crate::registry;
use crate::tester::{TestResult, Tester};

/// Name of the file remembering the last handled package.
pub const LAST_HANDLED_FILE: &str = "last_handled.rec";

/// Pause before retrying after a failed cycle.
pub const CYCLE_RETRY_PAUSE: Duration = Duration::from_secs(30);

/// Outcome of one cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub pkg: String,
    pub results: Vec<TestResult>,
    /// New regressions and where they were introduced.
    pub regressions: Vec<(String, FirstFail)>,
}

pub struct Pipeline {
    manager: Box<dyn PackageManager>,
    tester: Box<dyn Tester>,
    store: RecordStore,
    classifier: FlakeClassifier,
    device: String,
    runtime_dir: PathBuf,
}

impl Pipeline {
    pub fn new(
        manager: Box<dyn PackageManager>,
        tester: Box<dyn Tester>,
        store: RecordStore,
        device: impl Into<String>,
        runtime_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            manager,
            tester,
            store,
            classifier: FlakeClassifier::default(),
            device: device.into(),
            runtime_dir: runtime_dir.into(),
        }
    }

    /// Build the backends named in `config` and load the record snapshot.
    pub fn from_config(config: &Config) -> Result<Self> {
        let manager = registry::package_manager(config)?;
        let tester = registry::tester(config)?;
        std::fs::create_dir_all(&config.runtime_dir)?;
        let store = RecordStore::load(config.runtime_dir.join(RECORDS_FILE))?;
        Ok(Self::new(
            manager,
            tester,
            store,
            config.device.clone(),
            config.runtime_dir.clone(),
        )
        .with_classifier(FlakeClassifier::new(config.flake_retries)))
    }

    pub fn with_classifier(mut self, classifier: FlakeClassifier) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn store(&self) -> &RecordStore {
        &self.store
    }

    pub fn runtime_dir(&self) -> &Path {
        &self.runtime_dir
    }

    /// Package handled by the last cycle, empty if none. A package that could
    /// not be flashed or tested counts as handled.
    pub fn last_handled(&self) -> Result<String> {
        let path = self.runtime_dir.join(LAST_HANDLED_FILE);
        Ok(read_optional(&path)?
            .map(|data| String::from_utf8_lossy(&data).trim().to_string())
            .unwrap_or_default())
    }

    fn set_last_handled(&self, pkg: &str) -> Result<()> {
        std::fs::create_dir_all(&self.runtime_dir)?;
        atomic_write(&self.runtime_dir.join(LAST_HANDLED_FILE), pkg.as_bytes())
    }

    /// Run cycles until cancelled. A failed cycle is logged and retried.
    pub async fn run_forever(&mut self, cancel: &CancellationToken) -> Result<()> {
        loop {
            if cancel.is_cancelled() {
                tracing::info!("automation loop stopped");
                return Ok(());
            }
            match self.run_cycle(cancel).await {
                Ok(report) => {
                    tracing::info!(
                        "{} handled: {} results, {} new regressions",
                        report.pkg,
                        report.results.len(),
                        report.regressions.len()
                    );
                }
                Err(err) if err.is_cancelled() && cancel.is_cancelled() => {
                    tracing::info!("automation loop stopped");
                    return Ok(());
                }
                Err(err) => {
                    tracing::error!("cycle failed: {err}");
                    if !sleep_or_cancel(CYCLE_RETRY_PAUSE, cancel).await {
                        return Ok(());
                    }
                }
            }
        }
    }

    pub async fn run_cycle(&mut self, cancel: &CancellationToken) -> Result<CycleReport> {
        let cur = self.last_handled()?;
        let pkg = self.manager.get_newer(&cur, cancel).await?;
        tracing::info!("handling {pkg} on {}", self.device);

        let results = match self.flash_and_test(&pkg, None, cancel).await {
            Ok(results) => results,
            Err(err) if cancel.is_cancelled() => return Err(err),
            Err(err) => {
                tracing::error!("{pkg} could not be tested, moving on: {err}");
                self.set_last_handled(&pkg)?;
                return Err(err);
            }
        };
        let regressions = self.handle_results(&pkg, &results, cancel).await?;
        let regressions = self.analyse(&pkg, &regressions, cancel).await?;
        self.store.save()?;
        self.set_last_handled(&pkg)?;

        Ok(CycleReport {
            pkg,
            results,
            regressions,
        })
    }

    /// Update the records from a suite run of `pkg` and return the cases that
    /// need bisection. The device must still have `pkg` flashed.
    ///
    /// A known failure whose search never completed is returned again.
    pub async fn handle_results(
        &mut self,
        pkg: &str,
        results: &[TestResult],
        cancel: &CancellationToken,
    ) -> Result<Vec<String>> {
        let mut regressions = Vec::new();
        for result in results {
            let case = result.test_case.as_str();
            if result.passed() {
                self.store.record_pass(case, pkg);
                continue;
            }
            if !self.store.should_classify(case) {
                if self.store.get(case).is_some_and(Record::needs_bisection) {
                    tracing::warn!("{case} was never bisected, queueing it again");
                    regressions.push(case.to_string());
                } else {
                    tracing::debug!("{case} is a known failure, skipping");
                }
                continue;
            }
            let verdict = self
                .classifier
                .classify(self.tester.as_ref(), case, &self.device, cancel)
                .await?;
            match self.store.record_fail(case, pkg, verdict) {
                FailOutcome::NeedsBisection => {
                    tracing::warn!("{case} regressed on {pkg}");
                    regressions.push(case.to_string());
                }
                FailOutcome::Recorded => tracing::warn!("{case} failed on {pkg}: {verdict:?}"),
                FailOutcome::Skipped => {}
            }
        }
        Ok(regressions)
    }

    /// Bisect each regressed case between its last passing build and its
    /// earliest failing one, `pkg` unless the failure was seen earlier.
    ///
    /// Cases later in `cases` ride along with earlier searches. A search
    /// that fails stores its error text as the issue.
    pub async fn analyse(
        &mut self,
        pkg: &str,
        cases: &[String],
        cancel: &CancellationToken,
    ) -> Result<Vec<(String, FirstFail)>> {
        let mut bisector = Bisector::new(self.manager.as_ref(), self.tester.as_ref(), &self.device);
        let mut found = Vec::with_capacity(cases.len());
        for (i, case) in cases.iter().enumerate() {
            let record = self.store.get(case);
            let good = record
                .and_then(|record| record.latest_success_pkg.clone())
                .ok_or_else(|| {
                    FirstFailError::Logic(format!("{case} has no passing build to bisect from"))
                })?;
            let bad = record
                .and_then(|record| record.earliest_fail_pkg.clone())
                .unwrap_or_else(|| pkg.to_string());
            let first = bisector
                .find_first_fail_text(case, &good, &bad, &cases[i + 1..], cancel)
                .await?;
            self.store.record_resolved(case, &first.build, &first.issue)?;
            found.push((case.clone(), first));
        }
        Ok(found)
    }

    /// Flash `pkg`, prepare it and run one case or the whole suite.
    pub async fn flash_and_test(
        &self,
        pkg: &str,
        case: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<Vec<TestResult>> {
        self.flash(pkg, cancel).await?;
        self.tester
            .prepare(&self.manager.pkg_dir(pkg), &self.device, cancel)
            .await?;
        match case {
            Some(case) => Ok(vec![self.tester.run_one(&self.device, case, cancel).await?]),
            None => self.tester.run_all(&self.device, cancel).await,
        }
    }

    pub async fn flash(&self, pkg: &str, cancel: &CancellationToken) -> Result<()> {
        self.manager.flash(&self.device, pkg, cancel).await
    }

    /// Operator bisection of one case. Errors are returned, not stored.
    pub async fn bisect(
        &self,
        case: &str,
        good: &str,
        bad: &str,
        cancel: &CancellationToken,
    ) -> Result<FirstFail> {
        Bisector::new(self.manager.as_ref(), self.tester.as_ref(), &self.device)
            .find_first_fail(case, good, bad, &[], cancel)
            .await
    }
}
