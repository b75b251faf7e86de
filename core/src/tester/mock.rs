//! Scripted tester for dry runs and tests.
//!
//! Outcomes are looked up per (build, test case). The build is whatever
//! package directory was last passed to `prepare`, so a scripted tester
//! paired with any package manager reflects the image currently flashed.

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::{TestResult, TestStatus, Tester};
use crate::error::{FirstFailError, Result};

/// One scripted outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scripted {
    Pass,
    Fail,
    /// The run itself fails (device lost, harness crash).
    Error,
    /// The run hangs until its deadline expires.
    Timeout,
}

/// Deadline reported by [`Scripted::Timeout`].
pub const SCRIPTED_DEADLINE: Duration = Duration::from_secs(1);

#[derive(Default)]
struct State {
    current_build: String,
    per_build: HashMap<(String, String), Scripted>,
    sequences: HashMap<String, VecDeque<Scripted>>,
    invocations: HashMap<String, usize>,
    runs_by_build: Vec<(String, String)>,
    prepared: Vec<String>,
}

pub struct ScriptedTester {
    task: String,
    cases: Vec<String>,
    state: Mutex<State>,
}

impl ScriptedTester {
    pub fn new(task: impl Into<String>, cases: Vec<String>) -> Self {
        Self {
            task: task.into(),
            cases,
            state: Mutex::new(State::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fixed outcome of `case` on `build`.
    pub fn with_result(self, build: &str, case: &str, outcome: Scripted) -> Self {
        self.state()
            .per_build
            .insert((build.to_string(), case.to_string()), outcome);
        self
    }

    /// Outcomes of consecutive runs of `case`, consumed before any per-build rule.
    pub fn with_sequence(self, case: &str, outcomes: Vec<Scripted>) -> Self {
        self.state()
            .sequences
            .insert(case.to_string(), outcomes.into());
        self
    }

    /// How many times `case` has been executed.
    pub fn invocations(&self, case: &str) -> usize {
        self.state().invocations.get(case).copied().unwrap_or(0)
    }

    /// Builds on which `case` was executed, in order.
    pub fn builds_tested(&self, case: &str) -> Vec<String> {
        self.state()
            .runs_by_build
            .iter()
            .filter(|(_, c)| c == case)
            .map(|(build, _)| build.clone())
            .collect()
    }

    /// Package directories passed to `prepare`, by build name.
    pub fn prepared(&self) -> Vec<String> {
        self.state().prepared.clone()
    }

    fn execute(&self, case: &str) -> Result<TestResult> {
        let mut state = self.state();
        *state.invocations.entry(case.to_string()).or_insert(0) += 1;
        let build = state.current_build.clone();
        state.runs_by_build.push((build.clone(), case.to_string()));

        let sequenced = state.sequences.get_mut(case).and_then(VecDeque::pop_front);
        let scripted = sequenced
            .or_else(|| state.per_build.get(&(build.clone(), case.to_string())).copied())
            .unwrap_or(Scripted::Pass);

        match scripted {
            Scripted::Pass => Ok(TestResult::new(case, TestStatus::Pass)),
            Scripted::Fail => Ok(TestResult::new(case, TestStatus::Fail)),
            Scripted::Error => Err(FirstFailError::Transport(format!(
                "scripted execution error for {case} on {build}"
            ))),
            Scripted::Timeout => Err(FirstFailError::DeadlineExceeded(SCRIPTED_DEADLINE)),
        }
    }
}

#[async_trait]
impl Tester for ScriptedTester {
    fn task_name(&self) -> &str {
        &self.task
    }

    async fn prepare(
        &self,
        pkg_dir: &Path,
        _device: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(FirstFailError::Cancelled);
        }
        let build = pkg_dir
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let mut state = self.state();
        state.prepared.push(build.clone());
        state.current_build = build;
        Ok(())
    }

    async fn run_all(&self, device: &str, cancel: &CancellationToken) -> Result<Vec<TestResult>> {
        self.run_many(device, &self.cases, cancel).await
    }

    async fn run_one(
        &self,
        _device: &str,
        test_case: &str,
        cancel: &CancellationToken,
    ) -> Result<TestResult> {
        if cancel.is_cancelled() {
            return Err(FirstFailError::Cancelled);
        }
        self.execute(test_case)
    }

    async fn run_many(
        &self,
        device: &str,
        test_cases: &[String],
        cancel: &CancellationToken,
    ) -> Result<Vec<TestResult>> {
        let mut results = Vec::with_capacity(test_cases.len());
        for case in test_cases {
            results.push(self.run_one(device, case, cancel).await?);
        }
        Ok(results)
    }
}
