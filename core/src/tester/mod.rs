//! Test execution capability.
//!
//! The engine only needs a pass/fail verdict per test case; how a backend
//! runs a suite on a device is its own business.

mod command;
mod mock;

use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::Result;

pub use command::{CommandTester, CommandTesterConfig};
pub use mock::{Scripted, ScriptedTester};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TestStatus {
    Pass,
    Fail,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TestResult {
    pub test_case: String,
    pub status: TestStatus,
}

impl TestResult {
    pub fn new(test_case: impl Into<String>, status: TestStatus) -> Self {
        Self {
            test_case: test_case.into(),
            status,
        }
    }

    pub fn passed(&self) -> bool {
        self.status == TestStatus::Pass
    }
}

#[async_trait]
pub trait Tester: Send + Sync {
    /// Name of the suite `run_all` executes, used in logs and reports.
    fn task_name(&self) -> &str;

    /// Per-package preparation after a flash (test mode, resources, reboot).
    async fn prepare(&self, pkg_dir: &Path, device: &str, cancel: &CancellationToken)
    -> Result<()>;

    /// Run the full suite.
    async fn run_all(&self, device: &str, cancel: &CancellationToken) -> Result<Vec<TestResult>>;

    /// Run a single test case.
    async fn run_one(
        &self,
        device: &str,
        test_case: &str,
        cancel: &CancellationToken,
    ) -> Result<TestResult>;

    /// Run the given test cases, in order.
    async fn run_many(
        &self,
        device: &str,
        test_cases: &[String],
        cancel: &CancellationToken,
    ) -> Result<Vec<TestResult>>;
}
