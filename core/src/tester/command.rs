//! Tester backed by an external command.
//!
//! Each test case is one invocation of the configured command; exit status
//! zero is a pass. Placeholders `{case}`, `{device}` and `{pkg_dir}` are
//! substituted in the program and arguments.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::{TestResult, TestStatus, Tester};
use crate::error::Result;
use crate::exec::{CommandSpec, run_command, run_for_status};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandTesterConfig {
    /// Suite name reported by `task_name`.
    pub task: String,
    pub program: String,
    pub args: Vec<String>,
    /// Cases executed by `run_all`.
    pub cases: Vec<String>,
    /// Optional preparation command run after every flash.
    pub prepare_program: Option<String>,
    pub prepare_args: Vec<String>,
}

pub struct CommandTester {
    config: CommandTesterConfig,
    deadline: Duration,
    pkg_dir: Mutex<Option<PathBuf>>,
}

impl CommandTester {
    pub fn new(config: CommandTesterConfig, deadline: Duration) -> Self {
        Self {
            config,
            deadline,
            pkg_dir: Mutex::new(None),
        }
    }

    fn current_pkg_dir(&self) -> String {
        self.pkg_dir
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|dir| dir.display().to_string())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Tester for CommandTester {
    fn task_name(&self) -> &str {
        &self.config.task
    }

    async fn prepare(
        &self,
        pkg_dir: &Path,
        device: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        *self.pkg_dir.lock().unwrap_or_else(PoisonError::into_inner) = Some(pkg_dir.to_path_buf());

        let Some(program) = &self.config.prepare_program else {
            return Ok(());
        };
        let pkg_dir = pkg_dir.display().to_string();
        let spec = CommandSpec::from_template(
            program,
            &self.config.prepare_args,
            &[("device", device), ("pkg_dir", &pkg_dir)],
        )
        .with_deadline(self.deadline);
        run_command(&spec, cancel).await?;
        Ok(())
    }

    async fn run_all(&self, device: &str, cancel: &CancellationToken) -> Result<Vec<TestResult>> {
        self.run_many(device, &self.config.cases, cancel).await
    }

    async fn run_one(
        &self,
        device: &str,
        test_case: &str,
        cancel: &CancellationToken,
    ) -> Result<TestResult> {
        let pkg_dir = self.current_pkg_dir();
        let spec = CommandSpec::from_template(
            &self.config.program,
            &self.config.args,
            &[("case", test_case), ("device", device), ("pkg_dir", &pkg_dir)],
        )
        .with_deadline(self.deadline);

        let status = if run_for_status(&spec, cancel).await? {
            TestStatus::Pass
        } else {
            TestStatus::Fail
        };
        tracing::info!("test case {test_case} on {device}: {status:?}");
        Ok(TestResult::new(test_case, status))
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
