//! In-memory package manager for dry runs and tests.
//!
//! Builds form a single ladder, oldest first. The steps between two builds
//! are the ladder entries strictly between them; `get_newer` only hands out
//! builds listed as releases.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use firstfail_async_utils::sleep_or_cancel;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::PackageManager;
use crate::error::{FirstFailError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MockManagerConfig {
    /// Every build, oldest first.
    pub builds: Vec<String>,
    /// Builds returned by `get_newer`. Empty means every build is a release.
    pub releases: Vec<String>,
    /// Change refs per build.
    pub issues: BTreeMap<String, String>,
    pub poll_interval_secs: u64,
}

impl Default for MockManagerConfig {
    fn default() -> Self {
        Self {
            builds: Vec::new(),
            releases: Vec::new(),
            issues: BTreeMap::new(),
            poll_interval_secs: 5,
        }
    }
}

pub struct MockManager {
    builds: Vec<String>,
    releases: Mutex<Vec<String>>,
    issues: BTreeMap<String, String>,
    workspace: PathBuf,
    poll_interval: Duration,
    fail_flash_on: Option<String>,
    flashed: Mutex<Vec<(String, String)>>,
}

impl MockManager {
    pub fn new(config: MockManagerConfig, workspace: impl Into<PathBuf>) -> Self {
        let releases = if config.releases.is_empty() {
            config.builds.clone()
        } else {
            config.releases
        };
        Self {
            builds: config.builds,
            releases: Mutex::new(releases),
            issues: config.issues,
            workspace: workspace.into(),
            poll_interval: Duration::from_secs(config.poll_interval_secs.max(1)),
            fail_flash_on: None,
            flashed: Mutex::new(Vec::new()),
        }
    }

    /// Shorthand for a ladder where every build is a release.
    pub fn from_builds<I, S>(builds: I, workspace: impl Into<PathBuf>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let config = MockManagerConfig {
            builds: builds.into_iter().map(Into::into).collect(),
            ..Default::default()
        };
        Self::new(config, workspace)
    }

    pub fn with_issue(mut self, build: &str, issue: &str) -> Self {
        self.issues.insert(build.to_string(), issue.to_string());
        self
    }

    pub fn with_releases(self, releases: &[&str]) -> Self {
        *self.lock_releases() = releases.iter().map(|r| (*r).to_string()).collect();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Make every flash of `build` fail.
    pub fn failing_flash(mut self, build: &str) -> Self {
        self.fail_flash_on = Some(build.to_string());
        self
    }

    /// Publish a new release, appending it to the ladder's release list.
    pub fn push_release(&self, build: &str) {
        self.lock_releases().push(build.to_string());
    }

    /// `(device, build)` pairs in flash order.
    pub fn flashed(&self) -> Vec<(String, String)> {
        self.flashed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    fn lock_releases(&self) -> MutexGuard<'_, Vec<String>> {
        self.releases.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn position(&self, build: &str) -> Result<usize> {
        self.builds
            .iter()
            .position(|b| b == build)
            .ok_or_else(|| FirstFailError::Logic(format!("unknown build {build}")))
    }

    fn newer_release(&self, cur: &str) -> Result<Option<String>> {
        let floor = if cur.is_empty() {
            None
        } else {
            Some(self.position(cur)?)
        };
        let releases = self.lock_releases().clone();
        for release in releases.iter().rev() {
            let index = self.position(release)?;
            if floor.is_none_or(|floor| index > floor) {
                return Ok(Some(release.clone()));
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl PackageManager for MockManager {
    async fn flash(&self, device: &str, pkg: &str, cancel: &CancellationToken) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(FirstFailError::Cancelled);
        }
        self.position(pkg)?;
        if self.fail_flash_on.as_deref() == Some(pkg) {
            return Err(FirstFailError::Transport(format!(
                "flashing {pkg} to {device} failed"
            )));
        }
        tracing::info!("flashed {pkg} to {device}");
        self.flashed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((device.to_string(), pkg.to_string()));
        Ok(())
    }

    fn last_issue(&self, pkg: &str) -> Result<String> {
        Ok(self.issues.get(pkg).cloned().unwrap_or_default())
    }

    async fn steps(
        &self,
        from: &str,
        to: &str,
        _cancel: &CancellationToken,
    ) -> Result<Vec<String>> {
        let start = self.position(from)?;
        let end = self.position(to)?;
        if start >= end {
            return Err(FirstFailError::Logic(format!(
                "build {from} is not older than {to}"
            )));
        }
        Ok(self.builds[start + 1..end].to_vec())
    }

    async fn get_newer(&self, cur: &str, cancel: &CancellationToken) -> Result<String> {
        loop {
            if let Some(newer) = self.newer_release(cur)? {
                return Ok(newer);
            }
            if !sleep_or_cancel(self.poll_interval, cancel).await {
                return Err(FirstFailError::Cancelled);
            }
        }
    }

    fn pkg_dir(&self, pkg: &str) -> PathBuf {
        self.workspace.join(pkg)
    }
}
