//! Package manager for images published by the upstream CI.
//!
//! Daily packages are directories in the workspace whose name embeds a
//! `YYYYMMDD_HHMMSS` build stamp. The steps between two packages come from
//! the tag service and are materialized next to them, one directory per tag.

use std::path::PathBuf;
use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Local, NaiveDateTime, TimeZone};
use firstfail_async_utils::sleep_or_cancel;
use regex_lite::Regex;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::PackageManager;
use crate::error::{FirstFailError, Result};
use crate::exec::{CommandSpec, run_command};
use crate::steps::{LAST_ISSUE_FILE, StepGenerator, read_last_issue};
use crate::tags::TagHistoryClient;

const PACKAGE_STAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CiTagsConfig {
    /// Directory holding daily packages and materialized steps.
    pub workspace: PathBuf,
    pub poll_interval_secs: u64,
    /// Flash command; `{device}`, `{pkg}` and `{pkg_dir}` are substituted.
    pub flash_program: String,
    pub flash_args: Vec<String>,
}

impl Default for CiTagsConfig {
    fn default() -> Self {
        Self {
            workspace: PathBuf::from("workspace"),
            poll_interval_secs: 60,
            flash_program: String::new(),
            flash_args: Vec::new(),
        }
    }
}

#[allow(clippy::expect_used)]
fn stamp_regex() -> &'static Regex {
    static STAMP_RE: OnceLock<Regex> = OnceLock::new();
    STAMP_RE.get_or_init(|| Regex::new(r"(\d{8}_\d{6})").expect("valid package stamp regex"))
}

/// Build time embedded in a package name, in the local zone.
pub fn package_timestamp(pkg: &str) -> Result<DateTime<Local>> {
    let stamp = stamp_regex()
        .captures(pkg)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
        .ok_or_else(|| FirstFailError::Parse(format!("package {pkg:?} has no build stamp")))?;
    let naive = NaiveDateTime::parse_from_str(stamp, PACKAGE_STAMP_FORMAT)
        .map_err(|e| FirstFailError::Parse(format!("package {pkg:?}: {e}")))?;
    Local
        .from_local_datetime(&naive)
        .earliest()
        .ok_or_else(|| FirstFailError::Parse(format!("package {pkg:?}: nonexistent local time")))
}

pub struct CiTagManager {
    config: CiTagsConfig,
    branch: String,
    tags: TagHistoryClient,
    generator: StepGenerator,
    deadline: Duration,
}

impl CiTagManager {
    pub fn new(
        config: CiTagsConfig,
        branch: impl Into<String>,
        tags: TagHistoryClient,
        deadline: Duration,
    ) -> Self {
        let generator = StepGenerator::new(config.workspace.clone(), tags.config().deadline);
        Self {
            config,
            branch: branch.into(),
            tags,
            generator,
            deadline,
        }
    }

    /// Newest stamped package in the workspace that is later than `cur`.
    fn newest_after(&self, cur: Option<DateTime<Local>>) -> Result<Option<String>> {
        let mut best: Option<(DateTime<Local>, String)> = None;
        for entry in std::fs::read_dir(&self.config.workspace)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() || entry.path().join(LAST_ISSUE_FILE).exists() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            let Ok(stamp) = package_timestamp(&name) else {
                continue;
            };
            if cur.is_some_and(|cur| stamp <= cur) {
                continue;
            }
            if best.as_ref().is_none_or(|(b, _)| stamp > *b) {
                best = Some((stamp, name));
            }
        }
        Ok(best.map(|(_, name)| name))
    }
}

#[async_trait]
impl PackageManager for CiTagManager {
    async fn flash(&self, device: &str, pkg: &str, cancel: &CancellationToken) -> Result<()> {
        if self.config.flash_program.is_empty() {
            return Err(FirstFailError::Config(
                "ci_tags.flash_program is not set".to_string(),
            ));
        }
        let pkg_dir = self.pkg_dir(pkg).display().to_string();
        let spec = CommandSpec::from_template(
            &self.config.flash_program,
            &self.config.flash_args,
            &[("device", device), ("pkg", pkg), ("pkg_dir", &pkg_dir)],
        )
        .with_deadline(self.deadline);
        run_command(&spec, cancel).await?;
        tracing::info!("flashed {pkg} to {device}");
        Ok(())
    }

    fn last_issue(&self, pkg: &str) -> Result<String> {
        let marker = self.pkg_dir(pkg).join(LAST_ISSUE_FILE);
        if !marker.is_file() {
            return Ok(String::new());
        }
        Ok(read_last_issue(&marker)?.join(", "))
    }

    async fn steps(&self, from: &str, to: &str, cancel: &CancellationToken) -> Result<Vec<String>> {
        let start = package_timestamp(from)?;
        let end = package_timestamp(to)?;
        let tags = self.tags.list_tags(&self.branch, start, end, cancel).await?;
        self.generator.materialize(&tags, cancel).await
    }

    async fn get_newer(&self, cur: &str, cancel: &CancellationToken) -> Result<String> {
        let floor = if cur.is_empty() {
            None
        } else {
            Some(package_timestamp(cur)?)
        };
        let interval = Duration::from_secs(self.config.poll_interval_secs.max(1));
        loop {
            if let Some(newer) = self.newest_after(floor)? {
                tracing::info!("new package {newer} found");
                return Ok(newer);
            }
            if !sleep_or_cancel(interval, cancel).await {
                return Err(FirstFailError::Cancelled);
            }
        }
    }

    fn pkg_dir(&self, pkg: &str) -> PathBuf {
        self.config.workspace.join(pkg)
    }
}
