//! Persistent per-test-case pass/fail lineage.
//!
//! The store is the only writer of its snapshot file. Records are kept in
//! memory for the duration of a run and written back as a whole with
//! [`RecordStore::save`].
//!
//! ## Snapshot format
//!
//! ```json
//! {
//!   "ActsWifiTest": {
//!     "status": "fail",
//!     "update_time": "2022-12-02 08:30:00",
//!     "latest_success_pkg": "img_20221201_080000",
//!     "earliest_fail_pkg": "tag_1234",
//!     "fail_issue": "I5ABC"
//!   }
//! }
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::Local;
use serde::{Deserialize, Serialize};

use crate::error::{FirstFailError, Result};
use crate::flake::Verdict;
use crate::fs_util::{atomic_write, read_optional};

/// Default snapshot file name inside the runtime directory.
pub const RECORDS_FILE: &str = "records.json";

const UPDATE_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    Pass,
    OccasionalFail,
    Fail,
}

impl From<Verdict> for RecordStatus {
    fn from(verdict: Verdict) -> Self {
        match verdict {
            Verdict::Fail => RecordStatus::Fail,
            Verdict::OccasionalFail => RecordStatus::OccasionalFail,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub status: RecordStatus,
    pub update_time: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest_success_pkg: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub earliest_fail_pkg: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fail_issue: Option<String>,
}

impl Record {
    /// A failure with a known transition point but no linked issue yet.
    pub fn needs_bisection(&self) -> bool {
        self.status == RecordStatus::Fail
            && self.latest_success_pkg.is_some()
            && self.fail_issue.is_none()
    }
}

/// What `record_fail` did with a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    /// The case was already failing; nothing changed.
    Skipped,
    /// Recorded, nothing further to do.
    Recorded,
    /// Recorded; the case has a known good build and must be bisected.
    NeedsBisection,
}

#[derive(Debug)]
pub struct RecordStore {
    path: PathBuf,
    records: BTreeMap<String, Record>,
}

fn now() -> String {
    Local::now().format(UPDATE_TIME_FORMAT).to_string()
}

impl RecordStore {
    /// Load the snapshot at `path`; a missing file yields an empty store.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let records = match read_optional(&path)? {
            Some(data) => serde_json::from_slice(&data).map_err(|e| {
                FirstFailError::Parse(format!("record snapshot {}: {e}", path.display()))
            })?,
            None => BTreeMap::new(),
        };
        tracing::debug!("loaded {} records from {}", records.len(), path.display());
        Ok(Self { path, records })
    }

    /// Replace the snapshot file with the current records.
    pub fn save(&self) -> Result<()> {
        let json = serde_json::to_vec_pretty(&self.records)?;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        atomic_write(&self.path, &json)?;
        tracing::info!("saved {} records to {}", self.records.len(), self.path.display());
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, case: &str) -> Option<&Record> {
        self.records.get(case)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Record)> {
        self.records.iter()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// True when a new failure of `case` should go through the flake classifier.
    pub fn should_classify(&self, case: &str) -> bool {
        self.records
            .get(case)
            .is_none_or(|record| record.status == RecordStatus::Pass)
    }

    pub fn record_pass(&mut self, case: &str, build: &str) {
        let record = Record {
            status: RecordStatus::Pass,
            update_time: now(),
            latest_success_pkg: Some(build.to_string()),
            earliest_fail_pkg: None,
            fail_issue: None,
        };
        self.records.insert(case.to_string(), record);
    }

    /// Record a classified failure of `case` on `build`.
    ///
    /// Only a case that is absent or passing changes; a known failure stays as
    /// it is until the case passes again.
    pub fn record_fail(&mut self, case: &str, build: &str, verdict: Verdict) -> FailOutcome {
        if !self.should_classify(case) {
            tracing::debug!("{case} already failing, not re-recorded");
            return FailOutcome::Skipped;
        }
        let update_time = now();
        let record = self.records.entry(case.to_string()).or_insert_with(|| Record {
            status: RecordStatus::Pass,
            update_time: update_time.clone(),
            latest_success_pkg: None,
            earliest_fail_pkg: None,
            fail_issue: None,
        });
        record.update_time = update_time;
        record.status = verdict.into();

        match verdict {
            Verdict::OccasionalFail => FailOutcome::Recorded,
            Verdict::Fail => {
                record.earliest_fail_pkg = Some(build.to_string());
                record.fail_issue = None;
                if record.needs_bisection() {
                    FailOutcome::NeedsBisection
                } else {
                    FailOutcome::Recorded
                }
            }
        }
    }

    /// Attach the bisection outcome to a failing case.
    ///
    /// `build` is the first failing build found; `issue` is its change refs or
    /// the error text of a failed search.
    pub fn record_resolved(&mut self, case: &str, build: &str, issue: &str) -> Result<()> {
        let record = self
            .records
            .get_mut(case)
            .filter(|record| record.status == RecordStatus::Fail)
            .ok_or_else(|| {
                FirstFailError::Logic(format!("{case} has no failure record to resolve"))
            })?;
        record.update_time = now();
        record.earliest_fail_pkg = Some(build.to_string());
        record.fail_issue = Some(issue.to_string());
        Ok(())
    }
}
