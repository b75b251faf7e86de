//! Materializes CI tags into local step directories.
//!
//! ## Layout
//!
//! ```text
//! <workspace>/{tag_id}/
//!   __last_issue__      JSON array of change refs (issue, else PR list)
//!   manifest_tag.xml    manifest snapshot, byte-for-byte as downloaded
//! ```
//!
//! Step directories are a cache keyed by tag id and survive across runs.
//! A downloaded manifest must parse before it is written.

use std::path::{Path, PathBuf};
use std::time::Duration;

use firstfail_async_utils::OrCancelExt;
use tokio_util::sync::CancellationToken;

use crate::error::{FirstFailError, Result};
use crate::fs_util::atomic_write;
use crate::manifest::Manifest;
use crate::retry::retry_once;
use crate::tags::Tag;

/// Marker file holding the change refs linked to a step.
pub const LAST_ISSUE_FILE: &str = "__last_issue__";

/// Manifest snapshot file inside a step directory.
pub const MANIFEST_FILE: &str = "manifest_tag.xml";

/// A materialized intermediate build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    pub id: String,
    pub dir: PathBuf,
}

impl Step {
    pub fn manifest_path(&self) -> PathBuf {
        self.dir.join(MANIFEST_FILE)
    }

    pub fn last_issue_path(&self) -> PathBuf {
        self.dir.join(LAST_ISSUE_FILE)
    }

    fn is_complete(&self) -> bool {
        self.manifest_path().is_file() && self.last_issue_path().is_file()
    }
}

pub struct StepGenerator {
    workspace: PathBuf,
    http: reqwest::Client,
    deadline: Duration,
}

impl StepGenerator {
    pub fn new(workspace: PathBuf, deadline: Duration) -> Self {
        Self {
            workspace,
            http: reqwest::Client::new(),
            deadline,
        }
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    pub fn step(&self, id: &str) -> Step {
        Step {
            id: id.to_string(),
            dir: self.workspace.join(id),
        }
    }

    /// Materialize `tags` in order and return their step ids.
    ///
    /// Stops at the first failure; steps already written stay on disk and a
    /// later call reuses them.
    pub async fn materialize(&self, tags: &[Tag], cancel: &CancellationToken) -> Result<Vec<String>> {
        let mut ids = Vec::with_capacity(tags.len());
        for tag in tags {
            if cancel.is_cancelled() {
                return Err(FirstFailError::Cancelled);
            }
            let step = self.materialize_one(tag, cancel).await?;
            ids.push(step.id);
        }
        Ok(ids)
    }

    async fn materialize_one(&self, tag: &Tag, cancel: &CancellationToken) -> Result<Step> {
        let step = self.step(&tag.id);
        if step.is_complete() {
            tracing::debug!("step {} already materialized", step.id);
            return Ok(step);
        }

        std::fs::create_dir_all(&step.dir)?;

        let refs = serde_json::to_vec(&tag.change_refs())?;
        atomic_write(&step.last_issue_path(), &refs)?;

        let manifest = self.download(&tag.tag_file_url, cancel).await?;
        atomic_write(&step.manifest_path(), &manifest)?;

        match Manifest::parse(&String::from_utf8_lossy(&manifest)).and_then(|m| m.standardize()) {
            Ok(digest) => tracing::info!(
                "step dir {} for tag {} generated (manifest {digest})",
                step.dir.display(),
                tag.tag_file_url
            ),
            Err(err) => tracing::warn!(
                "step dir {} for tag {} generated, manifest unreadable: {err}",
                step.dir.display(),
                tag.tag_file_url
            ),
        }
        Ok(step)
    }

    async fn download(&self, url: &str, cancel: &CancellationToken) -> Result<Vec<u8>> {
        let what = format!("download {url}");
        retry_once(&what, || async {
            let request = async {
                let response = self.http.get(url).send().await?.error_for_status()?;
                Ok::<_, FirstFailError>(response.bytes().await?.to_vec())
            };
            request.or_cancel_within(cancel, self.deadline).await?
        })
        .await
    }

    /// Change refs recorded for a step, joined for display.
    pub fn last_issue(&self, id: &str) -> Result<String> {
        Ok(read_last_issue(&self.step(id).last_issue_path())?.join(", "))
    }
}

/// Read a `__last_issue__` marker.
pub fn read_last_issue(path: &Path) -> Result<Vec<String>> {
    let data = std::fs::read(path)?;
    Ok(serde_json::from_slice(&data)?)
}
