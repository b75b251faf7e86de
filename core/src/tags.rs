//! Client for the upstream CI tag service.
//!
//! Every CI build the upstream pipeline produces is published as a tag that
//! points at a manifest snapshot and, optionally, at the issue or PRs that
//! triggered it. Listing the tags between two daily builds yields the
//! candidate steps for bisection.

use std::collections::HashSet;
use std::time::Duration;

use chrono::{DateTime, Local, NaiveDateTime, TimeZone};
use firstfail_async_utils::OrCancelExt;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::{FirstFailError, Result};
use crate::retry::retry_once;

/// Timestamp layout used by the tag service, in the service's local zone.
pub const SERVICE_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Default page size; large enough that most windows fit in one page.
pub const DEFAULT_PAGE_SIZE: u32 = 10_000;

/// Connection settings for the tag service.
#[derive(Debug, Clone)]
pub struct TagServiceConfig {
    /// Full URL of the tag query endpoint.
    pub endpoint: String,
    pub project_name: String,
    pub manifest_file: String,
    pub page_size: u32,
    /// Per-request deadline.
    pub deadline: Duration,
}

/// One CI build record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tag {
    pub id: String,
    pub issue: Option<String>,
    pub pr_list: Vec<String>,
    pub tag_file_url: String,
    pub timestamp: DateTime<Local>,
}

impl Tag {
    /// Change references linked to this build. A single issue takes
    /// precedence over the PR list.
    pub fn change_refs(&self) -> Vec<String> {
        match &self.issue {
            Some(issue) => vec![issue.clone()],
            None => self.pr_list.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TagQuery<'a> {
    project_name: &'a str,
    branch: &'a str,
    manifest_file: &'a str,
    start_time: String,
    end_time: String,
    page_num: u32,
    page_size: u32,
}

#[derive(Debug, Deserialize)]
struct TagResponse {
    result: TagPage,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TagPage {
    #[serde(default)]
    tag_list: Vec<RawTag>,
    total: usize,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawTag {
    id: String,
    #[serde(default)]
    issue: Option<String>,
    #[serde(default)]
    pr_list: Option<Vec<String>>,
    tag_file_url: String,
    timestamp: String,
}

impl RawTag {
    fn into_tag(self, timestamp: DateTime<Local>) -> Tag {
        Tag {
            id: self.id,
            issue: self.issue.filter(|issue| !issue.is_empty()),
            pr_list: self.pr_list.unwrap_or_default(),
            tag_file_url: self.tag_file_url,
            timestamp,
        }
    }
}

/// Parse a tag-service timestamp in the local zone.
pub fn parse_service_timestamp(raw: &str) -> Result<DateTime<Local>> {
    let naive = NaiveDateTime::parse_from_str(raw, SERVICE_TIMESTAMP_FORMAT)
        .map_err(|e| FirstFailError::Parse(format!("invalid tag timestamp {raw:?}: {e}")))?;
    Local
        .from_local_datetime(&naive)
        .earliest()
        .ok_or_else(|| FirstFailError::Parse(format!("tag timestamp {raw:?} does not exist locally")))
}

pub struct TagHistoryClient {
    http: reqwest::Client,
    config: TagServiceConfig,
}

impl TagHistoryClient {
    pub fn new(config: TagServiceConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
        }
    }

    pub fn config(&self) -> &TagServiceConfig {
        &self.config
    }

    /// All tags on `branch` strictly between `from` and `to`, oldest first.
    ///
    /// Pages are requested until the number of distinct tag ids seen equals
    /// the total the service reports. Any failure discards what was gathered.
    pub async fn list_tags(
        &self,
        branch: &str,
        from: DateTime<Local>,
        to: DateTime<Local>,
        cancel: &CancellationToken,
    ) -> Result<Vec<Tag>> {
        if from >= to {
            return Err(FirstFailError::Logic(format!(
                "empty or inverted tag window: {from} .. {to}"
            )));
        }

        let mut seen: HashSet<String> = HashSet::new();
        let mut kept = Vec::new();
        let mut page_num = 1u32;

        loop {
            let query = TagQuery {
                project_name: &self.config.project_name,
                branch,
                manifest_file: &self.config.manifest_file,
                start_time: from.format("%Y-%m-%d").to_string(),
                end_time: to.format("%Y-%m-%d").to_string(),
                page_num,
                page_size: self.config.page_size,
            };
            let page = self.fetch_page(&query, cancel).await?;

            let seen_before = seen.len();
            for raw in page.tag_list {
                if !seen.insert(raw.id.clone()) {
                    continue;
                }
                let timestamp = parse_service_timestamp(&raw.timestamp)?;
                if timestamp > from && timestamp < to {
                    kept.push(raw.into_tag(timestamp));
                }
            }
            tracing::debug!(
                "tag page {page_num}: {} distinct of {} total",
                seen.len(),
                page.total
            );

            if seen.len() >= page.total {
                break;
            }
            if seen.len() == seen_before {
                return Err(FirstFailError::Parse(format!(
                    "tag service reported {} tags but page {page_num} added none (have {})",
                    page.total,
                    seen.len()
                )));
            }
            page_num += 1;
        }

        kept.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
        tracing::info!(
            "{} tags on {branch} between {from} and {to} ({page_num} page(s))",
            kept.len()
        );
        Ok(kept)
    }

    async fn fetch_page(
        &self,
        query: &TagQuery<'_>,
        cancel: &CancellationToken,
    ) -> Result<TagPage> {
        let what = format!("tag query page {}", query.page_num);
        retry_once(&what, || async {
            let request = async {
                let response = self
                    .http
                    .post(&self.config.endpoint)
                    .json(query)
                    .send()
                    .await?
                    .error_for_status()?;
                let body = response.bytes().await?;
                let parsed: TagResponse = serde_json::from_slice(&body)?;
                Ok::<_, FirstFailError>(parsed.result)
            };
            request
                .or_cancel_within(cancel, self.config.deadline)
                .await?
        })
        .await
    }
}
