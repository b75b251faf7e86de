//! Package (OS image) management capability.
//!
//! A package is named by a string; its files live under [`PackageManager::pkg_dir`].
//! Daily packages are released periodically, and the intermediate CI builds
//! between two of them are the steps a bisection walks.

mod ci;
mod mock;

use std::path::PathBuf;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::Result;

pub use ci::{CiTagManager, CiTagsConfig, package_timestamp};
pub use mock::{MockManager, MockManagerConfig};

#[async_trait]
pub trait PackageManager: Send + Sync {
    /// Flash `pkg` onto `device`.
    async fn flash(&self, device: &str, pkg: &str, cancel: &CancellationToken) -> Result<()>;

    /// Change refs linked to `pkg`, joined for display. Empty when unknown.
    fn last_issue(&self, pkg: &str) -> Result<String>;

    /// Intermediate builds strictly between `from` and `to`, oldest first.
    async fn steps(&self, from: &str, to: &str, cancel: &CancellationToken)
    -> Result<Vec<String>>;

    /// Block until a package newer than `cur` is available and return its name.
    /// An empty `cur` accepts any package.
    async fn get_newer(&self, cur: &str, cancel: &CancellationToken) -> Result<String>;

    /// Directory holding the files of `pkg`.
    fn pkg_dir(&self, pkg: &str) -> PathBuf;
}
