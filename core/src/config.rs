//! Layered configuration.
//!
//! Precedence, later layers win:
//! 1. Built-in defaults
//! 2. `config.toml` in the firstfail home directory
//! 3. `FIRSTFAIL_*` environment variables
//!
//! ## Example
//!
//! ```toml
//! pkg_manager = "ci_tags"
//! tester = "command"
//! device = "7001005458323933328a01fce1dc3800"
//!
//! [tag_service]
//! endpoint = "https://ci.example.org/api/ci-backend/ci-portal/v1/event/tag"
//! branch = "master"
//!
//! [ci_tags]
//! workspace = "/data/images"
//! flash_program = "flash.sh"
//! flash_args = ["{device}", "{pkg_dir}"]
//!
//! [command_tester]
//! task = "acts"
//! program = "run_case.sh"
//! args = ["{device}", "{case}"]
//! cases = ["ActsWifiTest", "ActsBootTest"]
//! ```

use std::collections::BTreeMap;
use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{FirstFailError, Result};
use crate::flake::DEFAULT_RETRIES;
use crate::pkg::{CiTagsConfig, MockManagerConfig};
use crate::tags::{DEFAULT_PAGE_SIZE, TagServiceConfig};
use crate::tester::CommandTesterConfig;

/// Config file name inside the home directory.
pub const CONFIG_FILE: &str = "config.toml";

const DEFAULT_ENV_PREFIX: &str = "FIRSTFAIL";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TagServiceSection {
    pub endpoint: String,
    pub project_name: String,
    pub manifest_file: String,
    pub branch: String,
    pub page_size: u32,
    pub request_deadline_secs: u64,
}

impl Default for TagServiceSection {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            project_name: "openharmony".to_string(),
            manifest_file: "default.xml".to_string(),
            branch: "master".to_string(),
            page_size: DEFAULT_PAGE_SIZE,
            request_deadline_secs: 600,
        }
    }
}

impl TagServiceSection {
    pub fn client_config(&self) -> TagServiceConfig {
        TagServiceConfig {
            endpoint: self.endpoint.clone(),
            project_name: self.project_name.clone(),
            manifest_file: self.manifest_file.clone(),
            page_size: self.page_size,
            deadline: Duration::from_secs(self.request_deadline_secs),
        }
    }
}

/// A scripted failure for the mock tester.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MockFailure {
    pub build: String,
    pub case: String,
}

/// Settings for the `mock` package manager and tester, used for dry runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MockSection {
    pub builds: Vec<String>,
    pub releases: Vec<String>,
    pub issues: BTreeMap<String, String>,
    pub poll_interval_secs: u64,
    pub cases: Vec<String>,
    pub failing: Vec<MockFailure>,
}

impl Default for MockSection {
    fn default() -> Self {
        let manager = MockManagerConfig::default();
        Self {
            builds: manager.builds,
            releases: manager.releases,
            issues: manager.issues,
            poll_interval_secs: manager.poll_interval_secs,
            cases: Vec::new(),
            failing: Vec::new(),
        }
    }
}

impl MockSection {
    pub fn manager_config(&self) -> MockManagerConfig {
        MockManagerConfig {
            builds: self.builds.clone(),
            releases: self.releases.clone(),
            issues: self.issues.clone(),
            poll_interval_secs: self.poll_interval_secs,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Package manager backend: `mock` or `ci_tags`.
    pub pkg_manager: String,
    /// Tester backend: `mock` or `command`.
    pub tester: String,
    pub device: String,
    /// Holds the record snapshot and `last_handled.rec`.
    pub runtime_dir: PathBuf,
    /// Ceiling for one flash, preparation or test run.
    pub deadline_secs: u64,
    pub flake_retries: u32,
    pub tag_service: TagServiceSection,
    pub ci_tags: CiTagsConfig,
    pub command_tester: CommandTesterConfig,
    pub mock: MockSection,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            pkg_manager: "mock".to_string(),
            tester: "mock".to_string(),
            device: "device0".to_string(),
            runtime_dir: PathBuf::from("runtime"),
            deadline_secs: crate::DEFAULT_DEADLINE.as_secs(),
            flake_retries: DEFAULT_RETRIES,
            tag_service: TagServiceSection::default(),
            ci_tags: CiTagsConfig::default(),
            command_tester: CommandTesterConfig::default(),
            mock: MockSection::default(),
        }
    }
}

impl Config {
    pub fn deadline(&self) -> Duration {
        Duration::from_secs(self.deadline_secs)
    }

    /// Resolve relative directories against `home`.
    fn anchor(&mut self, home: &Path) {
        if self.runtime_dir.is_relative() {
            self.runtime_dir = home.join(&self.runtime_dir);
        }
        if self.ci_tags.workspace.is_relative() {
            self.ci_tags.workspace = home.join(&self.ci_tags.workspace);
        }
    }
}

pub struct ConfigLoader {
    home: Option<PathBuf>,
    env_prefix: String,
    skip_file: bool,
    skip_env: bool,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self {
            home: None,
            env_prefix: DEFAULT_ENV_PREFIX.to_string(),
            skip_file: false,
            skip_env: false,
        }
    }

    /// Set the home directory explicitly instead of resolving it.
    pub fn with_home(mut self, path: PathBuf) -> Self {
        self.home = Some(path);
        self
    }

    /// Prefix of override variables, `FIRSTFAIL` by default.
    pub fn with_env_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.env_prefix = prefix.into();
        self
    }

    pub fn skip_file_layer(mut self) -> Self {
        self.skip_file = true;
        self
    }

    pub fn skip_env_layer(mut self) -> Self {
        self.skip_env = true;
        self
    }

    pub fn load(self) -> Result<Config> {
        let home = self.resolve_home()?;

        let mut config = if self.skip_file {
            Config::default()
        } else {
            Self::load_from_file(&home)?
        };

        if !self.skip_env {
            Self::apply_env_overrides(&mut config, &self.env_prefix)?;
        }

        config.anchor(&home);
        Ok(config)
    }

    /// Explicit home, then `$FIRSTFAIL_HOME`, then `~/.firstfail`.
    fn resolve_home(&self) -> Result<PathBuf> {
        if let Some(path) = &self.home {
            return Ok(path.clone());
        }
        if let Ok(path) = env::var("FIRSTFAIL_HOME") {
            return Ok(PathBuf::from(path));
        }
        dirs::home_dir()
            .map(|home| home.join(".firstfail"))
            .ok_or_else(|| FirstFailError::Config("cannot determine home directory".to_string()))
    }

    /// Parse `<home>/config.toml`; keys it omits keep their defaults.
    pub fn load_from_file(home: &Path) -> Result<Config> {
        let path = home.join(CONFIG_FILE);
        let contents = match std::fs::read_to_string(&path) {
            Ok(s) => s,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("{} not found, using defaults", path.display());
                return Ok(Config::default());
            }
            Err(e) => return Err(e.into()),
        };
        toml::from_str(&contents)
            .map_err(|e| FirstFailError::Config(format!("{}: {e}", path.display())))
    }

    /// Apply `{prefix}_*` overrides.
    ///
    /// Supported: `PKG_MANAGER`, `TESTER`, `DEVICE`, `RUNTIME_DIR`,
    /// `DEADLINE_SECS`, `FLAKE_RETRIES`, `TAG_ENDPOINT`, `BRANCH`.
    pub fn apply_env_overrides(config: &mut Config, prefix: &str) -> Result<()> {
        if let Some(value) = env_string(prefix, "PKG_MANAGER") {
            config.pkg_manager = value;
        }
        if let Some(value) = env_string(prefix, "TESTER") {
            config.tester = value;
        }
        if let Some(value) = env_string(prefix, "DEVICE") {
            config.device = value;
        }
        if let Some(value) = env_string(prefix, "RUNTIME_DIR") {
            config.runtime_dir = PathBuf::from(value);
        }
        if let Some(value) = env_parsed(prefix, "DEADLINE_SECS")? {
            config.deadline_secs = value;
        }
        if let Some(value) = env_parsed(prefix, "FLAKE_RETRIES")? {
            config.flake_retries = value;
        }
        if let Some(value) = env_string(prefix, "TAG_ENDPOINT") {
            config.tag_service.endpoint = value;
        }
        if let Some(value) = env_string(prefix, "BRANCH") {
            config.tag_service.branch = value;
        }
        Ok(())
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

fn env_string(prefix: &str, key: &str) -> Option<String> {
    let var = format!("{prefix}_{key}");
    let value = env::var(&var).ok().filter(|v| !v.trim().is_empty())?;
    tracing::debug!("applying env override: {var}={value}");
    Some(value)
}

fn env_parsed<T: FromStr>(prefix: &str, key: &str) -> Result<Option<T>> {
    let Some(value) = env_string(prefix, key) else {
        return Ok(None);
    };
    value.trim().parse().map(Some).map_err(|_| {
        FirstFailError::Config(format!("invalid value for ${prefix}_{key}: {value:?}"))
    })
}
