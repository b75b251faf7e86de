//! Backend selection by configured name.

use crate::config::Config;
use crate::error::{FirstFailError, Result};
use crate::pkg::{CiTagManager, MockManager, PackageManager};
use crate::tags::TagHistoryClient;
use crate::tester::{CommandTester, Scripted, ScriptedTester, Tester};

pub const PACKAGE_MANAGERS: &[&str] = &["mock", "ci_tags"];
pub const TESTERS: &[&str] = &["mock", "command"];

pub fn package_manager(config: &Config) -> Result<Box<dyn PackageManager>> {
    match config.pkg_manager.as_str() {
        "mock" => Ok(Box::new(MockManager::new(
            config.mock.manager_config(),
            config.runtime_dir.join("mock_pkgs"),
        ))),
        "ci_tags" => {
            if config.tag_service.endpoint.is_empty() {
                return Err(FirstFailError::Config(
                    "ci_tags needs tag_service.endpoint".to_string(),
                ));
            }
            let tags = TagHistoryClient::new(config.tag_service.client_config());
            Ok(Box::new(CiTagManager::new(
                config.ci_tags.clone(),
                config.tag_service.branch.clone(),
                tags,
                config.deadline(),
            )))
        }
        other => Err(FirstFailError::Config(format!(
            "unknown package manager {other:?}, expected one of {PACKAGE_MANAGERS:?}"
        ))),
    }
}

pub fn tester(config: &Config) -> Result<Box<dyn Tester>> {
    match config.tester.as_str() {
        "mock" => {
            let tester = config.mock.failing.iter().fold(
                ScriptedTester::new("mock", config.mock.cases.clone()),
                |tester, failure| tester.with_result(&failure.build, &failure.case, Scripted::Fail),
            );
            Ok(Box::new(tester))
        }
        "command" => {
            if config.command_tester.program.is_empty() {
                return Err(FirstFailError::Config(
                    "command tester needs command_tester.program".to_string(),
                ));
            }
            Ok(Box::new(CommandTester::new(
                config.command_tester.clone(),
                config.deadline(),
            )))
        }
        other => Err(FirstFailError::Config(format!(
            "unknown tester {other:?}, expected one of {TESTERS:?}"
        ))),
    }
}
