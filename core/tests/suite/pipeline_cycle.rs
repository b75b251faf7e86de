use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use firstfail_core::config::{Config, MockFailure, MockSection};
use firstfail_core::pipeline::{LAST_HANDLED_FILE, Pipeline};
use firstfail_core::pkg::MockManager;
use firstfail_core::record::{RECORDS_FILE, RecordStatus, RecordStore};
use firstfail_core::tester::{Scripted, ScriptedTester};
use pretty_assertions::assert_eq;
use tokio_util::sync::CancellationToken;

fn config(runtime_dir: &Path) -> Config {
    let failing = ["s2", "s3", "d2"]
        .iter()
        .map(|build| MockFailure {
            build: (*build).to_string(),
            case: "wifi".to_string(),
        })
        .collect();
    Config {
        runtime_dir: runtime_dir.to_path_buf(),
        mock: MockSection {
            builds: ["d1", "s1", "s2", "s3", "d2"].map(String::from).to_vec(),
            releases: vec!["d1".to_string(), "d2".to_string()],
            issues: BTreeMap::from([("s2".to_string(), "I2WIFI".to_string())]),
            poll_interval_secs: 1,
            cases: vec!["boot".to_string(), "wifi".to_string()],
            failing,
        },
        ..Default::default()
    }
}

fn seed_history(runtime_dir: &Path) {
    std::fs::write(runtime_dir.join(LAST_HANDLED_FILE), "d1").unwrap();
    std::fs::write(
        runtime_dir.join(RECORDS_FILE),
        r#"{
  "boot": { "status": "pass", "update_time": "2022-12-01 08:00:00", "latest_success_pkg": "d1" },
  "wifi": { "status": "pass", "update_time": "2022-12-01 08:00:00", "latest_success_pkg": "d1" }
}"#,
    )
    .unwrap();
}

#[tokio::test]
async fn cycle_bisects_new_regression_and_persists() {
    let dir = tempfile::tempdir().unwrap();
    seed_history(dir.path());
    let mut pipeline = Pipeline::from_config(&config(dir.path())).unwrap();

    let report = pipeline.run_cycle(&CancellationToken::new()).await.unwrap();

    assert_eq!(report.pkg, "d2");
    assert_eq!(report.results.len(), 2);
    assert_eq!(report.regressions.len(), 1);
    let (case, first) = &report.regressions[0];
    assert_eq!(case, "wifi");
    assert_eq!(first.build, "s2");
    assert_eq!(first.issue, "I2WIFI");

    assert_eq!(pipeline.last_handled().unwrap(), "d2");
    let wifi = pipeline.store().get("wifi").unwrap();
    assert_eq!(wifi.status, RecordStatus::Fail);
    assert_eq!(wifi.earliest_fail_pkg.as_deref(), Some("s2"));
    assert_eq!(wifi.fail_issue.as_deref(), Some("I2WIFI"));
    assert_eq!(
        pipeline.store().get("boot").unwrap().latest_success_pkg.as_deref(),
        Some("d2")
    );

    let reloaded = Pipeline::from_config(&config(dir.path())).unwrap();
    assert_eq!(
        reloaded.store().get("wifi").unwrap().fail_issue.as_deref(),
        Some("I2WIFI")
    );
}

#[tokio::test]
async fn first_sighting_of_a_failure_is_not_bisected() {
    let dir = tempfile::tempdir().unwrap();
    let mut pipeline = Pipeline::from_config(&config(dir.path())).unwrap();

    let report = pipeline.run_cycle(&CancellationToken::new()).await.unwrap();

    assert_eq!(report.pkg, "d2");
    assert!(report.regressions.is_empty());
    let wifi = pipeline.store().get("wifi").unwrap();
    assert_eq!(wifi.status, RecordStatus::Fail);
    assert_eq!(wifi.latest_success_pkg, None);
}

#[tokio::test]
async fn loop_stops_on_cancel_while_waiting() {
    let dir = tempfile::tempdir().unwrap();
    seed_history(dir.path());
    std::fs::write(dir.path().join(LAST_HANDLED_FILE), "d2").unwrap();
    let mut pipeline = Pipeline::from_config(&config(dir.path())).unwrap();
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    tokio::time::timeout(Duration::from_secs(5), pipeline.run_forever(&cancel))
        .await
        .expect("loop did not stop")
        .unwrap();
}

#[tokio::test]
async fn operator_test_runs_a_single_case() {
    let dir = tempfile::tempdir().unwrap();
    let pipeline = Pipeline::from_config(&config(dir.path())).unwrap();

    let results = pipeline
        .flash_and_test("s3", Some("wifi"), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(results.len(), 1);
    assert!(!results[0].passed());
}

#[tokio::test]
async fn operator_bisection_reports_first_failure() {
    let dir = tempfile::tempdir().unwrap();
    let pipeline = Pipeline::from_config(&config(dir.path())).unwrap();

    let first = pipeline
        .bisect("wifi", "d1", "d2", &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(first.build, "s2");
}

fn ladder(runtime_dir: &Path) -> MockManager {
    MockManager::from_builds(["d1", "s1", "s2", "s3", "d2"], runtime_dir.join("pkgs"))
        .with_releases(&["d1", "d2"])
        .with_issue("s2", "I2WIFI")
        .with_poll_interval(Duration::from_millis(20))
}

fn suite() -> ScriptedTester {
    ScriptedTester::new("acts", vec!["boot".to_string(), "wifi".to_string()])
}

fn pipeline(runtime_dir: &Path, manager: MockManager, tester: ScriptedTester) -> Pipeline {
    let store = RecordStore::load(runtime_dir.join(RECORDS_FILE)).unwrap();
    Pipeline::new(
        Box::new(manager),
        Box::new(tester),
        store,
        "device0",
        runtime_dir,
    )
}

#[tokio::test]
async fn hung_bisection_is_recorded_as_issue_text() {
    let dir = tempfile::tempdir().unwrap();
    seed_history(dir.path());
    let tester = ["s1", "s2", "s3"]
        .iter()
        .fold(suite().with_result("d2", "wifi", Scripted::Fail), |tester, step| {
            tester.with_result(step, "wifi", Scripted::Timeout)
        });
    let mut pipeline = pipeline(dir.path(), ladder(dir.path()), tester);

    let report = pipeline.run_cycle(&CancellationToken::new()).await.unwrap();

    assert_eq!(report.regressions.len(), 1);
    assert_eq!(report.regressions[0].1.build, "d2");
    assert_eq!(pipeline.last_handled().unwrap(), "d2");
    let reloaded = RecordStore::load(dir.path().join(RECORDS_FILE)).unwrap();
    let wifi = reloaded.get("wifi").unwrap();
    assert_eq!(wifi.status, RecordStatus::Fail);
    assert!(wifi.fail_issue.as_deref().unwrap().contains("deadline"));
    assert!(!wifi.needs_bisection());
}

#[tokio::test]
async fn unfinished_bisection_is_resumed_on_next_cycle() {
    let dir = tempfile::tempdir().unwrap();
    seed_history(dir.path());
    std::fs::write(
        dir.path().join(RECORDS_FILE),
        r#"{
  "boot": { "status": "pass", "update_time": "2022-12-01 08:00:00", "latest_success_pkg": "d1" },
  "wifi": { "status": "fail", "update_time": "2022-12-02 08:00:00", "latest_success_pkg": "d1", "earliest_fail_pkg": "d2" }
}"#,
    )
    .unwrap();
    let tester = ["s2", "s3", "d2"]
        .iter()
        .fold(suite(), |tester, build| {
            tester.with_result(build, "wifi", Scripted::Fail)
        });
    let mut pipeline = pipeline(dir.path(), ladder(dir.path()), tester);

    let report = pipeline.run_cycle(&CancellationToken::new()).await.unwrap();

    assert_eq!(report.pkg, "d2");
    assert_eq!(report.regressions.len(), 1);
    assert_eq!(report.regressions[0].1.build, "s2");
    let wifi = pipeline.store().get("wifi").unwrap();
    assert_eq!(wifi.earliest_fail_pkg.as_deref(), Some("s2"));
    assert_eq!(wifi.fail_issue.as_deref(), Some("I2WIFI"));
}

#[tokio::test]
async fn package_that_cannot_be_flashed_is_not_retried() {
    let dir = tempfile::tempdir().unwrap();
    seed_history(dir.path());
    let manager = ladder(dir.path()).failing_flash("d2");
    let mut pipeline = pipeline(dir.path(), manager, suite());
    let cancel = CancellationToken::new();

    assert!(pipeline.run_cycle(&cancel).await.is_err());
    assert_eq!(pipeline.last_handled().unwrap(), "d2");
    assert_eq!(
        pipeline.store().get("wifi").unwrap().status,
        RecordStatus::Pass
    );

    let next = tokio::time::timeout(Duration::from_millis(200), pipeline.run_cycle(&cancel)).await;
    assert!(next.is_err(), "failed package was handed out again");
}
