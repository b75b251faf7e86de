use firstfail_core::bisect::{Bisector, FirstFail};
use firstfail_core::pkg::MockManager;
use firstfail_core::tester::{Scripted, ScriptedTester};
use pretty_assertions::assert_eq;
use tokio_util::sync::CancellationToken;

fn ladder() -> MockManager {
    MockManager::from_builds(["B1", "B2", "B3", "B4", "B5"], "/ws")
        .with_issue("B2", "pr/2")
        .with_issue("B3", "pr/3")
        .with_issue("B4", "I4XYZ")
        .with_issue("B5", "pr/5")
}

fn failing_from(tester: ScriptedTester, case: &str, builds: &[&str]) -> ScriptedTester {
    builds
        .iter()
        .fold(tester, |t, build| t.with_result(build, case, Scripted::Fail))
}

#[tokio::test]
async fn finds_first_failing_step_without_testing_bad_build() {
    let manager = ladder();
    let tester = failing_from(ScriptedTester::new("acts", vec![]), "wifi", &["B4", "B5"]);
    let mut bisector = Bisector::new(&manager, &tester, "dev");

    let found = bisector
        .find_first_fail("wifi", "B1", "B5", &[], &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(
        found,
        FirstFail {
            build: "B4".to_string(),
            issue: "I4XYZ".to_string(),
        }
    );
    let tested = tester.builds_tested("wifi");
    assert!(tested.len() <= 3);
    assert!(!tested.contains(&"B5".to_string()));
    assert!(!tested.contains(&"B1".to_string()));
    assert_eq!(tested, vec!["B3", "B4"]);
}

#[tokio::test]
async fn no_intermediate_steps_blames_bad_build_without_flashing() {
    let manager = MockManager::from_builds(["B1", "B2"], "/ws").with_issue("B2", "I2");
    let tester = ScriptedTester::new("acts", vec![]);
    let mut bisector = Bisector::new(&manager, &tester, "dev");

    let found = bisector
        .find_first_fail("wifi", "B1", "B2", &[], &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(found.build, "B2");
    assert_eq!(found.issue, "I2");
    assert!(manager.flashed().is_empty());
    assert_eq!(tester.invocations("wifi"), 0);
}

#[tokio::test]
async fn batch_cases_share_observations() {
    let manager = ladder();
    let tester = ScriptedTester::new("acts", vec![]);
    let tester = failing_from(tester, "wifi", &["B4", "B5"]);
    let tester = failing_from(tester, "bt", &["B3", "B4", "B5"]);
    let cancel = CancellationToken::new();
    let mut bisector = Bisector::new(&manager, &tester, "dev");

    let wifi = bisector
        .find_first_fail("wifi", "B1", "B5", &["bt".to_string()], &cancel)
        .await
        .unwrap();
    let bt = bisector
        .find_first_fail("bt", "B1", "B5", &[], &cancel)
        .await
        .unwrap();

    assert_eq!(wifi.build, "B4");
    assert_eq!(bt.build, "B3");
    assert_eq!(tester.builds_tested("bt"), vec!["B3", "B4", "B2"]);
    let flashed: Vec<String> = manager.flashed().into_iter().map(|(_, b)| b).collect();
    assert_eq!(flashed, vec!["B3", "B4", "B2"]);
}

#[tokio::test]
async fn each_case_gets_its_own_transition_point() {
    let manager = ladder();
    let tester = failing_from(ScriptedTester::new("acts", vec![]), "wifi", &["B2", "B3", "B4", "B5"]);
    let mut bisector = Bisector::new(&manager, &tester, "dev");

    let found = bisector
        .find_first_fail(
            "wifi",
            "B1",
            "B5",
            &["bt".to_string(), "wifi".to_string()],
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(found.build, "B2");
    assert_eq!(found.issue, "pr/2");
}

#[tokio::test]
async fn flash_failure_becomes_issue_text() {
    let manager = ladder().failing_flash("B3");
    let tester = ScriptedTester::new("acts", vec![]);
    let mut bisector = Bisector::new(&manager, &tester, "dev");

    let found = bisector
        .find_first_fail_text("wifi", "B1", "B5", &[], &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(found.build, "B5");
    assert!(found.issue.contains("transport error"), "{}", found.issue);
}

#[tokio::test]
async fn execution_error_aborts_the_search() {
    let manager = ladder();
    let tester = ScriptedTester::new("acts", vec![]).with_sequence("wifi", vec![Scripted::Error]);
    let mut bisector = Bisector::new(&manager, &tester, "dev");

    assert!(
        bisector
            .find_first_fail("wifi", "B1", "B5", &[], &CancellationToken::new())
            .await
            .is_err()
    );
}
