use firstfail_core::flake::{FlakeClassifier, Verdict};
use firstfail_core::tester::{Scripted, ScriptedTester, Tester};
use pretty_assertions::assert_eq;
use tokio_util::sync::CancellationToken;

/// Run the suite once, then classify every failure the way the automation
/// loop does.
async fn run_and_classify(tester: &ScriptedTester, case: &str) -> Verdict {
    let cancel = CancellationToken::new();
    let results = tester.run_all("dev", &cancel).await.unwrap();
    assert!(!results[0].passed());
    FlakeClassifier::default()
        .classify(tester, case, "dev", &cancel)
        .await
        .unwrap()
}

#[tokio::test]
async fn pass_on_first_retry_is_occasional() {
    let tester = ScriptedTester::new("acts", vec!["wifi".to_string()])
        .with_sequence("wifi", vec![Scripted::Fail, Scripted::Pass]);

    assert_eq!(
        run_and_classify(&tester, "wifi").await,
        Verdict::OccasionalFail
    );
    assert_eq!(tester.invocations("wifi"), 2);
}

#[tokio::test]
async fn four_failures_are_a_real_failure() {
    let tester = ScriptedTester::new("acts", vec!["wifi".to_string()]).with_result(
        "",
        "wifi",
        Scripted::Fail,
    );

    assert_eq!(run_and_classify(&tester, "wifi").await, Verdict::Fail);
    assert_eq!(tester.invocations("wifi"), 4);
}

#[tokio::test]
async fn errors_count_as_failed_attempts() {
    let tester = ScriptedTester::new("acts", vec!["wifi".to_string()]).with_sequence(
        "wifi",
        vec![Scripted::Fail, Scripted::Error, Scripted::Error, Scripted::Pass],
    );

    assert_eq!(
        run_and_classify(&tester, "wifi").await,
        Verdict::OccasionalFail
    );
    assert_eq!(tester.invocations("wifi"), 4);
}
