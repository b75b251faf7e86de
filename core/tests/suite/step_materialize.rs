use std::time::Duration;

use firstfail_core::steps::{StepGenerator, read_last_issue};
use firstfail_core::tags::{Tag, parse_service_timestamp};
use pretty_assertions::assert_eq;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const MANIFEST: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<manifest>
  <default revision="master"/>
  <project name="kernel" path="kernel/linux" revision="abc123"/>
</manifest>
"#;

fn tag(server: &MockServer, id: &str, issue: Option<&str>, prs: &[&str], ts: &str) -> Tag {
    Tag {
        id: id.to_string(),
        issue: issue.map(str::to_string),
        pr_list: prs.iter().map(|p| (*p).to_string()).collect(),
        tag_file_url: format!("{}/files/{id}.xml", server.uri()),
        timestamp: parse_service_timestamp(ts).unwrap(),
    }
}

#[tokio::test]
async fn writes_marker_and_verbatim_manifest() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/files/t1.xml"))
        .respond_with(ResponseTemplate::new(200).set_body_string(MANIFEST))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/files/t2.xml"))
        .respond_with(ResponseTemplate::new(200).set_body_string(MANIFEST))
        .expect(1)
        .mount(&server)
        .await;

    let workspace = tempfile::tempdir().unwrap();
    let generator = StepGenerator::new(workspace.path().to_path_buf(), Duration::from_secs(5));
    let tags = vec![
        tag(&server, "t1", Some("I5ABC"), &["pr/1"], "2022-12-01 08:00:00"),
        tag(&server, "t2", None, &["pr/2", "pr/3"], "2022-12-01 09:00:00"),
    ];

    let ids = generator
        .materialize(&tags, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(ids, vec!["t1", "t2"]);

    let t1 = generator.step("t1");
    assert_eq!(
        read_last_issue(&t1.last_issue_path()).unwrap(),
        vec!["I5ABC".to_string()]
    );
    assert_eq!(std::fs::read_to_string(t1.manifest_path()).unwrap(), MANIFEST);
    assert_eq!(generator.last_issue("t2").unwrap(), "pr/2, pr/3");
}

#[tokio::test]
async fn rematerializing_reuses_existing_steps() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/files/t1.xml"))
        .respond_with(ResponseTemplate::new(200).set_body_string(MANIFEST))
        .expect(1)
        .mount(&server)
        .await;

    let workspace = tempfile::tempdir().unwrap();
    let generator = StepGenerator::new(workspace.path().to_path_buf(), Duration::from_secs(5));
    let tags = vec![tag(&server, "t1", None, &["pr/1"], "2022-12-01 08:00:00")];
    let cancel = CancellationToken::new();

    let first = generator.materialize(&tags, &cancel).await.unwrap();
    let second = generator.materialize(&tags, &cancel).await.unwrap();

    assert_eq!(first, second);
}

#[tokio::test]
async fn failure_aborts_but_keeps_earlier_steps() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/files/t1.xml"))
        .respond_with(ResponseTemplate::new(200).set_body_string(MANIFEST))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/files/t2.xml"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let workspace = tempfile::tempdir().unwrap();
    let generator = StepGenerator::new(workspace.path().to_path_buf(), Duration::from_secs(5));
    let tags = vec![
        tag(&server, "t1", None, &["pr/1"], "2022-12-01 08:00:00"),
        tag(&server, "t2", None, &["pr/2"], "2022-12-01 09:00:00"),
        tag(&server, "t3", None, &["pr/3"], "2022-12-01 10:00:00"),
    ];

    assert!(
        generator
            .materialize(&tags, &CancellationToken::new())
            .await
            .is_err()
    );

    assert!(generator.step("t1").manifest_path().is_file());
    assert!(!generator.step("t2").manifest_path().exists());
    assert!(!generator.step("t3").dir.exists());
}

#[tokio::test]
async fn cancelled_token_stops_before_any_work() {
    let server = MockServer::start().await;
    let workspace = tempfile::tempdir().unwrap();
    let generator = StepGenerator::new(workspace.path().to_path_buf(), Duration::from_secs(5));
    let tags = vec![tag(&server, "t1", None, &[], "2022-12-01 08:00:00")];
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = generator.materialize(&tags, &cancel).await.unwrap_err();

    assert!(err.is_cancelled());
    assert!(!generator.step("t1").dir.exists());
}

#[tokio::test]
async fn unparsable_manifest_is_still_persisted_verbatim() {
    let body = "<html>gateway error</html>";
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/files/t1.xml"))
        .respond_with(ResponseTemplate::new(200).set_body_string(body))
        .expect(1)
        .mount(&server)
        .await;

    let workspace = tempfile::tempdir().unwrap();
    let generator = StepGenerator::new(workspace.path().to_path_buf(), Duration::from_secs(5));
    let tags = vec![tag(&server, "t1", None, &["pr/1"], "2022-12-01 08:00:00")];

    let ids = generator
        .materialize(&tags, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(ids, vec!["t1"]);
    assert_eq!(
        std::fs::read_to_string(generator.step("t1").manifest_path()).unwrap(),
        body
    );
}
