use firstfail_core::flake::Verdict;
use firstfail_core::record::{FailOutcome, RECORDS_FILE, RecordStatus, RecordStore};
use pretty_assertions::assert_eq;

#[test]
fn resolved_failure_survives_restart_and_is_not_rebisected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join(RECORDS_FILE);

    let mut store = RecordStore::load(&path).unwrap();
    store.record_pass("wifi", "d1");
    assert_eq!(
        store.record_fail("wifi", "d2", Verdict::Fail),
        FailOutcome::NeedsBisection
    );
    store.record_resolved("wifi", "s4", "I4XYZ").unwrap();
    store.save().unwrap();

    let mut reloaded = RecordStore::load(&path).unwrap();
    let record = reloaded.get("wifi").unwrap().clone();
    assert_eq!(record.status, RecordStatus::Fail);
    assert_eq!(record.latest_success_pkg.as_deref(), Some("d1"));
    assert_eq!(record.earliest_fail_pkg.as_deref(), Some("s4"));
    assert_eq!(record.fail_issue.as_deref(), Some("I4XYZ"));

    assert_eq!(
        reloaded.record_fail("wifi", "d3", Verdict::Fail),
        FailOutcome::Skipped
    );

    reloaded.record_pass("wifi", "d4");
    assert_eq!(
        reloaded.record_fail("wifi", "d5", Verdict::Fail),
        FailOutcome::NeedsBisection
    );
    let record = reloaded.get("wifi").unwrap();
    assert_eq!(record.latest_success_pkg.as_deref(), Some("d4"));
    assert_eq!(record.earliest_fail_pkg.as_deref(), Some("d5"));
    assert_eq!(record.fail_issue, None);
}

#[test]
fn reads_snapshot_written_by_hand() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join(RECORDS_FILE);
    std::fs::write(
        &path,
        r#"{
  "boot": { "status": "pass", "update_time": "2022-12-01 08:00:00", "latest_success_pkg": "d1" },
  "wifi": { "status": "occasional_fail", "update_time": "2022-12-01 08:00:00" }
}"#,
    )
    .unwrap();

    let store = RecordStore::load(&path).unwrap();

    assert_eq!(store.len(), 2);
    assert!(store.should_classify("boot"));
    assert!(!store.should_classify("wifi"));
    assert!(store.should_classify("never-seen"));
    let names: Vec<&str> = store.iter().map(|(name, _)| name.as_str()).collect();
    assert_eq!(names, vec!["boot", "wifi"]);
}
