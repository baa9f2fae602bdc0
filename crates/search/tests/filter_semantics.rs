use crcwatch_core::{decode_case_runs, Snapshot};
use crcwatch_search::{matches, FieldValue, FilterController, FilterCriteria, MatchMode};

fn snapshot_from(body: &str) -> Snapshot {
    let items = decode_case_runs(body.as_bytes()).expect("payload decodes");
    Snapshot::new(1, items)
}

#[test]
fn wrapped_payload_filters_like_bare_payload() {
    let bare = r#"[
        {"id": "1", "name": "install", "running_for": ["planA"], "configuration": {"arch": "x86_64", "variant": "server"}, "state": "running", "result": null, "workflow": "kickstart"},
        {"id": "2", "name": "install", "running_for": ["planB"], "configuration": {"arch": "aarch64"}, "state": "complete", "result": "PASS", "workflow": "kickstart"}
    ]"#;
    let wrapped = format!(r#"{{"caseRuns": {}}}"#, bare);
    let criteria = FilterCriteria::parse("install config:server;arch:x86_64 result:None");
    let (a, _) = criteria.evaluate(&snapshot_from(bare));
    let (b, _) = criteria.evaluate(&snapshot_from(&wrapped));
    assert_eq!(a, b);
    assert_eq!(a.ids(), &["1".to_string()]);
}

#[test]
fn malformed_fields_degrade_instead_of_failing() {
    let snap = snapshot_from(r#"[
        {"id": 5, "name": null, "running_for": "planA", "configuration": {"cpus": 4}},
        {"id": "6"}
    ]"#);
    assert_eq!(snap.len(), 2);
    let m = snap.get("5").map(|c| c.configuration.clone()).unwrap_or_default();
    assert!(matches("cpus:4", FieldValue::Map(&m), MatchMode::Config));

    let mut fc = FilterController::new();
    fc.apply_filter(FilterCriteria::parse("plan:planA"), &snap);
    assert!(fc.is_visible("5"));
    assert!(!fc.is_visible("6"));
}

#[test]
fn state_with_spaces_needs_quotes() {
    let snap = snapshot_from(r#"[
        {"id": "1", "name": "a", "running_for": ["p"], "state": "not started"},
        {"id": "2", "name": "b", "running_for": ["p"], "state": "running"}
    ]"#);
    let (m, dbg) = FilterCriteria::parse(r#"state:"not started""#).evaluate(&snap);
    assert_eq!(m.ids(), &["1".to_string()]);
    assert_eq!(dbg.after_state, 1);
}
