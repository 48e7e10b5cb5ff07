use proptest::prelude::*;
use test_case::test_case;

use super::*;

// ============================================================================
// LogicalPath
// ============================================================================

#[test_case("/tempZone/home/alice/a.dat"; "nested object")]
#[test_case("/tempZone"; "zone root")]
#[test_case("/z/trash/home/bob/x"; "trash path")]
fn logical_path_accepts(path: &str) {
    let parsed = LogicalPath::new(path).unwrap();
    assert_eq!(parsed.as_str(), path);
}

#[test_case(""; "empty")]
#[test_case("/"; "bare root")]
#[test_case("relative/a"; "relative")]
fn logical_path_rejects_non_absolute(path: &str) {
    assert!(matches!(
        LogicalPath::new(path),
        Err(TypeError::NotAbsolute { .. })
    ));
}

#[test_case("/z//a"; "empty segment")]
#[test_case("/z/a/"; "trailing slash")]
#[test_case("/z/../etc"; "parent segment")]
#[test_case("/z/./a"; "current segment")]
fn logical_path_rejects_bad_segments(path: &str) {
    assert!(matches!(
        LogicalPath::new(path),
        Err(TypeError::InvalidSegment { .. })
    ));
}

#[test]
fn logical_path_components() {
    let path = LogicalPath::new("/tempZone/home/alice/a.dat").unwrap();
    assert_eq!(path.zone(), "tempZone");
    assert_eq!(path.file_name(), "a.dat");
    assert_eq!(path.parent().unwrap().as_str(), "/tempZone/home/alice");
    assert_eq!(
        path.segments().collect::<Vec<_>>(),
        vec!["tempZone", "home", "alice", "a.dat"]
    );
    assert!(LogicalPath::new("/tempZone").unwrap().parent().is_none());
}

#[test]
fn logical_path_trash_detection() {
    assert!(LogicalPath::new("/z/trash/home/a").unwrap().is_under("trash"));
    assert!(!LogicalPath::new("/z/home/trash/a").unwrap().is_under("trash"));
    assert!(!LogicalPath::new("/z").unwrap().is_under("trash"));
}

#[test]
fn logical_path_serde_validates() {
    let ok: LogicalPath = serde_json::from_str("\"/z/a\"").unwrap();
    assert_eq!(ok.as_str(), "/z/a");
    assert!(serde_json::from_str::<LogicalPath>("\"z/a\"").is_err());
}

proptest! {
    #[test]
    fn logical_path_join_then_parent(segments in prop::collection::vec("[a-z0-9_]{1,8}", 1..6)) {
        let base = LogicalPath::new(format!("/{}", segments.join("/"))).unwrap();
        let child = base.join("leaf").unwrap();
        prop_assert_eq!(child.parent().unwrap(), base);
        prop_assert_eq!(child.file_name(), "leaf");
    }
}

// ============================================================================
// Resource classes and statuses
// ============================================================================

#[test_case(ResourceClass::Normal, false; "normal")]
#[test_case(ResourceClass::Cache, false; "cache")]
#[test_case(ResourceClass::Archive, true; "archive")]
#[test_case(ResourceClass::Bundle, true; "bundle")]
fn staging_requirement(class: ResourceClass, staged: bool) {
    assert_eq!(class.requires_staging(), staged);
}

#[test]
fn resource_class_parses_aliases() {
    assert_eq!("compound".parse::<ResourceClass>(), Ok(ResourceClass::Archive));
    assert_eq!("cache".parse::<ResourceClass>(), Ok(ResourceClass::Cache));
    assert!("tape".parse::<ResourceClass>().is_err());
}

#[test]
fn read_rank_prefers_cache() {
    assert!(ResourceClass::Cache.read_rank() < ResourceClass::Normal.read_rank());
    assert!(ResourceClass::Normal.read_rank() < ResourceClass::Archive.read_rank());
}

#[test_case(ReplicaStatus::Current, false)]
#[test_case(ReplicaStatus::NewlyCreated, false)]
#[test_case(ReplicaStatus::OldCopy, true)]
#[test_case(ReplicaStatus::Stale, true)]
fn superseded_statuses(status: ReplicaStatus, superseded: bool) {
    assert_eq!(status.is_superseded(), superseded);
    assert_eq!(status.to_string().parse::<ReplicaStatus>(), Ok(status));
}

#[test]
fn resource_group_membership() {
    let cache = ResourceIdentity::new("cache1", "localhost", ResourceClass::Cache, "/v/c")
        .with_group("pair");
    let archive = ResourceIdentity::new("arch1", "localhost", ResourceClass::Archive, "/v/a")
        .with_group("pair");
    let plain = ResourceIdentity::new("demo", "localhost", ResourceClass::Normal, "/v/d");

    assert!(cache.same_group(&archive));
    assert!(!cache.same_group(&plain));
    assert!(cache.answers_to(&ResourceName::from("pair")));
    assert!(cache.answers_to(&ResourceName::from("cache1")));
    assert!(!plain.answers_to(&ResourceName::from("pair")));
    assert_eq!(archive.category, ResourceCategory::Structured);
}

#[test]
fn timestamp_display_pads_nanos() {
    assert_eq!(Timestamp::from_nanos(1_000_000_005).to_string(), "1.000000005");
    assert!(Timestamp::now() > Timestamp::EPOCH);
}
