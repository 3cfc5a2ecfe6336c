#![forbid(unsafe_code)]
//! Diff engine scenarios: status streaming, ignore handling, and parent
//! enforcement.

use sfs_error::SfsError;
use sfs_harness::simple_mount;
use sfs_mount::diff::{GitIgnoreStack, StatusCode, StatusCollector};
use sfs_mount::server::LogEvent;
use sfs_testkit::TestMountBuilder;
use sfs_types::{RepoPath, RootId};

fn path(p: &str) -> RepoPath {
    RepoPath::parse(p).unwrap()
}

#[test]
fn clean_working_copy_diffs_empty_apart_from_control_dir() {
    let tm = simple_mount(&[("a", "1"), ("sub/b", "2")]).unwrap();
    let collector = StatusCollector::new();
    tm.mount
        .diff(&tm.cx(), &collector, &RootId::from("R0"), false, false)
        .unwrap();

    let status = collector.status();
    // The control directory is the only untracked content.
    assert!(status
        .keys()
        .all(|p| p.as_str().starts_with(".snapfs/")));
    assert!(status.values().all(|code| *code == StatusCode::Added));
}

#[test]
fn diff_reports_added_removed_modified() {
    let tm = simple_mount(&[("a", "1"), ("sub/b", "2"), ("sub/c", "3")]).unwrap();
    tm.write_file("a", b"changed").unwrap();
    tm.write_file("new.txt", b"fresh").unwrap();
    tm.unlink_file("sub/b").unwrap();

    let collector = StatusCollector::new();
    tm.mount
        .diff(&tm.cx(), &collector, &RootId::from("R0"), false, false)
        .unwrap();
    let status = collector.status();

    assert_eq!(status.get(&path("a")), Some(&StatusCode::Modified));
    assert_eq!(status.get(&path("new.txt")), Some(&StatusCode::Added));
    assert_eq!(status.get(&path("sub/b")), Some(&StatusCode::Removed));
    assert_eq!(status.get(&path("sub/c")), None, "untouched file is clean");
}

#[test]
fn materialized_but_identical_content_is_clean() {
    let tm = simple_mount(&[("a", "same")]).unwrap();
    // Rewrite with identical bytes: materialized, but content-equal.
    tm.write_file("a", b"same").unwrap();

    let collector = StatusCollector::new();
    tm.mount
        .diff(&tm.cx(), &collector, &RootId::from("R0"), false, false)
        .unwrap();
    assert_eq!(collector.status().get(&path("a")), None);
}

#[test]
fn ignored_files_are_reported_only_when_listed() {
    let tm = TestMountBuilder::new()
        .commit("R0", &[("a", "1")])
        .parent("R0")
        .ignores(GitIgnoreStack::from_lines(["*.tmp"]))
        .build();
    tm.initialize().unwrap();
    tm.write_file("scratch.tmp", b"junk").unwrap();

    let collector = StatusCollector::new();
    tm.mount
        .diff(&tm.cx(), &collector, &RootId::from("R0"), true, false)
        .unwrap();
    assert_eq!(
        collector.status().get(&path("scratch.tmp")),
        Some(&StatusCode::Ignored)
    );

    let quiet = StatusCollector::new();
    tm.mount
        .diff(&tm.cx(), &quiet, &RootId::from("R0"), false, false)
        .unwrap();
    assert_eq!(quiet.status().get(&path("scratch.tmp")), None);
}

#[test]
fn enforced_parent_mismatch_fails_and_logs() {
    let tm = TestMountBuilder::new()
        .commit("R0", &[("a", "1")])
        .commit("R1", &[("a", "2")])
        .parent("R0")
        .build();
    tm.initialize().unwrap();

    let collector = StatusCollector::new();
    let err = tm
        .mount
        .diff(&tm.cx(), &collector, &RootId::from("R1"), false, true)
        .unwrap_err();
    match err {
        SfsError::OutOfDateParent { requested, actual } => {
            assert_eq!(requested, "R1");
            assert_eq!(actual, "R0");
        }
        other => panic!("unexpected error: {other}"),
    }

    assert!(tm.logger.events().iter().any(|event| matches!(
        event,
        LogEvent::ParentMismatch { expected, actual }
            if expected == "R1" && actual == "R0"
    )));
}

#[test]
fn enforced_parent_match_diffs_normally() {
    let tm = simple_mount(&[("a", "1")]).unwrap();
    tm.write_file("a", b"dirty").unwrap();

    let collector = StatusCollector::new();
    tm.mount
        .diff(&tm.cx(), &collector, &RootId::from("R0"), false, true)
        .unwrap();
    assert_eq!(collector.status().get(&path("a")), Some(&StatusCode::Modified));
}

#[test]
fn type_change_reports_removed_and_added() {
    let tm = simple_mount(&[("thing", "file content")]).unwrap();
    tm.unlink_file("thing").unwrap();
    let cx = tm.cx();
    tm.mount
        .ensure_directory_exists(&cx, &path("thing"))
        .unwrap();
    tm.write_file("thing/inner", b"x").unwrap();

    let collector = StatusCollector::new();
    tm.mount
        .diff(&cx, &collector, &RootId::from("R0"), false, false)
        .unwrap();
    let status = collector.status();
    assert_eq!(status.get(&path("thing")), Some(&StatusCode::Removed));
    assert_eq!(status.get(&path("thing/inner")), Some(&StatusCode::Added));
}
