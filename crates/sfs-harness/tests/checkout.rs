#![forbid(unsafe_code)]
//! Checkout engine scenarios: the commit-switch transaction, conflicts,
//! journaling, and concurrency guarantees.

use asupersync::Cx;
use sfs_error::SfsError;
use sfs_harness::two_commit_mount;
use sfs_journal::JournalDelta;
use sfs_mount::server::LogEvent;
use sfs_mount::{CheckoutMode, ConflictType};
use sfs_testkit::TestMountBuilder;
use sfs_types::{RepoPath, RootId, TreeEntryType};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn unclean(paths: &[&str]) -> BTreeSet<RepoPath> {
    paths
        .iter()
        .map(|path| RepoPath::parse(path).unwrap())
        .collect()
}

#[test]
fn init_then_checkout_moves_parent_and_journals_unclean_paths() {
    let tm = two_commit_mount().unwrap();
    let result = tm
        .mount
        .checkout(&tm.cx(), &RootId::from("R1"), None, "test", CheckoutMode::Normal)
        .unwrap();

    assert!(result.conflicts.is_empty());
    assert_eq!(tm.mount.parent_commit(), RootId::from("R1"));
    assert_eq!(tm.read_file("a").unwrap(), b"1");
    assert_eq!(tm.read_file("b").unwrap(), b"3");
    assert_eq!(tm.read_file("c").unwrap(), b"4");

    // One initial hash update plus exactly one unclean-paths entry: b was
    // rewritten by the switch, c was added and is not unclean.
    let entries = tm.journal.entries();
    assert_eq!(entries.len(), 2);
    assert_eq!(
        entries[1].delta,
        JournalDelta::UncleanPaths {
            from: RootId::from("R0"),
            to: RootId::from("R1"),
            paths: unclean(&["b"]),
        }
    );
}

#[test]
fn dry_run_reports_without_mutating() {
    let tm = two_commit_mount().unwrap();
    let result = tm
        .mount
        .checkout(&tm.cx(), &RootId::from("R1"), None, "test", CheckoutMode::DryRun)
        .unwrap();

    assert!(result.conflicts.is_empty());
    assert_eq!(tm.mount.parent_commit(), RootId::from("R0"));
    assert_eq!(tm.read_file("b").unwrap(), b"2");
    assert_eq!(tm.journal.entry_count(), 1, "journal untouched by dry run");
}

#[test]
fn concurrent_checkouts_one_wins_one_fails_fast() {
    let tm = TestMountBuilder::new()
        .commit("R0", &[("a", "1"), ("b", "2")])
        .commit("R1", &[("a", "1"), ("b", "3"), ("c", "4")])
        .commit("R2", &[("a", "9")])
        .parent("R0")
        .build();
    tm.initialize().unwrap();

    let path = tm.mount_path().display().to_string();
    let gate = tm.faults.inject_block("inodeCheckout", &path);

    let winner = {
        let mount = Arc::clone(&tm.mount);
        thread::spawn(move || {
            mount.checkout(
                &Cx::for_testing(),
                &RootId::from("R1"),
                None,
                "winner",
                CheckoutMode::Normal,
            )
        })
    };
    gate.wait_for_waiter();

    // The winner holds the parent lock; the loser must time out.
    let loser = tm.mount.checkout(
        &tm.cx(),
        &RootId::from("R2"),
        None,
        "loser",
        CheckoutMode::Normal,
    );
    assert!(matches!(loser, Err(SfsError::CheckoutInProgress)));

    gate.release();
    let result = winner.join().unwrap().unwrap();
    assert!(result.conflicts.is_empty());
    assert_eq!(tm.mount.parent_commit(), RootId::from("R1"));
}

#[test]
fn failed_checkout_leaves_parent_and_journal_untouched() {
    let tm = two_commit_mount().unwrap();
    let path = tm.mount_path().display().to_string();
    tm.faults.inject_error("inodeCheckout", &path, "disk on fire");

    let err = tm
        .mount
        .checkout(&tm.cx(), &RootId::from("R1"), None, "test", CheckoutMode::Normal)
        .unwrap_err();
    assert!(matches!(err, SfsError::InjectedFault(_)));

    assert_eq!(tm.mount.parent_commit(), RootId::from("R0"));
    assert_eq!(tm.journal.entry_count(), 1, "no checkout entry appended");
    assert_eq!(tm.read_file("b").unwrap(), b"2");

    // The parent lock was released by the rollback; a retry succeeds.
    tm.faults.remove_fault("inodeCheckout", &path);
    tm.mount
        .checkout(&tm.cx(), &RootId::from("R1"), None, "test", CheckoutMode::Normal)
        .unwrap();
    assert_eq!(tm.mount.parent_commit(), RootId::from("R1"));
}

#[test]
fn normal_mode_surfaces_conflicts_and_keeps_local_changes() {
    let tm = two_commit_mount().unwrap();
    tm.write_file("b", b"local edit").unwrap();

    let result = tm
        .mount
        .checkout(&tm.cx(), &RootId::from("R1"), None, "test", CheckoutMode::Normal)
        .unwrap();

    assert_eq!(result.conflicts.len(), 1);
    assert_eq!(result.conflicts[0].path, RepoPath::parse("b").unwrap());
    assert_eq!(
        result.conflicts[0].conflict_type,
        ConflictType::ModifiedModified
    );
    // The switch still happened; the conflicted file kept the local edit.
    assert_eq!(tm.mount.parent_commit(), RootId::from("R1"));
    assert_eq!(tm.read_file("b").unwrap(), b"local edit");
    assert_eq!(tm.read_file("c").unwrap(), b"4");
}

#[test]
fn force_mode_overrides_conflicts() {
    let tm = two_commit_mount().unwrap();
    tm.write_file("b", b"local edit").unwrap();

    let result = tm
        .mount
        .checkout(&tm.cx(), &RootId::from("R1"), None, "test", CheckoutMode::Force)
        .unwrap();

    assert_eq!(result.conflicts.len(), 1);
    assert_eq!(tm.read_file("b").unwrap(), b"3", "forced to target content");
    assert_eq!(tm.mount.parent_commit(), RootId::from("R1"));
}

#[test]
fn untracked_file_collision_is_a_conflict() {
    let tm = two_commit_mount().unwrap();
    tm.write_file("c", b"untracked").unwrap();

    let result = tm
        .mount
        .checkout(&tm.cx(), &RootId::from("R1"), None, "test", CheckoutMode::Normal)
        .unwrap();

    let conflict = result
        .conflicts
        .iter()
        .find(|conflict| conflict.path == RepoPath::parse("c").unwrap())
        .expect("conflict on c");
    assert_eq!(conflict.conflict_type, ConflictType::UntrackedAdded);
    assert_eq!(tm.read_file("c").unwrap(), b"untracked");
}

#[test]
fn locally_removed_file_modified_upstream_is_a_conflict() {
    let tm = two_commit_mount().unwrap();
    tm.unlink_file("b").unwrap();

    let result = tm
        .mount
        .checkout(&tm.cx(), &RootId::from("R1"), None, "test", CheckoutMode::Normal)
        .unwrap();

    let conflict = result
        .conflicts
        .iter()
        .find(|conflict| conflict.path == RepoPath::parse("b").unwrap())
        .expect("conflict on b");
    assert_eq!(conflict.conflict_type, ConflictType::RemovedModified);
}

#[test]
fn checkout_into_nested_trees_updates_subdirectories() {
    let tm = TestMountBuilder::new()
        .commit(
            "R0",
            &[("src/main.rs", "v1"), ("src/util/io.rs", "old"), ("doc/x", "d")],
        )
        .commit(
            "R1",
            &[("src/main.rs", "v2"), ("src/util/net.rs", "new"), ("doc/x", "d")],
        )
        .parent("R0")
        .build();
    tm.initialize().unwrap();

    let result = tm
        .mount
        .checkout(&tm.cx(), &RootId::from("R1"), None, "test", CheckoutMode::Normal)
        .unwrap();
    assert!(result.conflicts.is_empty());

    assert_eq!(tm.read_file("src/main.rs").unwrap(), b"v2");
    assert_eq!(tm.read_file("src/util/net.rs").unwrap(), b"new");
    assert!(matches!(
        tm.read_file("src/util/io.rs"),
        Err(SfsError::NotFound(_))
    ));

    // Rewritten and removed files are unclean; additions are not.
    match &tm.journal.latest().unwrap().delta {
        JournalDelta::UncleanPaths { paths, .. } => {
            assert_eq!(*paths, unclean(&["src/main.rs", "src/util/io.rs"]));
        }
        other => panic!("unexpected journal delta: {other:?}"),
    }
}

#[test]
fn checkout_updates_last_checkout_time() {
    let tm = two_commit_mount().unwrap();
    let before = tm.mount.last_checkout_time();
    tm.clock.advance(Duration::from_secs(60));

    tm.mount
        .checkout(&tm.cx(), &RootId::from("R1"), None, "test", CheckoutMode::Normal)
        .unwrap();
    assert!(tm.mount.last_checkout_time() > before);
}

#[test]
fn checkout_emits_finished_checkout_event() {
    let tm = two_commit_mount().unwrap();
    tm.mount
        .checkout(&tm.cx(), &RootId::from("R1"), None, "test", CheckoutMode::Normal)
        .unwrap();

    let events = tm.logger.events();
    let finished = events
        .iter()
        .find_map(|event| match event {
            LogEvent::FinishedCheckout {
                mode,
                success,
                trees_fetched,
                ..
            } => Some((*mode, *success, *trees_fetched)),
            LogEvent::ParentMismatch { .. } => None,
        })
        .expect("FinishedCheckout event");
    assert_eq!(finished.0, "normal");
    assert!(finished.1);
    assert!(finished.2 >= 2, "fetched both root trees");
}

#[test]
fn failed_checkout_emits_failure_event() {
    let tm = two_commit_mount().unwrap();
    let path = tm.mount_path().display().to_string();
    tm.faults.inject_error("checkout", &path, "gate closed");

    let _ = tm
        .mount
        .checkout(&tm.cx(), &RootId::from("R1"), None, "test", CheckoutMode::Normal)
        .unwrap_err();

    let failure = tm.logger.events().into_iter().find_map(|event| match event {
        LogEvent::FinishedCheckout { success, .. } => Some(success),
        LogEvent::ParentMismatch { .. } => None,
    });
    assert_eq!(failure, Some(false));
}

#[test]
fn reset_parent_round_trip() {
    let tm = two_commit_mount().unwrap();
    tm.mount.reset_parent(RootId::from("R1"));

    assert_eq!(tm.mount.parent_commit(), RootId::from("R1"));
    assert_eq!(
        tm.mount.checkout_config().parent_commit(),
        RootId::from("R1")
    );
    assert_eq!(
        tm.journal.latest().unwrap().delta,
        JournalDelta::HashUpdate {
            from: Some(RootId::from("R0")),
            to: RootId::from("R1"),
        }
    );
    // The working copy is untouched: b still has R0 content.
    assert_eq!(tm.read_file("b").unwrap(), b"2");
}

#[test]
fn checkout_to_identical_commit_journals_a_plain_hash_update() {
    let tm = TestMountBuilder::new()
        .commit("R0", &[("a", "1")])
        .commit("R1", &[("a", "1")])
        .parent("R0")
        .build();
    tm.initialize().unwrap();

    let result = tm
        .mount
        .checkout(&tm.cx(), &RootId::from("R1"), None, "test", CheckoutMode::Normal)
        .unwrap();
    assert!(result.conflicts.is_empty());

    // No file content changed, so the single appended entry degrades to a
    // hash update.
    let entries = tm.journal.entries();
    assert_eq!(entries.len(), 2);
    assert_eq!(
        entries[1].delta,
        JournalDelta::HashUpdate {
            from: Some(RootId::from("R0")),
            to: RootId::from("R1"),
        }
    );
}

#[test]
fn set_path_object_id_grafts_a_tree_without_moving_parent() {
    let tm = TestMountBuilder::new()
        .commit("R0", &[("a", "1")])
        .commit("EXTRA", &[("lib.rs", "graft")])
        .parent("R0")
        .build();
    tm.initialize().unwrap();

    let conflicts = tm
        .mount
        .set_path_object_id(
            &tm.cx(),
            &RepoPath::parse("third_party/widget").unwrap(),
            &RootId::from("EXTRA"),
            TreeEntryType::Tree,
            CheckoutMode::Normal,
        )
        .unwrap();
    assert!(conflicts.is_empty());

    assert_eq!(
        tm.read_file("third_party/widget/lib.rs").unwrap(),
        b"graft"
    );
    assert_eq!(tm.mount.parent_commit(), RootId::from("R0"));
    assert_eq!(tm.journal.entry_count(), 1, "no journal entry for grafts");
}

#[test]
fn set_path_object_id_rejects_symlink_objects() {
    let tm = two_commit_mount().unwrap();
    let err = tm
        .mount
        .set_path_object_id(
            &tm.cx(),
            &RepoPath::parse("x").unwrap(),
            &RootId::from("R1"),
            TreeEntryType::Symlink,
            CheckoutMode::Normal,
        )
        .unwrap_err();
    assert!(matches!(err, SfsError::Store(_)));
}
