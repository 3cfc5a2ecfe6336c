#![forbid(unsafe_code)]
//! Symlink resolution and directory-ensuring scenarios.

use asupersync::Cx;
use sfs_error::SfsError;
use sfs_harness::simple_mount;
use sfs_store::FetchContext;
use sfs_testkit::TestMountBuilder;
use sfs_types::RepoPath;
use std::sync::Arc;
use std::thread;

#[test]
fn resolve_returns_non_symlinks_unchanged() {
    let tm = simple_mount(&[("a", "payload")]).unwrap();
    let fetch = FetchContext::new("test");
    let inode = tm.inode("a").unwrap();
    let resolved = tm
        .mount
        .resolve_symlink(&tm.cx(), inode.clone(), &fetch)
        .unwrap();
    assert_eq!(resolved.number(), inode.number());
}

#[test]
fn resolve_follows_chains_to_the_target() {
    let tm = TestMountBuilder::new()
        .commit_with("R0", |builder| {
            builder
                .file("data/real", "the goods")
                .symlink("one", "data/real")
                .symlink("two", "one")
        })
        .parent("R0")
        .build();
    tm.initialize().unwrap();

    let fetch = FetchContext::new("test");
    let resolved = tm
        .mount
        .resolve_symlink(&tm.cx(), tm.inode("two").unwrap(), &fetch)
        .unwrap();
    assert_eq!(
        resolved.path().unwrap(),
        RepoPath::parse("data/real").unwrap()
    );

    // Transparent resolution through the content loader too.
    assert_eq!(tm.read_file("two").unwrap(), b"the goods");
}

#[test]
fn relative_targets_resolve_against_the_link_directory() {
    let tm = TestMountBuilder::new()
        .commit_with("R0", |builder| {
            builder
                .file("lib/core.rs", "core")
                .symlink("lib/alias.rs", "./core.rs")
                .symlink("top.rs", "lib/../lib/core.rs")
        })
        .parent("R0")
        .build();
    tm.initialize().unwrap();

    assert_eq!(tm.read_file("lib/alias.rs").unwrap(), b"core");
    assert_eq!(tm.read_file("top.rs").unwrap(), b"core");
}

#[test]
fn symlink_loop_fails_with_eloop() {
    let tm = TestMountBuilder::new()
        .commit_with("R0", |builder| {
            builder.symlink("a", "b").symlink("b", "a")
        })
        .parent("R0")
        .build();
    tm.initialize().unwrap();
    let fetch = FetchContext::new("test");

    for name in ["a", "b"] {
        let err = tm
            .mount
            .resolve_symlink(&tm.cx(), tm.inode(name).unwrap(), &fetch)
            .unwrap_err();
        assert!(matches!(err, SfsError::Loop(_)), "{name}: {err}");
        assert_eq!(err.to_errno(), libc::ELOOP);
    }
}

#[test]
fn chain_of_forty_resolves_but_forty_one_loops() {
    let mut tm_builder = TestMountBuilder::new();
    tm_builder = tm_builder.commit_with("R0", |mut builder| {
        builder = builder.file("target", "end");
        // link0 → link1 → ... → link40 → target: 41 symlink hops.
        for hop in 0..41 {
            let name = format!("link{hop}");
            let next = if hop == 40 {
                "target".to_owned()
            } else {
                format!("link{}", hop + 1)
            };
            builder = builder.symlink(&name, &next);
        }
        builder
    });
    let tm = tm_builder.parent("R0").build();
    tm.initialize().unwrap();
    let fetch = FetchContext::new("test");

    // From link1 the chain is exactly 40 hops: resolvable.
    let ok = tm
        .mount
        .resolve_symlink(&tm.cx(), tm.inode("link1").unwrap(), &fetch)
        .unwrap();
    assert_eq!(ok.path().unwrap(), RepoPath::parse("target").unwrap());

    // From link0 it is 41: one too many.
    let err = tm
        .mount
        .resolve_symlink(&tm.cx(), tm.inode("link0").unwrap(), &fetch)
        .unwrap_err();
    assert!(matches!(err, SfsError::Loop(_)));
}

#[test]
fn unlinked_inode_cannot_be_resolved() {
    let tm = TestMountBuilder::new()
        .commit_with("R0", |builder| builder.symlink("link", "gone"))
        .parent("R0")
        .build();
    tm.initialize().unwrap();
    let fetch = FetchContext::new("test");

    let inode = tm.inode("link").unwrap();
    tm.unlink_file("link").unwrap();
    let err = tm
        .mount
        .resolve_symlink(&tm.cx(), inode, &fetch)
        .unwrap_err();
    assert_eq!(err.to_errno(), libc::ENOENT);
}

#[test]
fn escaping_symlink_target_is_rejected() {
    let tm = TestMountBuilder::new()
        .commit_with("R0", |builder| builder.symlink("out", "../../etc/passwd"))
        .parent("R0")
        .build();
    tm.initialize().unwrap();
    let fetch = FetchContext::new("test");

    let err = tm
        .mount
        .resolve_symlink(&tm.cx(), tm.inode("out").unwrap(), &fetch)
        .unwrap_err();
    assert_eq!(err.to_errno(), libc::EXDEV);
}

#[test]
fn ensure_directory_exists_builds_the_chain() {
    let tm = simple_mount(&[("a", "1")]).unwrap();
    let cx = tm.cx();
    let path = RepoPath::parse("x/y/z").unwrap();

    let dir = tm.mount.ensure_directory_exists(&cx, &path).unwrap();
    assert_eq!(dir.path().unwrap(), path);

    // Idempotent: a second call lands on the same inode.
    let again = tm.mount.ensure_directory_exists(&cx, &path).unwrap();
    assert_eq!(again.number(), dir.number());
}

#[test]
fn ensure_directory_exists_over_a_file_is_eexist() {
    let tm = simple_mount(&[("a", "1")]).unwrap();
    let err = tm
        .mount
        .ensure_directory_exists(&tm.cx(), &RepoPath::parse("a/b").unwrap())
        .unwrap_err();
    assert!(matches!(err, SfsError::AlreadyExists(_)));
    assert_eq!(err.to_errno(), libc::EEXIST);
}

#[test]
fn ensure_directory_exists_descends_committed_trees() {
    let tm = simple_mount(&[("src/deep/file", "1")]).unwrap();
    let dir = tm
        .mount
        .ensure_directory_exists(&tm.cx(), &RepoPath::parse("src/deep/newer").unwrap())
        .unwrap();
    assert_eq!(dir.path().unwrap(), RepoPath::parse("src/deep/newer").unwrap());
    // The pre-existing file is still reachable.
    assert_eq!(tm.read_file("src/deep/file").unwrap(), b"1");
}

#[test]
fn concurrent_ensure_directory_calls_agree() {
    let tm = Arc::new(simple_mount(&[("a", "1")]).unwrap());
    let path = RepoPath::parse("x/y/z").unwrap();

    let mut handles = Vec::new();
    for _ in 0..16 {
        let tm = Arc::clone(&tm);
        let path = path.clone();
        handles.push(thread::spawn(move || {
            tm.mount
                .ensure_directory_exists(&Cx::for_testing(), &path)
                .map(|dir| dir.number())
        }));
    }
    let numbers: Vec<_> = handles
        .into_iter()
        .map(|handle| handle.join().unwrap().unwrap())
        .collect();

    // Everyone succeeded and agreed on the final inode.
    assert!(numbers.windows(2).all(|pair| pair[0] == pair[1]));

    // Exactly one x, one y, one z exist.
    let root = tm.mount.inode_map().get_root_inode().unwrap();
    let x_entries: Vec<_> = root
        .entry_summaries()
        .into_iter()
        .filter(|entry| entry.name == "x")
        .collect();
    assert_eq!(x_entries.len(), 1);
    let x = tm.inode("x").unwrap();
    let x = x.as_tree().unwrap();
    assert_eq!(x.entry_summaries().len(), 1);
    let y = tm.inode("x/y").unwrap();
    let y = y.as_tree().unwrap();
    assert_eq!(y.entry_summaries().len(), 1);
}
