#![forbid(unsafe_code)]
//! Control directory scenarios: symlink materialization, repair, and the
//! post-setup modification lock.

use sfs_error::SfsError;
use sfs_harness::simple_mount;
use sfs_store::FetchContext;
use sfs_testkit::{TestMount, TestMountBuilder};

fn readlink(tm: &TestMount, path: &str) -> String {
    let fetch = FetchContext::new("test");
    let inode = tm.inode(path).unwrap();
    inode
        .as_file()
        .expect("control entries are files")
        .readlink(&tm.cx(), &fetch)
        .unwrap()
}

#[test]
fn setup_creates_all_four_symlinks() {
    let tm = simple_mount(&[("a", "1")]).unwrap();
    let mount_path = tm.mount_path();

    assert_eq!(
        readlink(&tm, ".snapfs/this-dir"),
        mount_path.join(".snapfs").display().to_string()
    );
    assert_eq!(
        readlink(&tm, ".snapfs/root"),
        mount_path.display().to_string()
    );
    assert_eq!(
        readlink(&tm, ".snapfs/socket"),
        tm.mount
            .checkout_config()
            .mount_path
            .parent()
            .unwrap()
            .join("server.sock")
            .display()
            .to_string()
    );
    assert_eq!(
        readlink(&tm, ".snapfs/client"),
        tm.mount
            .checkout_config()
            .client_directory
            .display()
            .to_string()
    );
}

#[test]
fn setup_records_the_control_inode_last() {
    let tm = simple_mount(&[("a", "1")]).unwrap();
    let control = tm.inode(".snapfs").unwrap();
    assert_eq!(
        tm.mount.control_dir_inode_number(),
        Some(control.number())
    );
}

#[test]
fn control_directory_rejects_modification_after_setup() {
    let tm = simple_mount(&[("a", "1")]).unwrap();
    let cx = tm.cx();
    let control = tm.inode(".snapfs").unwrap();
    let control = control.as_tree().unwrap();

    let err = control
        .mkdir(&cx, &TestMount::component("subdir"))
        .unwrap_err();
    assert_eq!(err, SfsError::ProtectedDirectory);
    let err = control.unlink(&cx, "root").unwrap_err();
    assert_eq!(err, SfsError::ProtectedDirectory);
}

#[test]
fn wrong_symlink_contents_are_repaired() {
    // The commit ships a stale control directory: `root` is a plain file
    // and `socket` is a symlink pointing somewhere wrong.
    let tm = TestMountBuilder::new()
        .commit_with("R0", |builder| {
            builder
                .file("a", "1")
                .file(".snapfs/root", "stale garbage")
                .symlink(".snapfs/socket", "/nowhere/else")
        })
        .parent("R0")
        .build();
    tm.initialize().unwrap();

    let mount_path = tm.mount_path();
    assert_eq!(
        readlink(&tm, ".snapfs/root"),
        mount_path.display().to_string()
    );
    let socket_target = readlink(&tm, ".snapfs/socket");
    assert_ne!(socket_target, "/nowhere/else");
    assert!(socket_target.ends_with("server.sock"));

    // The other two were created from scratch.
    assert_eq!(
        readlink(&tm, ".snapfs/this-dir"),
        mount_path.join(".snapfs").display().to_string()
    );
    assert!(tm.inode(".snapfs/client").is_ok());
}

#[test]
fn directory_in_place_of_symlink_is_left_alone() {
    let tm = TestMountBuilder::new()
        .commit_with("R0", |builder| {
            builder.file("a", "1").file(".snapfs/client/nested", "keep me")
        })
        .parent("R0")
        .build();
    // Setup logs the problem and continues; the mount still comes up.
    tm.initialize().unwrap();

    let client = tm.inode(".snapfs/client").unwrap();
    assert!(client.as_tree().is_some(), "directory was not replaced");
    assert_eq!(tm.read_file(".snapfs/client/nested").unwrap(), b"keep me");

    // The rest of the control directory is intact and locked.
    assert!(tm.inode(".snapfs/root").is_ok());
    assert!(tm.mount.control_dir_inode_number().is_some());
}

#[test]
fn committed_symlink_with_correct_target_is_kept() {
    // A commit can already carry a correct control symlink; setup leaves
    // it alone instead of churning the inode.
    let tm = TestMountBuilder::new()
        .commit("R0", &[("a", "1")])
        .parent("R0")
        .build();
    tm.initialize().unwrap();

    let before = tm.inode(".snapfs/root").unwrap().number();
    let target = readlink(&tm, ".snapfs/root");
    assert_eq!(target, tm.mount_path().display().to_string());
    assert_eq!(tm.inode(".snapfs/root").unwrap().number(), before);
}
