//! The `.snapfs` control directory.
//!
//! Every mount exposes a small directory of symlinks applications use to
//! find the mount, its client directory, and the server socket. Setup is
//! best-effort per symlink: a broken entry is repaired, an unexpected
//! directory is left alone, and failures are logged without failing the
//! mount. Once all entries are in place the directory's inode number is
//! recorded, which locks it against further modification.

use crate::SnapMount;
use asupersync::Cx;
use sfs_error::{Result, SfsError};
use sfs_inode::{InodePtr, TreeInode};
use sfs_store::FetchContext;
use sfs_types::PathComponent;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error};

/// Name of the control directory at the mount root.
pub const CONTROL_DIR_NAME: &str = ".snapfs";

// The kernel does not tolerate hard-linked directories, so the control
// directory is reached through a symlink that resolves to its own inode.
const THIS_DIR_LINK: &str = "this-dir";
const ROOT_LINK: &str = "root";
const SOCKET_LINK: &str = "socket";
const CLIENT_LINK: &str = "client";

pub(crate) fn setup_control_dir(mount: &Arc<SnapMount>, cx: &Cx) -> Result<()> {
    let fetch = FetchContext::new("setup_control_dir");
    let root = mount.root_inode()?;

    let control_dir = match root.get_or_load_child_tree(cx, CONTROL_DIR_NAME, &fetch) {
        Ok(dir) => dir,
        Err(SfsError::NotFound(_)) => {
            let name = PathComponent::new(CONTROL_DIR_NAME).expect("static name is valid");
            root.mkdir(cx, &name)?
        }
        Err(err) => return Err(err),
    };

    let mount_path = &mount.config.mount_path;
    let links: [(&str, PathBuf); 4] = [
        (THIS_DIR_LINK, mount_path.join(CONTROL_DIR_NAME)),
        (ROOT_LINK, mount_path.clone()),
        (SOCKET_LINK, mount.server_state.socket_path.clone()),
        (CLIENT_LINK, mount.config.client_directory.clone()),
    ];
    for (name, target) in links {
        let target = target.display().to_string();
        // Failures here must not block the mount; log and keep going.
        if let Err(err) = ensure_control_symlink(cx, &control_dir, name, &target) {
            error!(
                link = name,
                error = %err,
                "error setting up control directory symlink"
            );
        }
    }

    // Recorded only after every symlink is in place: from this point the
    // inode layer refuses modifications to the control directory.
    mount.record_control_dir(control_dir.number());
    debug!(ino = %control_dir.number(), "control directory ready");
    Ok(())
}

fn ensure_control_symlink(
    cx: &Cx,
    dir: &Arc<TreeInode>,
    name: &str,
    target: &str,
) -> Result<()> {
    let fetch = FetchContext::new("control_symlink");
    let component = PathComponent::new(name)?;

    match dir.get_or_load_child(cx, name, &fetch) {
        Err(SfsError::NotFound(_)) => {
            dir.symlink(cx, &component, target)?;
        }
        Err(err) => return Err(err),
        Ok(InodePtr::Tree(_)) => {
            // Replacing a directory is more destructive than a stale
            // control entry; leave it and move on.
            error!(link = name, "a directory exists at this location");
        }
        Ok(InodePtr::File(file)) => {
            if file.kind().is_symlink() && file.readlink(cx, &fetch)? == target {
                return Ok(());
            }
            dir.unlink(cx, name)?;
            dir.symlink(cx, &component, target)?;
        }
    }
    Ok(())
}
