//! Symlink resolution and race-tolerant directory creation.

use crate::SnapMount;
use asupersync::Cx;
use sfs_error::{Result, SfsError};
use sfs_inode::{InodePtr, TreeInode};
use sfs_store::FetchContext;
use sfs_types::{join_and_normalize, RepoPath};
use std::sync::Arc;
use tracing::trace;

/// Longest symlink chain followed before giving up with `ELOOP`.
pub const MAX_SYMLINK_CHAIN_DEPTH: usize = 40;

impl SnapMount {
    /// Follow `inode` through any chain of symlinks to a non-symlink inode.
    ///
    /// Fails with `Loop` past [`MAX_SYMLINK_CHAIN_DEPTH`] hops, with an
    /// `ENOENT`-mapped error if the inode has been unlinked, and with the
    /// normalization error if a target leaves the mount.
    pub fn resolve_symlink(
        &self,
        cx: &Cx,
        inode: InodePtr,
        fetch: &FetchContext,
    ) -> Result<InodePtr> {
        let mut current = inode;
        let mut path = current
            .path()
            .ok_or_else(|| SfsError::Unlinked(current.number()))?;
        let mut depth = 0_usize;

        loop {
            let file = match &current {
                InodePtr::Tree(_) => return Ok(current),
                InodePtr::File(file) if !file.kind().is_symlink() => return Ok(current),
                InodePtr::File(file) => Arc::clone(file),
            };
            depth += 1;
            if depth > MAX_SYMLINK_CHAIN_DEPTH {
                return Err(SfsError::Loop(path));
            }

            let target = file.readlink(cx, fetch)?;
            let joined = join_and_normalize(&path.dirname(), &target)?;
            trace!(%path, target, resolved = %joined, "following symlink");

            let root = self.root_inode()?;
            current = root.get_child_recursive(cx, &joined, fetch)?;
            path = joined;
        }
    }

    /// Guarantee every component of `path` exists as a directory, creating
    /// what's missing, and return the final directory inode.
    ///
    /// Losing a `mkdir` race to a concurrent creator restarts that
    /// component, so concurrent callers all succeed and agree on the
    /// resulting inode. A non-directory in the way fails with an
    /// `EEXIST`-mapped error.
    pub fn ensure_directory_exists(
        &self,
        cx: &Cx,
        path: &RepoPath,
    ) -> Result<Arc<TreeInode>> {
        let fetch = FetchContext::new("ensure_directory_exists");
        let mut current = self.root_inode()?;
        let mut remaining = path.clone();

        while let Some((component, rest)) = remaining.split_first() {
            loop {
                cx.checkpoint().map_err(|_| SfsError::Cancelled)?;
                if let Some(existing) =
                    current.lookup(component.as_str(), self.config.case_sensitive)
                {
                    if !existing.kind.is_tree() {
                        return Err(SfsError::AlreadyExists(
                            current
                                .path()
                                .unwrap_or_else(RepoPath::root)
                                .join(&component),
                        ));
                    }
                    current = current.get_or_load_child_tree(cx, component.as_str(), &fetch)?;
                    break;
                }
                match current.mkdir(cx, &component) {
                    Ok(child) => {
                        current = child;
                        break;
                    }
                    // Lost the race to a concurrent creator; look again.
                    Err(SfsError::AlreadyExists(_)) => continue,
                    Err(err) => return Err(err),
                }
            }
            remaining = rest;
        }
        Ok(current)
    }
}
