//! The checkout engine: switching a mount from one parent commit to another.
//!
//! A checkout is a multi-phase transaction. The parent-commit writer lock is
//! held for the whole operation (bounded acquire so a second checkout fails
//! fast), the rename lock is taken after the diff phase, and a mid-flight
//! failure leaves the parent commit untouched.

use crate::diff::{
    diff_working_copy, DiffCallback, DiffContext, GitIgnoreStack, JournalDiffCallback,
};
use crate::server::LogEvent;
use crate::SnapMount;
use asupersync::Cx;
use sfs_error::{Result, SfsError};
use sfs_inode::{EntrySummary, InodePtr, TreeInode};
use sfs_store::{FetchContext, FetchStatistics, ObjectStore, Tree, TreeEntry};
use sfs_types::{ObjectId, PathComponent, RepoPath, RootId, SnapTimestamp, TreeEntryType};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Bounded acquire for the parent-commit lock; a timeout means another
/// checkout holds it.
pub(crate) const PARENT_LOCK_TIMEOUT: Duration = Duration::from_millis(500);

// ── Modes, conflicts, timing ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckoutMode {
    /// Report conflicts without mutating anything.
    DryRun,
    /// Apply the switch; conflicted paths keep their local state.
    Normal,
    /// Apply the switch, overriding conflicts with the target state.
    Force,
}

impl CheckoutMode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::DryRun => "dry_run",
            Self::Normal => "normal",
            Self::Force => "force",
        }
    }

    fn is_dry_run(self) -> bool {
        matches!(self, Self::DryRun)
    }

    fn is_force(self) -> bool {
        matches!(self, Self::Force)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictType {
    /// An untracked local file collides with an entry the target adds.
    UntrackedAdded,
    /// Removed locally while the target modifies it.
    RemovedModified,
    /// Removed locally and removed by the target.
    MissingRemoved,
    /// Modified locally while the target removes it.
    ModifiedRemoved,
    /// Modified locally while the target modifies it.
    ModifiedModified,
    /// A locally modified directory stands where the target wants a file.
    DirectoryNotEmpty,
}

impl fmt::Display for ConflictType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::UntrackedAdded => "UNTRACKED_ADDED",
            Self::RemovedModified => "REMOVED_MODIFIED",
            Self::MissingRemoved => "MISSING_REMOVED",
            Self::ModifiedRemoved => "MODIFIED_REMOVED",
            Self::ModifiedModified => "MODIFIED_MODIFIED",
            Self::DirectoryNotEmpty => "DIRECTORY_NOT_EMPTY",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckoutConflict {
    pub path: RepoPath,
    pub conflict_type: ConflictType,
}

/// Stopwatch splits for each checkout phase.
#[derive(Debug, Clone, Copy, Default)]
pub struct CheckoutTimes {
    pub did_acquire_parent_lock: Duration,
    pub did_lookup_trees: Duration,
    pub did_diff: Duration,
    pub did_acquire_rename_lock: Duration,
    pub did_checkout: Duration,
    pub did_finish: Duration,
}

#[derive(Debug, Clone)]
pub struct CheckoutResult {
    pub conflicts: Vec<CheckoutConflict>,
    pub times: CheckoutTimes,
    pub fetch_stats: FetchStatistics,
}

// ── Apply engine ────────────────────────────────────────────────────────────

struct ApplyContext<'a> {
    mode: CheckoutMode,
    store: Arc<dyn ObjectStore>,
    fetch: &'a FetchContext,
    /// Collects the paths the apply phase itself modifies or removes;
    /// `None` for dry runs.
    recorder: Option<&'a JournalDiffCallback>,
}

impl ApplyContext<'_> {
    fn record_modified(&self, path: &RepoPath) {
        if let Some(recorder) = self.recorder {
            recorder.modified_file(path);
        }
    }

    fn record_removed(&self, path: &RepoPath) {
        if let Some(recorder) = self.recorder {
            recorder.removed_file(path);
        }
    }
}

fn join_name(path: &RepoPath, name: &str) -> Option<RepoPath> {
    PathComponent::new(name)
        .ok()
        .map(|component| path.join(&component))
}

fn entry_clean(summary: &EntrySummary, entry: &TreeEntry) -> bool {
    summary.id == Some(entry.id) && summary.kind == entry.kind
}

/// Record every file under `tree_id` as removed.
fn record_tree_removed(
    cx: &Cx,
    actx: &ApplyContext<'_>,
    path: &RepoPath,
    tree_id: ObjectId,
) -> Result<()> {
    if actx.recorder.is_none() {
        return Ok(());
    }
    let tree = actx.store.get_tree(cx, &tree_id, actx.fetch)?;
    for (name, entry) in tree.entries() {
        let Some(child_path) = join_name(path, name) else { continue };
        if entry.kind.is_tree() {
            record_tree_removed(cx, actx, &child_path, entry.id)?;
        } else {
            actx.record_removed(&child_path);
        }
    }
    Ok(())
}

/// Record the per-file changes of an old→new subtree swap: modifications
/// and removals count, additions do not.
fn record_tree_to_tree(
    cx: &Cx,
    actx: &ApplyContext<'_>,
    path: &RepoPath,
    old_id: ObjectId,
    new_id: ObjectId,
) -> Result<()> {
    if actx.recorder.is_none() || old_id == new_id {
        return Ok(());
    }
    let old_tree = actx.store.get_tree(cx, &old_id, actx.fetch)?;
    let new_tree = actx.store.get_tree(cx, &new_id, actx.fetch)?;

    let mut names: BTreeSet<String> =
        old_tree.entries().map(|(name, _)| name.to_owned()).collect();
    names.extend(new_tree.entries().map(|(name, _)| name.to_owned()));

    for name in names {
        let Some(child_path) = join_name(path, &name) else { continue };
        match (old_tree.get(&name), new_tree.get(&name)) {
            (Some(old), None) => {
                if old.kind.is_tree() {
                    record_tree_removed(cx, actx, &child_path, old.id)?;
                } else {
                    actx.record_removed(&child_path);
                }
            }
            (Some(old), Some(new)) if old != new => {
                match (old.kind.is_tree(), new.kind.is_tree()) {
                    (true, true) => {
                        record_tree_to_tree(cx, actx, &child_path, old.id, new.id)?;
                    }
                    (true, false) => {
                        record_tree_removed(cx, actx, &child_path, old.id)?;
                    }
                    (false, true) => actx.record_removed(&child_path),
                    (false, false) => actx.record_modified(&child_path),
                }
            }
            _ => {}
        }
    }
    Ok(())
}

/// Apply the `from → to` switch to one directory, accumulating conflicts.
fn apply_tree(
    cx: &Cx,
    actx: &ApplyContext<'_>,
    dir: &Arc<TreeInode>,
    from: Option<&Tree>,
    to: &Tree,
    path: &RepoPath,
    conflicts: &mut Vec<CheckoutConflict>,
) -> Result<()> {
    cx.checkpoint().map_err(|_| SfsError::Cancelled)?;

    let mut names: BTreeSet<String> = to.entries().map(|(name, _)| name.to_owned()).collect();
    if let Some(from) = from {
        names.extend(from.entries().map(|(name, _)| name.to_owned()));
    }

    for name in names {
        let old = from.and_then(|tree| tree.get(&name));
        let new = to.get(&name);
        if let (Some(old), Some(new)) = (old, new) {
            if old == new {
                continue;
            }
        }
        let Some(child_path) = join_name(path, &name) else { continue };
        let local = dir.lookup(&name, true);
        apply_entry(cx, actx, dir, &name, &child_path, old, new, local, conflicts)?;
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn apply_entry(
    cx: &Cx,
    actx: &ApplyContext<'_>,
    dir: &Arc<TreeInode>,
    name: &str,
    path: &RepoPath,
    old: Option<&TreeEntry>,
    new: Option<&TreeEntry>,
    local: Option<EntrySummary>,
    conflicts: &mut Vec<CheckoutConflict>,
) -> Result<()> {
    let dry = actx.mode.is_dry_run();
    let force = actx.mode.is_force();

    match (old, new) {
        // Removed by the target.
        (Some(old), None) => match local {
            None => conflicts.push(CheckoutConflict {
                path: path.clone(),
                conflict_type: ConflictType::MissingRemoved,
            }),
            Some(local) if entry_clean(&local, old) => {
                if !dry {
                    remove_recorded(cx, actx, dir, name, path, old)?;
                }
            }
            Some(_) => {
                conflicts.push(CheckoutConflict {
                    path: path.clone(),
                    conflict_type: ConflictType::ModifiedRemoved,
                });
                if force && !dry {
                    remove_recorded(cx, actx, dir, name, path, old)?;
                }
            }
        },

        // Added by the target.
        (None, Some(new)) => match local {
            None => {
                if !dry {
                    dir.checkout_set_entry(name, new.kind, new.id)?;
                }
            }
            Some(local) if entry_clean(&local, new) => {}
            Some(_) => {
                conflicts.push(CheckoutConflict {
                    path: path.clone(),
                    conflict_type: ConflictType::UntrackedAdded,
                });
                if force && !dry {
                    dir.checkout_set_entry(name, new.kind, new.id)?;
                    actx.record_modified(path);
                }
            }
        },

        // Changed by the target.
        (Some(old), Some(new)) => match local {
            None => {
                conflicts.push(CheckoutConflict {
                    path: path.clone(),
                    conflict_type: ConflictType::RemovedModified,
                });
                if force && !dry {
                    dir.checkout_set_entry(name, new.kind, new.id)?;
                }
            }
            Some(local) => {
                if old.kind.is_tree() && new.kind.is_tree() && local.kind.is_tree() {
                    return apply_dir_to_dir(
                        cx, actx, dir, name, path, old, new, &local, conflicts,
                    );
                }
                if entry_clean(&local, old) {
                    if !dry {
                        replace_clean_entry(cx, actx, dir, name, path, old, new)?;
                    }
                } else {
                    let conflict_type = if local.kind.is_tree() && !new.kind.is_tree() {
                        ConflictType::DirectoryNotEmpty
                    } else {
                        ConflictType::ModifiedModified
                    };
                    conflicts.push(CheckoutConflict {
                        path: path.clone(),
                        conflict_type,
                    });
                    if force && !dry {
                        if old.kind.is_tree() {
                            record_tree_removed(cx, actx, path, old.id)?;
                        } else {
                            actx.record_modified(path);
                        }
                        dir.checkout_set_entry(name, new.kind, new.id)?;
                    }
                }
            }
        },

        (None, None) => unreachable!("name came from one of the two trees"),
    }
    Ok(())
}

fn remove_recorded(
    cx: &Cx,
    actx: &ApplyContext<'_>,
    dir: &Arc<TreeInode>,
    name: &str,
    path: &RepoPath,
    old: &TreeEntry,
) -> Result<()> {
    if old.kind.is_tree() {
        record_tree_removed(cx, actx, path, old.id)?;
    } else {
        actx.record_removed(path);
    }
    dir.checkout_remove_entry(name)
}

/// The local entry is clean with respect to `old`; move it to `new`,
/// recording what changed.
fn replace_clean_entry(
    cx: &Cx,
    actx: &ApplyContext<'_>,
    dir: &Arc<TreeInode>,
    name: &str,
    path: &RepoPath,
    old: &TreeEntry,
    new: &TreeEntry,
) -> Result<()> {
    match (old.kind.is_tree(), new.kind.is_tree()) {
        (true, false) => record_tree_removed(cx, actx, path, old.id)?,
        (false, true) => actx.record_removed(path),
        (false, false) => actx.record_modified(path),
        (true, true) => unreachable!("tree-to-tree handled by apply_dir_to_dir"),
    }
    dir.checkout_set_entry(name, new.kind, new.id)
}

#[allow(clippy::too_many_arguments)]
fn apply_dir_to_dir(
    cx: &Cx,
    actx: &ApplyContext<'_>,
    parent: &Arc<TreeInode>,
    name: &str,
    path: &RepoPath,
    old: &TreeEntry,
    new: &TreeEntry,
    local: &EntrySummary,
    conflicts: &mut Vec<CheckoutConflict>,
) -> Result<()> {
    let dry = actx.mode.is_dry_run();

    // Fast path: a clean subtree nobody holds loaded or referenced can be
    // swapped wholesale, as if the checkout replaced it with fresh inodes.
    let clean_swappable = local.id == Some(old.id)
        && match &local.loaded {
            None => true,
            Some(InodePtr::Tree(tree)) => {
                tree.source_id() == Some(old.id)
                    && !tree.has_loaded_children()
                    && !tree.is_fs_referenced()
            }
            Some(InodePtr::File(_)) => false,
        };

    if clean_swappable {
        if !dry {
            parent.checkout_set_entry(name, TreeEntryType::Tree, new.id)?;
            record_tree_to_tree(cx, actx, path, old.id, new.id)?;
        }
        return Ok(());
    }

    // Slow path: descend and process entry by entry.
    let child = parent.get_or_load_child_tree(cx, name, actx.fetch)?;
    let from_tree = actx.store.get_tree(cx, &old.id, actx.fetch)?;
    let to_tree = actx.store.get_tree(cx, &new.id, actx.fetch)?;
    apply_tree(cx, actx, &child, Some(&from_tree), &to_tree, path, conflicts)?;

    if !dry {
        let clean = child.checkout_reconcile_source(new.id, &to_tree)?;
        parent.checkout_set_entry_id(name, clean.then_some(new.id))?;
    }
    Ok(())
}

// ── Checkout operation ──────────────────────────────────────────────────────

impl SnapMount {
    /// Switch the mount's view from its current parent to `target`.
    pub fn checkout(
        self: &Arc<Self>,
        cx: &Cx,
        target: &RootId,
        client_pid: Option<i32>,
        caller: &str,
        mode: CheckoutMode,
    ) -> Result<CheckoutResult> {
        let stopwatch = Instant::now();
        let mut times = CheckoutTimes::default();
        let fetch = FetchContext::new("checkout");
        let mount_path = self.config.mount_path.display().to_string();

        // Phase 1: the parent lock is held for the entire operation; a
        // bounded acquire keeps a second checkout from piling up behind it.
        let Some(mut parent_guard) = self.parent_commit.try_write_for(PARENT_LOCK_TIMEOUT)
        else {
            return Err(SfsError::CheckoutInProgress);
        };
        times.did_acquire_parent_lock = stopwatch.elapsed();

        let old_parent = parent_guard.clone();
        debug!(
            mount = %mount_path,
            from = %old_parent,
            to = %target,
            caller,
            ?client_pid,
            mode = mode.as_str(),
            "starting checkout"
        );

        // Phase 2: inodes created from here on carry the new timestamp.
        self.set_last_checkout_time(SnapTimestamp::from_system_time(
            self.server_state.clock.now(),
        ));

        let recorder = JournalDiffCallback::new();
        let inner = self.checkout_phases(
            cx,
            &mut times,
            &stopwatch,
            &fetch,
            &recorder,
            &old_parent,
            target,
            mode,
        );

        let (result, unclean) = match inner {
            Ok(conflicts) => {
                if mode.is_dry_run() {
                    (Ok(conflicts), None)
                } else {
                    // Phase 9: persist the new parent, then release the lock.
                    *parent_guard = target.clone();
                    self.config.set_parent_commit(target.clone());
                    times.did_finish = stopwatch.elapsed();
                    (Ok(conflicts), Some(recorder.steal_unclean_paths()))
                }
            }
            Err(err) => (Err(err), None),
        };
        drop(parent_guard);

        // Phase 10: journal append, after both locks are released.
        if let Some(unclean) = unclean {
            self.journal
                .record_unclean_paths(old_parent.clone(), target.clone(), unclean);
        }

        // Phase 11: telemetry, success or not.
        let stats = fetch.statistics();
        let success = result.is_ok();
        debug!(
            mount = %mount_path,
            success,
            from = %old_parent,
            to = %target,
            trees = stats.trees_fetched,
            blobs = stats.blobs_fetched,
            "checkout finished"
        );
        self.server_state
            .structured_logger
            .log_event(LogEvent::FinishedCheckout {
                mode: mode.as_str(),
                duration_s: stopwatch.elapsed().as_secs_f64(),
                success,
                trees_fetched: stats.trees_fetched,
                blobs_fetched: stats.blobs_fetched,
            });

        result.map(|conflicts| CheckoutResult {
            conflicts,
            times,
            fetch_stats: stats,
        })
    }

    /// Phases 3–8; the caller owns the parent lock and the finish phase.
    #[allow(clippy::too_many_arguments)]
    fn checkout_phases(
        self: &Arc<Self>,
        cx: &Cx,
        times: &mut CheckoutTimes,
        stopwatch: &Instant,
        fetch: &FetchContext,
        recorder: &JournalDiffCallback,
        old_parent: &RootId,
        target: &RootId,
        mode: CheckoutMode,
    ) -> Result<Vec<CheckoutConflict>> {
        let mount_path = self.config.mount_path.display().to_string();
        let store = self.object_store();

        // Phase 3: fault gate.
        self.server_state
            .fault_injector
            .check(cx, "checkout", &mount_path)?;

        // Phase 4: resolve both trees.
        let from = store.get_root_tree(cx, old_parent, fetch)?;
        let to = store.get_root_tree(cx, target, fetch)?;
        times.did_lookup_trees = stopwatch.elapsed();

        let root = self.root_inode()?;

        // Phase 5: collect unclean working-copy paths against the old tree.
        // Skipped for dry runs, which never write a journal entry.
        if !mode.is_dry_run() {
            let diff_ctx = DiffContext::new(
                recorder,
                false,
                self.config.case_sensitive,
                Arc::clone(&store),
                GitIgnoreStack::empty(),
                Arc::clone(&root),
            );
            diff_working_copy(cx, &diff_ctx, &root, &from.tree)?;
            fetch.merge(diff_ctx.fetch());
        }
        times.did_diff = stopwatch.elapsed();

        // Phase 6: structural mutations happen under the rename lock.
        // Unloading unreferenced inodes first lets whole subtrees take the
        // swap fast path instead of entry-by-entry work.
        let _rename_guard = self.rename_lock.lock();
        times.did_acquire_rename_lock = stopwatch.elapsed();
        root.unload_unreferenced_children();

        // Phase 7: second fault gate.
        self.server_state
            .fault_injector
            .check(cx, "inodeCheckout", &mount_path)?;

        // Phase 8: apply recursively from the root.
        let actx = ApplyContext {
            mode,
            store,
            fetch,
            recorder: (!mode.is_dry_run()).then_some(recorder),
        };
        let mut conflicts = Vec::new();
        let root_swappable = root.source_id() == Some(from.id)
            && !root.has_loaded_children()
            && !root.is_fs_referenced();
        if root_swappable {
            if !mode.is_dry_run() {
                root.checkout_swap_source(to.id, &to.tree)?;
                record_tree_to_tree(cx, &actx, &RepoPath::root(), from.id, to.id)?;
            }
        } else {
            apply_tree(
                cx,
                &actx,
                &root,
                Some(&from.tree),
                &to.tree,
                &RepoPath::root(),
                &mut conflicts,
            )?;
            if !mode.is_dry_run() && !root.checkout_reconcile_source(to.id, &to.tree)? {
                warn!(mount = %mount_path, "working copy still dirty after checkout");
            }
        }
        times.did_checkout = stopwatch.elapsed();

        Ok(conflicts)
    }

    /// Graft the object `root_id` resolves to at `path`.
    ///
    /// Unlike a checkout this does not move the parent commit; the parent
    /// lock is only read to log the base the graft landed on.
    pub fn set_path_object_id(
        self: &Arc<Self>,
        cx: &Cx,
        path: &RepoPath,
        root_id: &RootId,
        object_type: TreeEntryType,
        mode: CheckoutMode,
    ) -> Result<Vec<CheckoutConflict>> {
        if object_type.is_symlink() {
            return Err(SfsError::Store(
                "set_path_object_id does not support symlink objects".to_owned(),
            ));
        }
        let fetch = FetchContext::new("set_path_object_id");
        let base = self.parent_commit.read().clone();
        debug!(
            mount = %self.config.mount_path.display(),
            %root_id,
            %path,
            %base,
            "grafting object"
        );

        self.set_last_checkout_time(SnapTimestamp::from_system_time(
            self.server_state.clock.now(),
        ));

        let is_tree = object_type.is_tree();
        let target_dir = if is_tree {
            self.ensure_directory_exists(cx, path)?
        } else {
            self.ensure_directory_exists(cx, &path.dirname())?
        };
        let apply_base = if is_tree { path.clone() } else { path.dirname() };

        let to_tree = if is_tree {
            self.object_store()
                .get_root_tree(cx, root_id, &fetch)?
                .tree
                .as_ref()
                .clone()
        } else {
            let basename = path
                .basename()
                .ok_or_else(|| SfsError::NotFound(path.clone()))?;
            let entry = self.object_store().get_tree_entry_for_root_id(
                cx,
                root_id,
                object_type,
                &basename,
                &fetch,
            )?;
            Tree::new([(basename.as_str().to_owned(), entry)].into_iter().collect())
        };

        target_dir.unload_unreferenced_children();
        let _rename_guard = self.rename_lock.lock();

        let actx = ApplyContext {
            mode,
            store: self.object_store(),
            fetch: &fetch,
            recorder: None,
        };
        let mut conflicts = Vec::new();
        apply_tree(
            cx,
            &actx,
            &target_dir,
            None,
            &to_tree,
            &apply_base,
            &mut conflicts,
        )?;
        Ok(conflicts)
    }

    /// Move the recorded parent without touching the working copy.
    ///
    /// Readers that sampled the parent before this call may still act on
    /// the old value after the journal shows the update; the two are not
    /// ordered with respect to each other.
    pub fn reset_parent(&self, parent: RootId) {
        let mut guard = self.parent_commit.write();
        let old = guard.clone();
        debug!(
            mount = %self.config.mount_path.display(),
            from = %old,
            to = %parent,
            "resetting parent"
        );
        self.config.set_parent_commit(parent.clone());
        *guard = parent.clone();
        drop(guard);
        self.journal.record_hash_update(Some(old), parent);
    }
}
