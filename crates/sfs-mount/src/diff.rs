//! Tree-vs-working-copy diff engine.
//!
//! Streams differences between the live inode hierarchy and a committed
//! tree through a pluggable [`DiffCallback`]. Used standalone for status
//! queries and by the checkout engine to collect unclean paths.

use crate::checkout::PARENT_LOCK_TIMEOUT;
use crate::server::LogEvent;
use crate::SnapMount;
use asupersync::Cx;
use parking_lot::Mutex;
use sfs_error::{Result, SfsError};
use sfs_inode::{EntrySummary, InodePtr, TreeInode};
use sfs_store::{FetchContext, ObjectStore, Tree, TreeEntry};
use sfs_types::{ObjectId, PathComponent, RepoPath, RootId};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::warn;

// ── Callback ────────────────────────────────────────────────────────────────

/// Receives one event per path that differs.
pub trait DiffCallback: Send + Sync {
    fn ignored_file(&self, path: &RepoPath);
    fn added_file(&self, path: &RepoPath);
    fn removed_file(&self, path: &RepoPath);
    fn modified_file(&self, path: &RepoPath);
    fn diff_error(&self, path: &RepoPath, err: &SfsError);
}

// ── Ignore stack ────────────────────────────────────────────────────────────

/// Minimal ignore matching: literal names, literal paths, and single-`*`
/// globs, applied to untracked files.
#[derive(Debug, Clone, Default)]
pub struct GitIgnoreStack {
    patterns: Vec<String>,
}

impl GitIgnoreStack {
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_lines<I, S>(lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let patterns = lines
            .into_iter()
            .map(|line| line.as_ref().trim().to_owned())
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .collect();
        Self { patterns }
    }

    #[must_use]
    pub fn is_ignored(&self, path: &RepoPath) -> bool {
        let basename = path
            .basename()
            .map(|component| component.as_str().to_owned())
            .unwrap_or_default();
        self.patterns.iter().any(|pattern| {
            glob_match(pattern, &basename) || glob_match(pattern, path.as_str())
        })
    }
}

fn glob_match(pattern: &str, candidate: &str) -> bool {
    match pattern.split_once('*') {
        None => pattern == candidate,
        Some((prefix, suffix)) => {
            candidate.len() >= prefix.len() + suffix.len()
                && candidate.starts_with(prefix)
                && candidate.ends_with(suffix)
        }
    }
}

// ── Journal diff callback ───────────────────────────────────────────────────

/// Accumulates the unclean paths observed during a diff: removals and
/// modifications count, additions and ignored files do not. Errors are
/// logged and deliberately kept out of the unclean set.
#[derive(Default)]
pub struct JournalDiffCallback {
    unclean: Mutex<BTreeSet<RepoPath>>,
}

impl JournalDiffCallback {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Drain the collected set, leaving this callback empty.
    #[must_use]
    pub fn steal_unclean_paths(&self) -> BTreeSet<RepoPath> {
        std::mem::take(&mut self.unclean.lock())
    }
}

impl DiffCallback for JournalDiffCallback {
    fn ignored_file(&self, _path: &RepoPath) {}

    fn added_file(&self, _path: &RepoPath) {}

    fn removed_file(&self, path: &RepoPath) {
        self.unclean.lock().insert(path.clone());
    }

    fn modified_file(&self, path: &RepoPath) {
        self.unclean.lock().insert(path.clone());
    }

    fn diff_error(&self, path: &RepoPath, err: &SfsError) {
        warn!(%path, error = %err, "error computing journal diff data");
    }
}

// ── Status collector ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    Added,
    Removed,
    Modified,
    Ignored,
    Error,
}

/// Collects diff events into a path-keyed status map.
#[derive(Default)]
pub struct StatusCollector {
    entries: Mutex<BTreeMap<RepoPath, StatusCode>>,
}

impl StatusCollector {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn status(&self) -> BTreeMap<RepoPath, StatusCode> {
        self.entries.lock().clone()
    }
}

impl DiffCallback for StatusCollector {
    fn ignored_file(&self, path: &RepoPath) {
        self.entries.lock().insert(path.clone(), StatusCode::Ignored);
    }

    fn added_file(&self, path: &RepoPath) {
        self.entries.lock().insert(path.clone(), StatusCode::Added);
    }

    fn removed_file(&self, path: &RepoPath) {
        self.entries.lock().insert(path.clone(), StatusCode::Removed);
    }

    fn modified_file(&self, path: &RepoPath) {
        self.entries.lock().insert(path.clone(), StatusCode::Modified);
    }

    fn diff_error(&self, path: &RepoPath, _err: &SfsError) {
        self.entries.lock().insert(path.clone(), StatusCode::Error);
    }
}

// ── Diff context ────────────────────────────────────────────────────────────

/// Bundles everything one diff run needs. Holds the root inode so the mount
/// cannot tear its hierarchy down while the diff is walking it.
pub struct DiffContext<'a> {
    callback: &'a dyn DiffCallback,
    pub list_ignored: bool,
    pub case_sensitive: bool,
    store: Arc<dyn ObjectStore>,
    ignores: GitIgnoreStack,
    fetch: FetchContext,
    root_inode: Arc<TreeInode>,
}

impl<'a> DiffContext<'a> {
    pub fn new(
        callback: &'a dyn DiffCallback,
        list_ignored: bool,
        case_sensitive: bool,
        store: Arc<dyn ObjectStore>,
        ignores: GitIgnoreStack,
        root_inode: Arc<TreeInode>,
    ) -> Self {
        Self {
            callback,
            list_ignored,
            case_sensitive,
            store,
            ignores,
            fetch: FetchContext::new("diff"),
            root_inode,
        }
    }

    #[must_use]
    pub fn fetch(&self) -> &FetchContext {
        &self.fetch
    }

    /// Load a file's contents by path, starting from the retained root.
    pub fn load_file_contents(&self, cx: &Cx, path: &RepoPath) -> Result<Vec<u8>> {
        match self.root_inode.get_child_recursive(cx, path, &self.fetch)? {
            InodePtr::File(file) => file.read_all(cx, &self.fetch),
            InodePtr::Tree(_) => Err(SfsError::IsADirectory(path.clone())),
        }
    }
}

// ── Engine ──────────────────────────────────────────────────────────────────

/// Diff the whole working copy against `tree`.
pub fn diff_working_copy(
    cx: &Cx,
    ctx: &DiffContext<'_>,
    root: &Arc<TreeInode>,
    tree: &Tree,
) -> Result<()> {
    diff_tree(cx, ctx, &RepoPath::root(), root, tree)
}

fn join_name(path: &RepoPath, name: &str) -> Option<RepoPath> {
    PathComponent::new(name)
        .ok()
        .map(|component| path.join(&component))
}

fn diff_tree(
    cx: &Cx,
    ctx: &DiffContext<'_>,
    path: &RepoPath,
    dir: &Arc<TreeInode>,
    tree: &Tree,
) -> Result<()> {
    cx.checkpoint().map_err(|_| SfsError::Cancelled)?;

    let local: BTreeMap<String, EntrySummary> = dir
        .entry_summaries()
        .into_iter()
        .map(|summary| (summary.name.clone(), summary))
        .collect();
    let mut names: BTreeSet<String> = local.keys().cloned().collect();
    names.extend(tree.entries().map(|(name, _)| name.to_owned()));

    for name in names {
        let Some(child_path) = join_name(path, &name) else { continue };
        let committed = tree.get(&name);
        let summary = local.get(&name);
        match (committed, summary) {
            (Some(entry), None) => report_removed(cx, ctx, &child_path, entry)?,
            (None, Some(summary)) => report_added(cx, ctx, &child_path, dir, summary)?,
            (Some(entry), Some(summary)) => {
                diff_entry(cx, ctx, &child_path, dir, entry, summary)?;
            }
            (None, None) => unreachable!("name came from one of the two sides"),
        }
    }
    Ok(())
}

fn diff_entry(
    cx: &Cx,
    ctx: &DiffContext<'_>,
    path: &RepoPath,
    dir: &Arc<TreeInode>,
    entry: &TreeEntry,
    summary: &EntrySummary,
) -> Result<()> {
    if summary.id == Some(entry.id) && summary.kind == entry.kind {
        return Ok(());
    }

    if entry.kind.is_tree() && summary.kind.is_tree() {
        let child = match dir.get_or_load_child_tree(cx, &summary.name, ctx.fetch()) {
            Ok(child) => child,
            Err(err) => {
                ctx.callback.diff_error(path, &err);
                return Ok(());
            }
        };
        let subtree = match ctx.store.get_tree(cx, &entry.id, ctx.fetch()) {
            Ok(subtree) => subtree,
            Err(err) => {
                ctx.callback.diff_error(path, &err);
                return Ok(());
            }
        };
        return diff_tree(cx, ctx, path, &child, &subtree);
    }

    if entry.kind.is_tree() != summary.kind.is_tree() {
        // Type changed between directory and file: the committed side is
        // gone and the local side is new.
        report_removed(cx, ctx, path, entry)?;
        return report_added(cx, ctx, path, dir, summary);
    }

    // Both files. A different object id (or kind) is a modification; a
    // materialized file needs a content comparison.
    if summary.id.is_some() {
        ctx.callback.modified_file(path);
        return Ok(());
    }
    match file_differs(cx, ctx, dir, summary, entry.id) {
        Ok(true) => ctx.callback.modified_file(path),
        Ok(false) => {}
        Err(err) => ctx.callback.diff_error(path, &err),
    }
    Ok(())
}

fn file_differs(
    cx: &Cx,
    ctx: &DiffContext<'_>,
    dir: &Arc<TreeInode>,
    summary: &EntrySummary,
    blob_id: ObjectId,
) -> Result<bool> {
    let inode = dir.get_or_load_child(cx, &summary.name, ctx.fetch())?;
    let file = inode
        .as_file()
        .ok_or_else(|| SfsError::IsADirectory(RepoPath::parse(&summary.name)?))?;
    let local = file.read_all(cx, ctx.fetch())?;
    let committed = ctx.store.get_blob(cx, &blob_id, ctx.fetch())?;
    Ok(local != *committed.as_ref())
}

fn report_added(
    cx: &Cx,
    ctx: &DiffContext<'_>,
    path: &RepoPath,
    dir: &Arc<TreeInode>,
    summary: &EntrySummary,
) -> Result<()> {
    if ctx.ignores.is_ignored(path) {
        if ctx.list_ignored {
            ctx.callback.ignored_file(path);
        }
        return Ok(());
    }
    if !summary.kind.is_tree() {
        ctx.callback.added_file(path);
        return Ok(());
    }
    let child = match dir.get_or_load_child_tree(cx, &summary.name, ctx.fetch()) {
        Ok(child) => child,
        Err(err) => {
            ctx.callback.diff_error(path, &err);
            return Ok(());
        }
    };
    for child_summary in child.entry_summaries() {
        let Some(child_path) = join_name(path, &child_summary.name) else { continue };
        report_added(cx, ctx, &child_path, &child, &child_summary)?;
    }
    Ok(())
}

fn report_removed(
    cx: &Cx,
    ctx: &DiffContext<'_>,
    path: &RepoPath,
    entry: &TreeEntry,
) -> Result<()> {
    if !entry.kind.is_tree() {
        ctx.callback.removed_file(path);
        return Ok(());
    }
    let subtree = match ctx.store.get_tree(cx, &entry.id, ctx.fetch()) {
        Ok(subtree) => subtree,
        Err(err) => {
            ctx.callback.diff_error(path, &err);
            return Ok(());
        }
    };
    for (name, child_entry) in subtree.entries() {
        let Some(child_path) = join_name(path, name) else { continue };
        report_removed(cx, ctx, &child_path, child_entry)?;
    }
    Ok(())
}

// ── Mount entry point ───────────────────────────────────────────────────────

impl SnapMount {
    /// Stream the differences between the working copy and `commit`.
    ///
    /// With `enforce_current_parent`, the supplied commit must match the
    /// mount's parent: a 500 ms read lock validates it, a mismatch fails
    /// with `OutOfDateParent` and emits a `ParentMismatch` event. The lock
    /// is released before the walk; holding it for the whole diff (to block
    /// concurrent checkouts) is deliberately not done.
    pub fn diff(
        &self,
        cx: &Cx,
        callback: &dyn DiffCallback,
        commit: &RootId,
        list_ignored: bool,
        enforce_current_parent: bool,
    ) -> Result<()> {
        if enforce_current_parent {
            let parent = self
                .parent_commit
                .try_read_for(PARENT_LOCK_TIMEOUT)
                .ok_or(SfsError::CheckoutInProgress)?;
            if *parent != *commit {
                self.server_state
                    .structured_logger
                    .log_event(LogEvent::ParentMismatch {
                        expected: commit.to_string(),
                        actual: parent.to_string(),
                    });
                return Err(SfsError::OutOfDateParent {
                    requested: commit.to_string(),
                    actual: parent.to_string(),
                });
            }
        }

        let root = self.root_inode()?;
        let ctx = DiffContext::new(
            callback,
            list_ignored,
            self.config.case_sensitive,
            self.object_store(),
            self.top_level_ignores(),
            Arc::clone(&root),
        );
        let root_tree = self.object_store().get_root_tree(cx, commit, ctx.fetch())?;
        diff_working_copy(cx, &ctx, &root, &root_tree.tree)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn glob_matching() {
        assert!(glob_match("*.o", "main.o"));
        assert!(glob_match("build*", "build-output"));
        assert!(glob_match("exact", "exact"));
        assert!(!glob_match("*.o", "main.rs"));
        assert!(!glob_match("exact", "exactly"));
    }

    #[test]
    fn ignore_stack_skips_comments_and_blanks() {
        let stack = GitIgnoreStack::from_lines(["# comment", "", "*.tmp", "target"]);
        assert!(stack.is_ignored(&RepoPath::parse("a/b/scratch.tmp").unwrap()));
        assert!(stack.is_ignored(&RepoPath::parse("target").unwrap()));
        assert!(!stack.is_ignored(&RepoPath::parse("src/lib.rs").unwrap()));
    }

    #[test]
    fn journal_callback_collects_only_unclean() {
        let callback = JournalDiffCallback::new();
        let a = RepoPath::parse("a").unwrap();
        let b = RepoPath::parse("b").unwrap();
        let c = RepoPath::parse("c").unwrap();

        callback.added_file(&a);
        callback.ignored_file(&a);
        callback.removed_file(&b);
        callback.modified_file(&c);
        callback.diff_error(&a, &SfsError::Cancelled);

        let unclean = callback.steal_unclean_paths();
        assert_eq!(unclean, [b, c].into_iter().collect());
        assert!(callback.steal_unclean_paths().is_empty(), "drained");
    }
}
