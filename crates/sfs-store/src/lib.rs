#![forbid(unsafe_code)]
//! Content-addressed object model and collaborator interfaces.
//!
//! The checkout engine consumes two storage collaborators: an [`ObjectStore`]
//! holding immutable source-control trees and blobs, and an [`Overlay`]
//! holding per-mount local modifications keyed by inode number. Both are
//! trait objects; the in-memory implementations here back the test suites
//! and small deployments.

use asupersync::Cx;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sfs_error::{Result, SfsError};
use sfs_types::{InodeNumber, ObjectId, PathComponent, RepoPath, RootId, TreeEntryType};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::trace;

// ── Tree model ──────────────────────────────────────────────────────────────

/// One named entry inside a [`Tree`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeEntry {
    pub kind: TreeEntryType,
    pub id: ObjectId,
}

/// An immutable source-control directory listing.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Tree {
    entries: BTreeMap<String, TreeEntry>,
}

impl Tree {
    #[must_use]
    pub fn new(entries: BTreeMap<String, TreeEntry>) -> Self {
        Self { entries }
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&TreeEntry> {
        self.entries.get(name)
    }

    pub fn entries(&self) -> impl Iterator<Item = (&str, &TreeEntry)> {
        self.entries.iter().map(|(name, entry)| (name.as_str(), entry))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Content hash of this tree's canonical encoding.
    #[must_use]
    pub fn compute_id(&self) -> ObjectId {
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"tree\0");
        for (name, entry) in &self.entries {
            hasher.update(name.as_bytes());
            hasher.update(&[0, entry_kind_tag(entry.kind)]);
            hasher.update(entry.id.as_bytes());
        }
        ObjectId(*hasher.finalize().as_bytes())
    }
}

fn entry_kind_tag(kind: TreeEntryType) -> u8 {
    match kind {
        TreeEntryType::Tree => b't',
        TreeEntryType::RegularFile => b'f',
        TreeEntryType::ExecutableFile => b'x',
        TreeEntryType::Symlink => b'l',
    }
}

/// Content hash of a blob.
#[must_use]
pub fn compute_blob_id(content: &[u8]) -> ObjectId {
    let mut hasher = blake3::Hasher::new();
    hasher.update(b"blob\0");
    hasher.update(content);
    ObjectId(*hasher.finalize().as_bytes())
}

// ── Fetch statistics ────────────────────────────────────────────────────────

/// Snapshot of the counters in a [`FetchContext`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FetchStatistics {
    pub trees_fetched: u64,
    pub blobs_fetched: u64,
}

/// Per-request fetch accounting, shared by every store call made on behalf
/// of one top-level operation.
#[derive(Debug)]
pub struct FetchContext {
    cause: &'static str,
    trees_fetched: AtomicU64,
    blobs_fetched: AtomicU64,
}

impl FetchContext {
    #[must_use]
    pub fn new(cause: &'static str) -> Self {
        Self {
            cause,
            trees_fetched: AtomicU64::new(0),
            blobs_fetched: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn cause(&self) -> &'static str {
        self.cause
    }

    pub fn note_tree_fetch(&self) {
        self.trees_fetched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn note_blob_fetch(&self) {
        self.blobs_fetched.fetch_add(1, Ordering::Relaxed);
    }

    /// Fold another context's counters into this one, e.g. merging the diff
    /// phase's fetches into the surrounding checkout.
    pub fn merge(&self, other: &FetchContext) {
        let stats = other.statistics();
        self.trees_fetched
            .fetch_add(stats.trees_fetched, Ordering::Relaxed);
        self.blobs_fetched
            .fetch_add(stats.blobs_fetched, Ordering::Relaxed);
    }

    #[must_use]
    pub fn statistics(&self) -> FetchStatistics {
        FetchStatistics {
            trees_fetched: self.trees_fetched.load(Ordering::Relaxed),
            blobs_fetched: self.blobs_fetched.load(Ordering::Relaxed),
        }
    }
}

// ── Object store ────────────────────────────────────────────────────────────

/// A resolved commit root: the top-level tree together with its id.
#[derive(Debug, Clone)]
pub struct RootTree {
    pub id: ObjectId,
    pub tree: Arc<Tree>,
}

/// Content-addressed blob/tree fetcher.
pub trait ObjectStore: Send + Sync {
    /// Resolve a commit root to its top-level tree.
    fn get_root_tree(&self, cx: &Cx, root: &RootId, fetch: &FetchContext)
        -> Result<RootTree>;

    fn get_tree(&self, cx: &Cx, id: &ObjectId, fetch: &FetchContext) -> Result<Arc<Tree>>;

    fn get_blob(&self, cx: &Cx, id: &ObjectId, fetch: &FetchContext)
        -> Result<Arc<Vec<u8>>>;

    /// Wrap the object a root id resolves to as a single named tree entry.
    ///
    /// Used when grafting an object at an arbitrary path: the caller names
    /// the entry and declares its kind; the store validates that the object
    /// actually has that shape.
    fn get_tree_entry_for_root_id(
        &self,
        cx: &Cx,
        root: &RootId,
        kind: TreeEntryType,
        basename: &PathComponent,
        fetch: &FetchContext,
    ) -> Result<TreeEntry>;
}

enum StoredObject {
    Tree(Arc<Tree>),
    Blob(Arc<Vec<u8>>),
}

/// In-memory [`ObjectStore`].
#[derive(Default)]
pub struct MemoryObjectStore {
    roots: RwLock<HashMap<RootId, ObjectId>>,
    objects: RwLock<HashMap<ObjectId, StoredObject>>,
}

impl MemoryObjectStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_blob(&self, content: impl Into<Vec<u8>>) -> ObjectId {
        let content = content.into();
        let id = compute_blob_id(&content);
        self.objects
            .write()
            .insert(id, StoredObject::Blob(Arc::new(content)));
        id
    }

    pub fn put_tree(&self, tree: Tree) -> ObjectId {
        let id = tree.compute_id();
        self.objects
            .write()
            .insert(id, StoredObject::Tree(Arc::new(tree)));
        id
    }

    /// Bind a commit root id to a stored tree.
    pub fn put_root(&self, root: RootId, tree_id: ObjectId) {
        self.roots.write().insert(root, tree_id);
    }

    fn resolve_root(&self, root: &RootId) -> Result<ObjectId> {
        self.roots
            .read()
            .get(root)
            .copied()
            .ok_or_else(|| SfsError::Store(format!("unknown root id {root}")))
    }
}

impl ObjectStore for MemoryObjectStore {
    fn get_root_tree(
        &self,
        cx: &Cx,
        root: &RootId,
        fetch: &FetchContext,
    ) -> Result<RootTree> {
        cx.checkpoint().map_err(|_| SfsError::Cancelled)?;
        let tree_id = self.resolve_root(root)?;
        trace!(%root, %tree_id, cause = fetch.cause(), "root tree fetch");
        let tree = self.get_tree(cx, &tree_id, fetch)?;
        Ok(RootTree { id: tree_id, tree })
    }

    fn get_tree(&self, cx: &Cx, id: &ObjectId, fetch: &FetchContext) -> Result<Arc<Tree>> {
        cx.checkpoint().map_err(|_| SfsError::Cancelled)?;
        let objects = self.objects.read();
        match objects.get(id) {
            Some(StoredObject::Tree(tree)) => {
                fetch.note_tree_fetch();
                Ok(Arc::clone(tree))
            }
            Some(StoredObject::Blob(_)) => {
                Err(SfsError::Store(format!("object {id} is a blob, not a tree")))
            }
            None => Err(SfsError::Store(format!("unknown tree {id}"))),
        }
    }

    fn get_blob(
        &self,
        cx: &Cx,
        id: &ObjectId,
        fetch: &FetchContext,
    ) -> Result<Arc<Vec<u8>>> {
        cx.checkpoint().map_err(|_| SfsError::Cancelled)?;
        let objects = self.objects.read();
        match objects.get(id) {
            Some(StoredObject::Blob(blob)) => {
                fetch.note_blob_fetch();
                Ok(Arc::clone(blob))
            }
            Some(StoredObject::Tree(_)) => {
                Err(SfsError::Store(format!("object {id} is a tree, not a blob")))
            }
            None => Err(SfsError::Store(format!("unknown blob {id}"))),
        }
    }

    fn get_tree_entry_for_root_id(
        &self,
        cx: &Cx,
        root: &RootId,
        kind: TreeEntryType,
        basename: &PathComponent,
        fetch: &FetchContext,
    ) -> Result<TreeEntry> {
        cx.checkpoint().map_err(|_| SfsError::Cancelled)?;
        let id = self.resolve_root(root)?;
        let objects = self.objects.read();
        let matches = match (objects.get(&id), kind) {
            (Some(StoredObject::Tree(_)), TreeEntryType::Tree) => true,
            (Some(StoredObject::Blob(_)), TreeEntryType::Tree) => false,
            (Some(StoredObject::Blob(_)), _) => true,
            (Some(StoredObject::Tree(_)), _) => false,
            (None, _) => {
                return Err(SfsError::Store(format!("unknown object {id} for root {root}")))
            }
        };
        if !matches {
            return Err(SfsError::Store(format!(
                "object {id} for root {root} does not have type {kind}"
            )));
        }
        trace!(%root, %id, name = %basename, cause = fetch.cause(), "entry for root id");
        Ok(TreeEntry { kind, id })
    }
}

// ── Commit builder ──────────────────────────────────────────────────────────

/// Builds nested trees bottom-up and registers the result as a commit root.
///
/// Intended for tests and fixtures: add files by repository path, then
/// `commit` the whole structure into a [`MemoryObjectStore`].
#[derive(Default)]
pub struct CommitBuilder {
    files: Vec<(RepoPath, TreeEntryType, Vec<u8>)>,
}

impl CommitBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn file(self, path: &str, content: impl Into<Vec<u8>>) -> Self {
        self.entry(path, TreeEntryType::RegularFile, content)
    }

    #[must_use]
    pub fn executable(self, path: &str, content: impl Into<Vec<u8>>) -> Self {
        self.entry(path, TreeEntryType::ExecutableFile, content)
    }

    #[must_use]
    pub fn symlink(self, path: &str, target: &str) -> Self {
        self.entry(path, TreeEntryType::Symlink, target.as_bytes().to_vec())
    }

    #[must_use]
    pub fn entry(
        mut self,
        path: &str,
        kind: TreeEntryType,
        content: impl Into<Vec<u8>>,
    ) -> Self {
        let path = RepoPath::parse(path).expect("valid fixture path");
        self.files.push((path, kind, content.into()));
        self
    }

    /// Store all trees and blobs, then bind `root` to the top-level tree.
    pub fn commit(self, store: &MemoryObjectStore, root: RootId) -> ObjectId {
        #[derive(Default)]
        struct DirNode {
            files: BTreeMap<String, (TreeEntryType, Vec<u8>)>,
            dirs: BTreeMap<String, DirNode>,
        }

        let mut top = DirNode::default();
        for (path, kind, content) in self.files {
            let mut node = &mut top;
            let components: Vec<&str> = path.components().collect();
            let (name, dirs) = components.split_last().expect("non-empty fixture path");
            for dir in dirs {
                node = node.dirs.entry((*dir).to_owned()).or_default();
            }
            node.files.insert((*name).to_owned(), (kind, content));
        }

        fn build(store: &MemoryObjectStore, node: DirNode) -> ObjectId {
            let mut entries = BTreeMap::new();
            for (name, child) in node.dirs {
                let id = build(store, child);
                entries.insert(name, TreeEntry { kind: TreeEntryType::Tree, id });
            }
            for (name, (kind, content)) in node.files {
                let id = store.put_blob(content);
                entries.insert(name, TreeEntry { kind, id });
            }
            store.put_tree(Tree::new(entries))
        }

        let tree_id = build(store, top);
        store.put_root(root, tree_id);
        tree_id
    }
}

// ── Overlay ─────────────────────────────────────────────────────────────────

/// One entry of a materialized directory persisted in the overlay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverlayDirEntry {
    pub ino: InodeNumber,
    pub kind: TreeEntryType,
    /// `None` when the entry's content lives in the overlay rather than the
    /// object store.
    pub id: Option<ObjectId>,
}

/// A materialized directory listing persisted in the overlay.
pub type OverlayDir = BTreeMap<String, OverlayDirEntry>;

/// Local, per-mount storage of modifications keyed by inode number.
pub trait Overlay: Send + Sync {
    fn initialize(
        &self,
        cx: &Cx,
        mount_path: &std::path::Path,
        progress: &(dyn Fn(&str) + Send + Sync),
    ) -> Result<()>;

    /// Whether the contents survive a process restart. Decides how the
    /// inode map is seeded during mount initialization.
    fn is_persistent(&self) -> bool;

    fn load_overlay_dir(&self, ino: InodeNumber) -> Result<Option<OverlayDir>>;

    fn save_overlay_dir(&self, ino: InodeNumber, dir: &OverlayDir) -> Result<()>;

    fn load_overlay_file(&self, ino: InodeNumber) -> Result<Option<Vec<u8>>>;

    fn save_overlay_file(&self, ino: InodeNumber, data: &[u8]) -> Result<()>;

    fn remove(&self, ino: InodeNumber) -> Result<()>;

    /// Highest inode number recorded anywhere in the overlay, so a restart
    /// can seed allocation above every persisted number.
    fn max_assigned_inode(&self) -> Result<Option<InodeNumber>>;

    /// Release the overlay. Further access is an error; called during
    /// shutdown so a successor process can take the overlay over.
    fn close(&self);
}

#[derive(Default)]
struct MemoryOverlayState {
    dirs: HashMap<InodeNumber, OverlayDir>,
    files: HashMap<InodeNumber, Vec<u8>>,
}

/// In-memory [`Overlay`].
pub struct MemoryOverlay {
    state: RwLock<MemoryOverlayState>,
    closed: AtomicBool,
    persistent: bool,
}

impl MemoryOverlay {
    /// `persistent` controls only what [`Overlay::is_persistent`] reports;
    /// contents always live in memory.
    #[must_use]
    pub fn new(persistent: bool) -> Self {
        Self {
            state: RwLock::default(),
            closed: AtomicBool::new(false),
            persistent,
        }
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SfsError::Overlay("overlay is closed".to_owned()));
        }
        Ok(())
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Overlay for MemoryOverlay {
    fn initialize(
        &self,
        cx: &Cx,
        mount_path: &std::path::Path,
        progress: &(dyn Fn(&str) + Send + Sync),
    ) -> Result<()> {
        cx.checkpoint().map_err(|_| SfsError::Cancelled)?;
        self.check_open()?;
        progress(&format!("overlay ready for {}", mount_path.display()));
        Ok(())
    }

    fn is_persistent(&self) -> bool {
        self.persistent
    }

    fn load_overlay_dir(&self, ino: InodeNumber) -> Result<Option<OverlayDir>> {
        self.check_open()?;
        Ok(self.state.read().dirs.get(&ino).cloned())
    }

    fn save_overlay_dir(&self, ino: InodeNumber, dir: &OverlayDir) -> Result<()> {
        self.check_open()?;
        self.state.write().dirs.insert(ino, dir.clone());
        Ok(())
    }

    fn load_overlay_file(&self, ino: InodeNumber) -> Result<Option<Vec<u8>>> {
        self.check_open()?;
        Ok(self.state.read().files.get(&ino).cloned())
    }

    fn save_overlay_file(&self, ino: InodeNumber, data: &[u8]) -> Result<()> {
        self.check_open()?;
        self.state.write().files.insert(ino, data.to_vec());
        Ok(())
    }

    fn remove(&self, ino: InodeNumber) -> Result<()> {
        self.check_open()?;
        let mut state = self.state.write();
        state.dirs.remove(&ino);
        state.files.remove(&ino);
        Ok(())
    }

    fn max_assigned_inode(&self) -> Result<Option<InodeNumber>> {
        self.check_open()?;
        let state = self.state.read();
        let max = state
            .dirs
            .iter()
            .flat_map(|(ino, dir)| {
                std::iter::once(*ino).chain(dir.values().map(|entry| entry.ino))
            })
            .chain(state.files.keys().copied())
            .max();
        Ok(max)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
