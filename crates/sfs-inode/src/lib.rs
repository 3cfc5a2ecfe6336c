#![forbid(unsafe_code)]
//! Live inode hierarchy for a SnapFS mount.
//!
//! Directory inodes lazily load their children from the object store; local
//! modifications materialize the affected chain into the overlay. The mount
//! owns the [`InodeMap`], which owns the root inode strongly; every inode
//! holds a non-owning back-reference to the mount through [`InodeHost`].
//!
//! Inode numbers are assigned lazily, the first time an entry is loaded or
//! persisted. That keeps numbering stable across takeover: the map is seeded
//! with the predecessor's path→number table before any child is loaded.

use asupersync::Cx;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use sfs_error::{Result, SfsError};
use sfs_store::{
    FetchContext, ObjectStore, Overlay, OverlayDir, OverlayDirEntry, Tree,
};
use sfs_types::{InodeNumber, ObjectId, PathComponent, RepoPath, TreeEntryType};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::debug;

// ── Host back-reference ─────────────────────────────────────────────────────

/// What an inode needs from the mount that owns it.
///
/// Held as a `Weak` reference: the mount outlives its inodes by
/// construction, and a dead upgrade surfaces as `MountReleased`.
pub trait InodeHost: Send + Sync {
    fn object_store(&self) -> Arc<dyn ObjectStore>;
    fn overlay(&self) -> Arc<dyn Overlay>;
    fn case_sensitive(&self) -> bool;
    fn allocate_inode_number(&self, path: Option<&RepoPath>) -> InodeNumber;
    /// Directory whose contents are locked against modification (the
    /// control directory, once fully set up).
    fn protected_directory(&self) -> Option<InodeNumber>;
}

// ── Shared pieces ───────────────────────────────────────────────────────────

#[derive(Clone)]
struct Location {
    parent: Weak<TreeInode>,
    name: PathComponent,
}

/// A loaded inode: either a directory or a leaf.
#[derive(Clone)]
pub enum InodePtr {
    Tree(Arc<TreeInode>),
    File(Arc<FileInode>),
}

impl InodePtr {
    #[must_use]
    pub fn number(&self) -> InodeNumber {
        match self {
            Self::Tree(tree) => tree.number(),
            Self::File(file) => file.number(),
        }
    }

    #[must_use]
    pub fn kind(&self) -> TreeEntryType {
        match self {
            Self::Tree(_) => TreeEntryType::Tree,
            Self::File(file) => file.kind(),
        }
    }

    /// Path from the mount root, or `None` once unlinked.
    #[must_use]
    pub fn path(&self) -> Option<RepoPath> {
        match self {
            Self::Tree(tree) => tree.path(),
            Self::File(file) => file.path(),
        }
    }

    #[must_use]
    pub fn as_tree(&self) -> Option<&Arc<TreeInode>> {
        match self {
            Self::Tree(tree) => Some(tree),
            Self::File(_) => None,
        }
    }

    #[must_use]
    pub fn as_file(&self) -> Option<&Arc<FileInode>> {
        match self {
            Self::File(file) => Some(file),
            Self::Tree(_) => None,
        }
    }

    pub fn fs_ref_increment(&self) {
        match self {
            Self::Tree(tree) => tree.fs_refcount.fetch_add(1, Ordering::AcqRel),
            Self::File(file) => file.fs_refcount.fetch_add(1, Ordering::AcqRel),
        };
    }

    pub fn fs_ref_decrement(&self) {
        match self {
            Self::Tree(tree) => tree.fs_refcount.fetch_sub(1, Ordering::AcqRel),
            Self::File(file) => file.fs_refcount.fetch_sub(1, Ordering::AcqRel),
        };
    }

    fn mark_unlinked(&self) {
        match self {
            Self::Tree(tree) => *tree.location.lock() = None,
            Self::File(file) => *file.location.lock() = None,
        }
    }
}

fn location_path(
    number: InodeNumber,
    location: &Mutex<Option<Location>>,
) -> Option<RepoPath> {
    if number == InodeNumber::ROOT {
        return Some(RepoPath::root());
    }
    let location = location.lock().clone()?;
    let parent = location.parent.upgrade()?;
    Some(parent.path()?.join(&location.name))
}

fn upgrade_host(host: &Weak<dyn InodeHost>) -> Result<Arc<dyn InodeHost>> {
    host.upgrade().ok_or(SfsError::MountReleased)
}

fn find_entry_key(
    entries: &BTreeMap<String, DirEntry>,
    name: &str,
    case_sensitive: bool,
) -> Option<String> {
    if entries.contains_key(name) {
        return Some(name.to_owned());
    }
    if !case_sensitive {
        return entries
            .keys()
            .find(|key| key.eq_ignore_ascii_case(name))
            .cloned();
    }
    None
}

// ── File inodes ─────────────────────────────────────────────────────────────

struct FileState {
    kind: TreeEntryType,
    /// Backing blob in the object store; `None` once materialized, in which
    /// case the content lives in the overlay under this inode's number.
    source: Option<ObjectId>,
}

pub struct FileInode {
    number: InodeNumber,
    host: Weak<dyn InodeHost>,
    fs_refcount: AtomicU64,
    location: Mutex<Option<Location>>,
    state: Mutex<FileState>,
}

impl FileInode {
    #[must_use]
    pub fn number(&self) -> InodeNumber {
        self.number
    }

    #[must_use]
    pub fn kind(&self) -> TreeEntryType {
        self.state.lock().kind
    }

    #[must_use]
    pub fn is_materialized(&self) -> bool {
        self.state.lock().source.is_none()
    }

    #[must_use]
    pub fn path(&self) -> Option<RepoPath> {
        location_path(self.number, &self.location)
    }

    #[must_use]
    pub fn is_fs_referenced(&self) -> bool {
        self.fs_refcount.load(Ordering::Acquire) > 0
    }

    /// Full content of this file.
    pub fn read_all(&self, cx: &Cx, fetch: &FetchContext) -> Result<Vec<u8>> {
        let host = upgrade_host(&self.host)?;
        let source = self.state.lock().source;
        match source {
            Some(id) => {
                let blob = host.object_store().get_blob(cx, &id, fetch)?;
                Ok(blob.as_ref().clone())
            }
            None => host
                .overlay()
                .load_overlay_file(self.number)?
                .ok_or_else(|| {
                    SfsError::Overlay(format!(
                        "materialized file {} has no overlay content",
                        self.number
                    ))
                }),
        }
    }

    /// Symlink target. Errors on non-symlink inodes.
    pub fn readlink(&self, cx: &Cx, fetch: &FetchContext) -> Result<String> {
        if !self.kind().is_symlink() {
            return Err(SfsError::Io(format!(
                "readlink on non-symlink inode {}",
                self.number
            )));
        }
        let bytes = self.read_all(cx, fetch)?;
        String::from_utf8(bytes)
            .map_err(|_| SfsError::Io(format!("symlink {} target is not UTF-8", self.number)))
    }

    /// Retarget this inode at a new store object during checkout.
    pub(crate) fn update_source(&self, kind: TreeEntryType, id: ObjectId) {
        let mut state = self.state.lock();
        state.kind = kind;
        state.source = Some(id);
    }

    fn set_materialized(&self, kind: TreeEntryType) {
        let mut state = self.state.lock();
        state.kind = kind;
        state.source = None;
    }
}

// ── Directory entries ───────────────────────────────────────────────────────

struct DirEntry {
    kind: TreeEntryType,
    /// Backing object; `None` for materialized entries.
    id: Option<ObjectId>,
    /// Assigned lazily on first load or persist.
    ino: Option<InodeNumber>,
    loaded: Option<InodePtr>,
}

/// Read-only view of one directory entry, used by the diff and checkout
/// engines.
#[derive(Clone)]
pub struct EntrySummary {
    pub name: String,
    pub kind: TreeEntryType,
    pub id: Option<ObjectId>,
    pub ino: Option<InodeNumber>,
    pub loaded: Option<InodePtr>,
}

struct DirContents {
    entries: BTreeMap<String, DirEntry>,
    /// Backing tree; `None` once this directory is materialized.
    source: Option<ObjectId>,
}

// ── Tree inodes ─────────────────────────────────────────────────────────────

pub struct TreeInode {
    number: InodeNumber,
    host: Weak<dyn InodeHost>,
    fs_refcount: AtomicU64,
    location: Mutex<Option<Location>>,
    contents: RwLock<DirContents>,
}

fn entries_from_tree(tree: &Tree) -> BTreeMap<String, DirEntry> {
    tree.entries()
        .map(|(name, entry)| {
            (
                name.to_owned(),
                DirEntry {
                    kind: entry.kind,
                    id: Some(entry.id),
                    ino: None,
                    loaded: None,
                },
            )
        })
        .collect()
}

fn entries_from_overlay(dir: OverlayDir) -> BTreeMap<String, DirEntry> {
    dir.into_iter()
        .map(|(name, entry)| {
            (
                name,
                DirEntry {
                    kind: entry.kind,
                    id: entry.id,
                    ino: Some(entry.ino),
                    loaded: None,
                },
            )
        })
        .collect()
}

impl TreeInode {
    /// Root inode backed by a store tree (clean working copy).
    #[must_use]
    pub fn new_root_from_tree(host: &Arc<dyn InodeHost>, tree: &Tree, tree_id: ObjectId) -> Arc<Self> {
        Arc::new(Self {
            number: InodeNumber::ROOT,
            host: Arc::downgrade(host),
            fs_refcount: AtomicU64::new(0),
            location: Mutex::new(None),
            contents: RwLock::new(DirContents {
                entries: entries_from_tree(tree),
                source: Some(tree_id),
            }),
        })
    }

    /// Root inode restored from a persisted overlay directory. The root is
    /// always materialized in this case, so no tree hash is recorded.
    #[must_use]
    pub fn new_root_from_overlay(host: &Arc<dyn InodeHost>, dir: OverlayDir) -> Arc<Self> {
        Arc::new(Self {
            number: InodeNumber::ROOT,
            host: Arc::downgrade(host),
            fs_refcount: AtomicU64::new(0),
            location: Mutex::new(None),
            contents: RwLock::new(DirContents {
                entries: entries_from_overlay(dir),
                source: None,
            }),
        })
    }

    #[must_use]
    pub fn number(&self) -> InodeNumber {
        self.number
    }

    #[must_use]
    pub fn path(&self) -> Option<RepoPath> {
        location_path(self.number, &self.location)
    }

    /// Backing tree id, or `None` if this directory is materialized.
    #[must_use]
    pub fn source_id(&self) -> Option<ObjectId> {
        self.contents.read().source
    }

    #[must_use]
    pub fn is_fs_referenced(&self) -> bool {
        self.fs_refcount.load(Ordering::Acquire) > 0
    }

    #[must_use]
    pub fn has_loaded_children(&self) -> bool {
        self.contents
            .read()
            .entries
            .values()
            .any(|entry| entry.loaded.is_some())
    }

    /// Snapshot of the current entries.
    #[must_use]
    pub fn entry_summaries(&self) -> Vec<EntrySummary> {
        let contents = self.contents.read();
        contents
            .entries
            .iter()
            .map(|(name, entry)| EntrySummary {
                name: name.clone(),
                kind: entry.kind,
                id: entry.id,
                ino: entry.ino,
                loaded: entry.loaded.clone(),
            })
            .collect()
    }

    /// Look one entry up without loading it.
    #[must_use]
    pub fn lookup(&self, name: &str, case_sensitive: bool) -> Option<EntrySummary> {
        let contents = self.contents.read();
        let key = find_entry_key(&contents.entries, name, case_sensitive)?;
        let entry = contents.entries.get(&key)?;
        Some(EntrySummary {
            name: key,
            kind: entry.kind,
            id: entry.id,
            ino: entry.ino,
            loaded: entry.loaded.clone(),
        })
    }

    fn host(&self) -> Result<Arc<dyn InodeHost>> {
        upgrade_host(&self.host)
    }

    fn child_path(&self, name: &str) -> RepoPath {
        match (self.path(), PathComponent::new(name)) {
            (Some(path), Ok(component)) => path.join(&component),
            _ => RepoPath::parse(name).unwrap_or_else(|_| RepoPath::root()),
        }
    }

    fn check_not_protected(&self, host: &Arc<dyn InodeHost>) -> Result<()> {
        if host.protected_directory() == Some(self.number) {
            return Err(SfsError::ProtectedDirectory);
        }
        Ok(())
    }

    fn ensure_entry_ino(
        &self,
        host: &Arc<dyn InodeHost>,
        base: Option<&RepoPath>,
        name: &str,
        entry: &mut DirEntry,
    ) -> InodeNumber {
        if let Some(ino) = entry.ino {
            return ino;
        }
        let path = match (base, PathComponent::new(name)) {
            (Some(base), Ok(component)) => Some(base.join(&component)),
            _ => None,
        };
        let ino = host.allocate_inode_number(path.as_ref());
        entry.ino = Some(ino);
        ino
    }

    /// Write the directory listing to the overlay if it is materialized.
    fn persist_if_materialized(
        &self,
        host: &Arc<dyn InodeHost>,
        contents: &mut DirContents,
    ) -> Result<()> {
        if contents.source.is_some() {
            return Ok(());
        }
        let base = self.path();
        let mut dir = OverlayDir::new();
        for (name, entry) in &mut contents.entries {
            let ino = self.ensure_entry_ino(host, base.as_ref(), name, entry);
            dir.insert(
                name.clone(),
                OverlayDirEntry {
                    ino,
                    kind: entry.kind,
                    id: entry.id,
                },
            );
        }
        host.overlay().save_overlay_dir(self.number, &dir)
    }

    // ── Loading ─────────────────────────────────────────────────────────

    /// Fetch or construct the child inode for `name`.
    pub fn get_or_load_child(
        self: &Arc<Self>,
        cx: &Cx,
        name: &str,
        fetch: &FetchContext,
    ) -> Result<InodePtr> {
        let host = self.host()?;
        let case_sensitive = host.case_sensitive();

        // Fast path: already loaded.
        {
            let contents = self.contents.read();
            if let Some(key) = find_entry_key(&contents.entries, name, case_sensitive) {
                if let Some(loaded) = &contents.entries[&key].loaded {
                    return Ok(loaded.clone());
                }
            } else {
                return Err(SfsError::NotFound(self.child_path(name)));
            }
        }

        // Assign the inode number and capture what we need to construct.
        let (key, kind, id, ino) = {
            let mut contents = self.contents.write();
            let Some(key) = find_entry_key(&contents.entries, name, case_sensitive) else {
                return Err(SfsError::NotFound(self.child_path(name)));
            };
            if let Some(loaded) = &contents.entries[&key].loaded {
                return Ok(loaded.clone());
            }
            let base = self.path();
            let entry = contents.entries.get_mut(&key).expect("entry present");
            let ino = self.ensure_entry_ino(&host, base.as_ref(), &key, entry);
            (key, entry.kind, entry.id, ino)
        };

        let child = self.construct_child(cx, &host, &key, kind, id, ino, fetch)?;

        // Install, tolerating a concurrent loader having won the race.
        let mut contents = self.contents.write();
        match contents.entries.get_mut(&key) {
            Some(entry) => {
                if let Some(existing) = &entry.loaded {
                    return Ok(existing.clone());
                }
                entry.loaded = Some(child.clone());
                Ok(child)
            }
            None => Err(SfsError::NotFound(self.child_path(name))),
        }
    }

    fn construct_child(
        self: &Arc<Self>,
        cx: &Cx,
        host: &Arc<dyn InodeHost>,
        name: &str,
        kind: TreeEntryType,
        id: Option<ObjectId>,
        ino: InodeNumber,
        fetch: &FetchContext,
    ) -> Result<InodePtr> {
        let name = PathComponent::new(name).map_err(SfsError::from)?;
        let location = Mutex::new(Some(Location {
            parent: Arc::downgrade(self),
            name,
        }));
        if kind.is_tree() {
            let contents = match id {
                Some(tree_id) => {
                    let tree = host.object_store().get_tree(cx, &tree_id, fetch)?;
                    DirContents {
                        entries: entries_from_tree(&tree),
                        source: Some(tree_id),
                    }
                }
                None => {
                    let dir = host.overlay().load_overlay_dir(ino)?.unwrap_or_default();
                    DirContents {
                        entries: entries_from_overlay(dir),
                        source: None,
                    }
                }
            };
            Ok(InodePtr::Tree(Arc::new(TreeInode {
                number: ino,
                host: self.host.clone(),
                fs_refcount: AtomicU64::new(0),
                location,
                contents: RwLock::new(contents),
            })))
        } else {
            Ok(InodePtr::File(Arc::new(FileInode {
                number: ino,
                host: self.host.clone(),
                fs_refcount: AtomicU64::new(0),
                location,
                state: Mutex::new(FileState { kind, source: id }),
            })))
        }
    }

    /// Like [`Self::get_or_load_child`] but requires a directory.
    pub fn get_or_load_child_tree(
        self: &Arc<Self>,
        cx: &Cx,
        name: &str,
        fetch: &FetchContext,
    ) -> Result<Arc<TreeInode>> {
        match self.get_or_load_child(cx, name, fetch)? {
            InodePtr::Tree(tree) => Ok(tree),
            InodePtr::File(_) => Err(SfsError::NotADirectory(self.child_path(name))),
        }
    }

    /// Walk a relative path down from this directory.
    pub fn get_child_recursive(
        self: &Arc<Self>,
        cx: &Cx,
        path: &RepoPath,
        fetch: &FetchContext,
    ) -> Result<InodePtr> {
        let mut current = Arc::clone(self);
        let mut remaining = path.clone();
        loop {
            let Some((component, rest)) = remaining.split_first() else {
                return Ok(InodePtr::Tree(current));
            };
            let child = current.get_or_load_child(cx, component.as_str(), fetch)?;
            if rest.is_root() {
                return Ok(child);
            }
            match child {
                InodePtr::Tree(tree) => {
                    current = tree;
                    remaining = rest;
                }
                InodePtr::File(_) => {
                    return Err(SfsError::NotADirectory(
                        current.child_path(component.as_str()),
                    ))
                }
            }
        }
    }

    // ── Materialization ─────────────────────────────────────────────────

    /// Move this directory's listing into the overlay and mark the chain up
    /// to the root materialized.
    pub fn materialize(self: &Arc<Self>, cx: &Cx, host: &Arc<dyn InodeHost>) -> Result<()> {
        cx.checkpoint().map_err(|_| SfsError::Cancelled)?;
        {
            let mut contents = self.contents.write();
            if contents.source.is_none() {
                return Ok(());
            }
            contents.source = None;
            self.persist_if_materialized(host, &mut contents)?;
        }
        let location = self.location.lock().clone();
        if let Some(location) = location {
            if let Some(parent) = location.parent.upgrade() {
                parent.materialize(cx, host)?;
                let mut contents = parent.contents.write();
                if let Some(entry) = contents.entries.get_mut(location.name.as_str()) {
                    entry.id = None;
                }
                parent.persist_if_materialized(host, &mut contents)?;
            }
        }
        Ok(())
    }

    // ── Mutation ────────────────────────────────────────────────────────

    /// Create an empty subdirectory.
    pub fn mkdir(self: &Arc<Self>, cx: &Cx, name: &PathComponent) -> Result<Arc<TreeInode>> {
        let host = self.host()?;
        self.check_not_protected(&host)?;
        self.materialize(cx, &host)?;

        let mut contents = self.contents.write();
        if find_entry_key(&contents.entries, name.as_str(), host.case_sensitive()).is_some() {
            return Err(SfsError::AlreadyExists(self.child_path(name.as_str())));
        }
        let path = self.path().map(|base| base.join(name));
        let ino = host.allocate_inode_number(path.as_ref());
        host.overlay().save_overlay_dir(ino, &OverlayDir::new())?;

        let child = Arc::new(TreeInode {
            number: ino,
            host: self.host.clone(),
            fs_refcount: AtomicU64::new(0),
            location: Mutex::new(Some(Location {
                parent: Arc::downgrade(self),
                name: name.clone(),
            })),
            contents: RwLock::new(DirContents {
                entries: BTreeMap::new(),
                source: None,
            }),
        });
        contents.entries.insert(
            name.as_str().to_owned(),
            DirEntry {
                kind: TreeEntryType::Tree,
                id: None,
                ino: Some(ino),
                loaded: Some(InodePtr::Tree(Arc::clone(&child))),
            },
        );
        self.persist_if_materialized(&host, &mut contents)?;
        debug!(parent = %self.number, name = %name, ino = %ino, "mkdir");
        Ok(child)
    }

    /// Create a symlink. Fails if the name exists.
    pub fn symlink(
        self: &Arc<Self>,
        cx: &Cx,
        name: &PathComponent,
        target: &str,
    ) -> Result<Arc<FileInode>> {
        let host = self.host()?;
        self.check_not_protected(&host)?;
        self.materialize(cx, &host)?;

        let mut contents = self.contents.write();
        if find_entry_key(&contents.entries, name.as_str(), host.case_sensitive()).is_some() {
            return Err(SfsError::AlreadyExists(self.child_path(name.as_str())));
        }
        let path = self.path().map(|base| base.join(name));
        let ino = host.allocate_inode_number(path.as_ref());
        host.overlay().save_overlay_file(ino, target.as_bytes())?;

        let child = Arc::new(FileInode {
            number: ino,
            host: self.host.clone(),
            fs_refcount: AtomicU64::new(0),
            location: Mutex::new(Some(Location {
                parent: Arc::downgrade(self),
                name: name.clone(),
            })),
            state: Mutex::new(FileState {
                kind: TreeEntryType::Symlink,
                source: None,
            }),
        });
        contents.entries.insert(
            name.as_str().to_owned(),
            DirEntry {
                kind: TreeEntryType::Symlink,
                id: None,
                ino: Some(ino),
                loaded: Some(InodePtr::File(Arc::clone(&child))),
            },
        );
        self.persist_if_materialized(&host, &mut contents)?;
        Ok(child)
    }

    /// Create or overwrite a regular file with the given content.
    pub fn write_file(
        self: &Arc<Self>,
        cx: &Cx,
        name: &PathComponent,
        content: &[u8],
        executable: bool,
    ) -> Result<Arc<FileInode>> {
        let host = self.host()?;
        self.check_not_protected(&host)?;
        self.materialize(cx, &host)?;
        let kind = if executable {
            TreeEntryType::ExecutableFile
        } else {
            TreeEntryType::RegularFile
        };

        let mut contents = self.contents.write();
        let key = find_entry_key(&contents.entries, name.as_str(), host.case_sensitive());
        if let Some(key) = key {
            let base = self.path();
            let entry = contents.entries.get_mut(&key).expect("entry present");
            if entry.kind.is_tree() {
                return Err(SfsError::IsADirectory(self.child_path(&key)));
            }
            let ino = self.ensure_entry_ino(&host, base.as_ref(), &key, entry);
            host.overlay().save_overlay_file(ino, content)?;
            entry.id = None;
            entry.kind = kind;
            let file = match &entry.loaded {
                Some(InodePtr::File(file)) => {
                    file.set_materialized(kind);
                    Arc::clone(file)
                }
                _ => {
                    let file = Arc::new(FileInode {
                        number: ino,
                        host: self.host.clone(),
                        fs_refcount: AtomicU64::new(0),
                        location: Mutex::new(Some(Location {
                            parent: Arc::downgrade(self),
                            name: name.clone(),
                        })),
                        state: Mutex::new(FileState { kind, source: None }),
                    });
                    entry.loaded = Some(InodePtr::File(Arc::clone(&file)));
                    file
                }
            };
            self.persist_if_materialized(&host, &mut contents)?;
            return Ok(file);
        }

        let path = self.path().map(|base| base.join(name));
        let ino = host.allocate_inode_number(path.as_ref());
        host.overlay().save_overlay_file(ino, content)?;
        let file = Arc::new(FileInode {
            number: ino,
            host: self.host.clone(),
            fs_refcount: AtomicU64::new(0),
            location: Mutex::new(Some(Location {
                parent: Arc::downgrade(self),
                name: name.clone(),
            })),
            state: Mutex::new(FileState { kind, source: None }),
        });
        contents.entries.insert(
            name.as_str().to_owned(),
            DirEntry {
                kind,
                id: None,
                ino: Some(ino),
                loaded: Some(InodePtr::File(Arc::clone(&file))),
            },
        );
        self.persist_if_materialized(&host, &mut contents)?;
        Ok(file)
    }

    /// Remove a non-directory entry.
    pub fn unlink(self: &Arc<Self>, cx: &Cx, name: &str) -> Result<()> {
        let host = self.host()?;
        self.check_not_protected(&host)?;
        self.materialize(cx, &host)?;

        let mut contents = self.contents.write();
        let Some(key) = find_entry_key(&contents.entries, name, host.case_sensitive()) else {
            return Err(SfsError::NotFound(self.child_path(name)));
        };
        if contents.entries[&key].kind.is_tree() {
            return Err(SfsError::IsADirectory(self.child_path(&key)));
        }
        let entry = contents.entries.remove(&key).expect("entry present");
        if let Some(loaded) = &entry.loaded {
            loaded.mark_unlinked();
        }
        if let Some(ino) = entry.ino {
            host.overlay().remove(ino)?;
        }
        self.persist_if_materialized(&host, &mut contents)?;
        Ok(())
    }

    // ── Checkout support ────────────────────────────────────────────────
    //
    // These mutators run under the mount's rename lock and bypass the
    // protected-directory guard.

    /// Point an entry at a store object, creating it if absent.
    pub fn checkout_set_entry(
        self: &Arc<Self>,
        name: &str,
        kind: TreeEntryType,
        id: ObjectId,
    ) -> Result<()> {
        let host = self.host()?;
        let mut contents = self.contents.write();
        match contents.entries.get_mut(name) {
            Some(entry) if entry.kind.is_tree() == kind.is_tree() => {
                entry.id = Some(id);
                entry.kind = kind;
                match &entry.loaded {
                    Some(InodePtr::File(file)) => file.update_source(kind, id),
                    Some(InodePtr::Tree(_)) => {
                        // Tree updates descend through the checkout
                        // recursion instead; reaching here means the child
                        // handle is stale.
                        entry.loaded = None;
                    }
                    None => {}
                }
            }
            Some(entry) => {
                if let Some(loaded) = entry.loaded.take() {
                    loaded.mark_unlinked();
                }
                if let Some(old_ino) = entry.ino {
                    host.overlay().remove(old_ino)?;
                }
                *entry = DirEntry {
                    kind,
                    id: Some(id),
                    ino: None,
                    loaded: None,
                };
            }
            None => {
                contents.entries.insert(
                    name.to_owned(),
                    DirEntry {
                        kind,
                        id: Some(id),
                        ino: None,
                        loaded: None,
                    },
                );
            }
        }
        self.persist_if_materialized(&host, &mut contents)
    }

    /// Drop an entry entirely.
    pub fn checkout_remove_entry(self: &Arc<Self>, name: &str) -> Result<()> {
        let host = self.host()?;
        let mut contents = self.contents.write();
        if let Some(entry) = contents.entries.remove(name) {
            if let Some(loaded) = &entry.loaded {
                loaded.mark_unlinked();
            }
            if let Some(ino) = entry.ino {
                host.overlay().remove(ino)?;
            }
        }
        self.persist_if_materialized(&host, &mut contents)
    }

    /// Update only the backing id of an entry, keeping any loaded handle.
    pub fn checkout_set_entry_id(
        self: &Arc<Self>,
        name: &str,
        id: Option<ObjectId>,
    ) -> Result<()> {
        let host = self.host()?;
        let mut contents = self.contents.write();
        if let Some(entry) = contents.entries.get_mut(name) {
            entry.id = id;
        }
        self.persist_if_materialized(&host, &mut contents)
    }

    /// After a checkout pass mutated this directory entry-by-entry, decide
    /// what backs it now: if the entries exactly match `new_tree`, the
    /// directory becomes a clean view of `new_id`; otherwise it stays
    /// materialized and the listing is persisted. Returns whether the
    /// directory is clean at `new_id`.
    pub fn checkout_reconcile_source(
        self: &Arc<Self>,
        new_id: ObjectId,
        new_tree: &Tree,
    ) -> Result<bool> {
        let host = self.host()?;
        let mut contents = self.contents.write();
        let matches = contents.entries.len() == new_tree.len()
            && contents.entries.iter().all(|(name, entry)| {
                new_tree.get(name).is_some_and(|tree_entry| {
                    entry.id == Some(tree_entry.id) && entry.kind == tree_entry.kind
                })
            });
        if matches {
            contents.source = Some(new_id);
            return Ok(true);
        }
        contents.source = None;
        self.persist_if_materialized(&host, &mut contents)?;
        Ok(false)
    }

    /// Fast-path swap of an unmodified, unloaded directory onto a new tree.
    pub fn checkout_swap_source(
        self: &Arc<Self>,
        new_id: ObjectId,
        new_tree: &Tree,
    ) -> Result<()> {
        let mut contents = self.contents.write();
        for entry in contents.entries.values() {
            if let Some(loaded) = &entry.loaded {
                loaded.mark_unlinked();
            }
        }
        contents.entries = entries_from_tree(new_tree);
        contents.source = Some(new_id);
        Ok(())
    }

    // ── Unloading ───────────────────────────────────────────────────────

    /// Drop loaded handles for clean children the kernel driver does not
    /// reference, enabling the checkout fast path.
    pub fn unload_unreferenced_children(self: &Arc<Self>) {
        let mut contents = self.contents.write();
        for entry in contents.entries.values_mut() {
            let Some(loaded) = &entry.loaded else { continue };
            match loaded {
                InodePtr::Tree(child) => {
                    let child = Arc::clone(child);
                    child.unload_unreferenced_children();
                    if !child.is_fs_referenced()
                        && child.source_id().is_some()
                        && !child.has_loaded_children()
                    {
                        entry.loaded = None;
                    }
                }
                InodePtr::File(child) => {
                    if !child.is_fs_referenced() && !child.is_materialized() {
                        entry.loaded = None;
                    }
                }
            }
        }
    }

    /// Visit every loaded inode below (and including) this one.
    pub fn for_each_loaded(
        self: &Arc<Self>,
        path: &RepoPath,
        visit: &mut dyn FnMut(&RepoPath, &InodePtr),
    ) {
        let children: Vec<(String, InodePtr)> = {
            let contents = self.contents.read();
            contents
                .entries
                .iter()
                .filter_map(|(name, entry)| {
                    entry.loaded.clone().map(|loaded| (name.clone(), loaded))
                })
                .collect()
        };
        for (name, loaded) in children {
            let Ok(component) = PathComponent::new(&name) else { continue };
            let child_path = path.join(&component);
            visit(&child_path, &loaded);
            if let InodePtr::Tree(tree) = &loaded {
                tree.for_each_loaded(&child_path, visit);
            }
        }
    }
}

// ── Inode map ───────────────────────────────────────────────────────────────

/// One live inode captured for takeover.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerializedInode {
    pub path: RepoPath,
    pub number: InodeNumber,
}

/// Portable snapshot of the inode map, handed to a successor process.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SerializedInodeMap {
    pub next_inode_number: u64,
    pub inodes: Vec<SerializedInode>,
}

/// Registry of inode numbers for one mount.
pub struct InodeMap {
    next: AtomicU64,
    reserved: Mutex<HashMap<RepoPath, InodeNumber>>,
    root: Mutex<Option<Arc<TreeInode>>>,
    unmounted: AtomicBool,
}

impl Default for InodeMap {
    fn default() -> Self {
        Self::new()
    }
}

impl InodeMap {
    #[must_use]
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(InodeNumber::ROOT.0 + 1),
            reserved: Mutex::new(HashMap::new()),
            root: Mutex::new(None),
            unmounted: AtomicBool::new(false),
        }
    }

    /// Start from scratch: numbers are assigned fresh.
    pub fn initialize(&self, root: Arc<TreeInode>) {
        *self.root.lock() = Some(root);
    }

    /// Seed allocation above every number the persistent overlay recorded.
    pub fn initialize_from_overlay(
        &self,
        root: Arc<TreeInode>,
        overlay: &dyn Overlay,
    ) -> Result<()> {
        if let Some(max) = overlay.max_assigned_inode()? {
            self.next.store(max.0 + 1, Ordering::Release);
        }
        *self.root.lock() = Some(root);
        Ok(())
    }

    /// Restore the predecessor's numbering so every live inode keeps its
    /// number when its path is next loaded.
    pub fn initialize_from_takeover(
        &self,
        root: Arc<TreeInode>,
        serialized: &SerializedInodeMap,
    ) {
        self.next
            .store(serialized.next_inode_number, Ordering::Release);
        let mut reserved = self.reserved.lock();
        for inode in &serialized.inodes {
            reserved.insert(inode.path.clone(), inode.number);
        }
        drop(reserved);
        *self.root.lock() = Some(root);
    }

    /// Allocate a number, honoring any takeover reservation for `path`.
    pub fn allocate(&self, path: Option<&RepoPath>) -> InodeNumber {
        if let Some(path) = path {
            if let Some(number) = self.reserved.lock().remove(path) {
                return number;
            }
        }
        InodeNumber(self.next.fetch_add(1, Ordering::AcqRel))
    }

    #[must_use]
    pub fn get_root_inode(&self) -> Option<Arc<TreeInode>> {
        self.root.lock().clone()
    }

    /// Numbers of loaded inodes the kernel driver still references.
    #[must_use]
    pub fn get_referenced_inodes(&self) -> Vec<InodeNumber> {
        let Some(root) = self.get_root_inode() else {
            return Vec::new();
        };
        let mut referenced = Vec::new();
        if root.is_fs_referenced() {
            referenced.push(root.number());
        }
        root.for_each_loaded(&RepoPath::root(), &mut |_, inode| {
            let is_referenced = match inode {
                InodePtr::Tree(tree) => tree.is_fs_referenced(),
                InodePtr::File(file) => file.is_fs_referenced(),
            };
            if is_referenced {
                referenced.push(inode.number());
            }
        });
        referenced
    }

    /// Mark that the kernel has detached; inode state no longer reflects a
    /// live mount point.
    pub fn set_unmounted(&self) {
        self.unmounted.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn is_unmounted(&self) -> bool {
        self.unmounted.load(Ordering::Acquire)
    }

    /// Tear the map down, optionally capturing live numbering for takeover.
    pub fn shutdown(&self, do_takeover: bool) -> SerializedInodeMap {
        let root = self.root.lock().take();
        let mut serialized = SerializedInodeMap {
            next_inode_number: self.next.load(Ordering::Acquire),
            inodes: Vec::new(),
        };
        if do_takeover {
            if let Some(root) = &root {
                root.for_each_loaded(&RepoPath::root(), &mut |path, inode| {
                    serialized.inodes.push(SerializedInode {
                        path: path.clone(),
                        number: inode.number(),
                    });
                });
            }
        }
        debug!(
            takeover = do_takeover,
            live = serialized.inodes.len(),
            "inode map shut down"
        );
        serialized
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use sfs_store::{CommitBuilder, MemoryObjectStore, MemoryOverlay};
    use sfs_types::RootId;

    /// Minimal host wiring a store, an overlay, and an inode map together.
    struct TestHost {
        store: Arc<MemoryObjectStore>,
        overlay: Arc<MemoryOverlay>,
        map: InodeMap,
        case_sensitive: bool,
        protected: Mutex<Option<InodeNumber>>,
    }

    impl TestHost {
        fn new(case_sensitive: bool) -> Arc<Self> {
            Arc::new(Self {
                store: Arc::new(MemoryObjectStore::new()),
                overlay: Arc::new(MemoryOverlay::new(true)),
                map: InodeMap::new(),
                case_sensitive,
                protected: Mutex::new(None),
            })
        }
    }

    impl InodeHost for TestHost {
        fn object_store(&self) -> Arc<dyn ObjectStore> {
            Arc::clone(&self.store) as Arc<dyn ObjectStore>
        }

        fn overlay(&self) -> Arc<dyn Overlay> {
            Arc::clone(&self.overlay) as Arc<dyn Overlay>
        }

        fn case_sensitive(&self) -> bool {
            self.case_sensitive
        }

        fn allocate_inode_number(&self, path: Option<&RepoPath>) -> InodeNumber {
            self.map.allocate(path)
        }

        fn protected_directory(&self) -> Option<InodeNumber> {
            *self.protected.lock()
        }
    }

    fn test_cx() -> Cx {
        Cx::for_testing()
    }

    fn host_with_commit(files: &[(&str, &str)]) -> (Arc<TestHost>, Arc<TreeInode>) {
        let host = TestHost::new(true);
        let mut builder = CommitBuilder::new();
        for (path, content) in files {
            builder = builder.file(path, *content);
        }
        let tree_id = builder.commit(&host.store, RootId::from("R0"));
        let cx = test_cx();
        let fetch = FetchContext::new("test");
        let tree = host
            .store
            .get_tree(&cx, &tree_id, &fetch)
            .expect("tree stored");
        let dyn_host: Arc<dyn InodeHost> = Arc::clone(&host) as Arc<dyn InodeHost>;
        let root = TreeInode::new_root_from_tree(&dyn_host, &tree, tree_id);
        host.map.initialize(Arc::clone(&root));
        (host, root)
    }

    #[test]
    fn lazy_load_walks_nested_paths() {
        let (_host, root) = host_with_commit(&[("a", "1"), ("sub/inner/b", "2")]);
        let cx = test_cx();
        let fetch = FetchContext::new("test");

        let path = RepoPath::parse("sub/inner/b").unwrap();
        let inode = root.get_child_recursive(&cx, &path, &fetch).unwrap();
        let file = inode.as_file().expect("file inode");
        assert_eq!(file.read_all(&cx, &fetch).unwrap(), b"2");
        assert_eq!(inode.path().unwrap().as_str(), "sub/inner/b");
    }

    #[test]
    fn missing_child_is_not_found() {
        let (_host, root) = host_with_commit(&[("a", "1")]);
        let cx = test_cx();
        let fetch = FetchContext::new("test");
        let err = root.get_or_load_child(&cx, "nope", &fetch).unwrap_err();
        assert!(matches!(err, SfsError::NotFound(_)));
    }

    #[test]
    fn case_insensitive_lookup_finds_entries() {
        let host = TestHost::new(false);
        let tree_id = CommitBuilder::new()
            .file("README", "docs")
            .commit(&host.store, RootId::from("R0"));
        let cx = test_cx();
        let fetch = FetchContext::new("test");
        let tree = host.store.get_tree(&cx, &tree_id, &fetch).unwrap();
        let dyn_host: Arc<dyn InodeHost> = Arc::clone(&host) as Arc<dyn InodeHost>;
        let root = TreeInode::new_root_from_tree(&dyn_host, &tree, tree_id);
        host.map.initialize(Arc::clone(&root));

        let inode = root.get_or_load_child(&cx, "readme", &fetch).unwrap();
        assert_eq!(
            inode.as_file().unwrap().read_all(&cx, &fetch).unwrap(),
            b"docs"
        );
    }

    #[test]
    fn mkdir_and_write_materialize_the_chain() {
        let (host, root) = host_with_commit(&[("a", "1")]);
        let cx = test_cx();
        let fetch = FetchContext::new("test");

        let dir = root
            .mkdir(&cx, &PathComponent::new("newdir").unwrap())
            .unwrap();
        assert!(root.source_id().is_none(), "root materialized by mkdir");

        let file = dir
            .write_file(&cx, &PathComponent::new("f").unwrap(), b"local", false)
            .unwrap();
        assert!(file.is_materialized());
        assert_eq!(file.read_all(&cx, &fetch).unwrap(), b"local");
        assert_eq!(file.path().unwrap().as_str(), "newdir/f");

        // The listing is persisted in the overlay.
        let dir_listing = host
            .overlay
            .load_overlay_dir(dir.number())
            .unwrap()
            .unwrap();
        assert!(dir_listing.contains_key("f"));
    }

    #[test]
    fn mkdir_existing_name_is_already_exists() {
        let (_host, root) = host_with_commit(&[("a", "1")]);
        let cx = test_cx();
        let err = root
            .mkdir(&cx, &PathComponent::new("a").unwrap())
            .unwrap_err();
        assert!(matches!(err, SfsError::AlreadyExists(_)));
    }

    #[test]
    fn overwrite_clean_file_materializes_it() {
        let (_host, root) = host_with_commit(&[("a", "old")]);
        let cx = test_cx();
        let fetch = FetchContext::new("test");

        // Load first so the overwrite updates the live inode.
        let before = root.get_or_load_child(&cx, "a", &fetch).unwrap();
        assert!(!before.as_file().unwrap().is_materialized());

        root.write_file(&cx, &PathComponent::new("a").unwrap(), b"new", false)
            .unwrap();
        let after = root.get_or_load_child(&cx, "a", &fetch).unwrap();
        assert!(after.as_file().unwrap().is_materialized());
        assert_eq!(after.as_file().unwrap().read_all(&cx, &fetch).unwrap(), b"new");
    }

    #[test]
    fn unlink_removes_and_invalidates_paths() {
        let (_host, root) = host_with_commit(&[("a", "1")]);
        let cx = test_cx();
        let fetch = FetchContext::new("test");

        let inode = root.get_or_load_child(&cx, "a", &fetch).unwrap();
        root.unlink(&cx, "a").unwrap();
        assert!(inode.path().is_none(), "unlinked inode has no path");
        assert!(matches!(
            root.get_or_load_child(&cx, "a", &fetch),
            Err(SfsError::NotFound(_))
        ));
    }

    #[test]
    fn protected_directory_rejects_mutation() {
        let (host, root) = host_with_commit(&[("a", "1")]);
        let cx = test_cx();
        *host.protected.lock() = Some(root.number());

        let err = root
            .mkdir(&cx, &PathComponent::new("x").unwrap())
            .unwrap_err();
        assert_eq!(err, SfsError::ProtectedDirectory);
        let err = root.unlink(&cx, "a").unwrap_err();
        assert_eq!(err, SfsError::ProtectedDirectory);
    }

    #[test]
    fn readlink_returns_target() {
        let host = TestHost::new(true);
        let tree_id = CommitBuilder::new()
            .symlink("link", "a/b")
            .commit(&host.store, RootId::from("R0"));
        let cx = test_cx();
        let fetch = FetchContext::new("test");
        let tree = host.store.get_tree(&cx, &tree_id, &fetch).unwrap();
        let dyn_host: Arc<dyn InodeHost> = Arc::clone(&host) as Arc<dyn InodeHost>;
        let root = TreeInode::new_root_from_tree(&dyn_host, &tree, tree_id);
        host.map.initialize(Arc::clone(&root));

        let inode = root.get_or_load_child(&cx, "link", &fetch).unwrap();
        assert_eq!(
            inode.as_file().unwrap().readlink(&cx, &fetch).unwrap(),
            "a/b"
        );
    }

    #[test]
    fn unload_drops_clean_unreferenced_children() {
        let (_host, root) = host_with_commit(&[("sub/a", "1")]);
        let cx = test_cx();
        let fetch = FetchContext::new("test");

        let sub = root.get_or_load_child_tree(&cx, "sub", &fetch).unwrap();
        let _file = sub.get_or_load_child(&cx, "a", &fetch).unwrap();
        assert!(root.has_loaded_children());

        root.unload_unreferenced_children();
        assert!(!root.has_loaded_children());
    }

    #[test]
    fn unload_keeps_fs_referenced_children() {
        let (_host, root) = host_with_commit(&[("sub/a", "1")]);
        let cx = test_cx();
        let fetch = FetchContext::new("test");

        let sub = root.get_or_load_child(&cx, "sub", &fetch).unwrap();
        sub.fs_ref_increment();
        root.unload_unreferenced_children();
        assert!(root.has_loaded_children());

        sub.fs_ref_decrement();
        root.unload_unreferenced_children();
        assert!(!root.has_loaded_children());
    }

    #[test]
    fn takeover_preserves_live_inode_numbers() {
        let (host, root) = host_with_commit(&[("sub/a", "1"), ("b", "2")]);
        let cx = test_cx();
        let fetch = FetchContext::new("test");

        let sub = root.get_or_load_child_tree(&cx, "sub", &fetch).unwrap();
        let file = sub.get_or_load_child(&cx, "a", &fetch).unwrap();
        let sub_number = sub.number();
        let file_number = file.number();

        let serialized = host.map.shutdown(true);
        assert_eq!(serialized.inodes.len(), 2);

        // Second generation of the same mount.
        let (host2, root2) = host_with_commit(&[("sub/a", "1"), ("b", "2")]);
        host2.map.initialize_from_takeover(Arc::clone(&root2), &serialized);

        let sub2 = root2.get_or_load_child_tree(&cx, "sub", &fetch).unwrap();
        let file2 = sub2.get_or_load_child(&cx, "a", &fetch).unwrap();
        assert_eq!(sub2.number(), sub_number);
        assert_eq!(file2.number(), file_number);
    }

    #[test]
    fn referenced_inodes_reported_by_map() {
        let (host, root) = host_with_commit(&[("a", "1")]);
        let cx = test_cx();
        let fetch = FetchContext::new("test");

        let file = root.get_or_load_child(&cx, "a", &fetch).unwrap();
        assert!(host.map.get_referenced_inodes().is_empty());
        file.fs_ref_increment();
        assert_eq!(host.map.get_referenced_inodes(), vec![file.number()]);
    }
}
