#![forbid(unsafe_code)]
//! Mount lifecycle and checkout engine for SnapFS.
//!
//! A [`SnapMount`] exposes one source-control commit as a live directory
//! tree. The mount walks a strict lifecycle (`initialize` → `start_channel`
//! → running → `unmount`/`shutdown`/`destroy`), lazily materializes content
//! from the object store, keeps local modifications in the overlay, and can
//! atomically switch its view to another commit via
//! [`SnapMount::checkout`].

pub mod channel;
pub mod checkout;
pub mod config;
pub mod control;
pub mod diff;
pub mod handshake;
pub mod resolve;
pub mod server;
pub mod state;
pub mod sync;

pub use checkout::{
    CheckoutConflict, CheckoutMode, CheckoutResult, CheckoutTimes, ConflictType,
};
pub use state::MountState;

use crate::channel::{
    FuseChannelData, FuseDevice, FuseInitSettings, MountChannel, TakeoverData,
};
use crate::config::{CheckoutConfig, MountProtocol};
use crate::diff::GitIgnoreStack;
use crate::handshake::{BeginUnmount, MountingHandshake};
use crate::server::ServerState;
use crate::state::StateCell;
use crate::sync::SharedPromise;
use asupersync::Cx;
use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use sfs_error::{Result, SfsError};
use sfs_inode::{InodeHost, InodeMap, InodePtr, SerializedInodeMap, TreeInode};
use sfs_journal::Journal;
use sfs_store::{FetchContext, ObjectStore, Overlay, RootTree};
use sfs_types::{
    next_mount_generation, InodeNumber, RepoPath, RootId, SnapTimestamp,
};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

// ── Parent commit holder ────────────────────────────────────────────────────

/// Reader/writer-locked holder of the commit root the mount presents.
///
/// The checkout engine owns the writer side for the whole transaction;
/// everyone else takes short reads. Bounded acquires detect a checkout in
/// progress.
pub struct ParentCommit {
    inner: RwLock<RootId>,
}

impl ParentCommit {
    fn new(parent: RootId) -> Self {
        Self {
            inner: RwLock::new(parent),
        }
    }

    /// Snapshot of the current parent.
    #[must_use]
    pub fn get(&self) -> RootId {
        self.inner.read().clone()
    }

    pub(crate) fn read(&self) -> RwLockReadGuard<'_, RootId> {
        self.inner.read()
    }

    pub(crate) fn write(&self) -> RwLockWriteGuard<'_, RootId> {
        self.inner.write()
    }

    pub(crate) fn try_read_for(
        &self,
        timeout: Duration,
    ) -> Option<RwLockReadGuard<'_, RootId>> {
        self.inner.try_read_for(timeout)
    }

    pub(crate) fn try_write_for(
        &self,
        timeout: Duration,
    ) -> Option<RwLockWriteGuard<'_, RootId>> {
        self.inner.try_write_for(timeout)
    }
}

// ── Owner ───────────────────────────────────────────────────────────────────

/// Uid/gid pair presented as the owner of every inode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Owner {
    pub uid: u32,
    pub gid: u32,
}

/// Metadata stamped onto inodes created by the kernel dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InodeMetadata {
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub timestamp: SnapTimestamp,
}

// ── The mount ───────────────────────────────────────────────────────────────

pub struct SnapMount {
    pub(crate) config: Arc<CheckoutConfig>,
    pub(crate) server_state: Arc<ServerState>,
    object_store: Arc<dyn ObjectStore>,
    overlay: Arc<dyn Overlay>,
    pub(crate) journal: Arc<Journal>,
    inode_map: Arc<InodeMap>,
    pub(crate) state: StateCell,
    pub(crate) parent_commit: ParentCommit,
    handshake: MountingHandshake,
    /// Nanosecond timestamp of the last checkout; released store, acquired
    /// load, so new inodes pick it up without locking.
    last_checkout_time: AtomicU64,
    prefetches_in_progress: AtomicU64,
    owner: Mutex<Owner>,
    generation: u64,
    /// Inode number of the control directory; 0 until it is recorded.
    control_dir_ino: AtomicU64,
    channel: Mutex<Option<MountChannel>>,
    channel_completion: SharedPromise<TakeoverData>,
    pub(crate) rename_lock: Mutex<()>,
    released: AtomicBool,
}

impl SnapMount {
    pub fn new(
        config: Arc<CheckoutConfig>,
        server_state: Arc<ServerState>,
        object_store: Arc<dyn ObjectStore>,
        overlay: Arc<dyn Overlay>,
        journal: Arc<Journal>,
    ) -> Arc<Self> {
        let parent = config.parent_commit();
        let now = SnapTimestamp::from_system_time(server_state.clock.now());
        Arc::new(Self {
            config,
            server_state,
            object_store,
            overlay,
            journal,
            inode_map: Arc::new(InodeMap::new()),
            state: StateCell::new(),
            parent_commit: ParentCommit::new(parent),
            handshake: MountingHandshake::new(),
            last_checkout_time: AtomicU64::new(now.as_nanos()),
            prefetches_in_progress: AtomicU64::new(0),
            owner: Mutex::new(Owner::default()),
            generation: next_mount_generation(),
            control_dir_ino: AtomicU64::new(0),
            channel: Mutex::new(None),
            channel_completion: SharedPromise::new(),
            rename_lock: Mutex::new(()),
            released: AtomicBool::new(false),
        })
    }

    // ── Accessors ───────────────────────────────────────────────────────

    #[must_use]
    pub fn state(&self) -> MountState {
        self.state.load()
    }

    #[must_use]
    pub fn mount_generation(&self) -> u64 {
        self.generation
    }

    #[must_use]
    pub fn parent_commit(&self) -> RootId {
        self.parent_commit.get()
    }

    #[must_use]
    pub fn checkout_config(&self) -> &Arc<CheckoutConfig> {
        &self.config
    }

    #[must_use]
    pub fn journal(&self) -> &Arc<Journal> {
        &self.journal
    }

    #[must_use]
    pub fn inode_map(&self) -> &Arc<InodeMap> {
        &self.inode_map
    }

    #[must_use]
    pub fn owner(&self) -> Owner {
        *self.owner.lock()
    }

    pub fn set_owner(&self, uid: u32, gid: u32) {
        *self.owner.lock() = Owner { uid, gid };
    }

    /// Metadata for an inode created now: the mount owner plus the last
    /// checkout time, so files born during a checkout carry its timestamp.
    #[must_use]
    pub fn initial_inode_metadata(&self, mode: u32) -> InodeMetadata {
        let owner = self.owner();
        InodeMetadata {
            mode,
            uid: owner.uid,
            gid: owner.gid,
            timestamp: self.last_checkout_time(),
        }
    }

    #[must_use]
    pub fn last_checkout_time(&self) -> SnapTimestamp {
        SnapTimestamp(self.last_checkout_time.load(Ordering::Acquire))
    }

    pub fn set_last_checkout_time(&self, time: SnapTimestamp) {
        self.last_checkout_time
            .store(time.as_nanos(), Ordering::Release);
    }

    /// The attached channel, if any.
    #[must_use]
    pub fn channel(&self) -> Option<MountChannel> {
        self.channel.lock().clone()
    }

    /// Whether a kernel attach was ever initiated.
    #[must_use]
    pub fn channel_mount_started(&self) -> bool {
        self.handshake.channel_mount_started()
    }

    /// Whether a detach was ever initiated.
    #[must_use]
    pub fn channel_unmount_started(&self) -> bool {
        self.handshake.channel_unmount_started()
    }

    #[must_use]
    pub fn control_dir_inode_number(&self) -> Option<InodeNumber> {
        match self.control_dir_ino.load(Ordering::Acquire) {
            0 => None,
            ino => Some(InodeNumber(ino)),
        }
    }

    pub(crate) fn record_control_dir(&self, ino: InodeNumber) {
        self.control_dir_ino.store(ino.0, Ordering::Release);
    }

    /// Whether the mount has released its resources after destroy.
    #[must_use]
    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    pub(crate) fn object_store(&self) -> Arc<dyn ObjectStore> {
        Arc::clone(&self.object_store)
    }

    pub(crate) fn top_level_ignores(&self) -> GitIgnoreStack {
        self.server_state.top_level_ignores.clone()
    }

    pub(crate) fn root_inode(&self) -> Result<Arc<TreeInode>> {
        self.inode_map
            .get_root_inode()
            .ok_or_else(|| SfsError::Io("mount has no root inode".to_owned()))
    }

    fn mount_path_str(&self) -> String {
        self.config.mount_path.display().to_string()
    }

    // ── Initialize ──────────────────────────────────────────────────────

    /// Bring the mount from `UNINITIALIZED` to `INITIALIZED`: record the
    /// configured parent, initialize the overlay, construct the root inode,
    /// seed the inode map (from a takeover snapshot, the persistent
    /// overlay, or from scratch) and set up the control directory.
    pub fn initialize(
        self: &Arc<Self>,
        cx: &Cx,
        progress: &(dyn Fn(&str) + Send + Sync),
        takeover: Option<&SerializedInodeMap>,
    ) -> Result<()> {
        let mount_path = self.mount_path_str();
        self.state.transition(
            &mount_path,
            MountState::Uninitialized,
            MountState::Initializing,
        );
        let result = self.initialize_impl(cx, progress, takeover);
        match &result {
            Ok(()) => self.state.transition(
                &mount_path,
                MountState::Initializing,
                MountState::Initialized,
            ),
            Err(err) => {
                error!(mount = %mount_path, error = %err, "mount initialization failed");
                self.state.transition(
                    &mount_path,
                    MountState::Initializing,
                    MountState::InitError,
                );
            }
        }
        result
    }

    fn initialize_impl(
        self: &Arc<Self>,
        cx: &Cx,
        progress: &(dyn Fn(&str) + Send + Sync),
        takeover: Option<&SerializedInodeMap>,
    ) -> Result<()> {
        let mount_path = self.mount_path_str();
        self.server_state
            .fault_injector
            .check(cx, "mount", &mount_path)?;

        let parent = self.config.parent_commit();
        *self.parent_commit.write() = parent.clone();

        // Record the transition from "no snapshot" to the configured parent
        // so later entries can carry the snapshot id forward.
        self.journal.record_hash_update(None, parent.clone());

        // The overlay must be up before anything can allocate inode
        // numbers, including the root inode.
        self.overlay
            .initialize(cx, &self.config.mount_path, progress)?;

        let fetch = FetchContext::new("initialize");
        let root = self.create_root_inode(cx, &parent, &fetch)?;

        match takeover {
            Some(snapshot) => self.inode_map.initialize_from_takeover(root, snapshot),
            None if self.overlay.is_persistent() => {
                self.inode_map
                    .initialize_from_overlay(root, self.overlay.as_ref())?;
            }
            None => self.inode_map.initialize(root),
        }

        control::setup_control_dir(self, cx)
    }

    fn create_root_inode(
        self: &Arc<Self>,
        cx: &Cx,
        parent: &RootId,
        fetch: &FetchContext,
    ) -> Result<Arc<TreeInode>> {
        let host: Arc<dyn InodeHost> = Arc::clone(self) as Arc<dyn InodeHost>;
        // A persisted root directory wins: the root is materialized then
        // and carries no tree hash.
        if let Some(dir) = self.overlay.load_overlay_dir(InodeNumber::ROOT)? {
            if !dir.is_empty() {
                return Ok(TreeInode::new_root_from_overlay(&host, dir));
            }
        }
        let root_tree = self.object_store.get_root_tree(cx, parent, fetch)?;
        Ok(TreeInode::new_root_from_tree(
            &host,
            &root_tree.tree,
            root_tree.id,
        ))
    }

    // ── Channel start ───────────────────────────────────────────────────

    /// Attach to the kernel driver and move to `RUNNING`.
    pub fn start_channel(self: &Arc<Self>, cx: &Cx, read_only: bool) -> Result<()> {
        let mount_path = self.mount_path_str();
        self.state
            .transition(&mount_path, MountState::Initialized, MountState::Starting);

        // The mount point directory may not exist yet; creating it is best
        // effort, the attach will surface any real problem.
        let _ = std::fs::create_dir_all(&self.config.mount_path);

        match self.channel_mount(cx, read_only) {
            Ok(()) => {
                self.channel_init_successful();
                Ok(())
            }
            Err(err) => {
                self.state.transition_to_channel_error(&mount_path);
                Err(err)
            }
        }
    }

    fn channel_mount(self: &Arc<Self>, cx: &Cx, read_only: bool) -> Result<()> {
        let mount_promise = self.handshake.begin_mount()?;
        match self.attach_channel(cx, read_only) {
            Ok(channel) => {
                *self.channel.lock() = Some(channel);
                mount_promise.fulfill(Ok(()));
                Ok(())
            }
            Err(err) => {
                mount_promise.fulfill(Err(err.clone()));
                Err(err)
            }
        }
    }

    fn attach_channel(self: &Arc<Self>, cx: &Cx, read_only: bool) -> Result<MountChannel> {
        let server = &self.server_state;
        let config = &self.config;
        let path = &config.mount_path;

        match config.mount_protocol {
            MountProtocol::Projection => {
                let backend = server.projection_backend.as_ref().ok_or_else(|| {
                    SfsError::Channel("no projection backend configured".to_owned())
                })?;
                let session = backend.start(cx, path, read_only)?;
                Ok(MountChannel::Projection(session))
            }
            MountProtocol::Nfs => {
                let nfs = server.nfs_server.as_ref().ok_or_else(|| {
                    SfsError::Channel("no NFS server configured".to_owned())
                })?;
                let iosize = server.tunables.nfs_io_size;
                let (session, mountd_addr) =
                    nfs.register_mount(cx, path, InodeNumber::ROOT, iosize)?;
                let unix_socket = server
                    .tunables
                    .use_unix_socket
                    .then(|| config.client_directory.join("nfsd.socket"));
                session.initialize_socket(cx, unix_socket)?;
                server.priv_helper.nfs_mount(
                    cx,
                    path,
                    &mountd_addr,
                    &session.nfsd_addr(),
                    read_only,
                    iosize,
                )?;
                Ok(MountChannel::Nfs(session))
            }
            MountProtocol::Fuse => {
                let device = server.priv_helper.fuse_mount(cx, path, read_only)?;
                if self.handshake.channel_unmount_started() {
                    device.close();
                    if let Err(unmount_err) = server.priv_helper.fuse_unmount(cx, path) {
                        error!(
                            mount = %path.display(),
                            error = %unmount_err,
                            "fuse mount was cancelled, but rollback (fuse_unmount) failed"
                        );
                        return Err(unmount_err);
                    }
                    return Err(SfsError::DeviceUnmountedDuringInitialization(
                        path.display().to_string(),
                    ));
                }
                let settings = FuseInitSettings {
                    num_threads: server.tunables.fuse_num_threads,
                    request_timeout: server.tunables.fuse_request_timeout,
                    maximum_requests: server.tunables.fuse_maximum_requests,
                };
                let session = server.fuse_backend.create_session(
                    cx,
                    path,
                    device,
                    settings,
                    config.case_sensitive,
                    config.require_utf8_path,
                )?;
                Ok(MountChannel::Fuse(session))
            }
        }
    }

    /// Construct the FUSE channel from a predecessor's preserved device,
    /// bypassing the privileged-helper attach.
    pub fn takeover_fuse(self: &Arc<Self>, cx: &Cx, data: FuseChannelData) -> Result<()> {
        let mount_path = self.mount_path_str();
        self.state
            .transition(&mount_path, MountState::Initialized, MountState::Starting);

        let attach = (|| -> Result<()> {
            let mount_promise = self.handshake.begin_mount()?;
            mount_promise.fulfill(Ok(()));
            let session = self.server_state.fuse_backend.create_session_from_takeover(
                cx,
                &self.config.mount_path,
                data,
            )?;
            *self.channel.lock() = Some(MountChannel::Fuse(session));
            Ok(())
        })();

        match attach {
            Ok(()) => {
                self.channel_init_successful();
                Ok(())
            }
            Err(err) => {
                self.state.transition_to_channel_error(&mount_path);
                Err(err)
            }
        }
    }

    fn channel_init_successful(self: &Arc<Self>) {
        let mount_path = self.mount_path_str();
        // This can only fail if shutdown() won the race before the kernel
        // finished initializing; that is a bug in the caller's sequencing.
        self.state
            .transition(&mount_path, MountState::Starting, MountState::Running);

        let channel = self
            .channel
            .lock()
            .clone()
            .expect("channel attached before init-successful");
        let mount = Arc::clone(self);
        std::thread::spawn(move || mount.watch_channel_completion(channel));
    }

    /// Runs on its own thread: waits for the channel to terminate, then
    /// prepares the takeover payload.
    fn watch_channel_completion(self: Arc<Self>, channel: MountChannel) {
        let cx = Cx::for_request();
        match channel {
            MountChannel::Fuse(session) => match session.completion().wait(&cx) {
                Ok(stop) => {
                    let device = stop.device.filter(FuseDevice::is_open);
                    if device.is_none() {
                        // The kernel side is gone; inode state no longer
                        // mirrors a live mount point.
                        self.inode_map.set_unmounted();
                    }
                    self.complete_channel(device, stop.init_settings);
                }
                Err(err) => self.fail_channel_completion(err),
            },
            MountChannel::Nfs(session) => {
                let result = session.completion().wait(&cx);
                if let Some(nfs) = &self.server_state.nfs_server {
                    nfs.unregister_mount(&self.config.mount_path);
                    // The channel's sockets belong to the server's event
                    // loop; tear the handle down over there.
                    let taken = self.channel.lock().take();
                    nfs.run_on_event_loop(Box::new(move || drop(taken)));
                }
                self.inode_map.set_unmounted();
                match result {
                    Ok(_) => self.complete_channel(None, FuseInitSettings::default()),
                    Err(err) => self.fail_channel_completion(err),
                }
            }
            MountChannel::Projection(session) => match session.completion().wait(&cx) {
                Ok(_) => {
                    self.inode_map.set_unmounted();
                    self.complete_channel(None, FuseInitSettings::default());
                }
                Err(err) => self.fail_channel_completion(err),
            },
        }
    }

    fn complete_channel(&self, device: Option<FuseDevice>, settings: FuseInitSettings) {
        let data = TakeoverData {
            mount_path: self.config.mount_path.clone(),
            client_directory: self.config.client_directory.clone(),
            bind_mounts: Vec::new(),
            fuse_device: device,
            init_settings: settings,
            // Filled in by shutdown when it serializes the inode map.
            serialized_inode_map: SerializedInodeMap::default(),
        };
        self.channel_completion.fulfill(Ok(data));
    }

    fn fail_channel_completion(&self, err: SfsError) {
        error!(
            mount = %self.config.mount_path.display(),
            error = %err,
            "channel session completed with error"
        );
        self.channel_completion.fulfill(Err(err));
    }

    /// Promise resolved with the takeover payload when the channel
    /// terminates.
    #[must_use]
    pub fn get_channel_completion_future(&self) -> SharedPromise<TakeoverData> {
        self.channel_completion.clone()
    }

    // ── Unmount ─────────────────────────────────────────────────────────

    /// Detach from the kernel driver. Idempotent: concurrent callers join
    /// the first unmount and observe its outcome.
    pub fn unmount(&self, cx: &Cx) -> Result<()> {
        let (unmount_promise, mount_promise) = match self.handshake.begin_unmount() {
            BeginUnmount::AlreadyUnmounting(promise) => return promise.wait(cx),
            BeginUnmount::Started { unmount, mount } => (unmount, mount),
        };

        let Some(mount_promise) = mount_promise else {
            // No attach was ever started; nothing to detach.
            unmount_promise.fulfill(Ok(()));
            return Ok(());
        };

        if mount_promise.wait(cx).is_err() {
            // The attach failed; the kernel side never came up.
            unmount_promise.fulfill(Ok(()));
            return Ok(());
        }

        let result = self.detach_channel(cx);
        unmount_promise.fulfill(result.clone());
        result
    }

    fn detach_channel(&self, cx: &Cx) -> Result<()> {
        let path = &self.config.mount_path;
        let channel = self.channel.lock().clone();
        match channel {
            Some(MountChannel::Projection(session)) => {
                let result = session.stop(cx);
                *self.channel.lock() = None;
                result
            }
            Some(MountChannel::Nfs(_)) => {
                self.server_state.priv_helper.nfs_unmount(cx, path)
            }
            Some(MountChannel::Fuse(_)) => {
                self.server_state.priv_helper.fuse_unmount(cx, path)
            }
            None => match self.config.mount_protocol {
                MountProtocol::Nfs => self.server_state.priv_helper.nfs_unmount(cx, path),
                _ => self.server_state.priv_helper.fuse_unmount(cx, path),
            },
        }
    }

    // ── Shutdown & destroy ──────────────────────────────────────────────

    /// Tear the mount down to `SHUT_DOWN`, optionally serializing the inode
    /// map for takeover.
    ///
    /// Callable from running and error states; the not-yet-started states
    /// only when `allow_not_started`. Anything else reports an illegal
    /// transition.
    pub fn shutdown(
        &self,
        cx: &Cx,
        do_takeover: bool,
        allow_not_started: bool,
    ) -> Result<SerializedInodeMap> {
        cx.checkpoint().map_err(|_| SfsError::Cancelled)?;
        let to = MountState::ShuttingDown;
        let allowed = (allow_not_started
            && (self.state.try_transition(MountState::Uninitialized, to)
                || self.state.try_transition(MountState::Initializing, to)
                || self.state.try_transition(MountState::Initialized, to)))
            || self.state.try_transition(MountState::Running, to)
            || self.state.try_transition(MountState::Starting, to)
            || self.state.try_transition(MountState::InitError, to)
            || self.state.try_transition(MountState::ChannelError, to);
        if !allowed {
            return Err(SfsError::IllegalStateTransition {
                mount: self.mount_path_str(),
                expected: MountState::Running.name(),
                actual: self.state.load().name(),
                target: to.name(),
            });
        }
        Ok(self.shutdown_impl(do_takeover))
    }

    fn shutdown_impl(&self, do_takeover: bool) -> SerializedInodeMap {
        let mount_path = self.mount_path_str();
        debug!(mount = %mount_path, "beginning shutdown");
        self.journal.cancel_all_subscribers();

        let serialized = self.inode_map.shutdown(do_takeover);

        // Release the overlay lock before a successor process takes the
        // mount over.
        self.overlay.close();
        debug!(mount = %mount_path, "shutdown complete");

        let old = self.state.exchange(MountState::ShutDown);
        if old == MountState::Destroying {
            self.release();
        }
        serialized
    }

    /// Begin destruction. Absorbing: the mount ends released whatever state
    /// it was in, except that destroying twice is a bug.
    pub fn destroy(&self) {
        let old = self.state.exchange(MountState::Destroying);
        match old {
            MountState::Uninitialized | MountState::Initializing => {
                // The root inode may not exist if initialization failed
                // early; there is nothing to unload then.
                if self.inode_map.get_root_inode().is_none() {
                    self.release();
                } else {
                    self.shutdown_impl(false);
                }
            }
            MountState::Initialized
            | MountState::Running
            | MountState::Starting
            | MountState::InitError
            | MountState::ChannelError => {
                self.shutdown_impl(false);
            }
            MountState::ShuttingDown => {
                // The in-flight shutdown observes DESTROYING and releases.
            }
            MountState::ShutDown => {
                debug!(mount = %self.mount_path_str(), "destroying shut-down mount");
                self.release();
            }
            MountState::Destroying => {
                panic!(
                    "destroy() called on mount {} already being destroyed",
                    self.mount_path_str()
                );
            }
        }
    }

    fn release(&self) {
        debug_assert!(
            self.inode_map.get_root_inode().is_none(),
            "root inode must be unloaded before the mount releases"
        );
        self.released.store(true, Ordering::Release);
        debug!(mount = %self.mount_path_str(), "mount released");
    }

    // ── Content access ──────────────────────────────────────────────────

    /// The tree the current parent commit resolves to.
    pub fn get_root_tree(&self, cx: &Cx) -> Result<RootTree> {
        let parent = self.parent_commit.read().clone();
        let fetch = FetchContext::new("get_root_tree");
        self.object_store.get_root_tree(cx, &parent, &fetch)
    }

    /// Look an inode up by mount-relative path.
    pub fn get_inode(
        &self,
        cx: &Cx,
        path: &RepoPath,
        fetch: &FetchContext,
    ) -> Result<InodePtr> {
        self.root_inode()?.get_child_recursive(cx, path, fetch)
    }

    /// Read a file's full contents, transparently resolving symlinks.
    pub fn load_file_contents(
        &self,
        cx: &Cx,
        inode: InodePtr,
        fetch: &FetchContext,
    ) -> Result<Vec<u8>> {
        let resolved = self.resolve_symlink(cx, inode, fetch)?;
        match resolved {
            InodePtr::Tree(tree) => Err(SfsError::IsADirectory(
                tree.path().unwrap_or_else(RepoPath::root),
            )),
            InodePtr::File(file) => file.read_all(cx, fetch),
        }
    }

    /// [`Self::load_file_contents`] starting from a path.
    pub fn load_file_contents_from_path(
        &self,
        cx: &Cx,
        path: &RepoPath,
        fetch: &FetchContext,
    ) -> Result<Vec<u8>> {
        let inode = self.get_inode(cx, path, fetch)?;
        self.load_file_contents(cx, inode, fetch)
    }

    // ── Bind mounts ─────────────────────────────────────────────────────

    pub fn add_bind_mount(
        self: &Arc<Self>,
        cx: &Cx,
        repo_path: &RepoPath,
        target: &Path,
    ) -> Result<()> {
        self.ensure_directory_exists(cx, repo_path)?;
        let in_mount = self.config.mount_path.join(repo_path.as_str());
        self.server_state.priv_helper.bind_mount(cx, target, &in_mount)
    }

    pub fn remove_bind_mount(&self, cx: &Cx, repo_path: &RepoPath) -> Result<()> {
        let in_mount = self.config.mount_path.join(repo_path.as_str());
        self.server_state.priv_helper.bind_unmount(cx, &in_mount)
    }

    // ── Chown ───────────────────────────────────────────────────────────

    /// Re-own the mount: future inodes report the new owner, and inodes the
    /// kernel caches are invalidated so it re-reads their attributes.
    pub fn chown(&self, cx: &Cx, uid: u32, gid: u32) -> Result<()> {
        self.set_owner(uid, gid);
        let referenced = self.inode_map.get_referenced_inodes();
        match self.channel.lock().clone() {
            Some(MountChannel::Fuse(session)) => {
                session.invalidate_inodes(&referenced);
                session.flush_invalidations(cx)
            }
            _ => {
                warn!(
                    mount = %self.config.mount_path.display(),
                    "chown invalidation skipped: no FUSE channel attached"
                );
                Ok(())
            }
        }
    }

    // ── Prefetch leases ─────────────────────────────────────────────────

    /// Claim a prefetch slot, bounded by configuration. The lease releases
    /// the slot on drop, success or not.
    pub fn try_start_tree_prefetch(
        self: &Arc<Self>,
        tree: Arc<TreeInode>,
    ) -> Option<TreePrefetchLease> {
        let max = self.server_state.tunables.max_tree_prefetches;
        let in_progress = self.prefetches_in_progress.fetch_add(1, Ordering::AcqRel);
        if in_progress < max {
            Some(TreePrefetchLease {
                mount: Arc::clone(self),
                tree,
            })
        } else {
            self.prefetches_in_progress.fetch_sub(1, Ordering::AcqRel);
            None
        }
    }

    #[must_use]
    pub fn prefetches_in_progress(&self) -> u64 {
        self.prefetches_in_progress.load(Ordering::Acquire)
    }
}

impl InodeHost for SnapMount {
    fn object_store(&self) -> Arc<dyn ObjectStore> {
        Arc::clone(&self.object_store)
    }

    fn overlay(&self) -> Arc<dyn Overlay> {
        Arc::clone(&self.overlay)
    }

    fn case_sensitive(&self) -> bool {
        self.config.case_sensitive
    }

    fn allocate_inode_number(&self, path: Option<&RepoPath>) -> InodeNumber {
        self.inode_map.allocate(path)
    }

    fn protected_directory(&self) -> Option<InodeNumber> {
        self.control_dir_inode_number()
    }
}

// ── Prefetch lease ──────────────────────────────────────────────────────────

/// Holds one slot of the bounded prefetch budget.
pub struct TreePrefetchLease {
    mount: Arc<SnapMount>,
    tree: Arc<TreeInode>,
}

impl TreePrefetchLease {
    #[must_use]
    pub fn tree(&self) -> &Arc<TreeInode> {
        &self.tree
    }
}

impl Drop for TreePrefetchLease {
    fn drop(&mut self) {
        let old = self
            .mount
            .prefetches_in_progress
            .fetch_sub(1, Ordering::AcqRel);
        debug_assert_ne!(old, 0, "prefetch counter underflow");
    }
}
