#![forbid(unsafe_code)]
//! Test utilities for SnapFS.
//!
//! Fake collaborators (privileged helper, channel backends, clock,
//! structured logger) and a [`TestMountBuilder`] that wires a fully
//! functional mount against the in-memory store and overlay.

use asupersync::Cx;
use parking_lot::Mutex;
use sfs_error::{Result, SfsError};
use sfs_inode::InodePtr;
use sfs_journal::Journal;
use sfs_mount::channel::{
    FuseBackend, FuseChannelData, FuseDevice, FuseInitSettings, FuseSession,
    FuseStopData, NfsServerHandle, NfsSession, NfsStopData, PrivHelper,
    ProcessAccessLog, ProjectionBackend, ProjectionSession, ProjectionStopData,
};
use sfs_mount::config::{CheckoutConfig, MountProtocol, Tunables};
use sfs_mount::diff::GitIgnoreStack;
use sfs_mount::server::{
    Clock, FaultInjector, LogEvent, ServerState, StructuredLogger,
};
use sfs_mount::sync::SharedPromise;
use sfs_mount::SnapMount;
use sfs_store::{CommitBuilder, MemoryObjectStore, MemoryOverlay};
use sfs_types::{InodeNumber, PathComponent, RepoPath, RootId};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tempfile::TempDir;

// ── Clock ───────────────────────────────────────────────────────────────────

/// Manually advanced clock.
pub struct TestClock {
    now: Mutex<SystemTime>,
}

impl TestClock {
    #[must_use]
    pub fn new() -> Self {
        Self {
            now: Mutex::new(SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000)),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock();
        *now += by;
    }
}

impl Default for TestClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TestClock {
    fn now(&self) -> SystemTime {
        *self.now.lock()
    }
}

// ── Structured logger ───────────────────────────────────────────────────────

/// Captures every structured event for assertions.
#[derive(Default)]
pub struct CollectingLogger {
    events: Mutex<Vec<LogEvent>>,
}

impl CollectingLogger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn events(&self) -> Vec<LogEvent> {
        self.events.lock().clone()
    }
}

impl StructuredLogger for CollectingLogger {
    fn log_event(&self, event: LogEvent) {
        self.events.lock().push(event);
    }
}

// ── Fake FUSE session & backend ─────────────────────────────────────────────

pub struct FakeFuseSession {
    device: FuseDevice,
    settings: FuseInitSettings,
    completion: SharedPromise<FuseStopData>,
    access_log: ProcessAccessLog,
    invalidated: Mutex<Vec<InodeNumber>>,
    flushes: AtomicU64,
}

impl FakeFuseSession {
    fn new(device: FuseDevice, settings: FuseInitSettings) -> Arc<Self> {
        Arc::new(Self {
            device,
            settings,
            completion: SharedPromise::new(),
            access_log: ProcessAccessLog::new(),
            invalidated: Mutex::new(Vec::new()),
            flushes: AtomicU64::new(0),
        })
    }

    #[must_use]
    pub fn device(&self) -> &FuseDevice {
        &self.device
    }

    /// End the session gracefully, handing the still-open device back.
    pub fn stop_for_takeover(&self) {
        self.completion.fulfill(Ok(FuseStopData {
            device: Some(self.device.clone()),
            init_settings: self.settings.clone(),
        }));
    }

    /// End the session because the kernel unmounted the filesystem.
    pub fn stop_unmounted(&self) {
        self.completion.fulfill(Ok(FuseStopData {
            device: None,
            init_settings: self.settings.clone(),
        }));
    }

    #[must_use]
    pub fn invalidated(&self) -> Vec<InodeNumber> {
        self.invalidated.lock().clone()
    }

    #[must_use]
    pub fn flush_count(&self) -> u64 {
        self.flushes.load(Ordering::Acquire)
    }
}

impl FuseSession for FakeFuseSession {
    fn completion(&self) -> SharedPromise<FuseStopData> {
        self.completion.clone()
    }

    fn process_access_log(&self) -> &ProcessAccessLog {
        &self.access_log
    }

    fn invalidate_inodes(&self, inodes: &[InodeNumber]) {
        self.invalidated.lock().extend_from_slice(inodes);
    }

    fn flush_invalidations(&self, _cx: &Cx) -> Result<()> {
        self.flushes.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeFuseBackend {
    sessions: Mutex<HashMap<PathBuf, Arc<FakeFuseSession>>>,
    takeover_sessions: AtomicU64,
}

impl FakeFuseBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn session_for(&self, mount_path: &Path) -> Option<Arc<FakeFuseSession>> {
        self.sessions.lock().get(mount_path).cloned()
    }

    #[must_use]
    pub fn takeover_session_count(&self) -> u64 {
        self.takeover_sessions.load(Ordering::Acquire)
    }
}

impl FuseBackend for FakeFuseBackend {
    fn create_session(
        &self,
        _cx: &Cx,
        mount_path: &Path,
        device: FuseDevice,
        settings: FuseInitSettings,
        _case_sensitive: bool,
        _require_utf8_path: bool,
    ) -> Result<Arc<dyn FuseSession>> {
        let session = FakeFuseSession::new(device, settings);
        self.sessions
            .lock()
            .insert(mount_path.to_path_buf(), Arc::clone(&session));
        Ok(session)
    }

    fn create_session_from_takeover(
        &self,
        _cx: &Cx,
        mount_path: &Path,
        data: FuseChannelData,
    ) -> Result<Arc<dyn FuseSession>> {
        self.takeover_sessions.fetch_add(1, Ordering::AcqRel);
        let session = FakeFuseSession::new(data.device, data.init_settings);
        self.sessions
            .lock()
            .insert(mount_path.to_path_buf(), Arc::clone(&session));
        Ok(session)
    }
}

// ── Fake NFS server ─────────────────────────────────────────────────────────

pub struct FakeNfsSession {
    completion: SharedPromise<NfsStopData>,
    access_log: ProcessAccessLog,
    socket: Mutex<Option<PathBuf>>,
}

impl FakeNfsSession {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            completion: SharedPromise::new(),
            access_log: ProcessAccessLog::new(),
            socket: Mutex::new(None),
        })
    }

    pub fn stop(&self) {
        self.completion.fulfill(Ok(NfsStopData));
    }

    #[must_use]
    pub fn unix_socket(&self) -> Option<PathBuf> {
        self.socket.lock().clone()
    }
}

impl NfsSession for FakeNfsSession {
    fn initialize_socket(&self, _cx: &Cx, unix_socket: Option<PathBuf>) -> Result<()> {
        *self.socket.lock() = unix_socket;
        Ok(())
    }

    fn nfsd_addr(&self) -> String {
        "127.0.0.1:52001".to_owned()
    }

    fn completion(&self) -> SharedPromise<NfsStopData> {
        self.completion.clone()
    }

    fn process_access_log(&self) -> &ProcessAccessLog {
        &self.access_log
    }
}

#[derive(Default)]
pub struct FakeNfsServer {
    registered: Mutex<HashMap<PathBuf, Arc<FakeNfsSession>>>,
    unregistered: Mutex<Vec<PathBuf>>,
    event_loop_tasks: AtomicU64,
}

impl FakeNfsServer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn session_for(&self, mount_path: &Path) -> Option<Arc<FakeNfsSession>> {
        self.registered.lock().get(mount_path).cloned()
    }

    #[must_use]
    pub fn unregistered_mounts(&self) -> Vec<PathBuf> {
        self.unregistered.lock().clone()
    }

    #[must_use]
    pub fn event_loop_task_count(&self) -> u64 {
        self.event_loop_tasks.load(Ordering::Acquire)
    }
}

impl NfsServerHandle for FakeNfsServer {
    fn register_mount(
        &self,
        _cx: &Cx,
        mount_path: &Path,
        _root_ino: InodeNumber,
        _iosize: u32,
    ) -> Result<(Arc<dyn NfsSession>, String)> {
        let session = FakeNfsSession::new();
        self.registered
            .lock()
            .insert(mount_path.to_path_buf(), Arc::clone(&session));
        Ok((session, "127.0.0.1:52000".to_owned()))
    }

    fn unregister_mount(&self, mount_path: &Path) {
        self.unregistered.lock().push(mount_path.to_path_buf());
    }

    fn run_on_event_loop(&self, task: Box<dyn FnOnce() + Send>) {
        self.event_loop_tasks.fetch_add(1, Ordering::AcqRel);
        task();
    }
}

// ── Fake projection backend ─────────────────────────────────────────────────

pub struct FakeProjectionSession {
    completion: SharedPromise<ProjectionStopData>,
    access_log: ProcessAccessLog,
}

impl ProjectionSession for FakeProjectionSession {
    fn stop(&self, _cx: &Cx) -> Result<()> {
        self.completion.fulfill(Ok(ProjectionStopData));
        Ok(())
    }

    fn completion(&self) -> SharedPromise<ProjectionStopData> {
        self.completion.clone()
    }

    fn process_access_log(&self) -> &ProcessAccessLog {
        &self.access_log
    }
}

#[derive(Default)]
pub struct FakeProjectionBackend {
    started: Mutex<Vec<PathBuf>>,
}

impl FakeProjectionBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn started_mounts(&self) -> Vec<PathBuf> {
        self.started.lock().clone()
    }
}

impl ProjectionBackend for FakeProjectionBackend {
    fn start(
        &self,
        _cx: &Cx,
        mount_path: &Path,
        _read_only: bool,
    ) -> Result<Arc<dyn ProjectionSession>> {
        self.started.lock().push(mount_path.to_path_buf());
        Ok(Arc::new(FakeProjectionSession {
            completion: SharedPromise::new(),
            access_log: ProcessAccessLog::new(),
        }))
    }
}

// ── Fake privileged helper ──────────────────────────────────────────────────

#[derive(Default)]
struct HelperLog {
    fuse_mounts: Vec<PathBuf>,
    fuse_unmounts: Vec<PathBuf>,
    nfs_mounts: Vec<(PathBuf, String, String)>,
    nfs_unmounts: Vec<PathBuf>,
    bind_mounts: Vec<(PathBuf, PathBuf)>,
    bind_unmounts: Vec<PathBuf>,
}

/// Records every helper RPC; fault gates make mounts fail or park.
///
/// Gate keys: `("fuseMount", path)`, `("nfsMount", path)`. A FUSE unmount
/// ends the registered session the way a real kernel detach would.
pub struct FakePrivHelper {
    faults: Arc<FaultInjector>,
    fuse_backend: Arc<FakeFuseBackend>,
    nfs_server: Arc<FakeNfsServer>,
    next_device: AtomicU64,
    log: Mutex<HelperLog>,
}

impl FakePrivHelper {
    #[must_use]
    pub fn new(
        faults: Arc<FaultInjector>,
        fuse_backend: Arc<FakeFuseBackend>,
        nfs_server: Arc<FakeNfsServer>,
    ) -> Self {
        Self {
            faults,
            fuse_backend,
            nfs_server,
            next_device: AtomicU64::new(1),
            log: Mutex::new(HelperLog::default()),
        }
    }

    #[must_use]
    pub fn fuse_mount_count(&self) -> usize {
        self.log.lock().fuse_mounts.len()
    }

    #[must_use]
    pub fn fuse_unmount_count(&self) -> usize {
        self.log.lock().fuse_unmounts.len()
    }

    #[must_use]
    pub fn nfs_mount_count(&self) -> usize {
        self.log.lock().nfs_mounts.len()
    }

    #[must_use]
    pub fn bind_mounts(&self) -> Vec<(PathBuf, PathBuf)> {
        self.log.lock().bind_mounts.clone()
    }

    #[must_use]
    pub fn bind_unmounts(&self) -> Vec<PathBuf> {
        self.log.lock().bind_unmounts.clone()
    }
}

impl PrivHelper for FakePrivHelper {
    fn fuse_mount(&self, cx: &Cx, path: &Path, _read_only: bool) -> Result<FuseDevice> {
        self.faults
            .check(cx, "fuseMount", &path.display().to_string())?;
        self.log.lock().fuse_mounts.push(path.to_path_buf());
        Ok(FuseDevice::new(self.next_device.fetch_add(1, Ordering::AcqRel)))
    }

    fn fuse_unmount(&self, _cx: &Cx, path: &Path) -> Result<()> {
        self.log.lock().fuse_unmounts.push(path.to_path_buf());
        if let Some(session) = self.fuse_backend.session_for(path) {
            session.stop_unmounted();
        }
        Ok(())
    }

    fn nfs_mount(
        &self,
        cx: &Cx,
        path: &Path,
        mountd_addr: &str,
        nfsd_addr: &str,
        _read_only: bool,
        _iosize: u32,
    ) -> Result<()> {
        self.faults
            .check(cx, "nfsMount", &path.display().to_string())?;
        self.log.lock().nfs_mounts.push((
            path.to_path_buf(),
            mountd_addr.to_owned(),
            nfsd_addr.to_owned(),
        ));
        Ok(())
    }

    fn nfs_unmount(&self, _cx: &Cx, path: &Path) -> Result<()> {
        self.log.lock().nfs_unmounts.push(path.to_path_buf());
        if let Some(session) = self.nfs_server.session_for(path) {
            session.stop();
        }
        Ok(())
    }

    fn bind_mount(&self, _cx: &Cx, target: &Path, source: &Path) -> Result<()> {
        self.log
            .lock()
            .bind_mounts
            .push((target.to_path_buf(), source.to_path_buf()));
        Ok(())
    }

    fn bind_unmount(&self, _cx: &Cx, path: &Path) -> Result<()> {
        self.log.lock().bind_unmounts.push(path.to_path_buf());
        Ok(())
    }
}

// ── Test mount builder ──────────────────────────────────────────────────────

pub struct TestMountBuilder {
    parent: RootId,
    protocol: MountProtocol,
    case_sensitive: bool,
    persistent_overlay: bool,
    ignores: GitIgnoreStack,
    tunables: Tunables,
    store: Arc<MemoryObjectStore>,
}

impl TestMountBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            parent: RootId::from("R0"),
            protocol: MountProtocol::Fuse,
            case_sensitive: true,
            persistent_overlay: false,
            ignores: GitIgnoreStack::empty(),
            tunables: Tunables::default(),
            store: Arc::new(MemoryObjectStore::new()),
        }
    }

    #[must_use]
    pub fn parent(mut self, parent: &str) -> Self {
        self.parent = RootId::from(parent);
        self
    }

    #[must_use]
    pub fn protocol(mut self, protocol: MountProtocol) -> Self {
        self.protocol = protocol;
        self
    }

    #[must_use]
    pub fn case_sensitive(mut self, case_sensitive: bool) -> Self {
        self.case_sensitive = case_sensitive;
        self
    }

    #[must_use]
    pub fn persistent_overlay(mut self, persistent: bool) -> Self {
        self.persistent_overlay = persistent;
        self
    }

    #[must_use]
    pub fn ignores(mut self, ignores: GitIgnoreStack) -> Self {
        self.ignores = ignores;
        self
    }

    #[must_use]
    pub fn tunables(mut self, tunables: Tunables) -> Self {
        self.tunables = tunables;
        self
    }

    /// Register a commit of plain files.
    #[must_use]
    pub fn commit(self, root: &str, files: &[(&str, &str)]) -> Self {
        let mut builder = CommitBuilder::new();
        for (path, content) in files {
            builder = builder.file(path, *content);
        }
        builder.commit(&self.store, RootId::from(root));
        self
    }

    /// Register a commit built with full control over entry kinds.
    #[must_use]
    pub fn commit_with(
        self,
        root: &str,
        build: impl FnOnce(CommitBuilder) -> CommitBuilder,
    ) -> Self {
        build(CommitBuilder::new()).commit(&self.store, RootId::from(root));
        self
    }

    pub fn build(self) -> TestMount {
        let dir = tempfile::tempdir().expect("create test directory");
        let mount_path = dir.path().join("mount");
        let client_directory = dir.path().join("client");
        std::fs::create_dir_all(&client_directory).expect("create client directory");

        let clock = Arc::new(TestClock::new());
        let logger = Arc::new(CollectingLogger::new());
        let faults = Arc::new(FaultInjector::new());
        let fuse_backend = Arc::new(FakeFuseBackend::new());
        let nfs_server = Arc::new(FakeNfsServer::new());
        let projection = Arc::new(FakeProjectionBackend::new());
        let priv_helper = Arc::new(FakePrivHelper::new(
            Arc::clone(&faults),
            Arc::clone(&fuse_backend),
            Arc::clone(&nfs_server),
        ));

        let server_state = Arc::new(ServerState {
            clock: Arc::clone(&clock) as Arc<dyn Clock>,
            fault_injector: Arc::clone(&faults),
            structured_logger: Arc::clone(&logger) as Arc<dyn StructuredLogger>,
            priv_helper: Arc::clone(&priv_helper) as Arc<dyn PrivHelper>,
            fuse_backend: Arc::clone(&fuse_backend) as Arc<dyn FuseBackend>,
            nfs_server: Some(Arc::clone(&nfs_server) as Arc<dyn NfsServerHandle>),
            projection_backend: Some(Arc::clone(&projection) as Arc<dyn ProjectionBackend>),
            socket_path: dir.path().join("server.sock"),
            top_level_ignores: self.ignores,
            tunables: self.tunables,
        });

        let config = Arc::new(
            CheckoutConfig::new(
                mount_path,
                client_directory,
                self.protocol,
                self.parent,
            )
            .with_case_sensitive(self.case_sensitive),
        );

        let overlay = Arc::new(MemoryOverlay::new(self.persistent_overlay));
        let journal = Arc::new(Journal::new());
        let mount = SnapMount::new(
            config,
            server_state,
            Arc::clone(&self.store) as _,
            Arc::clone(&overlay) as _,
            Arc::clone(&journal),
        );

        TestMount {
            mount,
            store: self.store,
            overlay,
            journal,
            clock,
            logger,
            faults,
            fuse_backend,
            nfs_server,
            projection,
            priv_helper,
            _dir: dir,
        }
    }
}

impl Default for TestMountBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A fully wired mount plus handles to all its fakes.
pub struct TestMount {
    pub mount: Arc<SnapMount>,
    pub store: Arc<MemoryObjectStore>,
    pub overlay: Arc<MemoryOverlay>,
    pub journal: Arc<Journal>,
    pub clock: Arc<TestClock>,
    pub logger: Arc<CollectingLogger>,
    pub faults: Arc<FaultInjector>,
    pub fuse_backend: Arc<FakeFuseBackend>,
    pub nfs_server: Arc<FakeNfsServer>,
    pub projection: Arc<FakeProjectionBackend>,
    pub priv_helper: Arc<FakePrivHelper>,
    _dir: TempDir,
}

impl TestMount {
    #[must_use]
    pub fn cx(&self) -> Cx {
        Cx::for_testing()
    }

    /// Initialize with a no-op progress callback.
    pub fn initialize(&self) -> Result<()> {
        self.mount.initialize(&self.cx(), &|_| {}, None)
    }

    #[must_use]
    pub fn mount_path(&self) -> PathBuf {
        self.mount.checkout_config().mount_path.clone()
    }

    /// The FUSE session created for this mount, once a channel started.
    #[must_use]
    pub fn fuse_session(&self) -> Option<Arc<FakeFuseSession>> {
        self.fuse_backend.session_for(&self.mount_path())
    }

    pub fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        let path = RepoPath::parse(path)?;
        let fetch = sfs_store::FetchContext::new("test_read");
        self.mount
            .load_file_contents_from_path(&self.cx(), &path, &fetch)
    }

    /// Write a working-copy file, creating parent directories as needed.
    pub fn write_file(&self, path: &str, content: &[u8]) -> Result<()> {
        let cx = self.cx();
        let path = RepoPath::parse(path)?;
        let dir = self.mount.ensure_directory_exists(&cx, &path.dirname())?;
        let name = path
            .basename()
            .ok_or_else(|| SfsError::NotFound(path.clone()))?;
        dir.write_file(&cx, &name, content, false)?;
        Ok(())
    }

    /// Remove a working-copy file.
    pub fn unlink_file(&self, path: &str) -> Result<()> {
        let cx = self.cx();
        let path = RepoPath::parse(path)?;
        let fetch = sfs_store::FetchContext::new("test_unlink");
        let parent = self
            .mount
            .get_inode(&cx, &path.dirname(), &fetch)?;
        let name = path
            .basename()
            .ok_or_else(|| SfsError::NotFound(path.clone()))?;
        match parent {
            InodePtr::Tree(tree) => tree.unlink(&cx, name.as_str()),
            InodePtr::File(_) => Err(SfsError::NotADirectory(path.dirname())),
        }
    }

    /// Look an inode up by path with a throwaway fetch context.
    pub fn inode(&self, path: &str) -> Result<InodePtr> {
        let path = RepoPath::parse(path)?;
        let fetch = sfs_store::FetchContext::new("test_lookup");
        self.mount.get_inode(&self.cx(), &path, &fetch)
    }

    /// Create a symlink in the working copy.
    pub fn make_symlink(&self, path: &str, target: &str) -> Result<()> {
        let cx = self.cx();
        let path = RepoPath::parse(path)?;
        let dir = self.mount.ensure_directory_exists(&cx, &path.dirname())?;
        let name = path
            .basename()
            .ok_or_else(|| SfsError::NotFound(path.clone()))?;
        dir.symlink(&cx, &name, target)?;
        Ok(())
    }

    /// Convenience: `PathComponent` from a literal.
    #[must_use]
    pub fn component(name: &str) -> PathComponent {
        PathComponent::new(name).expect("valid component")
    }
}
