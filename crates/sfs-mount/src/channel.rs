//! Kernel-channel interfaces.
//!
//! The drivers that actually speak FUSE, NFS, or the projection protocol are
//! external collaborators. This module defines the handles the mount
//! exchanges with them: the privileged-helper RPC surface, the per-protocol
//! session traits, stop payloads, and the takeover payload assembled when a
//! channel terminates.

use crate::sync::SharedPromise;
use asupersync::Cx;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sfs_error::Result;
use sfs_inode::SerializedInodeMap;
use sfs_types::InodeNumber;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

// ── FUSE device handle ──────────────────────────────────────────────────────

/// Handle to a kernel FUSE device obtained from the privileged helper.
///
/// Clones share the open flag, mirroring duplicated ownership of one file
/// description.
#[derive(Debug, Clone)]
pub struct FuseDevice {
    id: u64,
    open: Arc<AtomicBool>,
}

impl FuseDevice {
    #[must_use]
    pub fn new(id: u64) -> Self {
        Self {
            id,
            open: Arc::new(AtomicBool::new(true)),
        }
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    pub fn close(&self) {
        self.open.store(false, Ordering::Release);
    }
}

/// Driver settings the kernel connection was initialized with; preserved
/// across takeover.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FuseInitSettings {
    pub num_threads: usize,
    pub request_timeout: Duration,
    pub maximum_requests: usize,
}

impl Default for FuseInitSettings {
    fn default() -> Self {
        Self {
            num_threads: 16,
            request_timeout: Duration::from_secs(60),
            maximum_requests: 1000,
        }
    }
}

/// Preserved FUSE state handed to a successor process.
#[derive(Debug, Clone)]
pub struct FuseChannelData {
    pub device: FuseDevice,
    pub init_settings: FuseInitSettings,
}

// ── Stop payloads ───────────────────────────────────────────────────────────

/// What a FUSE session leaves behind when it stops.
#[derive(Debug, Clone)]
pub struct FuseStopData {
    /// The device, still valid if the session stopped gracefully for
    /// takeover; `None` when the kernel side was unmounted.
    pub device: Option<FuseDevice>,
    pub init_settings: FuseInitSettings,
}

#[derive(Debug, Clone, Default)]
pub struct NfsStopData;

#[derive(Debug, Clone, Default)]
pub struct ProjectionStopData;

// ── Process access log ──────────────────────────────────────────────────────

/// Counts filesystem accesses per client process.
#[derive(Debug, Default)]
pub struct ProcessAccessLog {
    counts: Mutex<HashMap<u32, u64>>,
}

impl ProcessAccessLog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_access(&self, pid: u32) {
        *self.counts.lock().entry(pid).or_insert(0) += 1;
    }

    #[must_use]
    pub fn access_count(&self, pid: u32) -> u64 {
        self.counts.lock().get(&pid).copied().unwrap_or(0)
    }
}

// ── Session traits ──────────────────────────────────────────────────────────

/// A live FUSE channel bound to a dispatcher.
pub trait FuseSession: Send + Sync {
    /// Fulfilled when the channel terminates.
    fn completion(&self) -> SharedPromise<FuseStopData>;
    fn process_access_log(&self) -> &ProcessAccessLog;
    fn invalidate_inodes(&self, inodes: &[InodeNumber]);
    fn flush_invalidations(&self, cx: &Cx) -> Result<()>;
}

/// A mount registered with the in-process NFS server.
pub trait NfsSession: Send + Sync {
    /// Bind the nfsd socket, optionally a Unix socket in the client
    /// directory.
    fn initialize_socket(&self, cx: &Cx, unix_socket: Option<PathBuf>) -> Result<()>;
    /// Address the privileged helper should point the kernel at.
    fn nfsd_addr(&self) -> String;
    fn completion(&self) -> SharedPromise<NfsStopData>;
    fn process_access_log(&self) -> &ProcessAccessLog;
}

/// A projection channel (no helper round-trip).
pub trait ProjectionSession: Send + Sync {
    fn stop(&self, cx: &Cx) -> Result<()>;
    fn completion(&self) -> SharedPromise<ProjectionStopData>;
    fn process_access_log(&self) -> &ProcessAccessLog;
}

// ── Backends ────────────────────────────────────────────────────────────────

/// Builds FUSE sessions from a kernel device.
pub trait FuseBackend: Send + Sync {
    fn create_session(
        &self,
        cx: &Cx,
        mount_path: &Path,
        device: FuseDevice,
        settings: FuseInitSettings,
        case_sensitive: bool,
        require_utf8_path: bool,
    ) -> Result<Arc<dyn FuseSession>>;

    /// Construct a session from a preserved device, bypassing the normal
    /// attach protocol.
    fn create_session_from_takeover(
        &self,
        cx: &Cx,
        mount_path: &Path,
        data: FuseChannelData,
    ) -> Result<Arc<dyn FuseSession>>;
}

/// The in-process NFS server and its event loop.
pub trait NfsServerHandle: Send + Sync {
    /// Register a mount; returns the channel and the mountd address.
    fn register_mount(
        &self,
        cx: &Cx,
        mount_path: &Path,
        root_ino: InodeNumber,
        iosize: u32,
    ) -> Result<(Arc<dyn NfsSession>, String)>;

    fn unregister_mount(&self, mount_path: &Path);

    /// Run a closure on the server's event loop. Channel teardown must be
    /// dispatched here; the sockets only tolerate their own loop.
    fn run_on_event_loop(&self, task: Box<dyn FnOnce() + Send>);
}

pub trait ProjectionBackend: Send + Sync {
    fn start(
        &self,
        cx: &Cx,
        mount_path: &Path,
        read_only: bool,
    ) -> Result<Arc<dyn ProjectionSession>>;
}

// ── Privileged helper ───────────────────────────────────────────────────────

/// RPC surface of the privilege-separated mount helper.
pub trait PrivHelper: Send + Sync {
    fn fuse_mount(&self, cx: &Cx, path: &Path, read_only: bool) -> Result<FuseDevice>;
    fn fuse_unmount(&self, cx: &Cx, path: &Path) -> Result<()>;
    fn nfs_mount(
        &self,
        cx: &Cx,
        path: &Path,
        mountd_addr: &str,
        nfsd_addr: &str,
        read_only: bool,
        iosize: u32,
    ) -> Result<()>;
    fn nfs_unmount(&self, cx: &Cx, path: &Path) -> Result<()>;
    fn bind_mount(&self, cx: &Cx, target: &Path, source: &Path) -> Result<()>;
    fn bind_unmount(&self, cx: &Cx, path: &Path) -> Result<()>;
}

// ── Channel variant ─────────────────────────────────────────────────────────

/// The attached channel, if any. All channel-facing operations dispatch
/// through this match.
#[derive(Clone)]
pub enum MountChannel {
    Fuse(Arc<dyn FuseSession>),
    Nfs(Arc<dyn NfsSession>),
    Projection(Arc<dyn ProjectionSession>),
}

impl MountChannel {
    pub fn process_access_log(&self) -> &ProcessAccessLog {
        match self {
            Self::Fuse(session) => session.process_access_log(),
            Self::Nfs(session) => session.process_access_log(),
            Self::Projection(session) => session.process_access_log(),
        }
    }
}

// ── Takeover payload ────────────────────────────────────────────────────────

/// Everything a successor process needs to adopt this mount.
///
/// Built when the channel completes; the serialized inode map stays empty
/// until shutdown fills it in.
#[derive(Debug, Clone)]
pub struct TakeoverData {
    pub mount_path: PathBuf,
    pub client_directory: PathBuf,
    pub bind_mounts: Vec<PathBuf>,
    pub fuse_device: Option<FuseDevice>,
    pub init_settings: FuseInitSettings,
    pub serialized_inode_map: SerializedInodeMap,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fuse_device_close_is_shared_across_clones() {
        let device = FuseDevice::new(3);
        let clone = device.clone();
        assert!(clone.is_open());
        device.close();
        assert!(!clone.is_open());
    }

    #[test]
    fn access_log_counts_per_pid() {
        let log = ProcessAccessLog::new();
        log.record_access(100);
        log.record_access(100);
        log.record_access(200);
        assert_eq!(log.access_count(100), 2);
        assert_eq!(log.access_count(200), 1);
        assert_eq!(log.access_count(300), 0);
    }
}
