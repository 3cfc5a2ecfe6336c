//! Per-mount configuration.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sfs_types::RootId;
use std::path::PathBuf;
use std::time::Duration;

/// Which kernel protocol the mount should speak.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MountProtocol {
    Fuse,
    Nfs,
    Projection,
}

/// How local modifications are stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OverlayType {
    InMemory,
    Persistent,
}

/// Immutable checkout configuration plus the persisted parent commit.
pub struct CheckoutConfig {
    pub mount_path: PathBuf,
    pub client_directory: PathBuf,
    pub case_sensitive: bool,
    pub require_utf8_path: bool,
    pub overlay_type: OverlayType,
    pub mount_protocol: MountProtocol,
    parent: Mutex<RootId>,
}

impl CheckoutConfig {
    #[must_use]
    pub fn new(
        mount_path: PathBuf,
        client_directory: PathBuf,
        mount_protocol: MountProtocol,
        parent: RootId,
    ) -> Self {
        Self {
            mount_path,
            client_directory,
            case_sensitive: cfg!(target_os = "linux"),
            require_utf8_path: true,
            overlay_type: OverlayType::InMemory,
            mount_protocol,
            parent: Mutex::new(parent),
        }
    }

    #[must_use]
    pub fn with_case_sensitive(mut self, case_sensitive: bool) -> Self {
        self.case_sensitive = case_sensitive;
        self
    }

    #[must_use]
    pub fn with_overlay_type(mut self, overlay_type: OverlayType) -> Self {
        self.overlay_type = overlay_type;
        self
    }

    /// The parent commit recorded in the client configuration.
    #[must_use]
    pub fn parent_commit(&self) -> RootId {
        self.parent.lock().clone()
    }

    /// Persist a new parent commit.
    pub fn set_parent_commit(&self, parent: RootId) {
        *self.parent.lock() = parent;
    }
}

/// Server-wide knobs consumed by the mount.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tunables {
    /// Dispatcher threads for a FUSE channel.
    pub fuse_num_threads: usize,
    /// Per-request timeout handed to the kernel driver.
    pub fuse_request_timeout: Duration,
    /// Maximum in-flight kernel requests.
    pub fuse_maximum_requests: usize,
    /// NFS read/write transfer size.
    pub nfs_io_size: u32,
    /// Serve NFS over a Unix socket placed in the client directory.
    pub use_unix_socket: bool,
    /// Upper bound on concurrently running tree prefetches.
    pub max_tree_prefetches: u64,
}

impl Default for Tunables {
    fn default() -> Self {
        Self {
            fuse_num_threads: 16,
            fuse_request_timeout: Duration::from_secs(60),
            fuse_maximum_requests: 1000,
            nfs_io_size: 1024 * 1024,
            use_unix_socket: false,
            max_tree_prefetches: 8,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parent_commit_roundtrip() {
        let config = CheckoutConfig::new(
            PathBuf::from("/mnt/repo"),
            PathBuf::from("/clients/repo"),
            MountProtocol::Fuse,
            RootId::from("R0"),
        );
        assert_eq!(config.parent_commit(), RootId::from("R0"));
        config.set_parent_commit(RootId::from("R1"));
        assert_eq!(config.parent_commit(), RootId::from("R1"));
    }

    #[test]
    fn tunables_defaults_are_sane() {
        let tunables = Tunables::default();
        assert!(tunables.fuse_num_threads > 0);
        assert!(tunables.max_tree_prefetches > 0);
        assert!(tunables.fuse_request_timeout > Duration::ZERO);
    }
}
