//! Mount/unmount handshake tracking.
//!
//! Two optional broadcast promises track whether a kernel attach or detach
//! has ever been initiated. Invariant: once a promise is created it is never
//! cleared or replaced, so the `*_started` predicates answer history, not
//! just current activity.

use crate::sync::SharedPromise;
use parking_lot::Mutex;
use sfs_error::{Result, SfsError};

#[derive(Default)]
struct HandshakeState {
    channel_mount_promise: Option<SharedPromise<()>>,
    channel_unmount_promise: Option<SharedPromise<()>>,
}

#[derive(Default)]
pub struct MountingHandshake {
    state: Mutex<HandshakeState>,
}

/// Outcome of [`MountingHandshake::begin_unmount`].
pub enum BeginUnmount {
    /// An unmount is already underway (or finished); wait on its promise.
    AlreadyUnmounting(SharedPromise<()>),
    /// This caller owns the unmount. `mount` is the attach promise to wait
    /// on first, if an attach was ever started.
    Started {
        unmount: SharedPromise<()>,
        mount: Option<SharedPromise<()>>,
    },
}

impl MountingHandshake {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn channel_mount_started(&self) -> bool {
        self.state.lock().channel_mount_promise.is_some()
    }

    #[must_use]
    pub fn channel_unmount_started(&self) -> bool {
        self.state.lock().channel_unmount_promise.is_some()
    }

    /// Claim the (single) channel attach, returning the promise the attach
    /// must fulfill. Fails with `MountCancelled` if an unmount was already
    /// requested; calling it twice is a programmer error.
    pub fn begin_mount(&self) -> Result<SharedPromise<()>> {
        let mut state = self.state.lock();
        assert!(
            state.channel_mount_promise.is_none(),
            "begin_mount unexpectedly called more than once"
        );
        if state.channel_unmount_promise.is_some() {
            return Err(SfsError::MountCancelled);
        }
        let promise = SharedPromise::new();
        state.channel_mount_promise = Some(promise.clone());
        Ok(promise)
    }

    #[must_use]
    pub fn mount_promise(&self) -> Option<SharedPromise<()>> {
        self.state.lock().channel_mount_promise.clone()
    }

    #[must_use]
    pub fn unmount_promise(&self) -> Option<SharedPromise<()>> {
        self.state.lock().channel_unmount_promise.clone()
    }

    /// Claim or join the unmount.
    pub fn begin_unmount(&self) -> BeginUnmount {
        let mut state = self.state.lock();
        if let Some(promise) = &state.channel_unmount_promise {
            return BeginUnmount::AlreadyUnmounting(promise.clone());
        }
        let promise = SharedPromise::new();
        state.channel_unmount_promise = Some(promise.clone());
        BeginUnmount::Started {
            unmount: promise,
            mount: state.channel_mount_promise.clone(),
        }
    }
}
