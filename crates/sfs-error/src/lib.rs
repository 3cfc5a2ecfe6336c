#![forbid(unsafe_code)]
//! Error types for SnapFS.
//!
//! Defines `SfsError` and a `Result<T>` alias used throughout the workspace.
//! Includes errno mappings for kernel-channel response codes.
//!
//! The enum is `Clone`: a single failure can be broadcast to every waiter of
//! a shared promise, so I/O causes are carried as rendered strings rather
//! than as `std::io::Error` values.

use sfs_types::{PathError, RepoPath};
use thiserror::Error;

/// Unified error type for all SnapFS operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SfsError {
    #[error("another checkout operation is still in progress")]
    CheckoutInProgress,

    #[error("out-of-date parent commit: requested {requested}, but current parent is {actual}")]
    OutOfDateParent { requested: String, actual: String },

    #[error("too many levels of symbolic links resolving {0}")]
    Loop(RepoPath),

    #[error("{0} is not a directory")]
    NotADirectory(RepoPath),

    #[error("{0} is a directory")]
    IsADirectory(RepoPath),

    #[error("{0} already exists")]
    AlreadyExists(RepoPath),

    #[error("{0} not found")]
    NotFound(RepoPath),

    #[error("mount {0} was unmounted during channel initialization")]
    DeviceUnmountedDuringInitialization(String),

    #[error("mount was cancelled before the channel could start")]
    MountCancelled,

    #[error(
        "illegal state transition for mount {mount}: expected {expected}, \
         found {actual}, while moving to {target}"
    )]
    IllegalStateTransition {
        mount: String,
        expected: &'static str,
        actual: &'static str,
        target: &'static str,
    },

    #[error("operation cancelled")]
    Cancelled,

    #[error("the control directory may not be modified")]
    ProtectedDirectory,

    #[error("mount has been released")]
    MountReleased,

    #[error("invalid path: {0}")]
    Path(#[from] PathError),

    #[error("inode {0} has been unlinked")]
    Unlinked(sfs_types::InodeNumber),

    #[error("object store error: {0}")]
    Store(String),

    #[error("overlay error: {0}")]
    Overlay(String),

    #[error("privileged helper error: {0}")]
    PrivHelper(String),

    #[error("channel error: {0}")]
    Channel(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("fault injected: {0}")]
    InjectedFault(String),
}

impl SfsError {
    /// Convert this error into a POSIX errno suitable for channel replies.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::CheckoutInProgress => libc::EBUSY,
            Self::OutOfDateParent { .. } => libc::ESTALE,
            Self::Loop(_) => libc::ELOOP,
            Self::NotADirectory(_) => libc::ENOTDIR,
            Self::IsADirectory(_) => libc::EISDIR,
            Self::AlreadyExists(_) => libc::EEXIST,
            Self::NotFound(_) | Self::Unlinked(_) => libc::ENOENT,
            Self::DeviceUnmountedDuringInitialization(_) | Self::MountCancelled => {
                libc::ENXIO
            }
            Self::IllegalStateTransition { .. } => libc::EINVAL,
            Self::Cancelled => libc::ECANCELED,
            Self::ProtectedDirectory => libc::EPERM,
            Self::MountReleased => libc::EIO,
            Self::Path(PathError::AbsoluteTarget(_) | PathError::EscapesMount(_)) => {
                libc::EXDEV
            }
            Self::Path(_) => libc::EINVAL,
            Self::Store(_)
            | Self::Overlay(_)
            | Self::PrivHelper(_)
            | Self::Channel(_)
            | Self::Io(_)
            | Self::InjectedFault(_) => libc::EIO,
        }
    }
}

impl From<std::io::Error> for SfsError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

/// Result alias using `SfsError`.
pub type Result<T> = std::result::Result<T, SfsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mappings() {
        let path = RepoPath::parse("a/b").unwrap();
        assert_eq!(SfsError::Loop(path.clone()).to_errno(), libc::ELOOP);
        assert_eq!(SfsError::NotFound(path.clone()).to_errno(), libc::ENOENT);
        assert_eq!(
            SfsError::AlreadyExists(path.clone()).to_errno(),
            libc::EEXIST
        );
        assert_eq!(
            SfsError::NotADirectory(path.clone()).to_errno(),
            libc::ENOTDIR
        );
        assert_eq!(SfsError::IsADirectory(path).to_errno(), libc::EISDIR);
        assert_eq!(SfsError::CheckoutInProgress.to_errno(), libc::EBUSY);
        assert_eq!(SfsError::Cancelled.to_errno(), libc::ECANCELED);
    }

    #[test]
    fn escape_errors_map_to_exdev() {
        let err = SfsError::from(PathError::EscapesMount("../x".into()));
        assert_eq!(err.to_errno(), libc::EXDEV);
        let err = SfsError::from(PathError::AbsoluteTarget("/x".into()));
        assert_eq!(err.to_errno(), libc::EXDEV);
    }

    #[test]
    fn io_errors_render_to_strings() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "boom");
        let err = SfsError::from(io);
        assert_eq!(err.to_errno(), libc::EIO);
        assert!(err.to_string().contains("boom"));
    }
}
