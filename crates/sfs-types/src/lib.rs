#![forbid(unsafe_code)]
//! Core types for SnapFS.
//!
//! Identifier newtypes (`RootId`, `ObjectId`, `InodeNumber`), repository
//! path handling (`RepoPath`, `PathComponent`, normalization), the process
//! mount-generation counter, and timestamps.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::OnceLock;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;

// ── Identifiers ─────────────────────────────────────────────────────────────

/// Opaque source-control root identifier (commit/tree hash).
///
/// SnapFS never interprets the contents; equality is the only operation the
/// core needs.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RootId(String);

impl RootId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RootId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RootId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

/// Content hash addressing a tree or blob in the object store.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectId(pub [u8; 32]);

impl ObjectId {
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({self})")
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short hex prefix is enough to identify objects in logs.
        for byte in &self.0[..8] {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// Inode number within one mount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InodeNumber(pub u64);

impl InodeNumber {
    /// The root directory of every mount.
    pub const ROOT: Self = Self(1);
}

impl fmt::Display for InodeNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kind of a source-control tree entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TreeEntryType {
    Tree,
    RegularFile,
    ExecutableFile,
    Symlink,
}

impl TreeEntryType {
    #[must_use]
    pub fn is_tree(self) -> bool {
        matches!(self, Self::Tree)
    }

    #[must_use]
    pub fn is_symlink(self) -> bool {
        matches!(self, Self::Symlink)
    }
}

impl fmt::Display for TreeEntryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Tree => "tree",
            Self::RegularFile => "regular file",
            Self::ExecutableFile => "executable file",
            Self::Symlink => "symlink",
        };
        f.write_str(name)
    }
}

// ── Path errors ─────────────────────────────────────────────────────────────

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PathError {
    #[error("path component may not be empty")]
    EmptyComponent,
    #[error("illegal path component {0:?}")]
    IllegalComponent(String),
    #[error("target {0:?} is absolute and leaves the mount")]
    AbsoluteTarget(String),
    #[error("path {0:?} escapes the mount root")]
    EscapesMount(String),
}

// ── Path components ─────────────────────────────────────────────────────────

/// A single path element: non-empty, no `/`, not `.` or `..`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PathComponent(String);

impl PathComponent {
    pub fn new(value: impl Into<String>) -> Result<Self, PathError> {
        let value = value.into();
        if value.is_empty() {
            return Err(PathError::EmptyComponent);
        }
        if value.contains('/') || value == "." || value == ".." {
            return Err(PathError::IllegalComponent(value));
        }
        Ok(Self(value))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Case-folded equality used by case-insensitive mounts (ASCII folding).
    #[must_use]
    pub fn eq_ignore_case(&self, other: &str) -> bool {
        self.0.eq_ignore_ascii_case(other)
    }
}

impl fmt::Display for PathComponent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Compare two component names under the mount's case sensitivity.
#[must_use]
pub fn component_names_equal(a: &str, b: &str, case_sensitive: bool) -> bool {
    if case_sensitive {
        a == b
    } else {
        a.eq_ignore_ascii_case(b)
    }
}

// ── Repository paths ────────────────────────────────────────────────────────

/// A mount-relative path. The empty path names the mount root.
///
/// Stored as `/`-joined validated components.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RepoPath(String);

impl RepoPath {
    /// The mount root.
    #[must_use]
    pub fn root() -> Self {
        Self(String::new())
    }

    /// Parse and validate a relative path. Empty input names the root.
    pub fn parse(value: impl AsRef<str>) -> Result<Self, PathError> {
        let value = value.as_ref();
        if value.is_empty() {
            return Ok(Self::root());
        }
        if value.starts_with('/') {
            return Err(PathError::AbsoluteTarget(value.to_owned()));
        }
        for part in value.split('/') {
            // Re-use component validation for each element.
            PathComponent::new(part)?;
        }
        Ok(Self(value.to_owned()))
    }

    #[must_use]
    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Append one component.
    #[must_use]
    pub fn join(&self, component: &PathComponent) -> Self {
        if self.is_root() {
            Self(component.as_str().to_owned())
        } else {
            Self(format!("{}/{}", self.0, component.as_str()))
        }
    }

    /// Iterate the components in order. Empty for the root.
    pub fn components(&self) -> impl Iterator<Item = &str> {
        self.0.split('/').filter(|part| !part.is_empty())
    }

    /// Split off the first component, returning `(first, rest)`.
    #[must_use]
    pub fn split_first(&self) -> Option<(PathComponent, RepoPath)> {
        if self.is_root() {
            return None;
        }
        match self.0.split_once('/') {
            Some((first, rest)) => Some((
                PathComponent(first.to_owned()),
                RepoPath(rest.to_owned()),
            )),
            None => Some((PathComponent(self.0.clone()), RepoPath::root())),
        }
    }

    /// Everything but the last component. The root's dirname is the root.
    #[must_use]
    pub fn dirname(&self) -> RepoPath {
        match self.0.rsplit_once('/') {
            Some((dir, _)) => RepoPath(dir.to_owned()),
            None => RepoPath::root(),
        }
    }

    /// The last component, or `None` for the root.
    #[must_use]
    pub fn basename(&self) -> Option<PathComponent> {
        if self.is_root() {
            return None;
        }
        let name = match self.0.rsplit_once('/') {
            Some((_, name)) => name,
            None => self.0.as_str(),
        };
        Some(PathComponent(name.to_owned()))
    }
}

impl fmt::Display for RepoPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_root() {
            f.write_str("<root>")
        } else {
            f.write_str(&self.0)
        }
    }
}

/// Join a symlink target onto the directory containing the symlink, then
/// normalize the result relative to the mount root.
///
/// `.` components are dropped, `..` pops the stack. An absolute target or a
/// `..` underflow leaves the mount and is an error.
pub fn join_and_normalize(dir: &RepoPath, target: &str) -> Result<RepoPath, PathError> {
    if target.starts_with('/') {
        return Err(PathError::AbsoluteTarget(target.to_owned()));
    }
    let mut stack: Vec<&str> = dir.components().collect();
    for part in target.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                if stack.pop().is_none() {
                    return Err(PathError::EscapesMount(target.to_owned()));
                }
            }
            other => stack.push(other),
        }
    }
    RepoPath::parse(stack.join("/"))
}

// ── Mount generation ────────────────────────────────────────────────────────

// Computed once per process: bottom 16 bits of the pid shifted to the top,
// 32 bits of process start time above a 16-bit per-mount counter. A process
// restart invalidates any generation a client may still hold.
fn process_generation() -> u64 {
    static PROCESS_GENERATION: OnceLock<u64> = OnceLock::new();
    *PROCESS_GENERATION.get_or_init(|| {
        let pid = u64::from(std::process::id());
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_secs();
        (pid << 48) | ((now & 0xFFFF_FFFF) << 16)
    })
}

static MOUNT_COUNTER: AtomicU16 = AtomicU16::new(0);

/// Allocate the generation number for a new mount instance.
///
/// Unique per (pid, process start time) within a 16-bit counter lifetime.
#[must_use]
pub fn next_mount_generation() -> u64 {
    let counter = MOUNT_COUNTER.fetch_add(1, Ordering::AcqRel).wrapping_add(1);
    process_generation() | u64::from(counter)
}

// ── Timestamps ──────────────────────────────────────────────────────────────

/// Nanoseconds since the Unix epoch. Fits in an `AtomicU64` so the mount's
/// last-checkout time can be read and written lock-free.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SnapTimestamp(pub u64);

impl SnapTimestamp {
    #[must_use]
    pub fn from_system_time(time: SystemTime) -> Self {
        let nanos = time
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_nanos();
        Self(u64::try_from(nanos).unwrap_or(u64::MAX))
    }

    #[must_use]
    pub fn as_nanos(self) -> u64 {
        self.0
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_component_validation() {
        assert!(PathComponent::new("src").is_ok());
        assert_eq!(PathComponent::new(""), Err(PathError::EmptyComponent));
        assert!(matches!(
            PathComponent::new("a/b"),
            Err(PathError::IllegalComponent(_))
        ));
        assert!(matches!(
            PathComponent::new("."),
            Err(PathError::IllegalComponent(_))
        ));
        assert!(matches!(
            PathComponent::new(".."),
            Err(PathError::IllegalComponent(_))
        ));
    }

    #[test]
    fn repo_path_parse_and_split() {
        let path = RepoPath::parse("a/b/c").unwrap();
        assert_eq!(path.components().collect::<Vec<_>>(), vec!["a", "b", "c"]);

        let (first, rest) = path.split_first().unwrap();
        assert_eq!(first.as_str(), "a");
        assert_eq!(rest.as_str(), "b/c");

        let (second, rest) = rest.split_first().unwrap();
        assert_eq!(second.as_str(), "b");
        let (third, rest) = rest.split_first().unwrap();
        assert_eq!(third.as_str(), "c");
        assert!(rest.is_root());
        assert!(rest.split_first().is_none());
    }

    #[test]
    fn repo_path_dirname_basename() {
        let path = RepoPath::parse("a/b/c").unwrap();
        assert_eq!(path.dirname().as_str(), "a/b");
        assert_eq!(path.basename().unwrap().as_str(), "c");

        let single = RepoPath::parse("a").unwrap();
        assert!(single.dirname().is_root());
        assert_eq!(single.basename().unwrap().as_str(), "a");

        assert!(RepoPath::root().basename().is_none());
    }

    #[test]
    fn repo_path_rejects_bad_input() {
        assert!(RepoPath::parse("/abs").is_err());
        assert!(RepoPath::parse("a//b").is_err());
        assert!(RepoPath::parse("a/./b").is_err());
        assert!(RepoPath::parse("a/../b").is_err());
    }

    #[test]
    fn join_and_normalize_collapses_dots() {
        let dir = RepoPath::parse("a/b").unwrap();
        assert_eq!(
            join_and_normalize(&dir, "../c").unwrap().as_str(),
            "a/c"
        );
        assert_eq!(
            join_and_normalize(&dir, "./d/../e").unwrap().as_str(),
            "a/b/e"
        );
        assert_eq!(
            join_and_normalize(&dir, "../../f").unwrap().as_str(),
            "f"
        );
    }

    #[test]
    fn join_and_normalize_rejects_escapes() {
        let dir = RepoPath::parse("a").unwrap();
        assert!(matches!(
            join_and_normalize(&dir, "../../x"),
            Err(PathError::EscapesMount(_))
        ));
        assert!(matches!(
            join_and_normalize(&dir, "/etc/passwd"),
            Err(PathError::AbsoluteTarget(_))
        ));
    }

    #[test]
    fn mount_generations_are_distinct_and_monotonic() {
        let a = next_mount_generation();
        let b = next_mount_generation();
        let c = next_mount_generation();
        assert_ne!(a, b);
        assert_ne!(b, c);
        // Same process prefix, differing counter bits.
        assert_eq!(a & !0xFFFF, b & !0xFFFF);
        assert!((b & 0xFFFF) > (a & 0xFFFF));
    }

    #[test]
    fn component_case_comparison() {
        assert!(component_names_equal("Readme", "readme", false));
        assert!(!component_names_equal("Readme", "readme", true));
    }

    #[test]
    fn timestamp_roundtrip() {
        let now = SystemTime::now();
        let ts = SnapTimestamp::from_system_time(now);
        assert!(ts.as_nanos() > 0);
    }
}
