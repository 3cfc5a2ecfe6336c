#![forbid(unsafe_code)]
//! Shared fixtures for the SnapFS end-to-end suites.

use anyhow::{Context, Result};
use sfs_testkit::{TestMount, TestMountBuilder};

/// An initialized mount over a single commit `R0` of plain files.
pub fn simple_mount(files: &[(&str, &str)]) -> Result<TestMount> {
    let tm = TestMountBuilder::new()
        .commit("R0", files)
        .parent("R0")
        .build();
    tm.initialize().context("initializing fixture mount")?;
    Ok(tm)
}

/// The standard checkout fixture: `R0 = {a:"1", b:"2"}` and
/// `R1 = {a:"1", b:"3", c:"4"}`, initialized at `R0`.
pub fn two_commit_mount() -> Result<TestMount> {
    let tm = TestMountBuilder::new()
        .commit("R0", &[("a", "1"), ("b", "2")])
        .commit("R1", &[("a", "1"), ("b", "3"), ("c", "4")])
        .parent("R0")
        .build();
    tm.initialize().context("initializing fixture mount")?;
    Ok(tm)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixtures_initialize_cleanly() {
        let tm = two_commit_mount().unwrap();
        assert_eq!(tm.read_file("a").unwrap(), b"1");
        assert_eq!(tm.read_file("b").unwrap(), b"2");
    }
}
