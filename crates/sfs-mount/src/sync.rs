//! Broadcast promises.
//!
//! A [`SharedPromise`] is fulfilled at most once and observed by any number
//! of waiters; clones share the same slot. Once set, the value is never
//! cleared or replaced, which makes the handshake predicates safe to read
//! without extra synchronization.

use asupersync::Cx;
use parking_lot::{Condvar, Mutex};
use sfs_error::{Result, SfsError};
use std::sync::Arc;
use std::time::Duration;

struct Inner<T> {
    slot: Mutex<Option<Result<T>>>,
    cond: Condvar,
}

pub struct SharedPromise<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for SharedPromise<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone> Default for SharedPromise<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> SharedPromise<T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                slot: Mutex::new(None),
                cond: Condvar::new(),
            }),
        }
    }

    /// Set the result. Returns `false` if the promise was already fulfilled,
    /// in which case the new value is dropped.
    pub fn fulfill(&self, result: Result<T>) -> bool {
        let mut slot = self.inner.slot.lock();
        if slot.is_some() {
            return false;
        }
        *slot = Some(result);
        drop(slot);
        self.inner.cond.notify_all();
        true
    }

    #[must_use]
    pub fn is_fulfilled(&self) -> bool {
        self.inner.slot.lock().is_some()
    }

    /// Non-blocking read of the result, if present.
    #[must_use]
    pub fn try_get(&self) -> Option<Result<T>> {
        self.inner.slot.lock().clone()
    }

    /// Block until fulfilled.
    pub fn wait(&self, cx: &Cx) -> Result<T> {
        cx.checkpoint().map_err(|_| SfsError::Cancelled)?;
        let mut slot = self.inner.slot.lock();
        while slot.is_none() {
            self.inner.cond.wait(&mut slot);
        }
        slot.clone().expect("slot fulfilled")
    }

    /// Block until fulfilled or the timeout elapses.
    #[must_use]
    pub fn wait_for(&self, timeout: Duration) -> Option<Result<T>> {
        let mut slot = self.inner.slot.lock();
        if slot.is_none() {
            let _ = self.inner.cond.wait_for(&mut slot, timeout);
        }
        slot.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn fulfill_once_wins() {
        let promise: SharedPromise<u32> = SharedPromise::new();
        assert!(promise.fulfill(Ok(1)));
        assert!(!promise.fulfill(Ok(2)));
        assert_eq!(promise.try_get().unwrap().unwrap(), 1);
    }

    #[test]
    fn waiters_all_observe_the_value() {
        let promise: SharedPromise<&'static str> = SharedPromise::new();
        let mut handles = Vec::new();
        for _ in 0..4 {
            let promise = promise.clone();
            handles.push(thread::spawn(move || {
                promise.wait(&Cx::for_testing()).unwrap()
            }));
        }
        thread::sleep(Duration::from_millis(10));
        promise.fulfill(Ok("done"));
        for handle in handles {
            assert_eq!(handle.join().unwrap(), "done");
        }
    }

    #[test]
    fn errors_broadcast_too() {
        let promise: SharedPromise<()> = SharedPromise::new();
        promise.fulfill(Err(SfsError::MountCancelled));
        assert_eq!(
            promise.wait(&Cx::for_testing()).unwrap_err(),
            SfsError::MountCancelled
        );
    }

    #[test]
    fn wait_for_times_out_when_unfulfilled() {
        let promise: SharedPromise<()> = SharedPromise::new();
        assert!(promise.wait_for(Duration::from_millis(5)).is_none());
    }
}
