//! Server-wide collaborators shared by every mount.

use crate::channel::{FuseBackend, NfsServerHandle, PrivHelper, ProjectionBackend};
use crate::config::Tunables;
use crate::diff::GitIgnoreStack;
use asupersync::Cx;
use parking_lot::{Condvar, Mutex};
use sfs_error::{Result, SfsError};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;
use tracing::info;

// ── Clock ───────────────────────────────────────────────────────────────────

pub trait Clock: Send + Sync {
    fn now(&self) -> SystemTime;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}

// ── Fault injection ─────────────────────────────────────────────────────────

struct Gate {
    state: Mutex<GateState>,
    cond: Condvar,
}

#[derive(Default)]
struct GateState {
    released: bool,
    waiting: usize,
}

/// Handle to a blocking fault: release it, or wait until an operation has
/// actually parked on it.
#[derive(Clone)]
pub struct BlockedFault {
    gate: Arc<Gate>,
}

impl BlockedFault {
    pub fn release(&self) {
        let mut state = self.gate.state.lock();
        state.released = true;
        drop(state);
        self.gate.cond.notify_all();
    }

    /// Block until at least one operation is parked on this fault.
    pub fn wait_for_waiter(&self) {
        let mut state = self.gate.state.lock();
        while state.waiting == 0 && !state.released {
            self.gate.cond.wait(&mut state);
        }
    }
}

enum FaultKind {
    Error(String),
    Block(Arc<Gate>),
}

/// Keyed fault gates checked at well-known points of long operations.
#[derive(Default)]
pub struct FaultInjector {
    faults: Mutex<HashMap<(String, String), FaultKind>>,
}

impl FaultInjector {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inject_error(&self, class: &str, key: &str, message: &str) {
        self.faults.lock().insert(
            (class.to_owned(), key.to_owned()),
            FaultKind::Error(message.to_owned()),
        );
    }

    /// Make operations passing `(class, key)` park until released.
    pub fn inject_block(&self, class: &str, key: &str) -> BlockedFault {
        let gate = Arc::new(Gate {
            state: Mutex::new(GateState::default()),
            cond: Condvar::new(),
        });
        self.faults.lock().insert(
            (class.to_owned(), key.to_owned()),
            FaultKind::Block(Arc::clone(&gate)),
        );
        BlockedFault { gate }
    }

    pub fn remove_fault(&self, class: &str, key: &str) {
        self.faults
            .lock()
            .remove(&(class.to_owned(), key.to_owned()));
    }

    /// Gate used by long operations; a no-op unless a fault is configured.
    pub fn check(&self, cx: &Cx, class: &str, key: &str) -> Result<()> {
        cx.checkpoint().map_err(|_| SfsError::Cancelled)?;
        let gate = {
            let faults = self.faults.lock();
            match faults.get(&(class.to_owned(), key.to_owned())) {
                None => return Ok(()),
                Some(FaultKind::Error(message)) => {
                    return Err(SfsError::InjectedFault(format!("{class}:{key}: {message}")))
                }
                Some(FaultKind::Block(gate)) => Arc::clone(gate),
            }
        };
        let mut state = gate.state.lock();
        state.waiting += 1;
        gate.cond.notify_all();
        while !state.released {
            gate.cond.wait(&mut state);
        }
        state.waiting -= 1;
        Ok(())
    }
}

// ── Structured logging ──────────────────────────────────────────────────────

/// Analytics events emitted by the checkout and diff engines.
#[derive(Debug, Clone, PartialEq)]
pub enum LogEvent {
    FinishedCheckout {
        mode: &'static str,
        duration_s: f64,
        success: bool,
        trees_fetched: u64,
        blobs_fetched: u64,
    },
    ParentMismatch {
        expected: String,
        actual: String,
    },
}

pub trait StructuredLogger: Send + Sync {
    fn log_event(&self, event: LogEvent);
}

/// Default logger: forwards events to `tracing`.
pub struct TracingLogger;

impl StructuredLogger for TracingLogger {
    fn log_event(&self, event: LogEvent) {
        match event {
            LogEvent::FinishedCheckout {
                mode,
                duration_s,
                success,
                trees_fetched,
                blobs_fetched,
            } => {
                info!(
                    mode,
                    duration_s, success, trees_fetched, blobs_fetched, "finished checkout"
                );
            }
            LogEvent::ParentMismatch { expected, actual } => {
                info!(expected, actual, "parent mismatch");
            }
        }
    }
}

// ── Server state ────────────────────────────────────────────────────────────

/// Bundle of process-wide collaborators handed to each mount.
pub struct ServerState {
    pub clock: Arc<dyn Clock>,
    pub fault_injector: Arc<FaultInjector>,
    pub structured_logger: Arc<dyn StructuredLogger>,
    pub priv_helper: Arc<dyn PrivHelper>,
    pub fuse_backend: Arc<dyn FuseBackend>,
    pub nfs_server: Option<Arc<dyn NfsServerHandle>>,
    pub projection_backend: Option<Arc<dyn ProjectionBackend>>,
    /// Path of the server's client-facing socket, exposed through the
    /// control directory.
    pub socket_path: PathBuf,
    /// User- and system-level ignore rules applied to untracked files.
    pub top_level_ignores: GitIgnoreStack,
    pub tunables: Tunables,
}
