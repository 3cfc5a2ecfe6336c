//! The mount lifecycle state machine.
//!
//! A strictly ordered lifecycle kept in one atomic variable. All transitions
//! are compare-and-swap; an illegal transition from a path that should have
//! exclusive ownership of the state is a programmer error and panics.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use tracing::error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MountState {
    /// Freshly constructed, `initialize()` not yet called.
    Uninitialized = 0,
    /// `initialize()` is running.
    Initializing = 1,
    /// Initialized but no kernel channel yet.
    Initialized = 2,
    /// `start_channel()` is attaching to the kernel driver.
    Starting = 3,
    /// Channel attached and serving.
    Running = 4,
    /// `initialize()` failed.
    InitError = 5,
    /// Channel attach failed.
    ChannelError = 6,
    /// `shutdown()` is running.
    ShuttingDown = 7,
    /// Shutdown complete.
    ShutDown = 8,
    /// `destroy()` was called; absorbing.
    Destroying = 9,
}

impl MountState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Uninitialized,
            1 => Self::Initializing,
            2 => Self::Initialized,
            3 => Self::Starting,
            4 => Self::Running,
            5 => Self::InitError,
            6 => Self::ChannelError,
            7 => Self::ShuttingDown,
            8 => Self::ShutDown,
            9 => Self::Destroying,
            other => unreachable!("invalid mount state value {other}"),
        }
    }

    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Uninitialized => "UNINITIALIZED",
            Self::Initializing => "INITIALIZING",
            Self::Initialized => "INITIALIZED",
            Self::Starting => "STARTING",
            Self::Running => "RUNNING",
            Self::InitError => "INIT_ERROR",
            Self::ChannelError => "CHANNEL_ERROR",
            Self::ShuttingDown => "SHUTTING_DOWN",
            Self::ShutDown => "SHUT_DOWN",
            Self::Destroying => "DESTROYING",
        }
    }
}

impl fmt::Display for MountState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Atomic holder of a [`MountState`].
pub struct StateCell {
    state: AtomicU8,
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new()
    }
}

impl StateCell {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(MountState::Uninitialized as u8),
        }
    }

    #[must_use]
    pub fn load(&self) -> MountState {
        MountState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// CAS `expected → to`; returns whether the swap happened.
    pub fn try_transition(&self, expected: MountState, to: MountState) -> bool {
        self.state
            .compare_exchange(
                expected as u8,
                to as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// CAS `expected → to`, panicking if another path moved the state first.
    pub fn transition(&self, mount: &str, expected: MountState, to: MountState) {
        if let Err(found) = self.state.compare_exchange(
            expected as u8,
            to as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            panic!(
                "unable to transition mount {mount} to state {to}: expected to be in \
                 state {expected} but actually in {}",
                MountState::from_u8(found)
            );
        }
    }

    /// Unconditional swap, returning the previous state.
    pub fn exchange(&self, to: MountState) -> MountState {
        MountState::from_u8(self.state.swap(to as u8, Ordering::AcqRel))
    }

    /// Move `Starting → ChannelError` after a failed channel attach.
    ///
    /// Tolerant: if a shutdown or destroy already advanced the state, the
    /// failure is logged and swallowed; any other state is unexpected and
    /// logged loudly. A lost CAS that still observes `Starting` cannot
    /// happen and is fatal.
    pub fn transition_to_channel_error(&self, mount: &str) {
        if self.try_transition(MountState::Starting, MountState::ChannelError) {
            return;
        }
        match self.load() {
            MountState::Destroying | MountState::ShuttingDown | MountState::ShutDown => {}
            MountState::Starting => unreachable!(
                "compare_exchange failed while mount {mount} stayed in STARTING"
            ),
            other => {
                error!(
                    mount,
                    state = %other,
                    "channel initialization error for a mount in an unexpected state"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normal_lifecycle_order() {
        let cell = StateCell::new();
        assert_eq!(cell.load(), MountState::Uninitialized);
        cell.transition("m", MountState::Uninitialized, MountState::Initializing);
        cell.transition("m", MountState::Initializing, MountState::Initialized);
        cell.transition("m", MountState::Initialized, MountState::Starting);
        cell.transition("m", MountState::Starting, MountState::Running);
        assert_eq!(cell.load(), MountState::Running);
    }

    #[test]
    fn try_transition_reports_failure() {
        let cell = StateCell::new();
        assert!(cell.try_transition(MountState::Uninitialized, MountState::Initializing));
        assert!(!cell.try_transition(MountState::Uninitialized, MountState::Initializing));
        assert_eq!(cell.load(), MountState::Initializing);
    }

    #[test]
    #[should_panic(expected = "unable to transition")]
    fn transition_panics_on_mismatch() {
        let cell = StateCell::new();
        cell.transition("m", MountState::Running, MountState::ShuttingDown);
    }

    #[test]
    fn channel_error_transition_is_tolerant_of_shutdown() {
        let cell = StateCell::new();
        cell.transition("m", MountState::Uninitialized, MountState::Initializing);
        cell.transition("m", MountState::Initializing, MountState::Initialized);
        cell.transition("m", MountState::Initialized, MountState::Starting);
        // A concurrent shutdown wins the race.
        cell.transition("m", MountState::Starting, MountState::ShuttingDown);
        cell.transition_to_channel_error("m");
        assert_eq!(cell.load(), MountState::ShuttingDown);
    }

    #[test]
    fn channel_error_transition_applies_from_starting() {
        let cell = StateCell::new();
        cell.transition("m", MountState::Uninitialized, MountState::Initializing);
        cell.transition("m", MountState::Initializing, MountState::Initialized);
        cell.transition("m", MountState::Initialized, MountState::Starting);
        cell.transition_to_channel_error("m");
        assert_eq!(cell.load(), MountState::ChannelError);
    }

    #[test]
    fn exchange_returns_previous() {
        let cell = StateCell::new();
        let old = cell.exchange(MountState::Destroying);
        assert_eq!(old, MountState::Uninitialized);
        assert_eq!(cell.load(), MountState::Destroying);
    }
}
