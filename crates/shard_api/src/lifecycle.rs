//! The per-shard lifecycle state machine.
//!
//! States are strictly ordered. A transition may only move to the immediate
//! successor; skipping or moving backward is rejected. A failure freezes the
//! state where it happened and every later transition is refused.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use thiserror::Error;

/// Lifecycle state of a shard instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(u8)]
pub enum LifecycleState {
    Discovered = 0,
    ContextBound = 1,
    PreSetupRunning = 2,
    PreSetupDone = 3,
    DependenciesResolved = 4,
    SetupRunning = 5,
    Active = 6,
    TeardownRunning = 7,
    Terminated = 8,
}

impl LifecycleState {
    /// The state that must follow this one, if any.
    pub fn next(self) -> Option<LifecycleState> {
        Self::from_u8(self as u8 + 1)
    }

    fn from_u8(value: u8) -> Option<LifecycleState> {
        use LifecycleState::*;
        Some(match value {
            0 => Discovered,
            1 => ContextBound,
            2 => PreSetupRunning,
            3 => PreSetupDone,
            4 => DependenciesResolved,
            5 => SetupRunning,
            6 => Active,
            7 => TeardownRunning,
            8 => Terminated,
            _ => return None,
        })
    }

    pub fn as_str(self) -> &'static str {
        use LifecycleState::*;
        match self {
            Discovered => "DISCOVERED",
            ContextBound => "CONTEXT_BOUND",
            PreSetupRunning => "PRE_SETUP_RUNNING",
            PreSetupDone => "PRE_SETUP_DONE",
            DependenciesResolved => "DEPENDENCIES_RESOLVED",
            SetupRunning => "SETUP_RUNNING",
            Active => "ACTIVE",
            TeardownRunning => "TEARDOWN_RUNNING",
            Terminated => "TERMINATED",
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A rejected lifecycle transition.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("illegal lifecycle transition {from} -> {to}")]
    Illegal {
        from: LifecycleState,
        to: LifecycleState,
    },
    #[error("lifecycle is frozen at {at} after a failure")]
    Frozen { at: LifecycleState },
}

/// Atomic holder of a [`LifecycleState`] plus a failure marker.
///
/// Concurrent callers racing on the same transition see exactly one winner.
#[derive(Debug)]
pub struct LifecycleCell {
    state: AtomicU8,
    failed: AtomicBool,
}

impl Default for LifecycleCell {
    fn default() -> Self {
        Self::new()
    }
}

impl LifecycleCell {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(LifecycleState::Discovered as u8),
            failed: AtomicBool::new(false),
        }
    }

    pub fn current(&self) -> LifecycleState {
        LifecycleState::from_u8(self.state.load(Ordering::Acquire))
            .unwrap_or(LifecycleState::Terminated)
    }

    /// Moves to `to`, which must be the immediate successor of the current state.
    ///
    /// # Returns
    ///
    /// The state that was left, or a [`TransitionError`] if the move would skip,
    /// go backward, or the cell has been frozen by [`mark_failed`](Self::mark_failed).
    pub fn advance(&self, to: LifecycleState) -> Result<LifecycleState, TransitionError> {
        let from = self.current();
        if self.failed.load(Ordering::Acquire) {
            return Err(TransitionError::Frozen { at: from });
        }
        if from.next() != Some(to) {
            return Err(TransitionError::Illegal { from, to });
        }

        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| from)
            .map_err(|actual| TransitionError::Illegal {
                from: LifecycleState::from_u8(actual).unwrap_or(from),
                to,
            })
    }

    /// Freezes the cell at its current state and returns that state.
    pub fn mark_failed(&self) -> LifecycleState {
        self.failed.store(true, Ordering::Release);
        self.current()
    }

    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_forward_walk() {
        let cell = LifecycleCell::new();
        let mut state = cell.current();
        while let Some(next) = state.next() {
            assert_eq!(cell.advance(next), Ok(state));
            state = next;
        }
        assert_eq!(cell.current(), LifecycleState::Terminated);
    }

    #[test]
    fn test_skip_and_backward_rejected() {
        let cell = LifecycleCell::new();
        assert!(matches!(
            cell.advance(LifecycleState::PreSetupRunning),
            Err(TransitionError::Illegal { .. })
        ));

        cell.advance(LifecycleState::ContextBound).unwrap();
        assert!(cell.advance(LifecycleState::Discovered).is_err());
        assert!(cell.advance(LifecycleState::ContextBound).is_err());
        assert_eq!(cell.current(), LifecycleState::ContextBound);
    }

    #[test]
    fn test_failure_freezes_state() {
        let cell = LifecycleCell::new();
        cell.advance(LifecycleState::ContextBound).unwrap();
        cell.advance(LifecycleState::PreSetupRunning).unwrap();

        assert_eq!(cell.mark_failed(), LifecycleState::PreSetupRunning);
        assert_eq!(
            cell.advance(LifecycleState::PreSetupDone),
            Err(TransitionError::Frozen {
                at: LifecycleState::PreSetupRunning
            })
        );
        assert!(cell.is_failed());
    }

    #[test]
    fn test_display_names() {
        assert_eq!(LifecycleState::DependenciesResolved.to_string(), "DEPENDENCIES_RESOLVED");
        assert_eq!(LifecycleState::Terminated.next(), None);
    }
}
