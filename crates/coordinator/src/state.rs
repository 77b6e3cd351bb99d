//! Bootstrap state machine types

use std::fmt;

use serde::{Deserialize, Serialize};

/// Whether this process has a consensus group.
///
/// Moves from `Unbootstrapped` to `Bootstrapped` at most once per process
/// lifetime and never back.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub enum BootstrapState {
    /// No configuration has been written or observed yet
    #[default]
    Unbootstrapped,
    /// A configuration exists
    Bootstrapped,
}

/// Phase of the reconciler.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub enum ReconcilerState {
    /// Waiting for a trigger
    #[default]
    Idle,
    /// Deciding whether it is safe to bootstrap
    Evaluating,
    /// Terminal; only steady-state reconciliation runs from here
    Bootstrapped,
}

impl ReconcilerState {
    /// The bootstrap state this phase implies
    pub fn bootstrap_state(self) -> BootstrapState {
        match self {
            Self::Bootstrapped => BootstrapState::Bootstrapped,
            Self::Idle | Self::Evaluating => BootstrapState::Unbootstrapped,
        }
    }
}

impl fmt::Display for ReconcilerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Evaluating => write!(f, "evaluating"),
            Self::Bootstrapped => write!(f, "bootstrapped"),
        }
    }
}
