//! The replicated peer configuration

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::address::PeerAddress;

/// Voting membership of a consensus group.
///
/// Empty until the group is bootstrapped. Once non-empty it stays non-empty
/// for the life of the group's storage.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct Configuration {
    /// Voting peers.
    pub peers: BTreeSet<PeerAddress>,
}

impl Configuration {
    /// Configuration holding exactly `peers`.
    pub fn new(peers: impl IntoIterator<Item = PeerAddress>) -> Self {
        Self {
            peers: peers.into_iter().collect(),
        }
    }

    /// Whether a group exists.
    #[must_use]
    pub fn is_bootstrapped(&self) -> bool {
        !self.peers.is_empty()
    }

    /// Whether `addr` is a voter.
    #[must_use]
    pub fn contains(&self, addr: &PeerAddress) -> bool {
        self.peers.contains(addr)
    }

    /// Number of voters.
    #[must_use]
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    /// Whether there are no voters.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Number of voters other than `local`.
    #[must_use]
    pub fn other_peers(&self, local: &PeerAddress) -> usize {
        self.peers.iter().filter(|p| *p != local).count()
    }
}
