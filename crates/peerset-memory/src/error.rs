//! Error types for the in-memory peer set.

use muster_peerset::{PeerAddress, PeerSetAdaptorError, PeerSetErrorKind};
use thiserror::Error;

/// Result alias for the in-memory peer set.
pub type PeerSetResult<T> = Result<T, Error>;

/// Error type for the in-memory peer set.
#[derive(Clone, Debug, Error)]
pub enum Error {
    /// A configuration already exists on one of the proposed peers.
    #[error("peer {0} already holds a configuration")]
    AlreadyBootstrapped(PeerAddress),

    /// The operation requires leadership.
    #[error("not the leader (leader: {leader:?})")]
    NotLeader {
        /// Current leader, if any
        leader: Option<PeerAddress>,
    },

    /// An injected or simulated storage fault.
    #[error("storage fault on {0}")]
    Storage(PeerAddress),

    /// Bootstrap was called with no peers.
    #[error("bootstrap requires at least one peer")]
    EmptyPeerSet,
}

impl PeerSetAdaptorError for Error {
    fn kind(&self) -> PeerSetErrorKind {
        match self {
            Self::AlreadyBootstrapped(_) => PeerSetErrorKind::AlreadyBootstrapped,
            Self::NotLeader { .. } => PeerSetErrorKind::NotLeader,
            Self::Storage(_) => PeerSetErrorKind::Storage,
            Self::EmptyPeerSet => PeerSetErrorKind::Other,
        }
    }
}
