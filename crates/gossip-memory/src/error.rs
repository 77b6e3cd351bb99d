//! Error types for the in-memory gossip adaptor.

use muster_gossip::{GossipAdaptorError, GossipAdaptorErrorKind};
use thiserror::Error;

/// Error type for the in-memory gossip adaptor.
#[derive(Clone, Debug, Error)]
pub enum Error {
    /// Another running node is already bound to the address.
    #[error("address {0} is already bound")]
    AddressInUse(String),

    /// The node has been shut down.
    #[error("gossip node {0} is not running")]
    NotRunning(String),

    /// The node has left the cluster and cannot be used for gossip again.
    #[error("gossip node {0} has left the cluster")]
    AlreadyLeft(String),

    /// The node's transport has been switched off.
    #[error("gossip transport for {0} is unavailable")]
    TransportUnavailable(String),
}

impl GossipAdaptorError for Error {
    fn kind(&self) -> GossipAdaptorErrorKind {
        match self {
            Self::NotRunning(_) | Self::AlreadyLeft(_) | Self::TransportUnavailable(_) => {
                GossipAdaptorErrorKind::Unavailable
            }
            Self::AddressInUse(_) => GossipAdaptorErrorKind::Other,
        }
    }
}
