//! Error classification for peer-set adaptors

use std::error::Error;
use std::fmt::{self, Debug};

/// Marker trait for `PeerSetAdaptor` errors
pub trait PeerSetAdaptorError: Debug + Error + Send + Sync + 'static {
    /// Returns the kind of this error
    fn kind(&self) -> PeerSetErrorKind;
}

/// The kind of peer-set adaptor error.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum PeerSetErrorKind {
    /// A configuration already exists; bootstrap lost a race or is a restart
    AlreadyBootstrapped,

    /// The operation requires leadership and this node is not the leader
    NotLeader,

    /// Durable storage failed
    Storage,

    /// The engine did not answer in time
    Timeout,

    /// Other/unknown error
    Other,
}

impl fmt::Display for PeerSetErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}
