//! Error classification for gossip adaptors

use std::error::Error;
use std::fmt::{self, Debug};

/// Marker trait for `GossipAdaptor` errors
pub trait GossipAdaptorError: Debug + Error + Send + Sync + 'static {
    /// Returns the kind of this error
    fn kind(&self) -> GossipAdaptorErrorKind;
}

/// The kind of gossip adaptor error.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum GossipAdaptorErrorKind {
    /// The transport could not be used at all (not bound, shut down, left)
    Unavailable,

    /// The operation did not complete in time
    Timeout,

    /// Other/unknown error
    Other,
}

impl fmt::Display for GossipAdaptorErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}
