//! Consensus peer-set abstraction
//!
//! The consensus engine owns the durable, replicated list of voting peers.
//! This crate only describes how the coordinator talks to it: read the
//! current configuration, write the initial one exactly once, and ask the
//! leader to add or remove peers afterwards.
#![warn(missing_docs)]

pub mod address;
pub mod configuration;
pub mod error;

use async_trait::async_trait;

pub use address::{AddressError, PeerAddress};
pub use configuration::Configuration;
pub use error::{PeerSetAdaptorError, PeerSetErrorKind};

/// Interface to a consensus engine's peer set.
#[async_trait]
pub trait PeerSetAdaptor: Send + Sync + 'static {
    /// Error type returned by the engine.
    type Error: PeerSetAdaptorError;

    /// Consensus address of this process.
    fn local_address(&self) -> PeerAddress;

    /// Read the configuration from durable storage.
    async fn current_configuration(&self) -> Result<Configuration, Self::Error>;

    /// Write the initial configuration.
    ///
    /// Must fail with [`PeerSetErrorKind::AlreadyBootstrapped`] if any
    /// configuration already exists, on this node or on any of `peers`.
    async fn bootstrap(&self, peers: &[PeerAddress]) -> Result<(), Self::Error>;

    /// Add a voting peer. Only the leader may do this.
    async fn add_peer(&self, addr: &PeerAddress) -> Result<(), Self::Error>;

    /// Remove a voting peer. Only the leader may do this.
    async fn remove_peer(&self, addr: &PeerAddress) -> Result<(), Self::Error>;

    /// Whether this process currently leads the consensus group.
    async fn is_leader(&self) -> bool;
}
