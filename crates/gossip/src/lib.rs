//! Gossip membership abstraction for Muster servers
//!
//! This crate provides:
//! - Member identity and status types (`MemberId`, `Member`)
//! - The typed tag schema servers advertise over gossip (`ServerTags`)
//! - Membership events (`MemberEvent`)
//! - The `GossipAdaptor` trait implemented by concrete gossip layers
//!
//! Gossip layers themselves (failure detection, anti-entropy) live in
//! separate crates.
#![warn(missing_docs)]

pub mod error;
pub mod event;
pub mod member;
pub mod tags;

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;

pub use error::{GossipAdaptorError, GossipAdaptorErrorKind};
pub use event::{MemberEvent, MemberEventKind};
pub use member::{Member, MemberId, MemberStatus};
pub use tags::{Role, ServerTags, TagError};

/// Stream of membership events delivered by a gossip layer.
///
/// Events for a single member arrive in order. Nothing is guaranteed about the
/// relative order of events for different members.
pub type MemberEventStream = Pin<Box<dyn Stream<Item = MemberEvent> + Send>>;

/// Interface to an eventually-consistent gossip membership layer.
#[async_trait]
pub trait GossipAdaptor: Send + Sync + 'static {
    /// Error type returned by the gossip layer.
    type Error: GossipAdaptorError;

    /// The member describing this process.
    fn local_member(&self) -> Member;

    /// Subscribe to membership events.
    ///
    /// Each call returns an independent stream starting at the moment of the
    /// call; use [`GossipAdaptor::members`] to learn the state before it.
    fn subscribe(&self) -> MemberEventStream;

    /// Contact each address and merge memberships with whatever cluster it
    /// belongs to.
    ///
    /// Returns the number of addresses that were successfully contacted.
    /// Unreachable addresses reduce the count but are not an error; an error
    /// means the join could not be issued at all.
    async fn join(&self, addresses: &[String]) -> Result<usize, Self::Error>;

    /// Broadcast a graceful leave so peers record this member as left instead
    /// of failed.
    async fn leave(&self) -> Result<(), Self::Error>;

    /// Snapshot of every member currently known to this node, itself included.
    async fn members(&self) -> Result<Vec<Member>, Self::Error>;

    /// Stop participating in gossip without a graceful leave.
    async fn shutdown(&self) -> Result<(), Self::Error>;
}
