//! Cluster bootstrap and peer reconciliation for Muster servers
//!
//! A [`Coordinator`] sits between a gossip membership layer and a consensus
//! engine. It keeps a registry of the servers gossip has discovered, decides
//! when enough of them agree on the expected cluster size to write the initial
//! consensus configuration, writes it at most once, and afterwards keeps the
//! consensus membership in step with gossip from the leader.
//!
//! ```text
//! operator ── join/leave ──▶ Orchestrator ──▶ gossip
//!                                               │ events
//!                                               ▼
//!                                          PeerRegistry ── changes ──▶ Reconciler ──▶ consensus
//! ```
#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod backoff;
pub mod config;
pub mod coordinator;
pub mod diagnostics;
pub mod error;
mod events;
pub mod orchestrator;
pub mod reconciler;
pub mod registry;
pub mod state;

pub use backoff::Backoff;
pub use config::{BackoffConfig, CoordinatorConfig};
pub use coordinator::Coordinator;
pub use diagnostics::BootstrapDiagnostics;
pub use error::{CoordinatorResult, Error, ErrorContext, ErrorKind};
pub use orchestrator::Orchestrator;
pub use reconciler::Reconciler;
pub use registry::{BootstrapView, Candidate, DepartureReason, PeerRegistry, RegistryChange};
pub use state::{BootstrapState, ReconcilerState};
