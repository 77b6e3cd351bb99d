//! Error types for the coordinator

use std::fmt;

use muster_gossip::{GossipAdaptorError, GossipAdaptorErrorKind, TagError};
use muster_peerset::{PeerSetAdaptorError, PeerSetErrorKind};
use thiserror::Error;

/// Result type for coordinator operations
pub type CoordinatorResult<T> = Result<T, Error>;

/// Main error type for the coordinator
#[derive(Debug, Error)]
pub struct Error {
    /// Error kind
    kind: ErrorKind,
    /// Error context
    context: ErrorContext,
}

impl Error {
    /// Create a new error
    pub fn new(kind: ErrorKind, context: ErrorContext) -> Self {
        Self { kind, context }
    }

    /// Create error with string context
    pub fn with_context(kind: ErrorKind, context: impl Into<String>) -> Self {
        Self {
            kind,
            context: ErrorContext::Message(context.into()),
        }
    }

    /// Create error wrapping a source error
    pub fn with_source(
        kind: ErrorKind,
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self {
            kind,
            context: ErrorContext::Chain {
                message: message.into(),
                source: Box::new(source),
            },
        }
    }

    /// Get error kind
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Get error context
    pub fn context(&self) -> &ErrorContext {
        &self.context
    }

    /// Create a transport error
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::with_context(ErrorKind::Transport, msg)
    }

    /// Create a registry inconsistency error for a member with bad tags
    pub fn registry_inconsistency(member: impl fmt::Display, err: TagError) -> Self {
        Self::with_source(
            ErrorKind::RegistryInconsistency,
            format!("member {member} advertises malformed tags"),
            err,
        )
    }

    /// Create a bootstrap write error
    pub fn bootstrap_write(msg: impl Into<String>) -> Self {
        Self::with_context(ErrorKind::BootstrapWrite, msg)
    }

    /// Create a timeout error
    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::with_context(ErrorKind::Timeout, msg)
    }

    /// Create a consensus error
    pub fn consensus(msg: impl Into<String>) -> Self {
        Self::with_context(ErrorKind::Consensus, msg)
    }

    /// Create a configuration error
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::with_context(ErrorKind::Configuration, msg)
    }

    /// Create an invalid state error
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::with_context(ErrorKind::InvalidState, msg)
    }

    /// Create a shutdown error
    pub fn shutdown(msg: impl Into<String>) -> Self {
        Self::with_context(ErrorKind::Shutdown, msg)
    }

    /// Classify an error returned by the gossip layer
    pub fn from_gossip<E: GossipAdaptorError>(message: impl Into<String>, err: E) -> Self {
        let kind = match err.kind() {
            GossipAdaptorErrorKind::Timeout => ErrorKind::Timeout,
            GossipAdaptorErrorKind::Unavailable | GossipAdaptorErrorKind::Other => {
                ErrorKind::Transport
            }
        };
        Self::with_source(kind, message, err)
    }

    /// Classify an error returned by the consensus engine
    pub fn from_peer_set<E: PeerSetAdaptorError>(message: impl Into<String>, err: E) -> Self {
        let kind = match err.kind() {
            PeerSetErrorKind::AlreadyBootstrapped => ErrorKind::BootstrapRace,
            PeerSetErrorKind::Timeout => ErrorKind::Timeout,
            PeerSetErrorKind::NotLeader | PeerSetErrorKind::Storage | PeerSetErrorKind::Other => {
                ErrorKind::Consensus
            }
        };
        Self::with_source(kind, message, err)
    }

    /// Check if another server won the bootstrap race
    pub fn is_bootstrap_race(&self) -> bool {
        matches!(self.kind, ErrorKind::BootstrapRace)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.context {
            ErrorContext::Message(msg) => write!(f, "{}: {}", self.kind, msg),
            ErrorContext::Chain { message, source } => {
                write!(f, "{}: {} (caused by: {})", self.kind, message, source)
            }
        }
    }
}

/// Error kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Gossip could not be reached to issue a join or leave
    Transport,
    /// A member advertises tags that do not parse
    RegistryInconsistency,
    /// Another server already wrote the initial configuration
    BootstrapRace,
    /// The initial configuration write failed
    BootstrapWrite,
    /// Enough servers are visible but they disagree on the expected count
    ConfigMismatchStall,
    /// Operation timed out
    Timeout,
    /// Consensus engine error
    Consensus,
    /// Invalid configuration
    Configuration,
    /// Invalid state for operation
    InvalidState,
    /// The coordinator is shutting down
    Shutdown,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Transport => write!(f, "Transport error"),
            ErrorKind::RegistryInconsistency => write!(f, "Registry inconsistency"),
            ErrorKind::BootstrapRace => write!(f, "Bootstrap race"),
            ErrorKind::BootstrapWrite => write!(f, "Bootstrap write error"),
            ErrorKind::ConfigMismatchStall => write!(f, "Bootstrap stalled"),
            ErrorKind::Timeout => write!(f, "Timeout"),
            ErrorKind::Consensus => write!(f, "Consensus error"),
            ErrorKind::Configuration => write!(f, "Configuration error"),
            ErrorKind::InvalidState => write!(f, "Invalid state"),
            ErrorKind::Shutdown => write!(f, "Shutdown"),
        }
    }
}

/// Error context
#[derive(Debug)]
pub enum ErrorContext {
    /// Simple message
    Message(String),
    /// Error chain with source
    Chain {
        /// Error message
        message: String,
        /// Source error
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl From<tokio::task::JoinError> for Error {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::with_source(ErrorKind::Shutdown, "Task join error", err)
    }
}
