//! Lifecycle interface for long-running cluster services.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

use std::fmt;

use async_trait::async_trait;

/// Boxed error returned by lifecycle operations.
pub type BootableError = Box<dyn std::error::Error + Send + Sync>;

/// A service with background tasks that can be started and stopped.
///
/// `start` spawns the service's background work and returns once it is
/// running. `shutdown` stops accepting new work, lets in-flight work finish and
/// returns once every background task has exited.
#[async_trait]
pub trait Bootable
where
    Self: Send + Sync + 'static,
{
    /// Name used in logs.
    fn bootable_name(&self) -> &str;

    /// Start the service.
    async fn start(&self) -> Result<(), BootableError>;

    /// Shut the service down.
    async fn shutdown(&self) -> Result<(), BootableError>;

    /// Wait until the service's background tasks exit.
    async fn wait(&self);
}

/// Coarse lifecycle phase of a [`Bootable`] service.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum BootPhase {
    /// Constructed but not started.
    #[default]
    Created,

    /// Background tasks are running.
    Running,

    /// Shutdown has been requested and tasks are draining.
    ShuttingDown,

    /// All background tasks have exited.
    Stopped,
}

impl BootPhase {
    /// Whether `start` may be called from this phase.
    #[must_use]
    pub const fn can_start(self) -> bool {
        matches!(self, Self::Created)
    }

    /// Whether the service is running or draining.
    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(self, Self::Running | Self::ShuttingDown)
    }
}

impl fmt::Display for BootPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::ShuttingDown => "shutting-down",
            Self::Stopped => "stopped",
        };
        f.write_str(name)
    }
}
