//! Coordinator configuration

use std::time::Duration;

use muster_gossip::ServerTags;
use serde::{Deserialize, Serialize};

use crate::error::{CoordinatorResult, Error};

/// Coordinator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Node name, also the gossip member id
    pub node_name: String,

    /// Region this server belongs to
    pub region: String,

    /// Datacenter, informational
    pub datacenter: Option<String>,

    /// Number of servers to wait for before bootstrapping; 0 disables
    /// automatic bootstrap
    pub bootstrap_expect: u32,

    /// Protocol version advertised to and required of peers
    pub protocol_version: u32,

    /// Consensus protocol version advertised to and required of peers
    pub raft_protocol_version: u32,

    /// Period of the background reconciliation tick; `None` leaves only
    /// event-driven reconciliation
    pub reconcile_interval: Option<Duration>,

    /// Upper bound on a gossip join
    pub join_timeout: Duration,

    /// Upper bound on a consensus read or write
    pub write_timeout: Duration,

    /// Retry policy for failed bootstrap writes
    pub backoff: BackoffConfig,

    /// Capacity of the queue of departed servers awaiting removal
    pub event_buffer: usize,

    /// Upper bound on waiting for background tasks at shutdown
    pub shutdown_timeout: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            node_name: "muster".to_string(),
            region: "global".to_string(),
            datacenter: None,
            bootstrap_expect: 0,
            protocol_version: 1,
            raft_protocol_version: 1,
            reconcile_interval: Some(Duration::from_secs(60)),
            join_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(10),
            backoff: BackoffConfig::default(),
            event_buffer: 1024,
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

impl CoordinatorConfig {
    /// Check the configuration for values the coordinator cannot work with.
    ///
    /// # Errors
    ///
    /// Returns a configuration error describing the first problem found.
    pub fn validate(&self) -> CoordinatorResult<()> {
        if self.node_name.is_empty() {
            return Err(Error::configuration("node_name must not be empty"));
        }
        if self.region.is_empty() {
            return Err(Error::configuration("region must not be empty"));
        }
        if self.join_timeout.is_zero() || self.write_timeout.is_zero() {
            return Err(Error::configuration("timeouts must be non-zero"));
        }
        if self.reconcile_interval.is_some_and(|i| i.is_zero()) {
            return Err(Error::configuration(
                "reconcile_interval must be non-zero when set",
            ));
        }
        if self.event_buffer == 0 {
            return Err(Error::configuration("event_buffer must be non-zero"));
        }
        self.backoff.validate()
    }

    /// The server tags this node should advertise over gossip.
    pub fn server_tags(&self, rpc_port: u16) -> ServerTags {
        ServerTags {
            region: self.region.clone(),
            datacenter: self.datacenter.clone(),
            expect: self.bootstrap_expect,
            protocol_version: self.protocol_version,
            raft_version: self.raft_protocol_version,
            port: rpc_port,
            build: Some(env!("CARGO_PKG_VERSION").to_string()),
        }
    }
}

/// Upper bound accepted for `BackoffConfig::max_delay`.
pub const MAX_BACKOFF_DELAY: Duration = Duration::from_secs(3600);

/// Exponential backoff configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// Delay after the first failure
    pub initial_delay: Duration,

    /// Cap on the delay
    pub max_delay: Duration,

    /// Growth factor per consecutive failure
    pub multiplier: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

impl BackoffConfig {
    fn validate(&self) -> CoordinatorResult<()> {
        if self.initial_delay.is_zero() {
            return Err(Error::configuration("backoff.initial_delay must be non-zero"));
        }
        if self.max_delay < self.initial_delay {
            return Err(Error::configuration(
                "backoff.max_delay must not be below backoff.initial_delay",
            ));
        }
        if self.max_delay > MAX_BACKOFF_DELAY {
            return Err(Error::configuration(format!(
                "backoff.max_delay must not exceed {MAX_BACKOFF_DELAY:?}"
            )));
        }
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(Error::configuration(
                "backoff.multiplier must be a finite number of at least 1",
            ));
        }
        Ok(())
    }
}
