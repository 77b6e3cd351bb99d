//! Join/leave orchestration
//!
//! Turns operator requests into gossip operations. Membership changes that
//! result from a join reach the registry through gossip events, not through
//! this type.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use muster_gossip::{GossipAdaptor, Member};
use tracing::{debug, info};

use crate::error::{CoordinatorResult, Error};
use crate::registry::PeerRegistry;

/// Issues joins and leaves on behalf of the operator.
pub struct Orchestrator<G>
where
    G: GossipAdaptor,
{
    gossip: Arc<G>,
    registry: Arc<PeerRegistry>,
    join_timeout: Duration,
    left: AtomicBool,
}

impl<G> Orchestrator<G>
where
    G: GossipAdaptor,
{
    /// Create an orchestrator over a gossip layer and the registry it feeds
    pub fn new(gossip: Arc<G>, registry: Arc<PeerRegistry>, join_timeout: Duration) -> Self {
        Self {
            gossip,
            registry,
            join_timeout,
            left: AtomicBool::new(false),
        }
    }

    /// Contact each address and merge with its cluster.
    ///
    /// Returns how many addresses were contacted, which is not the size of
    /// the resulting cluster. Unreachable addresses only lower the count.
    ///
    /// # Errors
    ///
    /// `InvalidState` after [`Orchestrator::leave`], `Transport` if gossip
    /// could not issue the join, `Timeout` if it did not finish within the
    /// join timeout.
    pub async fn join(&self, addresses: &[String]) -> CoordinatorResult<usize> {
        if self.left.load(Ordering::SeqCst) {
            return Err(Error::invalid_state(
                "this node has left the cluster and must be restarted to rejoin",
            ));
        }
        if addresses.is_empty() {
            return Ok(0);
        }

        debug!("Joining {:?}", addresses);
        let contacted = tokio::time::timeout(self.join_timeout, self.gossip.join(addresses))
            .await
            .map_err(|_| {
                Error::timeout(format!(
                    "join did not complete within {:?}",
                    self.join_timeout
                ))
            })?
            .map_err(|e| Error::from_gossip("issuing gossip join", e))?;

        info!("Contacted {} of {} addresses", contacted, addresses.len());
        Ok(contacted)
    }

    /// Announce a graceful leave. Calling it again, concurrently or not, is a
    /// no-op.
    ///
    /// # Errors
    ///
    /// `Transport` if gossip could not broadcast the leave; the node is then
    /// still considered a member and the call may be retried.
    pub async fn leave(&self) -> CoordinatorResult<()> {
        if self
            .left
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Leave already issued");
            return Ok(());
        }

        if let Err(e) = self.gossip.leave().await {
            self.left.store(false, Ordering::SeqCst);
            return Err(Error::from_gossip("broadcasting leave", e));
        }

        info!("Left the cluster");
        Ok(())
    }

    /// Whether a leave has been issued
    pub fn has_left(&self) -> bool {
        self.left.load(Ordering::SeqCst)
    }

    /// Every member in the registry, all regions included
    pub async fn members(&self) -> Vec<Member> {
        self.registry.snapshot().await
    }
}
