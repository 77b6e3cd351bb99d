//! Gossip event apply loop

use std::sync::Arc;

use futures::StreamExt;
use muster_gossip::{Member, MemberEventStream};
use muster_peerset::PeerAddress;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::registry::{DepartureReason, PeerRegistry, RegistryChange};

/// Sole writer of the peer registry.
///
/// Applies gossip events in arrival order and forwards graceful departures of
/// local-region servers to the reconciler.
pub(crate) struct EventApplier {
    registry: Arc<PeerRegistry>,
    local_region: String,
    departures: flume::Sender<PeerAddress>,
}

impl EventApplier {
    pub(crate) fn new(
        registry: Arc<PeerRegistry>,
        local_region: String,
        departures: flume::Sender<PeerAddress>,
    ) -> Self {
        Self {
            registry,
            local_region,
            departures,
        }
    }

    pub(crate) fn start(
        self,
        mut events: MemberEventStream,
        task_tracker: &TaskTracker,
        cancellation_token: &CancellationToken,
    ) {
        let token = cancellation_token.clone();

        task_tracker.spawn(async move {
            info!("Starting gossip event apply loop");

            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => {
                        info!("Gossip event apply loop shutting down");
                        return;
                    }
                    event = events.next() => {
                        let Some(event) = event else {
                            warn!("Gossip event stream closed");
                            return;
                        };
                        debug!("Applying gossip event {}", event);
                        let change = self.registry.apply(event).await;
                        self.forward(&change);
                    }
                }
            }
        });
    }

    fn forward(&self, change: &RegistryChange) {
        let RegistryChange::Removed {
            member,
            reason: DepartureReason::Left,
        } = change
        else {
            return;
        };
        let Some(addr) = self.consensus_address(member) else {
            return;
        };

        match self.departures.try_send(addr) {
            Ok(()) => debug!("Queued {} for removal from the consensus group", member.id),
            Err(flume::TrySendError::Full(addr)) => {
                warn!("Departure queue full, dropping removal of {}", addr);
            }
            Err(flume::TrySendError::Disconnected(_)) => {}
        }
    }

    fn consensus_address(&self, member: &Member) -> Option<PeerAddress> {
        let tags = member.server_tags().ok()?;
        if tags.region != self.local_region {
            return None;
        }
        member
            .rpc_addr()
            .ok()
            .and_then(|addr| PeerAddress::parse(addr).ok())
    }
}
