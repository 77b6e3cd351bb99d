//! Coordinator facade
//!
//! One `Coordinator` per server process owns the registry, the reconciler and
//! the orchestrator, and runs two background tasks on its task tracker: the
//! gossip event apply loop and the reconciler loop.

use std::sync::Arc;

use async_trait::async_trait;
use muster_bootable::{BootPhase, Bootable, BootableError};
use muster_gossip::{GossipAdaptor, Member, MemberEvent, ServerTags};
use muster_peerset::{PeerAddress, PeerSetAdaptor};
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::config::CoordinatorConfig;
use crate::diagnostics::BootstrapDiagnostics;
use crate::error::{CoordinatorResult, Error};
use crate::events::EventApplier;
use crate::orchestrator::Orchestrator;
use crate::reconciler::Reconciler;
use crate::registry::PeerRegistry;
use crate::state::{BootstrapState, ReconcilerState};

/// Cluster bootstrap and peer reconciliation for one server.
pub struct Coordinator<G, P>
where
    G: GossipAdaptor,
    P: PeerSetAdaptor,
{
    config: CoordinatorConfig,
    local: Member,
    gossip: Arc<G>,
    registry: Arc<PeerRegistry>,
    reconciler: Arc<Reconciler<P>>,
    orchestrator: Orchestrator<G>,
    applier: Mutex<Option<EventApplier>>,
    phase: Mutex<BootPhase>,
    task_tracker: TaskTracker,
    cancellation_token: CancellationToken,
}

impl<G, P> Coordinator<G, P>
where
    G: GossipAdaptor,
    P: PeerSetAdaptor,
{
    /// Create a coordinator.
    ///
    /// The gossip layer's local member must advertise server tags that agree
    /// with `config`, and its consensus address must be the peer set's local
    /// address.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if `config` is invalid or disagrees with
    /// what the adaptors report.
    pub fn new(config: CoordinatorConfig, gossip: G, peer_set: P) -> CoordinatorResult<Self> {
        config.validate()?;

        let local = gossip.local_member();
        let local_tags = ServerTags::parse(&local.tags).map_err(|e| {
            Error::configuration(format!("local member {} has invalid tags: {e}", local.id))
        })?;
        check_local(&config, &local, &local_tags, &peer_set.local_address())?;

        let gossip = Arc::new(gossip);
        let peer_set = Arc::new(peer_set);
        let registry = Arc::new(PeerRegistry::new());
        let (departures_tx, departures_rx) = flume::bounded(config.event_buffer);

        let reconciler = Arc::new(Reconciler::new(
            &config,
            local.clone(),
            local_tags,
            registry.clone(),
            peer_set,
            departures_rx,
        ));
        let orchestrator = Orchestrator::new(gossip.clone(), registry.clone(), config.join_timeout);
        let applier = EventApplier::new(registry.clone(), config.region.clone(), departures_tx);

        Ok(Self {
            config,
            local,
            gossip,
            registry,
            reconciler,
            orchestrator,
            applier: Mutex::new(Some(applier)),
            phase: Mutex::new(BootPhase::Created),
            task_tracker: TaskTracker::new(),
            cancellation_token: CancellationToken::new(),
        })
    }

    /// Contact `addresses` over gossip; returns how many were reached.
    ///
    /// # Errors
    ///
    /// See [`Orchestrator::join`].
    pub async fn join(&self, addresses: &[String]) -> CoordinatorResult<usize> {
        self.orchestrator.join(addresses).await
    }

    /// Leave the cluster gracefully. Idempotent.
    ///
    /// # Errors
    ///
    /// See [`Orchestrator::leave`].
    pub async fn leave(&self) -> CoordinatorResult<()> {
        self.orchestrator.leave().await
    }

    /// Every known member across all regions
    pub async fn members(&self) -> Vec<Member> {
        self.orchestrator.members().await
    }

    /// Number of consensus peers other than this server.
    ///
    /// # Errors
    ///
    /// Returns an error if the consensus configuration cannot be read.
    pub async fn num_other_peers(&self) -> CoordinatorResult<usize> {
        let config = self.reconciler.read_configuration().await?;
        Ok(config.other_peers(self.reconciler.local_address()))
    }

    /// Whether this process has a consensus group
    pub fn bootstrap_state(&self) -> BootstrapState {
        self.reconciler.state().bootstrap_state()
    }

    /// Reconciler phase
    pub fn reconciler_state(&self) -> ReconcilerState {
        self.reconciler.state()
    }

    /// Watch reconciler phase transitions
    pub fn subscribe_state(&self) -> watch::Receiver<ReconcilerState> {
        self.reconciler.subscribe()
    }

    /// Bootstrap progress as last observed
    pub fn diagnostics(&self) -> BootstrapDiagnostics {
        self.reconciler.diagnostics()
    }

    /// Evaluate bootstrap and membership now instead of waiting for a trigger.
    /// A no-op once shutdown has begun.
    pub async fn reconcile_now(&self) {
        self.reconciler.trigger().await;
    }

    /// The peer registry
    pub fn registry(&self) -> &Arc<PeerRegistry> {
        &self.registry
    }

    /// This server's gossip member
    pub fn local_member(&self) -> &Member {
        &self.local
    }

    /// This server's consensus address
    pub fn local_address(&self) -> &PeerAddress {
        self.reconciler.local_address()
    }

    /// Lifecycle phase
    pub fn phase(&self) -> BootPhase {
        *self.phase.lock()
    }

    async fn start_tasks(&self) -> CoordinatorResult<()> {
        // Subscribe before the snapshot so nothing falls between them;
        // replays are harmless
        let events = self.gossip.subscribe();
        let members = self
            .gossip
            .members()
            .await
            .map_err(|e| Error::from_gossip("reading gossip members", e))?;

        self.registry
            .apply(MemberEvent::Joined(self.local.clone()))
            .await;
        for member in members {
            self.registry.apply(MemberEvent::Joined(member)).await;
        }

        let applier = self
            .applier
            .lock()
            .take()
            .ok_or_else(|| Error::invalid_state("event apply loop already started"))?;
        applier.start(events, &self.task_tracker, &self.cancellation_token);
        self.reconciler
            .clone()
            .start_reconciling(&self.task_tracker, &self.cancellation_token);

        info!(
            "Coordinator for {} started with {} known members",
            self.local.id,
            self.registry.len().await
        );
        Ok(())
    }
}

fn check_local(
    config: &CoordinatorConfig,
    local: &Member,
    tags: &ServerTags,
    consensus_addr: &PeerAddress,
) -> CoordinatorResult<()> {
    if local.id.as_str() != config.node_name {
        return Err(Error::configuration(format!(
            "gossip member {} does not match node_name {}",
            local.id, config.node_name
        )));
    }
    if tags.region != config.region || tags.expect != config.bootstrap_expect {
        return Err(Error::configuration(format!(
            "gossip tags (region {}, expect {}) disagree with configuration (region {}, expect {})",
            tags.region, tags.expect, config.region, config.bootstrap_expect
        )));
    }
    if tags.protocol_version != config.protocol_version
        || tags.raft_version != config.raft_protocol_version
    {
        return Err(Error::configuration(
            "gossip tags advertise different protocol versions than configured",
        ));
    }

    let advertised = local
        .rpc_addr()
        .map_err(|e| Error::configuration(format!("local consensus address: {e}")))?;
    if advertised != consensus_addr.as_str() {
        return Err(Error::configuration(format!(
            "gossip advertises consensus address {advertised} but the peer set uses {consensus_addr}"
        )));
    }
    Ok(())
}

#[async_trait]
impl<G, P> Bootable for Coordinator<G, P>
where
    G: GossipAdaptor,
    P: PeerSetAdaptor,
{
    fn bootable_name(&self) -> &str {
        "Coordinator"
    }

    async fn start(&self) -> Result<(), BootableError> {
        {
            let mut phase = self.phase.lock();
            if !phase.can_start() {
                return Err(Box::new(Error::invalid_state(format!(
                    "cannot start coordinator that is {phase}"
                ))));
            }
            *phase = BootPhase::Running;
        }

        if let Err(e) = self.start_tasks().await {
            *self.phase.lock() = BootPhase::Created;
            return Err(Box::new(e));
        }
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), BootableError> {
        {
            let mut phase = self.phase.lock();
            match *phase {
                BootPhase::Created => {
                    *phase = BootPhase::Stopped;
                    self.reconciler.stop();
                    self.task_tracker.close();
                    return Ok(());
                }
                BootPhase::ShuttingDown | BootPhase::Stopped => return Ok(()),
                BootPhase::Running => *phase = BootPhase::ShuttingDown,
            }
        }

        info!("Shutting down coordinator for {}", self.local.id);
        self.reconciler.stop();
        self.cancellation_token.cancel();
        self.task_tracker.close();

        let drained =
            tokio::time::timeout(self.config.shutdown_timeout, self.task_tracker.wait()).await;

        if let Err(e) = self.gossip.shutdown().await {
            warn!("Gossip shutdown failed: {}", e);
        }
        *self.phase.lock() = BootPhase::Stopped;

        match drained {
            Ok(()) => {
                debug!("Coordinator tasks shut down cleanly");
                Ok(())
            }
            Err(_) => {
                warn!(
                    "Coordinator tasks did not stop within {:?}",
                    self.config.shutdown_timeout
                );
                Err(Box::new(Error::shutdown("background tasks did not stop in time")))
            }
        }
    }

    async fn wait(&self) {
        self.task_tracker.wait().await;
    }
}
