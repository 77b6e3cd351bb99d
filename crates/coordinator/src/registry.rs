//! Peer registry
//!
//! The registry is the coordinator's local, eventually-consistent view of
//! gossip membership. Only the event apply loop mutates it; everything else
//! reads point-in-time copies. Members of every region and role are kept so
//! callers can route to them, but bootstrap and consensus membership only
//! consider servers of the local region (see [`PeerRegistry::bootstrap_view`]).

use std::collections::BTreeMap;

use muster_gossip::{Member, MemberEvent, MemberId, MemberStatus, Role, ServerTags, TagError};
use muster_peerset::PeerAddress;
use tokio::sync::{RwLock, watch};
use tracing::{debug, warn};

use crate::error::Error;

/// Why a member was removed.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DepartureReason {
    /// The member announced a graceful leave
    Left,
    /// The failure detector declared the member dead
    Failed,
}

/// Outcome of applying one membership event.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RegistryChange {
    /// A new member was recorded
    Inserted(Member),
    /// A known member's record changed
    Updated(Member),
    /// A member was removed
    Removed {
        /// The removed record
        member: Member,
        /// Why it went away
        reason: DepartureReason,
    },
    /// The event matched what was already known
    Unchanged,
}

impl RegistryChange {
    /// Whether the registry was modified
    pub fn is_change(&self) -> bool {
        !matches!(self, Self::Unchanged)
    }
}

/// A server eligible for the consensus configuration.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Candidate {
    /// Member id
    pub id: MemberId,
    /// Consensus address
    pub addr: PeerAddress,
}

/// Classification of the registry against the local server's tags.
#[derive(Clone, Debug, Default)]
pub struct BootstrapView {
    /// Servers that may bootstrap with us, sorted by id
    pub candidates: Vec<Candidate>,
    /// Every local-region server with valid tags, sorted by id
    pub region_servers: Vec<Candidate>,
    /// Local-region servers declaring a different expected count
    pub mismatched_expect: usize,
    /// Those servers grouped by the expected count they declare
    pub other_expects: BTreeMap<u32, usize>,
    /// Local-region servers on a different protocol version
    pub incompatible_version: usize,
    /// Members whose tags do not parse
    pub inconsistent_tags: usize,
    /// Servers of other regions
    pub other_region: usize,
    /// Members that are not servers
    pub non_server: usize,
}

impl BootstrapView {
    /// The first `count` candidates, or `None` while fewer are visible
    pub fn select(&self, count: usize) -> Option<&[Candidate]> {
        if count == 0 || self.candidates.len() < count {
            None
        } else {
            Some(&self.candidates[..count])
        }
    }

    /// Groups declaring a different expected count that have enough visible
    /// servers to bootstrap on their own. While any exists nobody may
    /// bootstrap, so two groups never form from one pool.
    pub fn competing_groups(&self) -> usize {
        self.other_expects
            .iter()
            .filter(|&(&expect, &seen)| expect > 0 && seen >= expect as usize)
            .count()
    }
}

/// Locally-known gossip members.
#[derive(Debug)]
pub struct PeerRegistry {
    members: RwLock<BTreeMap<MemberId, Member>>,
    generation: watch::Sender<u64>,
}

impl Default for PeerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PeerRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        let (generation, _) = watch::channel(0);
        Self {
            members: RwLock::new(BTreeMap::new()),
            generation,
        }
    }

    /// Apply one membership event.
    ///
    /// Joins and updates upsert; leaves and failures remove. Replays and
    /// departures of unknown members are no-ops.
    pub async fn apply(&self, event: MemberEvent) -> RegistryChange {
        let kind = event.kind();
        let change = match event {
            MemberEvent::Joined(member) | MemberEvent::Updated(member) => {
                check_tags(&member);
                let member = member.with_status(MemberStatus::Alive);
                let mut members = self.members.write().await;
                match members.insert(member.id.clone(), member.clone()) {
                    None => RegistryChange::Inserted(member),
                    Some(previous) if previous == member => RegistryChange::Unchanged,
                    Some(_) => RegistryChange::Updated(member),
                }
            }
            MemberEvent::Left(member) => self.remove(&member.id, DepartureReason::Left).await,
            MemberEvent::Failed(member) => self.remove(&member.id, DepartureReason::Failed).await,
        };

        if change.is_change() {
            self.generation.send_modify(|generation| *generation += 1);
        } else {
            debug!("Ignoring {} event that changes nothing", kind);
        }
        change
    }

    async fn remove(&self, id: &MemberId, reason: DepartureReason) -> RegistryChange {
        let mut members = self.members.write().await;
        match members.remove(id) {
            Some(member) => {
                let status = match reason {
                    DepartureReason::Left => MemberStatus::Left,
                    DepartureReason::Failed => MemberStatus::Failed,
                };
                RegistryChange::Removed {
                    member: member.with_status(status),
                    reason,
                }
            }
            None => RegistryChange::Unchanged,
        }
    }

    /// Count members of `region`, optionally restricted to one role.
    ///
    /// Members whose tags cannot be read are not counted.
    pub async fn eligible_count(&self, region: &str, role: Option<Role>) -> usize {
        let members = self.members.read().await;
        members
            .values()
            .filter(|m| m.tag(muster_gossip::tags::REGION) == Some(region))
            .filter(|m| match role {
                Some(role) => m.role().is_ok_and(|r| r == role),
                None => true,
            })
            .count()
    }

    /// Copy of every known member
    pub async fn snapshot(&self) -> Vec<Member> {
        self.members.read().await.values().cloned().collect()
    }

    /// Look up one member
    pub async fn get(&self, id: &MemberId) -> Option<Member> {
        self.members.read().await.get(id).cloned()
    }

    /// Number of known members
    pub async fn len(&self) -> usize {
        self.members.read().await.len()
    }

    /// Whether no members are known
    pub async fn is_empty(&self) -> bool {
        self.members.read().await.is_empty()
    }

    /// Subscribe to a counter bumped on every change
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.generation.subscribe()
    }

    /// Classify known members against the local server.
    ///
    /// The local member is always considered, whether or not gossip has
    /// delivered it to the registry yet.
    pub async fn bootstrap_view(&self, local: &Member, local_tags: &ServerTags) -> BootstrapView {
        let members = self.members.read().await;
        let mut view = BootstrapView::default();

        let others = members.values().filter(|m| m.id != local.id);
        for member in std::iter::once(local).chain(others) {
            match classify(member, local_tags) {
                Eligibility::Candidate(candidate) => {
                    view.region_servers.push(candidate.clone());
                    view.candidates.push(candidate);
                }
                Eligibility::MismatchedExpect(candidate, expect) => {
                    view.region_servers.push(candidate);
                    view.mismatched_expect += 1;
                    *view.other_expects.entry(expect).or_default() += 1;
                }
                Eligibility::IncompatibleVersion(candidate) => {
                    view.region_servers.push(candidate);
                    view.incompatible_version += 1;
                }
                Eligibility::Inconsistent(err) => {
                    debug!("Excluding {} from bootstrap: {}", member.id, err);
                    view.inconsistent_tags += 1;
                }
                Eligibility::OtherRegion => view.other_region += 1,
                Eligibility::NotServer => view.non_server += 1,
            }
        }

        view.candidates.sort_by(|a, b| a.id.cmp(&b.id));
        view.region_servers.sort_by(|a, b| a.id.cmp(&b.id));
        view
    }
}

fn check_tags(member: &Member) {
    let result = match member.role() {
        Ok(Role::Server) => member.server_tags().map(|_| ()),
        Ok(Role::Client) => Ok(()),
        Err(err) => Err(err),
    };
    if let Err(err) = result {
        warn!("{}", Error::registry_inconsistency(&member.id, err));
    }
}

enum Eligibility {
    Candidate(Candidate),
    MismatchedExpect(Candidate, u32),
    IncompatibleVersion(Candidate),
    Inconsistent(TagError),
    OtherRegion,
    NotServer,
}

fn classify(member: &Member, local: &ServerTags) -> Eligibility {
    match member.role() {
        Ok(Role::Server) => {}
        Ok(Role::Client) => return Eligibility::NotServer,
        Err(err) => return Eligibility::Inconsistent(err),
    }

    let tags = match member.server_tags() {
        Ok(tags) => tags,
        Err(err) => return Eligibility::Inconsistent(err),
    };
    if tags.region != local.region {
        return Eligibility::OtherRegion;
    }

    let addr = match PeerAddress::parse(format!("{}:{}", member.host(), tags.port)) {
        Ok(addr) => addr,
        Err(_) => {
            return Eligibility::Inconsistent(TagError::Invalid {
                key: muster_gossip::tags::PORT,
                value: tags.port.to_string(),
            });
        }
    };
    let candidate = Candidate {
        id: member.id.clone(),
        addr,
    };

    if tags.expect != local.expect {
        Eligibility::MismatchedExpect(candidate, tags.expect)
    } else if tags.protocol_version != local.protocol_version
        || tags.raft_version != local.raft_version
    {
        Eligibility::IncompatibleVersion(candidate)
    } else {
        Eligibility::Candidate(candidate)
    }
}
