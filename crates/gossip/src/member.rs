//! Member identity and status

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::tags::{self, Role, ServerTags, TagError};

/// Stable identity of a gossip member (its node name).
///
/// Ordering is lexicographic on the name; bootstrap relies on it to pick the
/// same servers on every node.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MemberId(String);

impl MemberId {
    /// Create a member id from a node name.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// The node name.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MemberId {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for MemberId {
    fn from(name: String) -> Self {
        Self(name)
    }
}

/// Liveness of a member as seen by the local failure detector.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub enum MemberStatus {
    /// Reachable and participating.
    #[default]
    Alive,

    /// Announced an intent to leave; not yet gone.
    Leaving,

    /// Left gracefully.
    Left,

    /// Declared dead by the failure detector.
    Failed,
}

/// One node visible through gossip.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Member {
    /// Node name.
    pub id: MemberId,

    /// Gossip address, `host:port`.
    pub addr: String,

    /// Liveness.
    pub status: MemberStatus,

    /// Raw metadata tags.
    pub tags: BTreeMap<String, String>,
}

impl Member {
    /// Create a live member.
    pub fn new(
        id: impl Into<MemberId>,
        addr: impl Into<String>,
        tags: BTreeMap<String, String>,
    ) -> Self {
        Self {
            id: id.into(),
            addr: addr.into(),
            status: MemberStatus::Alive,
            tags,
        }
    }

    /// Return a copy with a different status.
    #[must_use]
    pub fn with_status(mut self, status: MemberStatus) -> Self {
        self.status = status;
        self
    }

    /// Look up a raw tag.
    #[must_use]
    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(String::as_str)
    }

    /// Host part of the gossip address (everything before the last `:`).
    #[must_use]
    pub fn host(&self) -> &str {
        self.addr
            .rsplit_once(':')
            .map_or(self.addr.as_str(), |(host, _)| host)
    }

    /// The role this member advertises.
    ///
    /// # Errors
    ///
    /// Returns an error if the `role` tag is missing or unknown.
    pub fn role(&self) -> Result<Role, TagError> {
        let raw = self.tag(tags::ROLE).ok_or(TagError::Missing(tags::ROLE))?;
        raw.parse()
    }

    /// Whether the member advertises the server role.
    #[must_use]
    pub fn is_server(&self) -> bool {
        matches!(self.role(), Ok(Role::Server))
    }

    /// Parse the full server tag set.
    ///
    /// # Errors
    ///
    /// Returns an error if the member is not a server or a required tag is
    /// missing or malformed.
    pub fn server_tags(&self) -> Result<ServerTags, TagError> {
        ServerTags::parse(&self.tags)
    }

    /// Consensus RPC address: the gossip host combined with the `port` tag.
    ///
    /// # Errors
    ///
    /// Returns an error if the server tags cannot be parsed.
    pub fn rpc_addr(&self) -> Result<String, TagError> {
        let tags = self.server_tags()?;
        Ok(format!("{}:{}", self.host(), tags.port))
    }
}

impl fmt::Display for Member {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}, {:?})", self.id, self.addr, self.status)
    }
}
