//! The tag schema servers advertise over gossip
//!
//! Tags are untyped string pairs on the wire. They are parsed into
//! [`ServerTags`] at the registry boundary; anything missing or malformed is a
//! [`TagError`], never a panic.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Node role.
pub const ROLE: &str = "role";
/// Region name.
pub const REGION: &str = "region";
/// Datacenter name.
pub const DATACENTER: &str = "dc";
/// Declared expected cluster size.
pub const EXPECT: &str = "expect";
/// Protocol version.
pub const VERSION: &str = "vsn";
/// Consensus protocol version.
pub const RAFT_VERSION: &str = "raft_vsn";
/// Consensus RPC port.
pub const PORT: &str = "port";
/// Build version.
pub const BUILD: &str = "build";

/// Consensus protocol version assumed when `raft_vsn` is absent.
pub const DEFAULT_RAFT_VERSION: u32 = 1;

/// Errors parsing member tags
#[derive(Clone, Debug, Eq, Error, PartialEq)]
pub enum TagError {
    /// A required tag is absent
    #[error("missing tag '{0}'")]
    Missing(&'static str),

    /// A tag has a value that does not parse
    #[error("invalid value '{value}' for tag '{key}'")]
    Invalid {
        /// Tag key
        key: &'static str,
        /// Offending value
        value: String,
    },

    /// The role tag names a role this crate does not know
    #[error("unknown role '{0}'")]
    UnknownRole(String),

    /// The member is not a server
    #[error("member role is '{0}', not server")]
    NotServer(Role),
}

/// Role a member advertises.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Participates in consensus.
    Server,
    /// Runs workloads only.
    Client,
}

impl Role {
    /// Wire representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Server => "server",
            Self::Client => "client",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = TagError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "server" => Ok(Self::Server),
            "client" => Ok(Self::Client),
            other => Err(TagError::UnknownRole(other.to_string())),
        }
    }
}

/// Parsed tags of a server member.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ServerTags {
    /// Region the server belongs to.
    pub region: String,

    /// Datacenter, informational.
    pub datacenter: Option<String>,

    /// Expected cluster size the server was started with (0 disables
    /// bootstrap).
    pub expect: u32,

    /// Protocol version.
    pub protocol_version: u32,

    /// Consensus protocol version.
    pub raft_version: u32,

    /// Consensus RPC port.
    pub port: u16,

    /// Build version, informational.
    pub build: Option<String>,
}

impl ServerTags {
    /// Tags with protocol version 1 and no optional fields.
    pub fn new(region: impl Into<String>, expect: u32, port: u16) -> Self {
        Self {
            region: region.into(),
            datacenter: None,
            expect,
            protocol_version: 1,
            raft_version: DEFAULT_RAFT_VERSION,
            port,
            build: None,
        }
    }

    /// Parse a raw tag map.
    ///
    /// # Errors
    ///
    /// Returns an error if the role is not `server` or a required tag is
    /// missing or malformed.
    pub fn parse(tags: &BTreeMap<String, String>) -> Result<Self, TagError> {
        let role: Role = required(tags, ROLE)?.parse()?;
        if role != Role::Server {
            return Err(TagError::NotServer(role));
        }

        let region = required(tags, REGION)?;
        if region.is_empty() {
            return Err(TagError::Invalid {
                key: REGION,
                value: String::new(),
            });
        }

        Ok(Self {
            region: region.to_string(),
            datacenter: tags.get(DATACENTER).cloned(),
            expect: parse_number(tags, EXPECT)?,
            protocol_version: parse_number(tags, VERSION)?,
            raft_version: match tags.get(RAFT_VERSION) {
                Some(_) => parse_number(tags, RAFT_VERSION)?,
                None => DEFAULT_RAFT_VERSION,
            },
            port: parse_number(tags, PORT)?,
            build: tags.get(BUILD).cloned(),
        })
    }

    /// Render as a raw tag map.
    #[must_use]
    pub fn to_tags(&self) -> BTreeMap<String, String> {
        let mut tags = BTreeMap::new();
        tags.insert(ROLE.to_string(), Role::Server.to_string());
        tags.insert(REGION.to_string(), self.region.clone());
        tags.insert(EXPECT.to_string(), self.expect.to_string());
        tags.insert(VERSION.to_string(), self.protocol_version.to_string());
        tags.insert(RAFT_VERSION.to_string(), self.raft_version.to_string());
        tags.insert(PORT.to_string(), self.port.to_string());
        if let Some(dc) = &self.datacenter {
            tags.insert(DATACENTER.to_string(), dc.clone());
        }
        if let Some(build) = &self.build {
            tags.insert(BUILD.to_string(), build.clone());
        }
        tags
    }
}

/// Raw tags for a client (non-server) member.
#[must_use]
pub fn client_tags(region: &str) -> BTreeMap<String, String> {
    let mut tags = BTreeMap::new();
    tags.insert(ROLE.to_string(), Role::Client.to_string());
    tags.insert(REGION.to_string(), region.to_string());
    tags
}

fn required<'a>(
    tags: &'a BTreeMap<String, String>,
    key: &'static str,
) -> Result<&'a str, TagError> {
    tags.get(key).map(String::as_str).ok_or(TagError::Missing(key))
}

fn parse_number<T: FromStr>(
    tags: &BTreeMap<String, String>,
    key: &'static str,
) -> Result<T, TagError> {
    let raw = required(tags, key)?;
    raw.parse().map_err(|_| TagError::Invalid {
        key,
        value: raw.to_string(),
    })
}
