//! Consensus peer addresses

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors parsing a peer address
#[derive(Clone, Debug, Eq, Error, PartialEq)]
pub enum AddressError {
    /// No `:` separating host and port
    #[error("address '{0}' is missing a port")]
    MissingPort(String),

    /// Empty host part
    #[error("address '{0}' has an empty host")]
    EmptyHost(String),

    /// Port is not a number in range
    #[error("address '{0}' has an invalid port")]
    InvalidPort(String),
}

/// A consensus address, `host:port`.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PeerAddress(String);

impl PeerAddress {
    /// Validate and wrap an address.
    ///
    /// # Errors
    ///
    /// Returns an error unless the input is `host:port` with a non-empty host
    /// and a port in `1..=65535`.
    pub fn parse(raw: impl Into<String>) -> Result<Self, AddressError> {
        let raw = raw.into();
        let Some((host, port)) = raw.rsplit_once(':') else {
            return Err(AddressError::MissingPort(raw));
        };
        if host.is_empty() {
            return Err(AddressError::EmptyHost(raw));
        }
        match port.parse::<u16>() {
            Ok(p) if p > 0 => {}
            _ => return Err(AddressError::InvalidPort(raw)),
        }
        Ok(Self(raw))
    }

    /// The address as a string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Host part.
    #[must_use]
    pub fn host(&self) -> &str {
        self.0.rsplit_once(':').map_or("", |(host, _)| host)
    }

    /// Port part.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.0
            .rsplit_once(':')
            .and_then(|(_, port)| port.parse().ok())
            .unwrap_or_default()
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for PeerAddress {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for PeerAddress {
    type Error = AddressError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<PeerAddress> for String {
    fn from(addr: PeerAddress) -> Self {
        addr.0
    }
}
