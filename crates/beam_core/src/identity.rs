//! Node identity: `name@host` identifiers and their reachable address.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::BeamError;

/// A parsed `name@host` node identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeName {
    pub name: String,
    pub host: String,
}

impl NodeName {
    /// Parse a full node identifier. Both halves must be non-empty.
    pub fn parse(full: &str) -> Result<Self, BeamError> {
        match full.split_once('@') {
            Some((name, host)) if !name.is_empty() && !host.is_empty() => Ok(Self {
                name: name.to_string(),
                host: host.to_string(),
            }),
            _ => Err(BeamError::InvalidNodeName(full.to_string())),
        }
    }

    pub fn full_name(&self) -> String {
        format!("{}@{}", self.name, self.host)
    }
}

impl fmt::Display for NodeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.host)
    }
}

/// Split a possibly partial identifier into its name and optional host.
///
/// Unlike [`NodeName::parse`] this accepts a bare `name`, which is how
/// callers address peers they already know.
pub fn split_node_name(node: &str) -> (&str, Option<&str>) {
    match node.split_once('@') {
        Some((name, host)) => (name, Some(host)),
        None => (node, None),
    }
}

/// A node as seen on the network: its name plus where it listens.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeIdentity {
    pub name: String,
    pub host: String,
    pub port: u16,
}

impl NodeIdentity {
    pub fn new(name: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            port,
        }
    }

    /// `name@host`
    pub fn full_name(&self) -> String {
        format!("{}@{}", self.name, self.host)
    }

    /// `host:port`, suitable for dialing.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for NodeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.name, self.host, self.port)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
