//! Node identity: unique node identification and the local node descriptor.

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::NetworkError;

/// Length in bytes of a [`NodeId`].
pub const NODE_ID_LEN: usize = 16;

/// A unique identifier for a node, stable for the lifetime of its
/// [`NodeConfig`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId([u8; NODE_ID_LEN]);

impl NodeId {
    /// Generate a new random node ID (UUID v4 bytes).
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().into_bytes())
    }

    /// Create a NodeId from raw bytes.
    pub fn from_bytes(bytes: [u8; NODE_ID_LEN]) -> Self {
        Self(bytes)
    }

    /// Return the raw bytes.
    pub fn as_bytes(&self) -> &[u8; NODE_ID_LEN] {
        &self.0
    }

    /// Lowercase hex rendering, used in logs and on the wire.
    pub fn to_hex_lower(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex_lower())
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.to_hex_lower())
    }
}

impl FromStr for NodeId {
    type Err = NetworkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; NODE_ID_LEN];
        hex::decode_to_slice(s, &mut bytes)
            .map_err(|e| NetworkError::Protocol(format!("Invalid node id '{s}': {e}")))?;
        Ok(Self(bytes))
    }
}

impl Serialize for NodeId {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.to_hex_lower())
    }
}

impl<'de> Deserialize<'de> for NodeId {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Immutable description of a node: where it listens, how it is tagged,
/// and who it is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Unique node identifier, generated at construction.
    node_id: NodeId,
    /// Address the node listens on for inbound connections.
    listen_addr: SocketAddr,
    /// Free-form labels used by broadcast predicates.
    tags: Vec<String>,
}

impl NodeConfig {
    /// Create a config with a fresh node identifier and a single tag.
    pub fn new(listen_addr: SocketAddr, tag: impl Into<String>) -> Self {
        Self {
            node_id: NodeId::generate(),
            listen_addr,
            tags: vec![tag.into()],
        }
    }

    /// Create a config carrying several tags.
    pub fn with_tags<I, T>(listen_addr: SocketAddr, tags: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        Self {
            node_id: NodeId::generate(),
            listen_addr,
            tags: tags.into_iter().map(Into::into).collect(),
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn listen_addr(&self) -> SocketAddr {
        self.listen_addr
    }

    pub fn tags(&self) -> &[String] {
        &self.tags
    }

    /// The first tag, if any.
    pub fn tag(&self) -> Option<&str> {
        self.tags.first().map(String::as_str)
    }

    /// Whether the node carries the given tag.
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }

    /// Check the config is usable.
    pub fn validate(&self) -> Result<(), NetworkError> {
        if self.tags.iter().any(|t| t.is_empty()) {
            return Err(NetworkError::Config("Tags must not be empty".to_string()));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
