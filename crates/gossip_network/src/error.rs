//! Network error types.

use std::fmt;

use crate::identity::NodeId;

/// Errors that can occur in the gossip_network crate.
#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    /// A transport-level error (connect, bind, read or write).
    #[error("Transport error: {0}")]
    Transport(String),

    /// The handshake with a peer was rejected or did not complete.
    #[error("Authentication error: {0}")]
    Authentication(String),

    /// A peer sent a malformed or unexpected frame.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Join/Leave was called with an identifier the table cannot accept.
    #[error("Membership error: {0}")]
    Membership(String),

    /// One or more targets of a broadcast failed.
    #[error(transparent)]
    Broadcast(#[from] BroadcastError),

    /// The connection was closed before the operation completed.
    #[error("Connection to {0} closed")]
    ConnectionClosed(NodeId),

    /// The node has been disposed.
    #[error("Node not running")]
    NotRunning,

    /// Invalid configuration.
    #[error("Config error: {0}")]
    Config(String),

    /// JSON serialization / deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A single target that failed during a broadcast.
#[derive(Debug)]
pub struct TargetFailure {
    /// The member the message was addressed to.
    pub node_id: NodeId,
    /// Why the send to that member failed.
    pub error: NetworkError,
}

/// Aggregate failure of a broadcast: `failures.len()` of `attempted` targets
/// did not receive the message.
#[derive(Debug, thiserror::Error)]
pub struct BroadcastError {
    /// Number of targets the broadcast was issued to.
    pub attempted: usize,
    /// Every target that failed, with its cause.
    pub failures: Vec<TargetFailure>,
}

impl BroadcastError {
    /// Whether the broadcast failed for the given member.
    pub fn failed_for(&self, node_id: &NodeId) -> bool {
        self.failures.iter().any(|f| &f.node_id == node_id)
    }

    /// The error a given member's send failed with, if it failed.
    pub fn error_for(&self, node_id: &NodeId) -> Option<&NetworkError> {
        self.failures
            .iter()
            .find(|f| &f.node_id == node_id)
            .map(|f| &f.error)
    }

    /// Number of targets that succeeded.
    pub fn delivered(&self) -> usize {
        self.attempted - self.failures.len()
    }
}

impl fmt::Display for BroadcastError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Broadcast failed for {} of {} targets",
            self.failures.len(),
            self.attempted
        )?;
        for failure in &self.failures {
            write!(f, "; {}: {}", failure.node_id, failure.error)?;
        }
        Ok(())
    }
}
