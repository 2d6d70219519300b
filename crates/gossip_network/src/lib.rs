//! Gossip Network: authenticated cluster messaging over TCP.
//!
//! A process hosts one or more [`GossipNode`]s. Each node listens on a TCP
//! endpoint, keeps a [`Cluster`] view of the peers it has joined, and
//! delivers every message it receives to its registered observers.
//!
//! # Architecture
//!
//! - **Transport**: one TCP connection per peer pair, opened lazily on the
//!   first send and shared by both directions.
//! - **Framing**: `[type u8][length u32 BE][payload]`, with message types
//!   `0xF0..=0xFF` reserved for the handshake and control frames.
//! - **Authentication**: HMAC-SHA256 challenge/response over a shared cluster
//!   key, performed before any application frame is exchanged.
//! - **Membership**: explicit join/leave of [`ClusterMember`] descriptors;
//!   members are selected for broadcast by predicate (typically by tag).
//!
//! # Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use gossip_network::{ClusterConfig, ClusterMember, GossipMessage, GossipNode, NodeConfig, RawMessage};
//!
//! # async fn example() -> Result<(), gossip_network::NetworkError> {
//! let config = ClusterConfig::new("ClusterKey");
//! let a = GossipNode::new(NodeConfig::new("127.0.0.1:30000".parse().unwrap(), "tag1"), config.clone())?;
//! let b = GossipNode::new(NodeConfig::new("127.0.0.1:30001".parse().unwrap(), "tag2"), config)?;
//!
//! a.cluster().join(ClusterMember::new(a.node_id(), b.node_config().clone(), a.authenticator()))?;
//! b.on_message_received(|_node, _conn, msg| println!("got {} bytes", msg.size()));
//! b.start_listening().await?;
//!
//! let hello = GossipMessage::from(RawMessage::new(1, "Hello World!"));
//! a.cluster().broadcast_message(&hello, |m| m.has_tag("tag2")).await?;
//!
//! a.dispose().await;
//! b.dispose().await;
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod cluster;
pub mod codec;
pub mod config;
pub mod connection;
pub mod dispatch;
pub mod error;
pub mod identity;
pub mod member;
pub mod message;
pub mod node;

// ── Re-exports for convenience ──────────────────────────────────────────

pub use auth::{Authenticator, Role, SessionToken};
pub use cluster::{BroadcastReport, Cluster};
pub use codec::{Frame, FrameCodec};
pub use config::ClusterConfig;
pub use connection::{Connection, ConnectionState};
pub use dispatch::{MessageObserver, ObserverId};
pub use error::{BroadcastError, NetworkError, TargetFailure};
pub use identity::{NodeConfig, NodeId};
pub use member::{ClusterMember, MemberInfo, MemberState};
pub use message::{GossipMessage, RawMessage};
pub use node::GossipNode;
