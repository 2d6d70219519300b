//! Cluster membership and broadcast fan-out.
//!
//! The member table is the one piece of state touched from many tasks at
//! once: explicit [`Cluster::join`]/[`Cluster::leave`] calls, the listener
//! adding members it accepted, and broadcasts reading it. It sits behind a
//! lock that is never held across an await; broadcasts copy out the target
//! identifiers and resolve each one independently afterwards.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::future::join_all;
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::auth::Authenticator;
use crate::config::ClusterConfig;
use crate::connection::{Connection, InboundHandler};
use crate::error::{BroadcastError, NetworkError, TargetFailure};
use crate::identity::{NodeConfig, NodeId};
use crate::member::{ClusterMember, Installed, MemberInfo, MemberRegistry, MemberState};
use crate::message::GossipMessage;

/// Most times a send moves to a fresh connection after the one it picked
/// started retiring.
const MAX_SEND_ATTEMPTS: usize = 4;

/// Summary of a broadcast in which every target succeeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BroadcastReport {
    /// Number of members the predicate selected.
    pub attempted: usize,
    /// Number of members whose send completed.
    pub delivered: usize,
    /// Payload bytes flushed across all targets.
    pub bytes: u64,
}

/// The set of peers a node talks to.
pub struct Cluster {
    local: NodeConfig,
    config: ClusterConfig,
    registry: RwLock<MemberRegistry>,
    handler: Arc<dyn InboundHandler>,
    running: AtomicBool,
}

impl Cluster {
    pub(crate) fn new(
        local: NodeConfig,
        config: ClusterConfig,
        handler: Arc<dyn InboundHandler>,
    ) -> Self {
        Self {
            registry: RwLock::new(MemberRegistry::new(local.node_id())),
            local,
            config,
            handler,
            running: AtomicBool::new(true),
        }
    }

    /// The local node this cluster view belongs to.
    pub fn local(&self) -> &NodeConfig {
        &self.local
    }

    // -----------------------------------------------------------------------
    // Membership
    // -----------------------------------------------------------------------

    /// Add a member to the table.
    ///
    /// Joining an identifier that is already present replaces the entry and
    /// closes its connection. The connection itself is opened lazily, the
    /// first time a message is sent to the member.
    pub fn join(&self, member: ClusterMember) -> Result<(), NetworkError> {
        self.ensure_running()?;

        let local_id = self.local.node_id();
        if member.owner_id() != local_id {
            return Err(NetworkError::Membership(format!(
                "Member descriptor belongs to node {}, not {local_id}",
                member.owner_id()
            )));
        }
        if member.node_id() == local_id {
            return Err(NetworkError::Membership(
                "A node cannot join itself".to_string(),
            ));
        }

        let node_id = member.node_id();
        let addr = member.config().listen_addr();
        let replaced = self.registry.write().insert(member);
        if let Some(old) = replaced {
            debug!("Rejoin of {node_id} replaces its previous connection");
            old.close();
        }

        info!("Member {node_id} ({addr}) joined");
        Ok(())
    }

    /// Remove a member and close its connection. Sends already queued on
    /// that connection fail.
    pub fn leave(&self, node_id: &NodeId) -> Result<ClusterMember, NetworkError> {
        let entry = self
            .registry
            .write()
            .remove(node_id)
            .ok_or_else(|| unknown_member(node_id))?;

        if let Some(connection) = entry.connection {
            connection.close();
        }
        info!("Member {node_id} left");
        Ok(entry.member)
    }

    /// Snapshot of every member.
    pub fn members(&self) -> Vec<MemberInfo> {
        self.registry.read().infos()
    }

    /// Snapshot of one member.
    pub fn member(&self, node_id: &NodeId) -> Option<MemberInfo> {
        self.registry
            .read()
            .infos()
            .into_iter()
            .find(|info| &info.member.node_id() == node_id)
    }

    pub fn contains(&self, node_id: &NodeId) -> bool {
        self.registry.read().contains(node_id)
    }

    pub fn len(&self) -> usize {
        self.registry.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The member's open connection, if one is established.
    pub fn connection(&self, node_id: &NodeId) -> Option<Connection> {
        self.registry
            .read()
            .get(node_id)
            .and_then(|entry| entry.open_connection().cloned())
    }

    // -----------------------------------------------------------------------
    // Messaging
    // -----------------------------------------------------------------------

    /// Send `message` to every member matching `predicate`, concurrently.
    ///
    /// Resolves once every per-member send has resolved. Succeeds only if all
    /// of them did; otherwise the error lists each member that failed and
    /// why. An empty selection succeeds immediately. Members without a
    /// connection are dialed first, so a broadcast issued right after
    /// [`join`](Self::join) waits for the handshake instead of failing.
    ///
    /// The predicate sees static member attributes and must not call back
    /// into the cluster.
    pub async fn broadcast_message<P>(
        &self,
        message: &GossipMessage,
        predicate: P,
    ) -> Result<BroadcastReport, NetworkError>
    where
        P: Fn(&ClusterMember) -> bool + Send,
    {
        self.ensure_running()?;
        message.to_frame()?;

        let targets = self.registry.read().select(predicate);
        if targets.is_empty() {
            debug!("Broadcast of type {} matched no members", message.message_type());
            return Ok(BroadcastReport::default());
        }

        let attempted = targets.len();
        let sends = targets.into_iter().map(|node_id| async move {
            (node_id, self.send_to(&node_id, message).await)
        });

        let failures: Vec<TargetFailure> = join_all(sends)
            .await
            .into_iter()
            .filter_map(|(node_id, result)| {
                result.err().map(|error| TargetFailure { node_id, error })
            })
            .collect();

        if failures.is_empty() {
            let delivered = attempted;
            return Ok(BroadcastReport {
                attempted,
                delivered,
                bytes: (message.size() * delivered) as u64,
            });
        }

        let error = BroadcastError {
            attempted,
            failures,
        };
        warn!("{error}");
        Err(error.into())
    }

    /// Send `message` to every member.
    pub async fn broadcast_all(&self, message: &GossipMessage) -> Result<BroadcastReport, NetworkError> {
        self.broadcast_message(message, |_| true).await
    }

    /// Send `message` to a single member, connecting first if needed.
    ///
    /// A connection that retires before taking the frame is not an error;
    /// the send moves to the member's next connection.
    pub async fn send_to(&self, node_id: &NodeId, message: &GossipMessage) -> Result<(), NetworkError> {
        let mut attempt = 1;
        loop {
            let connection = self.connect(node_id).await?;
            match connection.send(message).await {
                Err(NetworkError::ConnectionClosed(_))
                    if connection.is_retiring() && attempt < MAX_SEND_ATTEMPTS =>
                {
                    debug!(
                        "Connection {} to {node_id} retired before sending, redialing",
                        connection.id()
                    );
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    /// Return the member's connection, dialing and authenticating one if
    /// none is open.
    ///
    /// A member that fails the handshake is removed from the table.
    pub async fn connect(&self, node_id: &NodeId) -> Result<Connection, NetworkError> {
        self.ensure_running()?;

        let (member, dial_lock) = {
            let registry = self.registry.read();
            let entry = registry.get(node_id).ok_or_else(|| unknown_member(node_id))?;
            if let Some(connection) = entry.open_connection() {
                return Ok(connection.clone());
            }
            (entry.member.clone(), Arc::clone(&entry.dial_lock))
        };

        let _dialing = dial_lock.lock().await;

        // Someone may have connected while we waited for the lock.
        if let Some(connection) = self.connection(node_id) {
            return Ok(connection);
        }
        if !self.contains(node_id) {
            return Err(unknown_member(node_id));
        }

        self.registry.write().update_state(node_id, MemberState::Connecting);
        debug!("Connecting to member {node_id} at {}", member.config().listen_addr());

        let opened = Connection::open(
            member.config(),
            &self.local,
            member.authenticator(),
            &self.config,
            Arc::clone(&self.handler),
        )
        .await;

        match opened {
            Ok(connection) => self.install(connection),
            Err(e) => {
                let mut registry = self.registry.write();
                if matches!(e, NetworkError::Authentication(_)) && registry.remove_unconnected(&member) {
                    warn!("Member {node_id} removed after failing authentication: {e}");
                } else {
                    registry.update_state(node_id, MemberState::Disconnected);
                }
                Err(e)
            }
        }
    }

    // -----------------------------------------------------------------------
    // Connection bookkeeping
    // -----------------------------------------------------------------------

    /// Attach a connection to its member entry, settling duplicates.
    fn install(&self, connection: Connection) -> Result<Connection, NetworkError> {
        if !self.running.load(Ordering::Acquire) {
            connection.close();
            return Err(NetworkError::NotRunning);
        }

        let outcome = self.registry.write().install(connection.clone());
        match outcome {
            Some(Installed::Current(replaced)) => {
                if let Some(old) = replaced.filter(|old| old.id() != connection.id()) {
                    old.retire();
                }
                Ok(connection)
            }
            Some(Installed::Kept(existing)) => {
                debug!(
                    "Keeping connection {} to {}, retiring duplicate {}",
                    existing.id(),
                    existing.peer_id(),
                    connection.id()
                );
                connection.retire();
                Ok(existing)
            }
            None => {
                let node_id = connection.peer_id();
                connection.close();
                Err(NetworkError::Membership(format!(
                    "Member {node_id} left while connecting"
                )))
            }
        }
    }

    /// Register a connection the listener authenticated.
    pub(crate) fn accept_connection(&self, connection: Connection, authenticator: &Arc<Authenticator>) {
        let peer = connection.peer().clone();
        let node_id = peer.node_id();

        {
            let mut registry = self.registry.write();
            if !registry.contains(&node_id) {
                info!("Member {node_id} ({}) joined via inbound connection", peer.listen_addr());
                registry.insert(ClusterMember::new(
                    self.local.node_id(),
                    peer,
                    Arc::clone(authenticator),
                ));
            }
        }

        if let Err(e) = self.install(connection) {
            debug!("Dropped inbound connection from {node_id}: {e}");
        }
    }

    /// Record activity from a member.
    pub(crate) fn touch(&self, node_id: &NodeId) {
        self.registry.write().update_last_seen(node_id);
    }

    /// A connection closed. If it was the member's current connection and
    /// either side retired it, the member stays and is redialed on the next
    /// send. Any other loss of the current connection drops the member.
    pub(crate) fn connection_closed(&self, connection: &Connection) {
        let node_id = connection.peer_id();
        let mut registry = self.registry.write();
        let is_current = registry
            .get(&node_id)
            .and_then(|entry| entry.connection.as_ref())
            .is_some_and(|current| current.id() == connection.id());

        if is_current && connection.is_retiring() {
            registry.release(connection);
            debug!("Connection {} to member {node_id} retired", connection.id());
        } else if is_current {
            registry.remove(&node_id);
            warn!("Member {node_id} removed after its connection closed");
        } else if let Some(entry) = registry.get_mut(&node_id) {
            if entry.open_connection().is_none() && entry.state == MemberState::Connected {
                entry.state = MemberState::Disconnected;
            }
        }
    }

    /// Close every connection and refuse further work.
    pub(crate) fn shutdown(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        let entries = self.registry.write().drain();
        for entry in entries {
            if let Some(connection) = entry.connection {
                connection.close();
            }
        }
    }

    fn ensure_running(&self) -> Result<(), NetworkError> {
        if self.running.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(NetworkError::NotRunning)
        }
    }
}

fn unknown_member(node_id: &NodeId) -> NetworkError {
    NetworkError::Membership(format!("Unknown member {node_id}"))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::RawMessage;

    struct Ignore;

    impl InboundHandler for Ignore {
        fn on_message(&self, _connection: &Connection, _message: GossipMessage) {}
        fn on_closed(&self, _connection: &Connection) {}
    }

    fn cluster() -> Cluster {
        Cluster::new(
            NodeConfig::new("127.0.0.1:30000".parse().unwrap(), "tag1"),
            ClusterConfig::new("ClusterKey"),
            Arc::new(Ignore),
        )
    }

    fn member_of(cluster: &Cluster, tag: &str) -> ClusterMember {
        ClusterMember::new(
            cluster.local().node_id(),
            NodeConfig::new("127.0.0.1:1".parse().unwrap(), tag),
            Arc::new(Authenticator::new(&ClusterConfig::new("ClusterKey"))),
        )
    }

    /// A peer listening with `key` that authenticates one inbound connection.
    async fn accepting_peer(key: &str) -> (NodeConfig, tokio::task::JoinHandle<Result<Connection, NetworkError>>) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let peer = NodeConfig::new(listener.local_addr().unwrap(), "tag2");
        let config = ClusterConfig::new(key);
        let local = peer.clone();
        let accept = tokio::spawn(async move {
            let (stream, _) = listener.accept().await?;
            Connection::accept(stream, &local, &Authenticator::new(&config), &config, Arc::new(Ignore)).await
        });
        (peer, accept)
    }

    fn member_at(cluster: &Cluster, peer: &NodeConfig) -> ClusterMember {
        ClusterMember::new(
            cluster.local().node_id(),
            peer.clone(),
            Arc::new(Authenticator::new(&ClusterConfig::new("ClusterKey"))),
        )
    }

    #[test]
    fn test_join_and_leave() {
        let cluster = cluster();
        let member = member_of(&cluster, "tag2");
        let id = member.node_id();

        cluster.join(member).unwrap();
        assert!(cluster.contains(&id));
        assert_eq!(cluster.member(&id).unwrap().state, MemberState::Joined);

        let left = cluster.leave(&id).unwrap();
        assert_eq!(left.node_id(), id);
        assert!(cluster.is_empty());
    }

    #[test]
    fn test_rejoin_is_idempotent() {
        let cluster = cluster();
        let member = member_of(&cluster, "tag2");
        cluster.join(member.clone()).unwrap();
        cluster.join(member).unwrap();
        assert_eq!(cluster.len(), 1);
    }

    #[test]
    fn test_leave_unknown_is_membership_error() {
        let cluster = cluster();
        assert!(matches!(
            cluster.leave(&NodeId::generate()),
            Err(NetworkError::Membership(_))
        ));
    }

    #[test]
    fn test_join_self_rejected() {
        let cluster = cluster();
        let me = ClusterMember::new(
            cluster.local().node_id(),
            cluster.local().clone(),
            Arc::new(Authenticator::new(&ClusterConfig::new("ClusterKey"))),
        );
        assert!(matches!(cluster.join(me), Err(NetworkError::Membership(_))));
    }

    #[test]
    fn test_join_foreign_descriptor_rejected() {
        let cluster = cluster();
        let foreign = ClusterMember::new(
            NodeId::generate(),
            NodeConfig::new("127.0.0.1:1".parse().unwrap(), "tag2"),
            Arc::new(Authenticator::new(&ClusterConfig::new("ClusterKey"))),
        );
        assert!(matches!(cluster.join(foreign), Err(NetworkError::Membership(_))));
    }

    #[tokio::test]
    async fn test_broadcast_empty_selection_completes_immediately() {
        let cluster = cluster();
        cluster.join(member_of(&cluster, "tag2")).unwrap();

        let msg = GossipMessage::from(RawMessage::new(1, b"nobody".to_vec()));
        let report = cluster.broadcast_message(&msg, |_| false).await.unwrap();
        assert_eq!(report, BroadcastReport::default());
        // No dial was attempted.
        assert!(cluster.members().iter().all(|m| m.state == MemberState::Joined));
    }

    #[tokio::test]
    async fn test_broadcast_to_unreachable_member_reports_failure() {
        let cluster = cluster();
        let member = member_of(&cluster, "tag2");
        let id = member.node_id();
        cluster.join(member).unwrap();

        let msg = GossipMessage::from(RawMessage::new(1, b"hello".to_vec()));
        match cluster.broadcast_all(&msg).await {
            Err(NetworkError::Broadcast(err)) => {
                assert_eq!(err.attempted, 1);
                assert!(err.failed_for(&id));
                assert!(matches!(err.failures[0].error, NetworkError::Transport(_)));
            }
            other => panic!("Expected broadcast failure, got {other:?}"),
        }
        assert_eq!(cluster.member(&id).unwrap().state, MemberState::Disconnected);
    }

    #[tokio::test]
    async fn test_authentication_failure_removes_member() {
        let cluster = cluster();
        let (peer, accept) = accepting_peer("OtherKey").await;
        let id = peer.node_id();
        cluster.join(member_at(&cluster, &peer)).unwrap();

        let err = cluster.connect(&id).await.unwrap_err();
        assert!(matches!(err, NetworkError::Authentication(_)));
        assert!(!cluster.contains(&id));
        assert!(accept.await.unwrap().is_err());

        // Later sends report the member as unknown.
        let msg = GossipMessage::from(RawMessage::new(1, b"hello".to_vec()));
        assert!(matches!(
            cluster.send_to(&id, &msg).await,
            Err(NetworkError::Membership(_))
        ));
    }

    #[tokio::test]
    async fn test_retired_connection_keeps_member() {
        let cluster = cluster();
        let (peer, accept) = accepting_peer("ClusterKey").await;
        let id = peer.node_id();
        cluster.join(member_at(&cluster, &peer)).unwrap();

        let connection = cluster.connect(&id).await.unwrap();
        let remote = accept.await.unwrap().unwrap();
        remote.retire();
        tokio::time::timeout(std::time::Duration::from_secs(5), connection.closed())
            .await
            .unwrap();
        assert!(connection.is_retiring());

        cluster.connection_closed(&connection);
        let info = cluster.member(&id).unwrap();
        assert_eq!(info.state, MemberState::Disconnected);
        assert!(info.connected_at.is_none());
        assert!(cluster.connection(&id).is_none());
    }

    #[tokio::test]
    async fn test_lost_connection_drops_member() {
        let cluster = cluster();
        let (peer, accept) = accepting_peer("ClusterKey").await;
        let id = peer.node_id();
        cluster.join(member_at(&cluster, &peer)).unwrap();

        let connection = cluster.connect(&id).await.unwrap();
        accept.await.unwrap().unwrap().close();
        tokio::time::timeout(std::time::Duration::from_secs(5), connection.closed())
            .await
            .unwrap();
        assert!(!connection.is_retiring());

        cluster.connection_closed(&connection);
        assert!(!cluster.contains(&id));
    }

    #[tokio::test]
    async fn test_broadcast_reserved_type_rejected() {
        let cluster = cluster();
        let msg = GossipMessage::from(RawMessage::new(0xFF, Vec::new()));
        assert!(matches!(
            cluster.broadcast_all(&msg).await,
            Err(NetworkError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn test_shutdown_refuses_work() {
        let cluster = cluster();
        cluster.join(member_of(&cluster, "tag2")).unwrap();
        cluster.shutdown();

        assert!(cluster.is_empty());
        assert!(matches!(
            cluster.join(member_of(&cluster, "tag2")),
            Err(NetworkError::NotRunning)
        ));
        let msg = GossipMessage::from(RawMessage::new(1, Vec::new()));
        assert!(matches!(
            cluster.broadcast_all(&msg).await,
            Err(NetworkError::NotRunning)
        ));
    }
}
