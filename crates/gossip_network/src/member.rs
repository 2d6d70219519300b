//! Member registry: known peers, their state, and the connection each one
//! owns.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::auth::{Authenticator, Role};
use crate::connection::Connection;
use crate::identity::{NodeConfig, NodeId};

/// Descriptor of a remote peer as seen by one local node.
#[derive(Debug, Clone)]
pub struct ClusterMember {
    /// The local node whose view this entry belongs to.
    owner_id: NodeId,
    /// The remote node's endpoint, tags and identifier.
    config: NodeConfig,
    /// Authenticator used when dialing this member.
    authenticator: Arc<Authenticator>,
}

impl ClusterMember {
    pub fn new(owner_id: NodeId, config: NodeConfig, authenticator: Arc<Authenticator>) -> Self {
        Self {
            owner_id,
            config,
            authenticator,
        }
    }

    pub fn owner_id(&self) -> NodeId {
        self.owner_id
    }

    /// The remote node's identifier.
    pub fn node_id(&self) -> NodeId {
        self.config.node_id()
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn authenticator(&self) -> &Arc<Authenticator> {
        &self.authenticator
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.config.has_tag(tag)
    }

    /// Same endpoint, tags and authenticator instance.
    pub(crate) fn same_descriptor(&self, other: &ClusterMember) -> bool {
        self.config == other.config && Arc::ptr_eq(&self.authenticator, &other.authenticator)
    }
}

/// Connection state of a member.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberState {
    /// Known but no connection attempted yet.
    Joined,
    /// Dial and handshake in progress.
    Connecting,
    /// An authenticated connection is open.
    Connected,
    /// The last connection attempt failed, or the open connection was
    /// retired. The next send dials again.
    Disconnected,
}

/// Point-in-time view of a member.
#[derive(Debug, Clone)]
pub struct MemberInfo {
    pub member: ClusterMember,
    pub state: MemberState,
    /// When the member entered the table.
    pub joined_at: DateTime<Utc>,
    /// When the current connection was established.
    pub connected_at: Option<DateTime<Utc>>,
    /// Last time a message arrived from this member.
    pub last_seen: Option<DateTime<Utc>>,
}

pub(crate) struct MemberEntry {
    pub(crate) member: ClusterMember,
    pub(crate) state: MemberState,
    pub(crate) joined_at: DateTime<Utc>,
    pub(crate) connected_at: Option<DateTime<Utc>>,
    pub(crate) last_seen: Option<DateTime<Utc>>,
    pub(crate) connection: Option<Connection>,
    /// Held while dialing so concurrent sends share one connection attempt.
    pub(crate) dial_lock: Arc<Mutex<()>>,
}

impl MemberEntry {
    fn new(member: ClusterMember) -> Self {
        Self {
            member,
            state: MemberState::Joined,
            joined_at: Utc::now(),
            connected_at: None,
            last_seen: None,
            connection: None,
            dial_lock: Arc::new(Mutex::new(())),
        }
    }

    /// The current connection, if it still accepts sends.
    pub(crate) fn open_connection(&self) -> Option<&Connection> {
        self.connection.as_ref().filter(|c| c.is_open())
    }

    fn info(&self) -> MemberInfo {
        MemberInfo {
            member: self.member.clone(),
            state: self.state,
            joined_at: self.joined_at,
            connected_at: self.connected_at,
            last_seen: self.last_seen,
        }
    }
}

/// Outcome of offering a connection to a member entry.
pub(crate) enum Installed {
    /// The offered connection is now the member's connection.
    Current(Option<Connection>),
    /// The member already had a preferred connection; the offered one lost.
    Kept(Connection),
}

/// Registry of members keyed by remote node identifier.
pub(crate) struct MemberRegistry {
    local_id: NodeId,
    members: HashMap<NodeId, MemberEntry>,
}

impl MemberRegistry {
    pub(crate) fn new(local_id: NodeId) -> Self {
        Self {
            local_id,
            members: HashMap::new(),
        }
    }

    /// Add or replace a member. Returns the replaced entry's connection.
    ///
    /// A replaced entry hands its dial lock to the new one, so a dial still
    /// running for the old descriptor finishes before the next one starts.
    pub(crate) fn insert(&mut self, member: ClusterMember) -> Option<Connection> {
        let node_id = member.node_id();
        let mut entry = MemberEntry::new(member);
        if let Some(old) = self.members.get(&node_id) {
            entry.dial_lock = Arc::clone(&old.dial_lock);
        }
        self.members
            .insert(node_id, entry)
            .and_then(|old| old.connection)
    }

    pub(crate) fn remove(&mut self, node_id: &NodeId) -> Option<MemberEntry> {
        self.members.remove(node_id)
    }

    /// Remove `member`'s entry unless it was rejoined with another descriptor
    /// or gained an open connection meanwhile. Returns true if removed.
    pub(crate) fn remove_unconnected(&mut self, member: &ClusterMember) -> bool {
        let node_id = member.node_id();
        let unchanged = self.members.get(&node_id).is_some_and(|entry| {
            entry.member.same_descriptor(member) && entry.open_connection().is_none()
        });
        if unchanged {
            self.members.remove(&node_id);
        }
        unchanged
    }

    /// Forget the member's current connection once it has been retired.
    /// Returns false if `connection` is not the current one.
    pub(crate) fn release(&mut self, connection: &Connection) -> bool {
        let Some(entry) = self.members.get_mut(&connection.peer_id()) else {
            return false;
        };
        if entry.connection.as_ref().map(Connection::id) != Some(connection.id()) {
            return false;
        }
        entry.connection = None;
        entry.connected_at = None;
        entry.state = MemberState::Disconnected;
        true
    }

    pub(crate) fn get(&self, node_id: &NodeId) -> Option<&MemberEntry> {
        self.members.get(node_id)
    }

    pub(crate) fn get_mut(&mut self, node_id: &NodeId) -> Option<&mut MemberEntry> {
        self.members.get_mut(node_id)
    }

    pub(crate) fn contains(&self, node_id: &NodeId) -> bool {
        self.members.contains_key(node_id)
    }

    pub(crate) fn len(&self) -> usize {
        self.members.len()
    }

    /// Identifiers of the members matching `predicate`.
    pub(crate) fn select<P>(&self, predicate: P) -> Vec<NodeId>
    where
        P: Fn(&ClusterMember) -> bool,
    {
        self.members
            .values()
            .filter(|e| predicate(&e.member))
            .map(|e| e.member.node_id())
            .collect()
    }

    pub(crate) fn infos(&self) -> Vec<MemberInfo> {
        self.members.values().map(MemberEntry::info).collect()
    }

    pub(crate) fn drain(&mut self) -> Vec<MemberEntry> {
        self.members.drain().map(|(_, entry)| entry).collect()
    }

    pub(crate) fn update_state(&mut self, node_id: &NodeId, state: MemberState) {
        if let Some(entry) = self.members.get_mut(node_id) {
            entry.state = state;
        }
    }

    pub(crate) fn update_last_seen(&mut self, node_id: &NodeId) {
        if let Some(entry) = self.members.get_mut(node_id) {
            entry.last_seen = Some(Utc::now());
        }
    }

    /// Offer an authenticated connection to its member's entry.
    ///
    /// When both nodes dial each other at once, each side ends up with two
    /// connections. Both sides keep the one opened by the node with the
    /// smaller identifier, so they agree without further messages.
    pub(crate) fn install(&mut self, connection: Connection) -> Option<Installed> {
        let local_id = self.local_id;
        let entry = self.members.get_mut(&connection.peer_id())?;

        if let Some(existing) = entry.open_connection() {
            if existing.id() == connection.id() {
                return Some(Installed::Current(None));
            }
            if initiator_of(existing, local_id) <= initiator_of(&connection, local_id) {
                return Some(Installed::Kept(existing.clone()));
            }
        }

        let replaced = entry.connection.replace(connection);
        entry.state = MemberState::Connected;
        entry.connected_at = Some(Utc::now());
        Some(Installed::Current(replaced))
    }
}

fn initiator_of(connection: &Connection, local_id: NodeId) -> NodeId {
    match connection.role() {
        Role::Initiator => local_id,
        Role::Responder => connection.peer_id(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
