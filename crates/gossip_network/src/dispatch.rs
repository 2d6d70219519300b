//! Message dispatcher: delivers received messages to registered observers.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use tracing::trace;

use crate::connection::Connection;
use crate::message::GossipMessage;
use crate::node::GossipNode;

/// An observer invoked for every message a node receives.
///
/// Observers run on the receiving connection's reader task. A slow observer
/// delays further messages on that connection only; it must not block
/// indefinitely.
pub type MessageObserver = Arc<dyn Fn(&GossipNode, &Connection, &GossipMessage) + Send + Sync>;

/// Handle returned on registration, used to unregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

/// Ordered list of observers.
pub struct MessageDispatcher {
    observers: RwLock<Vec<(ObserverId, MessageObserver)>>,
    next_id: AtomicU64,
}

impl MessageDispatcher {
    pub fn new() -> Self {
        Self {
            observers: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Append an observer; it runs after every observer registered before it.
    pub fn register(&self, observer: MessageObserver) -> ObserverId {
        let id = ObserverId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.observers.write().push((id, observer));
        id
    }

    /// Remove an observer. Returns false if it was not registered.
    pub fn remove(&self, id: ObserverId) -> bool {
        let mut observers = self.observers.write();
        let before = observers.len();
        observers.retain(|(oid, _)| *oid != id);
        observers.len() != before
    }

    pub fn observer_count(&self) -> usize {
        self.observers.read().len()
    }

    /// Deliver a message to every current observer, in registration order.
    pub fn dispatch(&self, node: &GossipNode, connection: &Connection, message: &GossipMessage) {
        // Snapshot so observers may (un)register without deadlocking.
        let observers: Vec<MessageObserver> = self
            .observers
            .read()
            .iter()
            .map(|(_, o)| Arc::clone(o))
            .collect();

        if observers.is_empty() {
            trace!(
                "No observers for message type {} from {}",
                message.message_type(),
                connection.peer_id()
            );
            return;
        }

        for observer in observers {
            observer(node, connection, message);
        }
    }
}

impl Default for MessageDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
