//! GossipNode: top-level owner of the listener, the cluster view and the
//! message observers.
//!
//! [`GossipNode`] is the primary public API of gossip_network. It manages:
//! - the TCP listener (accept and authenticate inbound connections)
//! - the [`Cluster`] (members, outbound connections, broadcasts)
//! - the [`MessageDispatcher`] (observers of received messages)
//!
//! The handle is cheap to clone. Background tasks only hold weak references,
//! so dropping the last handle tears everything down; [`GossipNode::dispose`]
//! does the same explicitly and waits for the listener to release its port.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::auth::Authenticator;
use crate::cluster::Cluster;
use crate::config::ClusterConfig;
use crate::connection::{Connection, InboundHandler};
use crate::dispatch::{MessageDispatcher, MessageObserver, ObserverId};
use crate::error::NetworkError;
use crate::identity::{NodeConfig, NodeId};
use crate::message::GossipMessage;

struct Listener {
    local_addr: SocketAddr,
    task: JoinHandle<()>,
}

struct NodeInner {
    node_config: NodeConfig,
    cluster_config: ClusterConfig,
    authenticator: Arc<Authenticator>,
    cluster: Cluster,
    dispatcher: MessageDispatcher,
    shutdown_tx: broadcast::Sender<()>,
    listener: Mutex<Option<Listener>>,
    disposed: AtomicBool,
}

impl Drop for NodeInner {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(());
        self.cluster.shutdown();
    }
}

/// Bridges connection events back to the node without keeping it alive.
struct NodeEvents {
    node: Weak<NodeInner>,
}

impl InboundHandler for NodeEvents {
    fn on_message(&self, connection: &Connection, message: GossipMessage) {
        let Some(inner) = self.node.upgrade() else {
            return;
        };
        inner.cluster.touch(&connection.peer_id());
        let node = GossipNode { inner };
        node.inner.dispatcher.dispatch(&node, connection, &message);
    }

    fn on_closed(&self, connection: &Connection) {
        if let Some(inner) = self.node.upgrade() {
            inner.cluster.connection_closed(connection);
        }
    }
}

/// A gossip cluster node.
///
/// Create one per local identity, [`join`](Cluster::join) the peers it should
/// talk to, register observers, and call
/// [`start_listening`](GossipNode::start_listening) so peers can reach it.
#[derive(Clone)]
pub struct GossipNode {
    inner: Arc<NodeInner>,
}

impl GossipNode {
    /// Create a node. Nothing is bound until
    /// [`start_listening`](Self::start_listening).
    pub fn new(node_config: NodeConfig, cluster_config: ClusterConfig) -> Result<Self, NetworkError> {
        node_config.validate()?;
        cluster_config.validate()?;

        let authenticator = Arc::new(Authenticator::new(&cluster_config));
        let (shutdown_tx, _) = broadcast::channel(1);

        let inner = Arc::new_cyclic(|weak: &Weak<NodeInner>| {
            let events: Arc<dyn InboundHandler> = Arc::new(NodeEvents { node: weak.clone() });
            NodeInner {
                cluster: Cluster::new(node_config.clone(), cluster_config.clone(), events),
                node_config,
                cluster_config,
                authenticator,
                dispatcher: MessageDispatcher::new(),
                shutdown_tx,
                listener: Mutex::new(None),
                disposed: AtomicBool::new(false),
            }
        });

        Ok(Self { inner })
    }

    pub fn node_config(&self) -> &NodeConfig {
        &self.inner.node_config
    }

    pub fn node_id(&self) -> NodeId {
        self.inner.node_config.node_id()
    }

    pub fn cluster_config(&self) -> &ClusterConfig {
        &self.inner.cluster_config
    }

    /// The authenticator holding this node's view of the cluster key. Hand
    /// it to [`ClusterMember::new`](crate::ClusterMember::new) when other
    /// nodes in the same process join this one.
    pub fn authenticator(&self) -> Arc<Authenticator> {
        Arc::clone(&self.inner.authenticator)
    }

    pub fn cluster(&self) -> &Cluster {
        &self.inner.cluster
    }

    /// Register an observer for received messages. Observers run in
    /// registration order.
    pub fn on_message_received<F>(&self, observer: F) -> ObserverId
    where
        F: Fn(&GossipNode, &Connection, &GossipMessage) + Send + Sync + 'static,
    {
        let observer: MessageObserver = Arc::new(observer);
        self.inner.dispatcher.register(observer)
    }

    /// Unregister an observer. Returns false if it was not registered.
    pub fn remove_observer(&self, id: ObserverId) -> bool {
        self.inner.dispatcher.remove(id)
    }

    /// Address the listener is bound to, once listening.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.listener.lock().as_ref().map(|l| l.local_addr)
    }

    pub fn is_listening(&self) -> bool {
        self.inner.listener.lock().is_some()
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::Acquire)
    }

    /// Bind the configured address and start accepting peers. Calling it
    /// again while listening returns the bound address.
    pub async fn start_listening(&self) -> Result<SocketAddr, NetworkError> {
        if self.is_disposed() {
            return Err(NetworkError::NotRunning);
        }
        if let Some(addr) = self.local_addr() {
            return Ok(addr);
        }

        let addr = self.inner.node_config.listen_addr();
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| NetworkError::Transport(format!("Bind to {addr} failed: {e}")))?;
        let local_addr = listener.local_addr()?;

        let mut slot = self.inner.listener.lock();
        if let Some(existing) = slot.as_ref() {
            // Lost a race with a concurrent call; ours is dropped unused.
            return Ok(existing.local_addr);
        }

        let shutdown = self.inner.shutdown_tx.subscribe();
        let task = tokio::spawn(accept_loop(listener, Arc::downgrade(&self.inner), shutdown));
        *slot = Some(Listener { local_addr, task });

        info!(
            "Node {} listening on {local_addr} (tags: {:?})",
            self.node_id(),
            self.inner.node_config.tags()
        );
        Ok(local_addr)
    }

    /// Close the listener and every connection. Safe to call more than once.
    pub async fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::AcqRel) {
            return;
        }

        let _ = self.inner.shutdown_tx.send(());
        self.inner.cluster.shutdown();

        let listener = self.inner.listener.lock().take();
        if let Some(listener) = listener {
            if let Err(e) = listener.task.await {
                warn!("Listener task ended abnormally: {e}");
            }
        }
        info!("Node {} disposed", self.node_id());
    }
}

impl std::fmt::Debug for GossipNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GossipNode")
            .field("node_id", &self.node_id())
            .field("listen_addr", &self.inner.node_config.listen_addr())
            .field("tags", &self.inner.node_config.tags())
            .field("members", &self.inner.cluster.len())
            .finish()
    }
}

/// Accept inbound connections until shutdown. Each handshake runs on its
/// own task.
async fn accept_loop(
    listener: TcpListener,
    node: Weak<NodeInner>,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer_addr)) => {
                        let Some(inner) = node.upgrade() else {
                            break;
                        };
                        debug!("Inbound connection from {peer_addr}");

                        let local = inner.node_config.clone();
                        let config = inner.cluster_config.clone();
                        let authenticator = Arc::clone(&inner.authenticator);
                        let events: Arc<dyn InboundHandler> = Arc::new(NodeEvents {
                            node: node.clone(),
                        });
                        drop(inner);

                        let node = node.clone();
                        tokio::spawn(async move {
                            match Connection::accept(stream, &local, &authenticator, &config, events).await {
                                Ok(connection) => match node.upgrade() {
                                    Some(inner) => inner.cluster.accept_connection(connection, &authenticator),
                                    None => connection.close(),
                                },
                                Err(e) => warn!("Rejected inbound connection from {peer_addr}: {e}"),
                            }
                        });
                    }
                    Err(e) => {
                        error!("TCP accept failed: {e}");
                    }
                }
            }
            _ = shutdown.recv() => {
                info!("Listener shutting down");
                break;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
