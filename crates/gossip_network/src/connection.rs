//! Authenticated TCP connections to a single peer.
//!
//! A [`Connection`] is established with [`Connection::open`] (initiator) or
//! [`Connection::accept`] (responder). Both drive the handshake before any
//! application frame is exchanged. Once authenticated, two background tasks
//! own the socket halves:
//!
//! - a **writer** draining the bounded send queue, batching whatever is
//!   ready, flushing, and then resolving each sender's completion;
//! - a **reader** decoding frames and handing messages to the node.
//!
//! Only the writer touches the write half, so frames from concurrent
//! senders are never torn. Any I/O error closes the connection and fails
//! every send still waiting on it.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use futures::{SinkExt, StreamExt};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::codec::{Framed, FramedParts, FramedRead, FramedWrite};
use tracing::{debug, info, trace, warn};

use crate::auth::{Authenticator, HANDSHAKE_MAX_FRAME_SIZE, Handshake, Role, SessionToken};
use crate::codec::{self, Frame, FrameCodec, frame_type};
use crate::config::ClusterConfig;
use crate::error::NetworkError;
use crate::identity::{NodeConfig, NodeId};
use crate::message::GossipMessage;

/// Most frames the writer encodes before forcing a flush.
const MAX_WRITE_BATCH: usize = 32;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Lifecycle of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Transport established, handshake not started.
    Unauthenticated,
    /// Handshake in progress.
    Authenticating,
    /// Handshake succeeded; application frames flow.
    Authenticated,
    /// Closed locally, by the peer, or by an I/O error.
    Closed,
}

/// Receives what a connection's reader produces.
pub(crate) trait InboundHandler: Send + Sync + 'static {
    /// A complete application message arrived.
    fn on_message(&self, connection: &Connection, message: GossipMessage);

    /// The connection reached [`ConnectionState::Closed`].
    fn on_closed(&self, connection: &Connection);
}

enum Outbound {
    Frame {
        frame: Frame,
        done: oneshot::Sender<Result<(), NetworkError>>,
    },
    Goodbye,
}

struct ConnectionInner {
    id: u64,
    peer: NodeConfig,
    role: Role,
    remote_addr: SocketAddr,
    session: SessionToken,
    max_frame_size: usize,
    queue: mpsc::Sender<Outbound>,
    state: watch::Sender<ConnectionState>,
    retiring: AtomicBool,
}

/// Handle to an authenticated connection with one peer. Cheap to clone;
/// every clone refers to the same socket.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl Connection {
    /// Connect to `remote` and authenticate as the initiator.
    pub(crate) async fn open(
        remote: &NodeConfig,
        local: &NodeConfig,
        authenticator: &Authenticator,
        config: &ClusterConfig,
        handler: Arc<dyn InboundHandler>,
    ) -> Result<Self, NetworkError> {
        let addr = remote.listen_addr();
        let stream = match tokio::time::timeout(config.connect_timeout, TcpStream::connect(addr))
            .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(NetworkError::Transport(format!("Connect to {addr} failed: {e}")));
            }
            Err(_) => {
                return Err(NetworkError::Transport(format!(
                    "Connect to {addr} timed out after {:?}",
                    config.connect_timeout
                )));
            }
        };

        let (state, _) = watch::channel(ConnectionState::Unauthenticated);
        let mut framed = Self::framed(stream)?;

        state.send_replace(ConnectionState::Authenticating);
        trace!("Authenticating outbound connection to {addr}");
        let handshake = match authenticator
            .initiate(&mut framed, local, remote.node_id())
            .await
        {
            Ok(handshake) => handshake,
            Err(e) => {
                state.send_replace(ConnectionState::Closed);
                warn!("Handshake with {addr} failed: {e}");
                return Err(e);
            }
        };

        Ok(Self::start(framed, handshake, Role::Initiator, addr, state, config, handler))
    }

    /// Authenticate an inbound stream as the responder.
    pub(crate) async fn accept(
        stream: TcpStream,
        local: &NodeConfig,
        authenticator: &Authenticator,
        config: &ClusterConfig,
        handler: Arc<dyn InboundHandler>,
    ) -> Result<Self, NetworkError> {
        let addr = stream.peer_addr()?;
        let (state, _) = watch::channel(ConnectionState::Unauthenticated);
        let mut framed = Self::framed(stream)?;

        state.send_replace(ConnectionState::Authenticating);
        trace!("Authenticating inbound connection from {addr}");
        let handshake = match authenticator.respond(&mut framed, local).await {
            Ok(handshake) => handshake,
            Err(e) => {
                state.send_replace(ConnectionState::Closed);
                warn!("Handshake with {addr} failed: {e}");
                return Err(e);
            }
        };

        Ok(Self::start(framed, handshake, Role::Responder, addr, state, config, handler))
    }

    fn framed(stream: TcpStream) -> Result<Framed<TcpStream, FrameCodec>, NetworkError> {
        stream.set_nodelay(true)?;
        let codec = FrameCodec::new().with_max_frame_size(HANDSHAKE_MAX_FRAME_SIZE);
        Ok(Framed::new(stream, codec))
    }

    /// Split the authenticated stream and spawn the reader and writer tasks.
    fn start(
        framed: Framed<TcpStream, FrameCodec>,
        handshake: Handshake,
        role: Role,
        remote_addr: SocketAddr,
        state: watch::Sender<ConnectionState>,
        config: &ClusterConfig,
        handler: Arc<dyn InboundHandler>,
    ) -> Self {
        // Frames the peer sent right after the handshake may already sit in
        // the read buffer; carry them over to the reader.
        let FramedParts {
            io,
            codec,
            read_buf,
            ..
        } = framed.into_parts();
        let codec = codec.with_max_frame_size(config.max_frame_size);
        let (read_half, write_half) = io.into_split();
        let mut reader = FramedRead::new(read_half, codec.clone());
        *reader.read_buffer_mut() = read_buf;
        let writer = FramedWrite::new(write_half, codec);

        let (queue, queue_rx) = mpsc::channel(config.send_queue_depth);
        state.send_replace(ConnectionState::Authenticated);

        let connection = Self {
            inner: Arc::new(ConnectionInner {
                id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
                peer: handshake.peer,
                role,
                remote_addr,
                session: handshake.session,
                max_frame_size: config.max_frame_size,
                queue,
                state,
                retiring: AtomicBool::new(false),
            }),
        };

        info!(
            "Connection {} to {} ({remote_addr}) authenticated as {role:?}",
            connection.id(),
            connection.peer_id()
        );

        let write_task = tokio::spawn(write_loop(writer, queue_rx, connection.clone()));
        tokio::spawn(read_loop(reader, connection.clone(), handler, write_task));

        connection
    }

    /// Process-unique identifier of this connection.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// The authenticated peer's declared identity.
    pub fn peer(&self) -> &NodeConfig {
        &self.inner.peer
    }

    pub fn peer_id(&self) -> NodeId {
        self.inner.peer.node_id()
    }

    /// Which side opened the connection.
    pub fn role(&self) -> Role {
        self.inner.role
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.inner.remote_addr
    }

    pub fn session_token(&self) -> &SessionToken {
        &self.inner.session
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Authenticated && !self.is_retiring()
    }

    /// Whether either side has started a graceful close.
    pub fn is_retiring(&self) -> bool {
        self.inner.retiring.load(Ordering::Acquire)
    }

    /// Queue a message and wait until its frame has been flushed to the
    /// socket. Resolves with an error if the connection closes first.
    pub async fn send(&self, message: &GossipMessage) -> Result<(), NetworkError> {
        let frame = message.to_frame()?;
        if frame.payload.len() > self.inner.max_frame_size {
            return Err(NetworkError::Protocol(format!(
                "Message of {} bytes exceeds frame limit of {} bytes",
                frame.payload.len(),
                self.inner.max_frame_size
            )));
        }
        self.send_frame(frame).await
    }

    async fn send_frame(&self, frame: Frame) -> Result<(), NetworkError> {
        let peer_id = self.peer_id();
        // Retiring connections take no new frames.
        if self.state() == ConnectionState::Closed || self.is_retiring() {
            return Err(NetworkError::ConnectionClosed(peer_id));
        }

        let (done, completion) = oneshot::channel();
        self.inner
            .queue
            .send(Outbound::Frame { frame, done })
            .await
            .map_err(|_| NetworkError::ConnectionClosed(peer_id))?;

        completion
            .await
            .map_err(|_| NetworkError::ConnectionClosed(peer_id))?
    }

    /// Close immediately. Queued sends fail; the peer sees the socket close.
    pub fn close(&self) {
        if self.mark_closed() {
            debug!("Closing connection {} to {}", self.id(), self.peer_id());
        }
    }

    /// Stop accepting new work, let queued frames drain, then say goodbye.
    /// The connection closes once the peer has said goodbye too.
    pub fn retire(&self) {
        if self.inner.retiring.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("Retiring connection {} to {}", self.id(), self.peer_id());
        let queue = self.inner.queue.clone();
        tokio::spawn(async move {
            let _ = queue.send(Outbound::Goodbye).await;
        });
    }

    /// Wait until the connection is closed.
    pub async fn closed(&self) {
        wait_closed(&mut self.inner.state.subscribe()).await;
    }

    /// Returns true if this call moved the connection to Closed.
    fn mark_closed(&self) -> bool {
        self.inner.state.send_if_modified(|state| {
            if *state == ConnectionState::Closed {
                false
            } else {
                *state = ConnectionState::Closed;
                true
            }
        })
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("peer", &self.peer_id())
            .field("remote_addr", &self.inner.remote_addr)
            .field("role", &self.inner.role)
            .field("state", &self.state())
            .finish()
    }
}

async fn wait_closed(state: &mut watch::Receiver<ConnectionState>) {
    // A dropped sender means the connection is gone as well.
    let _ = state.wait_for(|s| *s == ConnectionState::Closed).await;
}

// ---------------------------------------------------------------------------
// Background tasks
// ---------------------------------------------------------------------------

async fn write_loop(
    mut sink: FramedWrite<OwnedWriteHalf, FrameCodec>,
    mut queue: mpsc::Receiver<Outbound>,
    connection: Connection,
) {
    let peer_id = connection.peer_id();
    let mut state = connection.inner.state.subscribe();

    loop {
        let first = tokio::select! {
            _ = wait_closed(&mut state) => break,
            item = queue.recv() => match item {
                Some(item) => item,
                None => break,
            },
        };

        let mut pending = Vec::new();
        let mut goodbye = false;
        let result = tokio::select! {
            _ = wait_closed(&mut state) => Err(NetworkError::ConnectionClosed(peer_id)),
            result = write_batch(&mut sink, &mut queue, first, &mut pending, &mut goodbye) => result,
        };

        match result {
            Ok(()) => {
                trace!("Flushed {} frame(s) to {peer_id}", pending.len());
                for done in pending {
                    let _ = done.send(Ok(()));
                }
            }
            Err(e) => {
                if !matches!(e, NetworkError::ConnectionClosed(_)) {
                    warn!("Write to {peer_id} failed: {e}");
                }
                let reason = e.to_string();
                for done in pending {
                    let _ = done.send(Err(NetworkError::Transport(reason.clone())));
                }
                connection.mark_closed();
                break;
            }
        }

        if goodbye {
            debug!("Sent goodbye to {peer_id}");
            let _ = sink.get_mut().shutdown().await;
            break;
        }
    }

    // Nothing more will be written; fail whatever is still queued.
    queue.close();
    while let Ok(item) = queue.try_recv() {
        if let Outbound::Frame { done, .. } = item {
            let _ = done.send(Err(NetworkError::ConnectionClosed(peer_id)));
        }
    }
}

/// Encode `first` plus whatever else is already queued, then flush once.
async fn write_batch(
    sink: &mut FramedWrite<OwnedWriteHalf, FrameCodec>,
    queue: &mut mpsc::Receiver<Outbound>,
    first: Outbound,
    pending: &mut Vec<oneshot::Sender<Result<(), NetworkError>>>,
    goodbye: &mut bool,
) -> Result<(), NetworkError> {
    let mut next = Some(first);
    while let Some(item) = next.take() {
        match item {
            Outbound::Frame { frame, done } => {
                pending.push(done);
                sink.feed(frame).await?;
            }
            Outbound::Goodbye => {
                *goodbye = true;
                sink.feed(Frame::new(frame_type::GOODBYE, bytes::Bytes::new()))
                    .await?;
                break;
            }
        }
        if pending.len() < MAX_WRITE_BATCH {
            next = queue.try_recv().ok();
        }
    }
    sink.flush().await
}

async fn read_loop(
    mut stream: FramedRead<OwnedReadHalf, FrameCodec>,
    connection: Connection,
    handler: Arc<dyn InboundHandler>,
    mut write_task: JoinHandle<()>,
) {
    let peer_id = connection.peer_id();
    let mut state = connection.inner.state.subscribe();

    loop {
        let next = tokio::select! {
            _ = wait_closed(&mut state) => break,
            next = stream.next() => next,
        };

        match next {
            Some(Ok(frame)) if frame.message_type == frame_type::GOODBYE => {
                debug!("Peer {peer_id} said goodbye");
                // Answer with our own goodbye once our queue has drained.
                connection.retire();
                tokio::select! {
                    _ = &mut write_task => {}
                    _ = wait_closed(&mut state) => {}
                }
                break;
            }
            Some(Ok(frame)) if codec::is_reserved(frame.message_type) => {
                warn!(
                    "Unexpected control frame {:#04x} from {peer_id}, closing",
                    frame.message_type
                );
                break;
            }
            Some(Ok(frame)) => {
                trace!(
                    "Received frame type {} ({} bytes) from {peer_id}",
                    frame.message_type,
                    frame.payload.len()
                );
                handler.on_message(&connection, GossipMessage::from_frame(frame));
            }
            Some(Err(e)) => {
                warn!("Read from {peer_id} failed: {e}");
                break;
            }
            None => {
                debug!("Peer {peer_id} closed the connection");
                break;
            }
        }
    }

    if connection.mark_closed() {
        info!("Connection {} to {peer_id} closed", connection.id());
    }
    handler.on_closed(&connection);
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
