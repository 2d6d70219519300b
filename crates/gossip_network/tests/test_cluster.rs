use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio_util::codec::Framed;

use gossip_network::*;

// -- Helpers -----------------------------------------------------------------

fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

fn local_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], free_port()))
}

fn make_node(tag: &str, key: &str) -> GossipNode {
    GossipNode::new(NodeConfig::new(local_addr(), tag), ClusterConfig::new(key)).unwrap()
}

/// `from` learns about `to`, using `from`'s own cluster key to dial it.
fn join(from: &GossipNode, to: &GossipNode) {
    let member = ClusterMember::new(from.node_id(), to.node_config().clone(), from.authenticator());
    from.cluster().join(member).unwrap();
}

#[derive(Debug, Clone)]
struct Received {
    from: NodeId,
    message_type: u8,
    payload: Bytes,
}

fn record(node: &GossipNode) -> Arc<Mutex<Vec<Received>>> {
    let log = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&log);
    node.on_message_received(move |_node, conn, msg| {
        sink.lock().push(Received {
            from: conn.peer_id(),
            message_type: msg.message_type(),
            payload: msg.payload().clone(),
        });
    });
    log
}

/// Poll `check` until it holds, panicking after `limit`.
async fn eventually<F: Fn() -> bool>(limit: Duration, check: F) {
    tokio::time::timeout(limit, async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

fn raw(message_type: u8, payload: impl Into<Bytes>) -> GossipMessage {
    GossipMessage::from(RawMessage::new(message_type, payload))
}

// -- Authentication ----------------------------------------------------------

#[tokio::test]
async fn test_two_nodes_authenticate() {
    let a = make_node("tag1", "ClusterKey");
    let b = make_node("tag2", "ClusterKey");
    join(&a, &b);
    b.start_listening().await.unwrap();

    let conn = a.cluster().connect(&b.node_id()).await.unwrap();
    assert_eq!(conn.state(), ConnectionState::Authenticated);
    assert_eq!(conn.role(), Role::Initiator);
    assert_eq!(conn.peer_id(), b.node_id());

    // The responder registers the initiator as a member on its own.
    eventually(Duration::from_secs(5), || b.cluster().connection(&a.node_id()).is_some()).await;
    let inbound = b.cluster().connection(&a.node_id()).unwrap();
    assert_eq!(inbound.role(), Role::Responder);
    assert_eq!(inbound.session_token(), conn.session_token());

    let info = a.cluster().member(&b.node_id()).unwrap();
    assert_eq!(info.state, MemberState::Connected);
    assert!(info.connected_at.is_some());

    a.dispose().await;
    b.dispose().await;
}

#[tokio::test]
async fn test_mismatched_keys_fail_authentication() {
    let a = make_node("tag1", "ClusterKey");
    let b = make_node("tag2", "OtherKey");
    join(&a, &b);
    b.start_listening().await.unwrap();
    let received = record(&b);

    let err = a
        .cluster()
        .broadcast_all(&raw(1, "secret"))
        .await
        .unwrap_err();
    let NetworkError::Broadcast(failure) = err else {
        panic!("expected a broadcast error, got {err:?}");
    };
    assert_eq!(failure.attempted, 1);
    assert!(matches!(
        failure.error_for(&b.node_id()),
        Some(NetworkError::Authentication(_))
    ));

    assert!(!a.cluster().contains(&b.node_id()));
    assert!(a.cluster().connection(&b.node_id()).is_none());

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(b.cluster().is_empty());
    assert!(received.lock().is_empty());

    a.dispose().await;
    b.dispose().await;
}

// -- Broadcast ---------------------------------------------------------------

#[tokio::test]
async fn test_tagged_hello_reaches_only_tag2() {
    let a = make_node("tag1", "ClusterKey");
    let b = make_node("tag2", "ClusterKey");
    join(&a, &b);
    join(&b, &a);
    let at_a = record(&a);
    let at_b = record(&b);
    a.start_listening().await.unwrap();
    b.start_listening().await.unwrap();

    let hello = raw(1, "Hello World!");
    let report = a
        .cluster()
        .broadcast_message(&hello, |m| m.has_tag("tag2"))
        .await
        .unwrap();
    assert_eq!(report.attempted, 1);
    assert_eq!(report.delivered, 1);
    assert_eq!(report.bytes, 12);

    eventually(Duration::from_secs(5), || at_b.lock().len() == 1).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let got = at_b.lock().clone();
    assert_eq!(got.len(), 1);
    assert_eq!(got[0].from, a.node_id());
    assert_eq!(got[0].message_type, 1);
    assert_eq!(got[0].payload.len(), 12);
    assert_eq!(&got[0].payload[..], b"Hello World!");
    assert!(at_a.lock().is_empty());

    a.dispose().await;
    b.dispose().await;
}

#[tokio::test]
async fn test_broadcast_with_empty_selection() {
    let a = make_node("tag1", "ClusterKey");
    let b = make_node("tag2", "ClusterKey");
    join(&a, &b);
    let at_b = record(&b);
    b.start_listening().await.unwrap();

    let report = a
        .cluster()
        .broadcast_message(&raw(1, "nobody"), |_| false)
        .await
        .unwrap();
    assert_eq!(report, BroadcastReport::default());

    // Nothing was dialed either.
    assert!(a.cluster().connection(&b.node_id()).is_none());
    assert_eq!(a.cluster().member(&b.node_id()).unwrap().state, MemberState::Joined);
    assert!(at_b.lock().is_empty());

    a.dispose().await;
    b.dispose().await;
}

#[tokio::test]
async fn test_broadcast_reaches_single_tagged_target_once() {
    let a = make_node("tag1", "ClusterKey");
    let b = make_node("tag2", "ClusterKey");
    let c = make_node("tag3", "ClusterKey");
    join(&a, &b);
    join(&a, &c);
    let at_b = record(&b);
    let at_c = record(&c);
    b.start_listening().await.unwrap();
    c.start_listening().await.unwrap();

    let report = a
        .cluster()
        .broadcast_message(&raw(7, vec![0xAB; 1024]), |m| m.has_tag("tag3"))
        .await
        .unwrap();
    assert_eq!(report.attempted, 1);
    assert_eq!(report.bytes, 1024);

    eventually(Duration::from_secs(5), || at_c.lock().len() == 1).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(at_c.lock().len(), 1);
    assert_eq!(at_c.lock()[0].message_type, 7);
    assert!(at_b.lock().is_empty());

    for node in [a, b, c] {
        node.dispose().await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_large_broadcasts_arrive_intact() {
    const COUNT: usize = 500;
    const SIZE: usize = 1024 * 1024;

    let a = make_node("tag1", "ClusterKey");
    let b = make_node("tag2", "ClusterKey");
    join(&a, &b);
    join(&b, &a);
    a.start_listening().await.unwrap();
    b.start_listening().await.unwrap();

    let payload: Bytes = (0..SIZE).map(|i| (i % 251) as u8).collect::<Vec<u8>>().into();
    let intact = Arc::new(AtomicUsize::new(0));
    let corrupt = Arc::new(AtomicUsize::new(0));
    {
        let intact = Arc::clone(&intact);
        let corrupt = Arc::clone(&corrupt);
        let expected = payload.clone();
        b.on_message_received(move |_, _, msg| {
            if msg.message_type() == 2 && *msg.payload() == expected {
                intact.fetch_add(1, Ordering::SeqCst);
            } else {
                corrupt.fetch_add(1, Ordering::SeqCst);
            }
        });
    }

    let message = raw(2, payload);

    let mut tasks = Vec::with_capacity(COUNT);
    for _ in 0..COUNT {
        let a = a.clone();
        let message = message.clone();
        tasks.push(tokio::spawn(async move {
            a.cluster().broadcast_message(&message, |m| m.has_tag("tag2")).await
        }));
    }
    for task in tasks {
        let report = task.await.unwrap().unwrap();
        assert_eq!(report.delivered, 1);
        assert_eq!(report.bytes, SIZE as u64);
    }

    eventually(Duration::from_secs(120), || intact.load(Ordering::SeqCst) == COUNT).await;
    assert_eq!(corrupt.load(Ordering::SeqCst), 0);

    a.dispose().await;
    b.dispose().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_leave_during_inflight_broadcast() {
    const COUNT: usize = 32;
    const SIZE: usize = 1024 * 1024;

    let a = make_node("tag1", "ClusterKey");
    let b = make_node("tag2", "ClusterKey");
    join(&a, &b);
    let at_b = record(&b);
    b.start_listening().await.unwrap();

    // A peer that completes the handshake and then never reads.
    let stalled_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let stalled_config = NodeConfig::new(stalled_listener.local_addr().unwrap(), "tag2");
    let stalled_id = stalled_config.node_id();
    let stalled_auth = Authenticator::new(&ClusterConfig::new("ClusterKey"));
    let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
    let stalled = tokio::spawn({
        let config = stalled_config.clone();
        async move {
            let (stream, _) = stalled_listener.accept().await.unwrap();
            let mut framed = Framed::new(stream, FrameCodec::default());
            stalled_auth.respond(&mut framed, &config).await.unwrap();
            let _ = release_rx.await;
            drop(framed);
        }
    });
    a.cluster()
        .join(ClusterMember::new(a.node_id(), stalled_config, a.authenticator()))
        .unwrap();

    let message = raw(3, vec![0x5A; SIZE]);
    let mut tasks = Vec::with_capacity(COUNT);
    for _ in 0..COUNT {
        let a = a.clone();
        let message = message.clone();
        tasks.push(tokio::spawn(async move { a.cluster().broadcast_all(&message).await }));
    }

    // The healthy member gets everything while the stalled one backs up.
    eventually(Duration::from_secs(30), || at_b.lock().len() == COUNT).await;
    a.cluster().leave(&stalled_id).unwrap();

    let mut failed = 0;
    for task in tasks {
        let result = tokio::time::timeout(Duration::from_secs(10), task)
            .await
            .expect("broadcast hung after leave")
            .unwrap();
        if let Err(err) = result {
            let NetworkError::Broadcast(failure) = err else {
                panic!("expected a broadcast error, got {err:?}");
            };
            assert_eq!(failure.attempted, 2);
            assert_eq!(failure.failures.len(), 1);
            assert!(failure.failed_for(&stalled_id));
            assert!(!failure.failed_for(&b.node_id()));
            failed += 1;
        }
    }
    assert!(failed > 0, "some sends to the stalled peer should still have been queued");
    assert!(!a.cluster().contains(&stalled_id));
    assert!(a.cluster().contains(&b.node_id()));

    let _ = release_tx.send(());
    stalled.await.unwrap();
    a.dispose().await;
    b.dispose().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_simultaneous_broadcasts_after_mutual_join() {
    const ROUNDS: usize = 20;
    const PER_SIDE: usize = 20;

    for round in 0..ROUNDS {
        let a = make_node("tag1", "ClusterKey");
        let b = make_node("tag2", "ClusterKey");
        join(&a, &b);
        join(&b, &a);
        let at_a = record(&a);
        let at_b = record(&b);
        a.start_listening().await.unwrap();
        b.start_listening().await.unwrap();

        // Both sides dial at once, so each round settles a duplicate pair.
        let mut tasks = Vec::with_capacity(2 * PER_SIDE);
        for i in 0..PER_SIDE {
            for node in [&a, &b] {
                let node = node.clone();
                let message = raw(5, vec![i as u8; 512]);
                tasks.push(tokio::spawn(async move { node.cluster().broadcast_all(&message).await }));
            }
        }
        for task in tasks {
            match task.await.unwrap() {
                Ok(report) => assert_eq!(report.delivered, 1),
                Err(err) => panic!("round {round}: broadcast failed: {err}"),
            }
        }

        assert!(a.cluster().contains(&b.node_id()), "round {round}");
        assert!(b.cluster().contains(&a.node_id()), "round {round}");
        eventually(Duration::from_secs(10), || {
            at_a.lock().len() == PER_SIDE && at_b.lock().len() == PER_SIDE
        })
        .await;
        assert!(at_a.lock().iter().all(|r| r.from == b.node_id()));
        assert!(at_b.lock().iter().all(|r| r.from == a.node_id()));

        a.dispose().await;
        b.dispose().await;
    }
}

// -- Observers ---------------------------------------------------------------

#[tokio::test]
async fn test_observers_run_in_order_and_can_be_removed() {
    let a = make_node("tag1", "ClusterKey");
    let b = make_node("tag2", "ClusterKey");
    join(&a, &b);
    b.start_listening().await.unwrap();

    let calls = Arc::new(Mutex::new(Vec::new()));
    let mut ids = Vec::new();
    for n in 1..=3 {
        let calls = Arc::clone(&calls);
        ids.push(b.on_message_received(move |_, _, msg| {
            calls.lock().push((n, msg.message_type()));
        }));
    }

    a.cluster().broadcast_all(&raw(1, "first")).await.unwrap();
    eventually(Duration::from_secs(5), || calls.lock().len() == 3).await;
    assert_eq!(*calls.lock(), vec![(1, 1), (2, 1), (3, 1)]);

    assert!(b.remove_observer(ids[1]));
    calls.lock().clear();

    a.cluster().broadcast_all(&raw(2, "second")).await.unwrap();
    eventually(Duration::from_secs(5), || calls.lock().len() == 2).await;
    assert_eq!(*calls.lock(), vec![(1, 2), (3, 2)]);

    a.dispose().await;
    b.dispose().await;
}

#[tokio::test]
async fn test_messages_from_one_sender_arrive_in_order() {
    let a = make_node("tag1", "ClusterKey");
    let b = make_node("tag2", "ClusterKey");
    join(&a, &b);
    let at_b = record(&b);
    b.start_listening().await.unwrap();

    for i in 0..100u32 {
        a.cluster()
            .send_to(&b.node_id(), &raw(4, i.to_be_bytes().to_vec()))
            .await
            .unwrap();
    }

    eventually(Duration::from_secs(5), || at_b.lock().len() == 100).await;
    let order: Vec<u32> = at_b
        .lock()
        .iter()
        .map(|r| u32::from_be_bytes(r.payload[..4].try_into().unwrap()))
        .collect();
    assert_eq!(order, (0..100).collect::<Vec<_>>());

    a.dispose().await;
    b.dispose().await;
}

// -- Lifecycle ---------------------------------------------------------------

#[tokio::test]
async fn test_dispose_removes_member_from_peer() {
    let a = make_node("tag1", "ClusterKey");
    let b = make_node("tag2", "ClusterKey");
    join(&a, &b);
    b.start_listening().await.unwrap();

    a.cluster().connect(&b.node_id()).await.unwrap();
    assert!(a.cluster().contains(&b.node_id()));

    b.dispose().await;
    b.dispose().await;
    assert!(b.is_disposed());

    eventually(Duration::from_secs(5), || !a.cluster().contains(&b.node_id())).await;

    let err = b.cluster().broadcast_all(&raw(1, "late")).await.unwrap_err();
    assert!(matches!(err, NetworkError::NotRunning));

    a.dispose().await;
}

#[tokio::test]
async fn test_send_to_unknown_member_fails() {
    let a = make_node("tag1", "ClusterKey");
    let err = a
        .cluster()
        .send_to(&NodeId::generate(), &raw(1, "lost"))
        .await
        .unwrap_err();
    assert!(matches!(err, NetworkError::Membership(_)));
    a.dispose().await;
}
