//! Integration tests for the reliable link.
//!
//! Each test spins up in-process links talking over the loopback interface;
//! every link runs its own send, receive, and ack-checker tasks.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;

use broadcast_over_udp::{
    config::{AddressBook, LinkConfig},
    link::ReliableLink,
    packet::{BroadcastMessage, MessageId, TrafficClass, WireMessage},
    simulator::SimulatorConfig,
    socket::Socket,
};

/// Bind a socket to an OS-assigned port on loopback.
async fn ephemeral() -> Socket {
    let addr = "127.0.0.1:0".parse().unwrap();
    Socket::bind(addr).await.expect("bind failed")
}

fn original(sender: u32, seq: u64) -> WireMessage {
    WireMessage::original(BroadcastMessage::new(MessageId::new(sender, seq), None))
}

fn fast_config() -> LinkConfig {
    LinkConfig {
        base_window: 4,
        initial_threshold: 16,
        initial_rto: Duration::from_millis(50),
        max_rto: Duration::from_millis(500),
        ..LinkConfig::default()
    }
}

/// Receive until `count` distinct messages arrived; fail on any duplicate.
async fn receive_exactly(link: &mut ReliableLink, count: usize) -> HashSet<WireMessage> {
    let mut got = HashSet::new();
    while got.len() < count {
        let message = link.deliveries.recv().await.expect("link closed");
        assert!(got.insert(message.clone()), "duplicate delivery of {message}");
    }
    got
}

// ---------------------------------------------------------------------------
// Test 1: one message, acked, window slides
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_link_delivers_and_acks() {
    let a = ephemeral().await;
    let b = ephemeral().await;
    let book = AddressBook::from_addrs([(1, a.local_addr), (2, b.local_addr)]);

    let link_a = ReliableLink::spawn(Arc::new(a), 1, book.clone(), fast_config());
    let mut link_b = ReliableLink::spawn(Arc::new(b), 2, book, fast_config());

    link_a.handle.send(original(1, 1), 2).unwrap();

    let got = timeout(Duration::from_secs(5), receive_exactly(&mut link_b, 1))
        .await
        .expect("delivery timed out");
    assert!(got.contains(&original(1, 1)));

    // The ack slides A's original-traffic window toward B.
    timeout(Duration::from_secs(5), async {
        loop {
            let snap = link_a.handle.window_snapshot(2, TrafficClass::Original).unwrap();
            if snap.lower > 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("window never slid");

    assert!(link_a.handle.stats().acks_received >= 1);
    assert!(link_a.handle.window_snapshot(1, TrafficClass::Original).is_none());
}

// ---------------------------------------------------------------------------
// Test 2: relays and originals keep separate windows
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_link_relay_class_has_own_window() {
    let a = ephemeral().await;
    let b = ephemeral().await;
    let book = AddressBook::from_addrs([(1, a.local_addr), (2, b.local_addr)]);

    let link_a = ReliableLink::spawn(Arc::new(a), 1, book.clone(), fast_config());
    let mut link_b = ReliableLink::spawn(Arc::new(b), 2, book, fast_config());

    // A relay of a message whose own seq lies far outside any window.
    let relayed = WireMessage::relay(1, BroadcastMessage::new(MessageId::new(3, 900), None));
    link_a.handle.send(relayed.clone(), 2).unwrap();
    link_a.handle.send(original(1, 1), 2).unwrap();

    let got = timeout(Duration::from_secs(5), receive_exactly(&mut link_b, 2))
        .await
        .expect("delivery timed out");
    assert!(got.contains(&relayed));
    assert!(got.contains(&original(1, 1)));
}

// ---------------------------------------------------------------------------
// Test 3: 30% loss on one side; everything still arrives exactly once
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_link_recovers_from_loss() {
    const COUNT: u64 = 40;

    let a = Socket::bind_with_faults(
        "127.0.0.1:0".parse().unwrap(),
        SimulatorConfig::lossy(0.3, 11),
    )
    .await
    .unwrap();
    let b = ephemeral().await;
    let book = AddressBook::from_addrs([(1, a.local_addr), (2, b.local_addr)]);

    let link_a = ReliableLink::spawn(Arc::new(a), 1, book.clone(), fast_config());
    let mut link_b = ReliableLink::spawn(Arc::new(b), 2, book, fast_config());

    for seq in 1..=COUNT {
        link_a.handle.send(original(1, seq), 2).unwrap();
    }

    let got = timeout(
        Duration::from_secs(30),
        receive_exactly(&mut link_b, COUNT as usize),
    )
    .await
    .expect("lossy delivery timed out");
    assert!((1..=COUNT).all(|seq| got.contains(&original(1, seq))));

    let stats = link_a.handle.stats();
    assert!(stats.retransmissions > 0, "stats: {stats:?}");
    assert!(stats.timeout_shrinks > 0, "stats: {stats:?}");
}

// ---------------------------------------------------------------------------
// Test 4: garbage on the socket is skipped
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_link_ignores_undecodable_datagrams() {
    let a = ephemeral().await;
    let b = ephemeral().await;
    let b_addr = b.local_addr;
    let book = AddressBook::from_addrs([(1, a.local_addr), (2, b_addr)]);

    let link_a = ReliableLink::spawn(Arc::new(a), 1, book.clone(), fast_config());
    let mut link_b = ReliableLink::spawn(Arc::new(b), 2, book, fast_config());

    let raw = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    raw.send_to(b"\xff\xfe garbage", b_addr).await.unwrap();
    raw.send_to(b"ACK nonsense", b_addr).await.unwrap();

    link_a.handle.send(original(1, 1), 2).unwrap();
    let got = timeout(Duration::from_secs(5), receive_exactly(&mut link_b, 1))
        .await
        .expect("delivery timed out");
    assert!(got.contains(&original(1, 1)));
}

// ---------------------------------------------------------------------------
// Test 5: an unresolved peer is skipped, the rest keep working
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_link_skips_peer_without_address() {
    let a = ephemeral().await;
    let b = ephemeral().await;
    let book_a = AddressBook::from_addrs([(1, a.local_addr), (2, b.local_addr)]);

    let link_a = ReliableLink::spawn(Arc::new(a), 1, book_a.clone(), fast_config());
    let mut link_b = ReliableLink::spawn(Arc::new(b), 2, book_a, fast_config());

    // Peer 9 is not in the book at all.
    link_a.handle.send(original(1, 1), 9).unwrap();
    link_a.handle.send(original(1, 1), 2).unwrap();

    let got = timeout(Duration::from_secs(5), receive_exactly(&mut link_b, 1))
        .await
        .expect("delivery timed out");
    assert!(got.contains(&original(1, 1)));
}

// ---------------------------------------------------------------------------
// Test 6: every datagram doubled; duplicate acks shrink, delivery stays once
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_link_duplicate_acks_shrink_window() {
    const COUNT: u64 = 30;

    let doubling = |seed| SimulatorConfig {
        duplicate_rate: 1.0,
        seed,
        ..SimulatorConfig::default()
    };
    let a = Socket::bind_with_faults("127.0.0.1:0".parse().unwrap(), doubling(5))
        .await
        .unwrap();
    let b = Socket::bind_with_faults("127.0.0.1:0".parse().unwrap(), doubling(6))
        .await
        .unwrap();
    let book = AddressBook::from_addrs([(1, a.local_addr), (2, b.local_addr)]);

    let link_a = ReliableLink::spawn(Arc::new(a), 1, book.clone(), fast_config());
    let mut link_b = ReliableLink::spawn(Arc::new(b), 2, book, fast_config());

    for seq in 1..=COUNT {
        link_a.handle.send(original(1, seq), 2).unwrap();
    }

    let got = timeout(
        Duration::from_secs(10),
        receive_exactly(&mut link_b, COUNT as usize),
    )
    .await
    .expect("delivery timed out");
    assert!((1..=COUNT).all(|seq| got.contains(&original(1, seq))));

    timeout(Duration::from_secs(5), async {
        while link_a.handle.stats().duplicate_ack_shrinks == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("no duplicate-ack shrink");

    // The second copy of every datagram was deduplicated.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(link_b.deliveries.try_recv().is_err());
    assert!(link_a.handle.stats().acks_received > COUNT);
}
