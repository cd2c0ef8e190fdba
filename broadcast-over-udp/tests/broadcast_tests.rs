//! End-to-end tests for URB, FIFO, and causal broadcast.
//!
//! Each test runs a whole group of processes in-process, every one on its
//! own loopback socket, and checks what each process delivered.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;

use broadcast_over_udp::{
    config::{AddressBook, LinkConfig},
    node::{Broadcaster, Delivery, Mode, Node},
    output::LogEvent,
    packet::{MessageId, PeerId},
    simulator::SimulatorConfig,
    socket::Socket,
};

/// Bind a socket to an OS-assigned port on loopback.
async fn ephemeral() -> Socket {
    let addr = "127.0.0.1:0".parse().unwrap();
    Socket::bind(addr).await.expect("bind failed")
}

/// Address book for `sockets`, ids assigned 1..=N in order.
fn book_for(sockets: &[&Socket]) -> AddressBook {
    AddressBook::from_addrs(
        sockets
            .iter()
            .enumerate()
            .map(|(i, s)| (i as PeerId + 1, s.local_addr)),
    )
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

async fn collect(node: &mut Node, count: usize) -> Vec<Delivery> {
    let mut out = Vec::with_capacity(count);
    while out.len() < count {
        match node.deliveries.recv().await {
            Some(delivery) => out.push(delivery),
            None => break,
        }
    }
    out
}

fn by_sender(deliveries: &[Delivery]) -> BTreeMap<PeerId, Vec<u64>> {
    let mut map: BTreeMap<PeerId, Vec<u64>> = BTreeMap::new();
    for d in deliveries {
        map.entry(d.sender).or_default().push(d.seq);
    }
    map
}

// ---------------------------------------------------------------------------
// Test 1: three processes, FIFO, no loss
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_fifo_three_processes_in_order() {
    const M: u64 = 5;

    let sockets = vec![ephemeral().await, ephemeral().await, ephemeral().await];
    let book = book_for(&sockets.iter().collect::<Vec<_>>());

    let mut nodes = Vec::new();
    for (i, socket) in sockets.into_iter().enumerate() {
        let (node, finished) = Node::start(
            socket,
            book.clone(),
            i as PeerId + 1,
            LinkConfig::default(),
            M,
            Mode::Fifo,
        );
        nodes.push((node, finished));
    }

    for (node, finished) in nodes.iter_mut() {
        let got = timeout(Duration::from_secs(10), collect(node, 3 * M as usize))
            .await
            .expect("deliveries timed out");
        let expected: Vec<u64> = (1..=M).collect();
        let per_sender = by_sender(&got);
        assert_eq!(per_sender.len(), 3, "process {}: {got:?}", node.local_id);
        for seqs in per_sender.values() {
            assert_eq!(seqs, &expected, "process {}", node.local_id);
        }
        assert_eq!(finished.await.unwrap(), M);
    }

    // Nothing beyond the 15 expected deliveries shows up.
    tokio::time::sleep(Duration::from_millis(200)).await;
    for (node, _) in nodes.iter_mut() {
        assert!(node.deliveries.try_recv().is_err());
        let broadcasts = node
            .log
            .events()
            .iter()
            .filter(|e| matches!(e, LogEvent::Broadcast { .. }))
            .count();
        assert_eq!(broadcasts, M as usize);
        assert_eq!(node.log.len(), (M + 3 * M) as usize);
    }
}

// ---------------------------------------------------------------------------
// Test 2: 30% loss on one process; still exactly once, in order
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_fifo_survives_lossy_peer() {
    const M: u64 = 20;

    let lossy = Socket::bind_with_faults(
        "127.0.0.1:0".parse().unwrap(),
        SimulatorConfig::lossy(0.3, 5),
    )
    .await
    .unwrap();
    let sockets = vec![lossy, ephemeral().await, ephemeral().await];
    let book = book_for(&sockets.iter().collect::<Vec<_>>());

    let mut nodes = Vec::new();
    for (i, socket) in sockets.into_iter().enumerate() {
        let (node, _finished) = Node::start(
            socket,
            book.clone(),
            i as PeerId + 1,
            fast_config(),
            M,
            Mode::Fifo,
        );
        nodes.push(node);
    }

    let expected: Vec<u64> = (1..=M).collect();
    for node in nodes.iter_mut() {
        let got = timeout(Duration::from_secs(60), collect(node, 3 * M as usize))
            .await
            .expect("lossy deliveries timed out");
        let unique: BTreeSet<MessageId> = got.iter().copied().collect();
        assert_eq!(unique.len(), got.len(), "duplicate delivery at {}", node.local_id);
        for seqs in by_sender(&got).values() {
            assert_eq!(seqs, &expected);
        }
    }

    let stats = nodes[0].link.stats();
    assert!(stats.retransmissions > 0, "stats: {stats:?}");
    assert!(stats.timeout_shrinks > 0, "stats: {stats:?}");
}

// ---------------------------------------------------------------------------
// Test 3: a silent minority does not block delivery
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_urb_delivers_with_silent_minority() {
    const M: u64 = 3;

    let a = ephemeral().await;
    let b = ephemeral().await;
    // Bound but never serviced: behaves like a crashed process.
    let silent = ephemeral().await;
    let book = book_for(&[&a, &b, &silent]);

    let (mut node_a, _) = Node::start(a, book.clone(), 1, fast_config(), M, Mode::Fifo);
    let (mut node_b, _) = Node::start(b, book, 2, fast_config(), M, Mode::Fifo);

    for node in [&mut node_a, &mut node_b] {
        let got = timeout(Duration::from_secs(10), collect(node, 2 * M as usize))
            .await
            .expect("majority deliveries timed out");
        let per_sender = by_sender(&got);
        assert_eq!(per_sender.get(&1), Some(&vec![1, 2, 3]));
        assert_eq!(per_sender.get(&2), Some(&vec![1, 2, 3]));
    }
    drop(silent);
}

// ---------------------------------------------------------------------------
// Test 4: causal order with influence set {2} at process 1
// ---------------------------------------------------------------------------

async fn wait_for(node: &mut Node, target: MessageId, seen: &mut Vec<Delivery>) {
    while !seen.contains(&target) {
        let delivery = node.deliveries.recv().await.expect("node stopped");
        seen.push(delivery);
    }
}

#[tokio::test]
async fn test_causal_influence_orders_deliveries() {
    let sockets = vec![ephemeral().await, ephemeral().await, ephemeral().await];
    let book = book_for(&sockets.iter().collect::<Vec<_>>());

    let mut nodes: Vec<(Node, Broadcaster)> = Vec::new();
    for (i, socket) in sockets.into_iter().enumerate() {
        let id = i as PeerId + 1;
        let influences = if id == 1 {
            BTreeSet::from([2])
        } else {
            BTreeSet::new()
        };
        nodes.push(Node::assemble(
            Arc::new(socket),
            book.clone(),
            id,
            LinkConfig::default(),
            Mode::Causal { influences },
        ));
    }

    let first = MessageId::new(2, 1);
    let second = MessageId::new(1, 1);
    let mut seen: Vec<Vec<Delivery>> = vec![Vec::new(); 3];

    // Process 2 broadcasts; process 1 delivers it before broadcasting.
    assert_eq!(nodes[1].1.broadcast_next().await.unwrap(), 1);
    timeout(Duration::from_secs(10), wait_for(&mut nodes[0].0, first, &mut seen[0]))
        .await
        .expect("process 1 never delivered 2's message");
    assert_eq!(nodes[0].1.broadcast_next().await.unwrap(), 1);

    for (i, (node, _)) in nodes.iter_mut().enumerate() {
        timeout(Duration::from_secs(10), wait_for(node, second, &mut seen[i]))
            .await
            .expect("1's message never delivered");
        timeout(Duration::from_secs(10), wait_for(node, first, &mut seen[i]))
            .await
            .expect("2's message never delivered");

        let pos = |id: MessageId| seen[i].iter().position(|d| *d == id).unwrap();
        assert!(
            pos(first) < pos(second),
            "process {} delivered {:?}",
            node.local_id,
            seen[i]
        );
    }

    // Process 1's own log shows the delivery that shaped its broadcast.
    let events = nodes[0].0.log.events();
    let delivered = events
        .iter()
        .position(|e| *e == LogEvent::Deliver { sender: 2, seq: 1 })
        .unwrap();
    let broadcast = events
        .iter()
        .position(|e| *e == LogEvent::Broadcast { seq: 1 })
        .unwrap();
    assert!(delivered < broadcast);
}
