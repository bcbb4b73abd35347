//! Integration tests for the star overlay network.
//!
//! These build real pools on one in-process exchange and verify the full
//! routing pipeline: relay through the hub, sender-identity preservation,
//! membership enforcement and network multiplexing.

use std::sync::Arc;

use scribe_collab::overlay::{NetworkEvent, StarNetwork};
use scribe_collab::pool::{MemoryExchange, MemoryPeerPool, PeerPool};
use scribe_collab::protocol::PeerId;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, Duration};

fn pool(exchange: &MemoryExchange, peer: &str) -> Arc<MemoryPeerPool> {
    Arc::new(exchange.register(peer))
}

/// Await the next message and assert sender + payload.
async fn expect_message(
    rx: &mut mpsc::UnboundedReceiver<NetworkEvent>,
    sender: &str,
    payload: &str,
) {
    let event = timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for message")
        .expect("event channel closed");
    let NetworkEvent::Message {
        sender: got_sender,
        payload: got_payload,
    } = event;
    assert_eq!(got_sender, PeerId::new(sender));
    assert_eq!(got_payload, payload.as_bytes());
}

/// Collect `n` messages, returned as (sender, payload) pairs sorted for
/// comparison — ordering across different sources is not guaranteed.
async fn collect_messages(
    rx: &mut mpsc::UnboundedReceiver<NetworkEvent>,
    n: usize,
) -> Vec<(String, String)> {
    let mut messages = Vec::with_capacity(n);
    for _ in 0..n {
        let event = timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out collecting messages")
            .expect("event channel closed");
        let NetworkEvent::Message { sender, payload } = event;
        messages.push((sender.to_string(), String::from_utf8(payload).unwrap()));
    }
    messages.sort();
    messages
}

/// Assert that nothing arrives within a settle window.
async fn assert_silent(rx: &mut mpsc::UnboundedReceiver<NetworkEvent>) {
    sleep(Duration::from_millis(100)).await;
    assert!(rx.try_recv().is_err(), "expected no message");
}

#[tokio::test]
async fn test_unicast_sends_to_only_one_member() {
    let exchange = MemoryExchange::new();
    let pool1 = pool(&exchange, "peer-1");
    let pool2 = pool(&exchange, "peer-2");
    let pool3 = pool(&exchange, "peer-3");

    let mut hub = StarNetwork::hub("network-a", pool1);
    let mut spoke1 = StarNetwork::spoke("network-a", pool2);
    let mut spoke2 = StarNetwork::spoke("network-a", pool3);
    let mut hub_rx = hub.take_event_rx().unwrap();
    let mut spoke1_rx = spoke1.take_event_rx().unwrap();
    let mut spoke2_rx = spoke2.take_event_rx().unwrap();
    spoke1.connect_to("peer-1").await.unwrap();
    spoke2.connect_to("peer-1").await.unwrap();
    // Let the hub register both memberships before it originates traffic.
    sleep(Duration::from_millis(50)).await;

    spoke1.unicast("peer-3", "spoke-to-spoke");
    spoke2.unicast("peer-1", "spoke-to-hub");
    hub.unicast("peer-2", "hub-to-spoke");

    // Relay preserves identity: the spoke-to-spoke message arrives tagged
    // with peer-2, not the hub that forwarded it.
    expect_message(&mut spoke2_rx, "peer-2", "spoke-to-spoke").await;
    expect_message(&mut hub_rx, "peer-3", "spoke-to-hub").await;
    expect_message(&mut spoke1_rx, "peer-1", "hub-to-spoke").await;

    assert_silent(&mut hub_rx).await;
    assert_silent(&mut spoke1_rx).await;
    assert_silent(&mut spoke2_rx).await;
}

#[tokio::test]
async fn test_unicast_to_non_member_is_dropped() {
    let exchange = MemoryExchange::new();
    let pool1 = pool(&exchange, "peer-1");
    let pool2 = pool(&exchange, "peer-2");
    let pool3 = pool(&exchange, "peer-3");

    let _hub = StarNetwork::hub("network-a", pool1.clone());
    let spoke = StarNetwork::spoke("network-a", pool2);
    spoke.connect_to("peer-1").await.unwrap();

    // peer-3 has a pool connection to the hub but never joined the network.
    pool1.connect_to(pool3.local_peer()).await.unwrap();
    let mut peer3_frames = pool3.attach();

    spoke.unicast("peer-3", "this should never arrive");
    sleep(Duration::from_millis(100)).await;
    assert!(peer3_frames.try_recv().is_err());

    // The direct pool path still works — only the overlay refused routing.
    pool1.send(pool3.local_peer(), b"direct message".to_vec());
    let frame = timeout(Duration::from_secs(2), peer3_frames.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(frame.sender, PeerId::new("peer-1"));
    assert_eq!(frame.payload, b"direct message");
}

#[tokio::test]
async fn test_spoke_broadcast_reaches_all_other_members_exactly_once() {
    let exchange = MemoryExchange::new();
    let pool1 = pool(&exchange, "peer-1");
    let pool2 = pool(&exchange, "peer-2");
    let pool3 = pool(&exchange, "peer-3");

    let mut hub = StarNetwork::hub("network-a", pool1);
    let mut spoke1 = StarNetwork::spoke("network-a", pool2);
    let mut spoke2 = StarNetwork::spoke("network-a", pool3);
    let mut hub_rx = hub.take_event_rx().unwrap();
    let mut spoke1_rx = spoke1.take_event_rx().unwrap();
    let mut spoke2_rx = spoke2.take_event_rx().unwrap();
    spoke1.connect_to("peer-1").await.unwrap();
    spoke2.connect_to("peer-1").await.unwrap();

    spoke1.broadcast("hello");

    // The hub is itself a broadcast recipient.
    expect_message(&mut hub_rx, "peer-2", "hello").await;
    expect_message(&mut spoke2_rx, "peer-2", "hello").await;

    // The sender never observes its own broadcast, and nobody gets copies.
    assert_silent(&mut spoke1_rx).await;
    assert_silent(&mut hub_rx).await;
    assert_silent(&mut spoke2_rx).await;
}

#[tokio::test]
async fn test_hub_broadcast_reaches_every_member() {
    let exchange = MemoryExchange::new();
    let pool1 = pool(&exchange, "peer-1");
    let pool2 = pool(&exchange, "peer-2");
    let pool3 = pool(&exchange, "peer-3");

    let hub = StarNetwork::hub("network-a", pool1);
    let mut spoke1 = StarNetwork::spoke("network-a", pool2);
    let mut spoke2 = StarNetwork::spoke("network-a", pool3);
    let mut spoke1_rx = spoke1.take_event_rx().unwrap();
    let mut spoke2_rx = spoke2.take_event_rx().unwrap();
    spoke1.connect_to("peer-1").await.unwrap();
    spoke2.connect_to("peer-1").await.unwrap();
    sleep(Duration::from_millis(50)).await;

    hub.broadcast("from-the-hub");

    expect_message(&mut spoke1_rx, "peer-1", "from-the-hub").await;
    expect_message(&mut spoke2_rx, "peer-1", "from-the-hub").await;
}

#[tokio::test]
async fn test_broadcast_excludes_pool_neighbors_outside_the_network() {
    let exchange = MemoryExchange::new();
    let pool1 = pool(&exchange, "peer-1");
    let pool2 = pool(&exchange, "peer-2");
    let pool3 = pool(&exchange, "peer-3");
    let pool4 = pool(&exchange, "peer-4");

    let mut hub = StarNetwork::hub("some-network-id", pool1.clone());
    let mut spoke1 = StarNetwork::spoke("some-network-id", pool2);
    let mut spoke2 = StarNetwork::spoke("some-network-id", pool3);
    let mut hub_rx = hub.take_event_rx().unwrap();
    let mut spoke2_rx = spoke2.take_event_rx().unwrap();
    spoke1.connect_to("peer-1").await.unwrap();
    spoke2.connect_to("peer-1").await.unwrap();

    // peer-4 is connected to the hub at the pool level only.
    pool4.connect_to(pool1.local_peer()).await.unwrap();
    let mut peer4_frames = pool4.attach();

    spoke1.broadcast("hello");
    expect_message(&mut hub_rx, "peer-2", "hello").await;
    expect_message(&mut spoke2_rx, "peer-2", "hello").await;

    // Not a member — never receives the broadcast.
    sleep(Duration::from_millis(100)).await;
    assert!(peer4_frames.try_recv().is_err());

    let mut spoke1_rx = spoke1.take_event_rx().unwrap();
    assert_silent(&mut spoke1_rx).await;
}

#[tokio::test]
async fn test_networks_multiplex_without_leaking() {
    let exchange = MemoryExchange::new();
    let pool1 = pool(&exchange, "peer-1");
    let pool2 = pool(&exchange, "peer-2");
    let pool3 = pool(&exchange, "peer-3");

    // Three networks sharing the same three pools; network-c is hubbed on
    // peer-2 while a and b are hubbed on peer-1.
    let mut hub_a = StarNetwork::hub("network-a", pool1.clone());
    let mut spoke_a1 = StarNetwork::spoke("network-a", pool2.clone());
    let mut spoke_a2 = StarNetwork::spoke("network-a", pool3.clone());
    let mut hub_a_rx = hub_a.take_event_rx().unwrap();
    let mut spoke_a1_rx = spoke_a1.take_event_rx().unwrap();
    let mut spoke_a2_rx = spoke_a2.take_event_rx().unwrap();
    spoke_a1.connect_to("peer-1").await.unwrap();
    spoke_a2.connect_to("peer-1").await.unwrap();

    let mut hub_b = StarNetwork::hub("network-b", pool1.clone());
    let mut spoke_b1 = StarNetwork::spoke("network-b", pool2.clone());
    let mut spoke_b2 = StarNetwork::spoke("network-b", pool3.clone());
    let mut hub_b_rx = hub_b.take_event_rx().unwrap();
    let mut spoke_b1_rx = spoke_b1.take_event_rx().unwrap();
    let mut spoke_b2_rx = spoke_b2.take_event_rx().unwrap();
    spoke_b1.connect_to("peer-1").await.unwrap();
    spoke_b2.connect_to("peer-1").await.unwrap();

    let mut hub_c = StarNetwork::hub("network-c", pool2.clone());
    let mut spoke_c1 = StarNetwork::spoke("network-c", pool1.clone());
    let mut spoke_c2 = StarNetwork::spoke("network-c", pool3.clone());
    let mut hub_c_rx = hub_c.take_event_rx().unwrap();
    let mut spoke_c1_rx = spoke_c1.take_event_rx().unwrap();
    let mut spoke_c2_rx = spoke_c2.take_event_rx().unwrap();
    spoke_c1.connect_to("peer-2").await.unwrap();
    spoke_c2.connect_to("peer-2").await.unwrap();
    sleep(Duration::from_millis(50)).await;

    hub_a.broadcast("a1");
    spoke_a1.broadcast("a2");
    spoke_b1.broadcast("b");
    spoke_c1.broadcast("c");

    expect_message(&mut hub_a_rx, "peer-2", "a2").await;
    expect_message(&mut spoke_a1_rx, "peer-1", "a1").await;
    let a2_inbox = collect_messages(&mut spoke_a2_rx, 2).await;
    assert_eq!(
        a2_inbox,
        vec![
            ("peer-1".to_string(), "a1".to_string()),
            ("peer-2".to_string(), "a2".to_string()),
        ]
    );

    expect_message(&mut hub_b_rx, "peer-2", "b").await;
    expect_message(&mut spoke_b2_rx, "peer-2", "b").await;

    expect_message(&mut hub_c_rx, "peer-1", "c").await;
    expect_message(&mut spoke_c2_rx, "peer-1", "c").await;

    // No cross-network leakage anywhere.
    assert_silent(&mut hub_a_rx).await;
    assert_silent(&mut spoke_b1_rx).await;
    assert_silent(&mut spoke_c1_rx).await;
    assert_silent(&mut spoke_a2_rx).await;
    assert_silent(&mut spoke_b2_rx).await;
    assert_silent(&mut spoke_c2_rx).await;
}

#[tokio::test]
async fn test_disposed_network_stops_receiving() {
    let exchange = MemoryExchange::new();
    let pool1 = pool(&exchange, "peer-1");
    let pool2 = pool(&exchange, "peer-2");

    let hub = StarNetwork::hub("network-a", pool1);
    let mut spoke = StarNetwork::spoke("network-a", pool2);
    let mut spoke_rx = spoke.take_event_rx().unwrap();
    spoke.connect_to("peer-1").await.unwrap();
    sleep(Duration::from_millis(50)).await;

    // Prove the route works, then dispose the spoke.
    hub.broadcast("before");
    expect_message(&mut spoke_rx, "peer-1", "before").await;

    spoke.dispose();
    hub.broadcast("after");
    assert_silent(&mut spoke_rx).await;
}
