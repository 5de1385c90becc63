mod common;

use std::sync::Arc;

use callmesh::call::CallType;
use callmesh::peer::types::SessionDescription;
use callmesh::signaling::{
    ChannelMessage, HubStats, LocalHub, RoomPresence, SignalingChannel, SignalingMessage,
};

use common::*;

fn offer(from: &str, to: &str) -> SignalingMessage {
    SignalingMessage::offer(from, to, Some("c-1"), CallType::Voice, SessionDescription::offer("v=0\r\n"))
}

#[tokio::test]
async fn publish_reaches_everyone_but_the_sender() {
    let hub = hub();
    let (alice, mut alice_rx) = raw_client(&hub, "calls", "alice").await;
    let (_bob, mut bob_rx) = raw_client(&hub, "calls", "bob").await;
    let (_carol, mut carol_rx) = raw_client(&hub, "calls", "carol").await;

    alice.send(offer("alice", "bob")).await.unwrap();
    settle().await;

    // Addressing is left to the receiver; the channel fans out to the scope.
    assert_eq!(drain(&mut bob_rx), vec![ChannelMessage::Signal(offer("alice", "bob"))]);
    assert_eq!(drain(&mut carol_rx).len(), 1);
    assert!(drain(&mut alice_rx).is_empty());
    assert_eq!(
        hub.stats(),
        HubStats {
            messages_sent: 1,
            deliveries: 2,
            deliveries_dropped: 0,
        }
    );
}

#[tokio::test]
async fn scopes_are_isolated() {
    let hub = hub();
    let (alice, _) = raw_client(&hub, "room:a", "alice").await;
    let (_bob, mut bob_rx) = raw_client(&hub, "room:a", "bob").await;
    let (_carol, mut carol_rx) = raw_client(&hub, "room:b", "carol").await;

    alice.send(RoomPresence::joined("alice", true, "n-1")).await.unwrap();
    settle().await;

    assert_eq!(
        drain(&mut bob_rx),
        vec![ChannelMessage::Presence(RoomPresence::joined("alice", true, "n-1"))]
    );
    assert!(drain(&mut carol_rx).is_empty());
    assert_eq!(hub.participants("room:a").await, vec!["alice", "bob"]);
}

#[tokio::test]
async fn unsubscribed_client_stops_receiving() {
    let hub = hub();
    let (alice, _) = raw_client(&hub, "calls", "alice").await;
    let (bob, mut bob_rx) = raw_client(&hub, "calls", "bob").await;

    bob.unsubscribe().await;
    assert_eq!(hub.subscriber_count("calls").await, 1);

    alice.send(offer("alice", "bob")).await.unwrap();
    settle().await;
    assert!(drain(&mut bob_rx).is_empty());

    alice.unsubscribe().await;
    assert_eq!(hub.subscriber_count("calls").await, 0);
}

#[tokio::test]
async fn sending_requires_a_live_subscription() {
    let hub = hub();
    let channel: Arc<dyn SignalingChannel> = hub.clone();
    assert!(channel.publish(42, "calls", "{}".into()).await.is_err());

    let (_alice, _) = raw_client(&hub, "calls", "alice").await;
    assert!(channel.publish(42, "calls", "{}".into()).await.is_err());
}

#[tokio::test]
async fn undecodable_payloads_are_skipped() {
    let hub = hub();
    let channel: Arc<dyn SignalingChannel> = hub.clone();
    let raw = channel.subscribe("calls", "mallory").await.unwrap();
    let (_bob, mut bob_rx) = raw_client(&hub, "calls", "bob").await;

    channel
        .publish(raw.id, "calls", "not json".into())
        .await
        .unwrap();
    channel
        .publish(raw.id, "calls", r#"{"type":"wave","from":"mallory","to":"bob"}"#.into())
        .await
        .unwrap();
    let valid = serde_json::to_string(&ChannelMessage::from(offer("mallory", "bob"))).unwrap();
    channel.publish(raw.id, "calls", valid).await.unwrap();
    settle().await;

    assert_eq!(drain(&mut bob_rx), vec![ChannelMessage::Signal(offer("mallory", "bob"))]);
}

#[tokio::test]
async fn closed_subscribers_are_pruned_on_publish() {
    let hub = hub();
    let channel: Arc<dyn SignalingChannel> = hub.clone();
    let (alice, _) = raw_client(&hub, "calls", "alice").await;
    let gone = channel.subscribe("calls", "ghost").await.unwrap();
    drop(gone.inbox);

    alice.send(offer("alice", "ghost")).await.unwrap();
    assert_eq!(hub.subscriber_count("calls").await, 1);
    assert_eq!(hub.stats().deliveries_dropped, 1);
}

#[tokio::test]
async fn duplicating_hub_delivers_twice() {
    let hub = Arc::new(LocalHub::duplicating());
    let (alice, _) = raw_client(&hub, "calls", "alice").await;
    let (_bob, mut bob_rx) = raw_client(&hub, "calls", "bob").await;

    alice.send(offer("alice", "bob")).await.unwrap();
    settle().await;

    assert_eq!(drain(&mut bob_rx).len(), 2);
    assert_eq!(hub.stats().deliveries, 2);
    assert_eq!(hub.stats().messages_sent, 1);
}
