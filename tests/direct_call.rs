mod common;

use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;

use callmesh::call::{CallStatus, CallType, Direction};
use callmesh::collab::StatusCue;
use callmesh::config::CallConfig;
use callmesh::error::CallError;
use callmesh::events::CallEvent;
use callmesh::media::MediaKind;
use callmesh::peer::state::PeerState;
use callmesh::peer::types::SessionDescription;
use callmesh::signaling::{ChannelMessage, LocalHub, SignalKind, SignalingMessage};

use common::*;

const RINGING_OUT: CallStatus = CallStatus::Ringing(Direction::Outgoing);
const RINGING_IN: CallStatus = CallStatus::Ringing(Direction::Incoming);

#[tokio::test(start_paused = true)]
async fn unanswered_call_ends_as_no_answer() {
    let hub = hub();
    let mut alice = spawn(&hub, "alice").await;
    let bob = spawn(&hub, "bob").await;

    alice.handle.start_call("bob", CallType::Voice).await.unwrap();
    settle().await;
    assert_eq!(alice.status().await, RINGING_OUT);
    assert_eq!(bob.status().await, RINGING_IN);

    sleep(Duration::from_secs(29)).await;
    assert_eq!(alice.status().await, RINGING_OUT);

    sleep(Duration::from_secs(1)).await;
    assert_eq!(alice.status().await, CallStatus::NoAnswer);
    assert_eq!(bob.status().await, CallStatus::Ended);
    assert!(alice.factory.latest("bob").is_closed());

    let events = alice.drain_events();
    assert_eq!(outcomes(&events), vec!["no answer".to_string()]);

    let entries = alice.log.entries();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].status, CallStatus::NoAnswer);
    assert_eq!(entries[0].duration_secs, 0);

    sleep(Duration::from_secs(2)).await;
    assert_eq!(alice.status().await, CallStatus::Idle);
    assert_eq!(bob.status().await, CallStatus::Idle);
}

#[tokio::test(start_paused = true)]
async fn accepted_call_logs_its_duration() {
    let hub = hub();
    let mut alice = spawn(&hub, "alice").await;
    let mut bob = spawn(&hub, "bob").await;

    alice.handle.start_call("bob", CallType::Video).await.unwrap();
    settle().await;
    sleep(Duration::from_secs(3)).await;
    bob.handle.accept().await.unwrap();
    settle().await;

    assert_eq!(alice.status().await, CallStatus::Connected);
    assert_eq!(bob.status().await, CallStatus::Connected);

    let alice_view = alice.snapshot().await;
    let bob_view = bob.snapshot().await;
    let sas = alice_view.peer("bob").unwrap().safety_number.clone();
    assert!(sas.is_some());
    assert_eq!(sas, bob_view.peer("alice").unwrap().safety_number);
    assert!(bob_view.peer("alice").unwrap().has_remote_stream);
    assert_eq!(alice_view.peer("bob").unwrap().state, PeerState::Connected);

    let bob_events = bob.drain_events();
    let stream = bob_events
        .iter()
        .find_map(|e| match e {
            CallEvent::RemoteStream { peer_id, stream } if peer_id == "alice" => Some(stream.clone()),
            _ => None,
        })
        .expect("bob sees alice's stream");
    assert!(stream.has_kind(MediaKind::Audio));
    assert!(stream.has_kind(MediaKind::Video));

    // Hang up at t = 65 s.
    sleep(Duration::from_secs(62)).await;
    let ticks = alice
        .drain_events()
        .into_iter()
        .filter(|e| matches!(e, CallEvent::Duration { .. }))
        .count();
    assert!(ticks >= 60, "expected a tick per second, got {ticks}");

    alice.handle.hang_up().await.unwrap();
    settle().await;
    assert_eq!(alice.status().await, CallStatus::Ended);
    assert_eq!(bob.status().await, CallStatus::Ended);

    let entries = alice.log.entries();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].caller_id, "alice");
    assert_eq!(entries[0].receiver_id, "bob");
    assert_eq!(entries[0].call_type, CallType::Video);
    assert!((60..=65).contains(&entries[0].duration_secs), "{:?}", entries[0]);
    assert!(bob.log.entries().is_empty());
}

#[tokio::test(start_paused = true)]
async fn transport_loss_ends_the_call() {
    let hub = hub();
    let mut alice = spawn(&hub, "alice").await;
    let bob = spawn(&hub, "bob").await;

    alice.handle.start_call("bob", CallType::Voice).await.unwrap();
    settle().await;
    bob.handle.accept().await.unwrap();
    settle().await;
    sleep(Duration::from_secs(10)).await;

    alice.factory.latest("bob").fail();
    settle().await;

    assert_eq!(alice.status().await, CallStatus::Ended);
    assert_eq!(bob.status().await, CallStatus::Ended);
    assert!(outcomes(&alice.drain_events()).contains(&"call failed".to_string()));

    let entries = alice.log.entries();
    assert_eq!(entries.len(), 1);
    assert!(entries[0].duration_secs >= 10);
}

#[tokio::test(start_paused = true)]
async fn disconnect_grace_allows_recovery() {
    let hub = hub();
    let config = CallConfig {
        disconnect_grace_ms: 5_000,
        ..CallConfig::default()
    };
    let alice = spawn_with(&hub, "alice", config.clone(), |b| b).await;
    let bob = spawn_with(&hub, "bob", config, |b| b).await;

    alice.handle.start_call("bob", CallType::Voice).await.unwrap();
    settle().await;
    bob.handle.accept().await.unwrap();
    settle().await;

    let transport = alice.factory.latest("bob");
    transport.disconnect();
    settle().await;
    assert_eq!(alice.status().await, CallStatus::Connected);

    sleep(Duration::from_secs(2)).await;
    transport.reconnect();
    sleep(Duration::from_secs(10)).await;
    assert_eq!(alice.status().await, CallStatus::Connected);

    transport.disconnect();
    sleep(Duration::from_secs(6)).await;
    assert_eq!(alice.status().await, CallStatus::Ended);
    assert_eq!(bob.status().await, CallStatus::Ended);
}

#[tokio::test(start_paused = true)]
async fn only_one_call_at_a_time() {
    let hub = hub();
    let alice = spawn(&hub, "alice").await;
    let bob = spawn(&hub, "bob").await;
    let mut carol = spawn(&hub, "carol").await;

    alice.handle.start_call("bob", CallType::Voice).await.unwrap();
    settle().await;

    assert!(matches!(
        alice.handle.start_call("carol", CallType::Voice).await,
        Err(CallError::Busy)
    ));
    assert!(matches!(
        alice.handle.start_call("alice", CallType::Voice).await,
        Err(CallError::SelfCall)
    ));

    carol.handle.start_call("bob", CallType::Voice).await.unwrap();
    settle().await;

    assert_eq!(carol.status().await, CallStatus::Rejected);
    assert!(outcomes(&carol.drain_events()).contains(&"call declined".to_string()));
    assert_eq!(bob.status().await, RINGING_IN);
    assert_eq!(bob.snapshot().await.peer_id.as_deref(), Some("alice"));
    assert_eq!(bob.factory.created(), 0);
}

#[tokio::test(start_paused = true)]
async fn answer_while_idle_is_ignored() {
    let hub = hub();
    let alice = spawn(&hub, "alice").await;
    let (mallory, _inbox) = raw_client(&hub, "calls", "mallory").await;

    mallory
        .send(SignalingMessage::answer(
            "mallory",
            "alice",
            Some("c-1"),
            SessionDescription::answer("v=0\r\n"),
        ))
        .await
        .unwrap();
    mallory
        .send(SignalingMessage::reject("mallory", "alice", Some("c-1")))
        .await
        .unwrap();
    settle().await;

    assert_eq!(alice.status().await, CallStatus::Idle);
    assert_eq!(alice.factory.created(), 0);
}

#[tokio::test(start_paused = true)]
async fn declined_call_reports_rejection() {
    let hub = hub();
    let mut alice = spawn(&hub, "alice").await;
    let bob = spawn(&hub, "bob").await;

    alice.handle.start_call("bob", CallType::Voice).await.unwrap();
    settle().await;
    bob.handle.reject().await.unwrap();
    settle().await;

    assert_eq!(alice.status().await, CallStatus::Rejected);
    assert_eq!(bob.status().await, CallStatus::Ended);
    assert_eq!(outcomes(&alice.drain_events()), vec!["call declined".to_string()]);
    assert_eq!(alice.log.entries()[0].status, CallStatus::Rejected);

    assert_eq!(
        alice.notifier.cues(),
        vec![StatusCue::RingingOutgoing, StatusCue::Rejected]
    );
    sleep(Duration::from_secs(2)).await;
    assert_eq!(alice.notifier.cues().last(), Some(&StatusCue::Idle));
}

#[tokio::test(start_paused = true)]
async fn caller_cancel_stops_the_ringing() {
    let hub = hub();
    let alice = spawn(&hub, "alice").await;
    let bob = spawn(&hub, "bob").await;

    alice.handle.start_call("bob", CallType::Voice).await.unwrap();
    settle().await;
    alice.handle.hang_up().await.unwrap();
    settle().await;

    assert_eq!(alice.status().await, CallStatus::Ended);
    assert_eq!(bob.status().await, CallStatus::Ended);
    assert!(matches!(bob.handle.accept().await, Err(CallError::NoActiveCall)));

    // Back to idle, a new call goes through.
    sleep(Duration::from_secs(2)).await;
    bob.handle.start_call("alice", CallType::Voice).await.unwrap();
    settle().await;
    assert_eq!(alice.status().await, RINGING_IN);
}

#[tokio::test(start_paused = true)]
async fn denied_media_fails_the_call() {
    let hub = hub();
    let mut alice = spawn_with(&hub, "alice", CallConfig::default(), |b| {
        b.media_source(Arc::new(DeniedMedia))
    })
    .await;
    let bob = spawn(&hub, "bob").await;

    alice.handle.start_call("bob", CallType::Video).await.unwrap();
    settle().await;

    assert_eq!(alice.status().await, CallStatus::Ended);
    assert_eq!(bob.status().await, CallStatus::Idle);
    assert_eq!(alice.factory.created(), 0);

    let events = alice.drain_events();
    assert!(events.iter().any(|e| matches!(
        e,
        CallEvent::Error { message } if message.contains("permission denied")
    )));
    assert!(outcomes(&events).contains(&"call failed".to_string()));
}

#[tokio::test(start_paused = true)]
async fn callee_media_denial_releases_the_caller() {
    let hub = hub();
    let alice = spawn(&hub, "alice").await;
    let bob = spawn_with(&hub, "bob", CallConfig::default(), |b| {
        b.media_source(Arc::new(DeniedMedia))
    })
    .await;

    alice.handle.start_call("bob", CallType::Voice).await.unwrap();
    settle().await;
    bob.handle.accept().await.unwrap();
    settle().await;

    assert_eq!(bob.status().await, CallStatus::Ended);
    assert_eq!(alice.status().await, CallStatus::Ended);
}

#[tokio::test(start_paused = true)]
async fn answer_just_before_timeout_wins() {
    let hub = hub();
    let mut alice = spawn(&hub, "alice").await;
    let bob = spawn(&hub, "bob").await;

    alice.handle.start_call("bob", CallType::Voice).await.unwrap();
    settle().await;
    sleep(Duration::from_millis(29_800)).await;
    bob.handle.accept().await.unwrap();
    settle().await;

    sleep(Duration::from_secs(5)).await;
    assert_eq!(alice.status().await, CallStatus::Connected);
    assert_eq!(bob.status().await, CallStatus::Connected);
    assert!(outcomes(&alice.drain_events()).is_empty());
}

#[tokio::test(start_paused = true)]
async fn camera_enabled_mid_call_renegotiates() {
    let hub = hub();
    let alice = spawn(&hub, "alice").await;
    let mut bob = spawn(&hub, "bob").await;

    alice.handle.start_call("bob", CallType::Voice).await.unwrap();
    settle().await;
    bob.handle.accept().await.unwrap();
    settle().await;
    bob.drain_events();

    assert!(!alice.handle.set_video_enabled(false).await.unwrap());
    assert!(alice.handle.set_video_enabled(true).await.unwrap());
    settle().await;

    let transport = alice.factory.latest("bob");
    assert_eq!(transport.track_kinds(), vec![MediaKind::Audio, MediaKind::Video]);
    assert_eq!(transport.offers_created(), 2);
    assert_eq!(alice.factory.created(), 1);
    assert!(alice.snapshot().await.video_enabled);

    let video_seen = bob.drain_events().iter().any(|e| matches!(
        e,
        CallEvent::RemoteStream { stream, .. } if stream.has_kind(MediaKind::Video)
    ));
    assert!(video_seen);
    assert_eq!(alice.status().await, CallStatus::Connected);
    assert!(alice.snapshot().await.peer("bob").unwrap().safety_number.is_some());
}

#[tokio::test(start_paused = true)]
async fn cameras_enabled_at_once_still_reach_both_sides() {
    let hub = hub();
    let alice = spawn(&hub, "alice").await;
    let bob = spawn(&hub, "bob").await;

    alice.handle.start_call("bob", CallType::Voice).await.unwrap();
    settle().await;
    bob.handle.accept().await.unwrap();
    settle().await;

    let (a, b) = tokio::join!(
        alice.handle.set_video_enabled(true),
        bob.handle.set_video_enabled(true)
    );
    assert!(a.unwrap() && b.unwrap());
    settle().await;

    let alice_side = alice.factory.latest("bob");
    let bob_side = bob.factory.latest("alice");
    for transport in [&alice_side, &bob_side] {
        assert!(transport.is_connected());
        assert_eq!(transport.track_kinds(), vec![MediaKind::Audio, MediaKind::Video]);
    }
    assert_ne!(alice_side.is_offerer(), bob_side.is_offerer());
    for transport in alice.factory.transports().iter().chain(bob.factory.transports().iter()) {
        assert_eq!(transport.rejected_offers(), 0);
    }

    for (participant, other) in [(&alice, "bob"), (&bob, "alice")] {
        assert_eq!(participant.status().await, CallStatus::Connected);
        let view = participant.snapshot().await;
        assert_eq!(view.peer(other).unwrap().state, PeerState::Connected);
        assert!(view.video_enabled);
    }
    let a = alice.snapshot().await.peer("bob").unwrap().safety_number.clone();
    let b = bob.snapshot().await.peer("alice").unwrap().safety_number.clone();
    assert!(a.is_some());
    assert_eq!(a, b);
}

#[tokio::test(start_paused = true)]
async fn mute_toggles_are_idempotent() {
    let hub = hub();
    let alice = spawn(&hub, "alice").await;
    let bob = spawn(&hub, "bob").await;

    assert!(matches!(
        alice.handle.set_audio_enabled(false).await,
        Err(CallError::NoActiveCall)
    ));

    alice.handle.start_call("bob", CallType::Voice).await.unwrap();
    settle().await;
    bob.handle.accept().await.unwrap();
    settle().await;

    assert!(alice.handle.set_audio_enabled(false).await.unwrap());
    assert!(!alice.handle.set_audio_enabled(false).await.unwrap());
    assert!(!alice.snapshot().await.audio_enabled);
    assert!(alice.handle.set_audio_enabled(true).await.unwrap());
    assert!(alice.snapshot().await.audio_enabled);
}

#[tokio::test(start_paused = true)]
async fn duplicated_delivery_still_connects_once() {
    callmesh::logger::init("tests");
    let hub = Arc::new(LocalHub::duplicating());
    let alice = spawn(&hub, "alice").await;
    let bob = spawn(&hub, "bob").await;

    alice.handle.start_call("bob", CallType::Voice).await.unwrap();
    settle().await;
    bob.handle.accept().await.unwrap();
    settle().await;

    assert_eq!(alice.status().await, CallStatus::Connected);
    assert_eq!(bob.status().await, CallStatus::Connected);
    assert_eq!(alice.factory.created(), 1);
    assert_eq!(bob.factory.created(), 1);

    let candidates = bob.factory.latest("alice").applied_candidates();
    assert_eq!(candidates.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn candidates_of_a_ringing_call_are_replayed_on_accept() {
    let hub = hub();
    let alice = spawn(&hub, "alice").await;
    let bob = spawn(&hub, "bob").await;

    alice.handle.start_call("bob", CallType::Voice).await.unwrap();
    settle().await;
    alice
        .factory
        .latest("bob")
        .gather(callmesh::peer::types::IceCandidate::new(
            "candidate:9 1 udp 1686052607 203.0.113.7 6000 typ srflx",
        ));
    settle().await;

    bob.handle.accept().await.unwrap();
    settle().await;

    let applied = bob.factory.latest("alice").applied_candidates();
    assert_eq!(applied.len(), 2);
    assert_eq!(applied[0].candidate_type(), Some("host"));
    assert_eq!(applied[1].candidate_type(), Some("srflx"));
}

#[tokio::test(start_paused = true)]
async fn signals_carry_the_call_id() {
    let hub = hub();
    let alice = spawn(&hub, "alice").await;
    let (_bob, mut inbox) = raw_client(&hub, "calls", "bob").await;

    let call_id = alice.handle.start_call("bob", CallType::Video).await.unwrap();
    settle().await;

    let offer = drain(&mut inbox)
        .into_iter()
        .find_map(|m| match m {
            ChannelMessage::Signal(s) if s.kind == SignalKind::Offer => Some(s),
            _ => None,
        })
        .expect("offer sent");
    assert_eq!(offer.call_id.as_deref(), Some(call_id.as_str()));
    assert_eq!(offer.call_type, Some(CallType::Video));
    assert!(!offer.renegotiation);

    alice.handle.shutdown().await.unwrap();
    settle().await;
    let end = drain(&mut inbox).into_iter().any(|m| matches!(
        m,
        ChannelMessage::Signal(s) if s.kind == SignalKind::End && s.call_id.as_deref() == Some(call_id.as_str())
    ));
    assert!(end);
    assert!(matches!(alice.handle.status().await, Err(CallError::AgentStopped)));
}
