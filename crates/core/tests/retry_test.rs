//! Retry and backoff behaviour against an unresponsive peer

mod harness;

use harness::{init_test_tracing, MeshHarness};
use std::time::Duration;
use voicemesh_core::testing::LoopbackRelay;
use voicemesh_core::{PeerId, SessionConfig, SessionEvent, SessionState};

/// `bob` is connected to the relay but nothing ever reads his messages
fn silent_peer(relay: &LoopbackRelay) -> PeerId {
    let bob = PeerId::from("bob");
    let _endpoint = relay.endpoint(bob.clone());
    bob
}

#[tokio::test(start_paused = true)]
async fn test_retries_exhaust_after_max_attempts() {
    let mut mesh = MeshHarness::ideal();
    let bob = silent_peer(&mesh.relay);
    mesh.add("alice");
    let alice = mesh.get("alice");

    alice.manager.start_capture(None).await.unwrap();
    alice.manager.on_peer_joined(bob.clone()).await;

    // Attempts start at 0s, 29s, 62s, 103s and 148s; the last one times
    // out at 173s.
    mesh.settle(Duration::from_secs(172)).await;
    assert!(alice.manager.has_session(&bob));
    assert_eq!(alice.count(&SessionEvent::ConnectionFailed(bob.clone())), 0);

    mesh.settle(Duration::from_secs(2)).await;
    assert!(!alice.manager.has_session(&bob));
    assert_eq!(mesh.relay.count(&alice.id, &bob, "offer"), 5);
    assert_eq!(alice.count(&SessionEvent::ConnectionFailed(bob.clone())), 1);

    // Nothing further happens on its own
    mesh.settle(Duration::from_secs(600)).await;
    assert_eq!(mesh.relay.count(&alice.id, &bob, "offer"), 5);
    assert_eq!(alice.count(&SessionEvent::ConnectionFailed(bob)), 1);
}

#[tokio::test(start_paused = true)]
async fn test_announcement_after_exhaustion_starts_over() {
    let mut mesh = MeshHarness::ideal();
    let bob = silent_peer(&mesh.relay);
    mesh.add("alice");
    let alice = mesh.get("alice");

    alice.manager.start_capture(None).await.unwrap();
    alice.manager.on_peer_joined(bob.clone()).await;
    mesh.settle(Duration::from_secs(180)).await;
    assert!(!alice.manager.has_session(&bob));

    alice.manager.on_peer_joined(bob.clone()).await;
    assert_eq!(
        alice.state_with(&bob).await,
        Some(SessionState::AwaitingAnswer)
    );
    assert_eq!(mesh.relay.count(&alice.id, &bob, "offer"), 6);
    assert_eq!(alice.manager.status().await.sessions[0].retry_count, 0);
}

#[tokio::test(start_paused = true)]
async fn test_custom_retry_budget() {
    init_test_tracing();
    let config = SessionConfig::aggressive().with_max_retries(2);
    let timeout = config.negotiation_timeout();

    let mut mesh = MeshHarness::ideal().with_config(config);
    let bob = silent_peer(&mesh.relay);
    mesh.add("alice");
    let alice = mesh.get("alice");

    alice.manager.start_capture(None).await.unwrap();
    alice.manager.initiate(bob.clone()).await.unwrap();

    mesh.settle(timeout * 4 + Duration::from_secs(60)).await;
    assert_eq!(mesh.relay.count(&alice.id, &bob, "offer"), 2);
    assert_eq!(alice.count(&SessionEvent::ConnectionFailed(bob)), 1);
}

#[tokio::test(start_paused = true)]
async fn test_late_peer_recovers_within_budget() {
    let mut mesh = MeshHarness::ideal();
    mesh.add("alice");
    let bob = PeerId::from("bob");

    // bob's offers go nowhere until he has a manager attached
    let alice = mesh.get("alice");
    alice.manager.start_capture(None).await.unwrap();
    alice.manager.on_peer_joined(bob.clone()).await;
    mesh.settle(Duration::from_secs(26)).await;
    assert_eq!(alice.state_with(&bob).await, Some(SessionState::Failed));

    mesh.add("bob");
    let bob_participant = mesh.get("bob");
    bob_participant.manager.start_capture(None).await.unwrap();

    // The retry at 29s reaches bob, who answers
    mesh.settle(Duration::from_secs(10)).await;
    mesh.assert_full_mesh().await;

    let alice = mesh.get("alice");
    assert_eq!(alice.manager.status().await.sessions[0].retry_count, 0);
    assert_eq!(alice.count(&SessionEvent::PeerConnected(bob)), 1);
}
