use signal::{
    MemoryRelay, ParticipantId, SignalEvent, SignalMessage, SignalingChannel, TransportError,
};
use tokio::time::{timeout, Duration};

fn ready(id: &str) -> SignalMessage {
    SignalMessage::Ready { id: ParticipantId::from(id) }
}

#[tokio::test]
async fn test_relay_fans_out_to_others() {
    let relay = MemoryRelay::new();
    let (alice, mut alice_rx) = relay.join("alice").await;
    let (_bob, mut bob_rx) = relay.join("bob").await;
    let (_carol, mut carol_rx) = relay.join("carol").await;

    assert_eq!(alice_rx.recv().await, Some(SignalEvent::Connected));
    assert_eq!(bob_rx.recv().await, Some(SignalEvent::Connected));
    assert_eq!(carol_rx.recv().await, Some(SignalEvent::Connected));

    alice.send(&ready("alice")).await.unwrap();

    assert_eq!(bob_rx.recv().await, Some(SignalEvent::Message(ready("alice"))));
    assert_eq!(carol_rx.recv().await, Some(SignalEvent::Message(ready("alice"))));
    assert!(timeout(Duration::from_millis(50), alice_rx.recv()).await.is_err());
}

#[tokio::test]
async fn test_interrupted_link_rejects_and_does_not_replay() {
    let relay = MemoryRelay::new();
    let (alice, mut alice_rx) = relay.join("alice").await;
    let (_bob, mut bob_rx) = relay.join("bob").await;
    alice_rx.recv().await;
    bob_rx.recv().await;

    let alice_id = ParticipantId::from("alice");
    relay.interrupt(&alice_id).await;
    assert_eq!(alice_rx.recv().await, Some(SignalEvent::Disconnected));
    assert!(matches!(alice.send(&ready("alice")).await, Err(TransportError::NotConnected)));

    relay.restore(&alice_id).await;
    assert_eq!(alice_rx.recv().await, Some(SignalEvent::Connected));

    // the rejected frame is gone for good
    assert!(timeout(Duration::from_millis(50), bob_rx.recv()).await.is_err());

    alice.send(&ready("alice")).await.unwrap();
    assert_eq!(bob_rx.recv().await, Some(SignalEvent::Message(ready("alice"))));
}

#[tokio::test]
async fn test_disconnect_is_idempotent() {
    let relay = MemoryRelay::new();
    let (alice, _alice_rx) = relay.join("alice").await;
    let (_bob, _bob_rx) = relay.join("bob").await;
    assert_eq!(relay.participants().await, 2);

    alice.disconnect().await;
    alice.disconnect().await;
    assert_eq!(relay.participants().await, 1);
    assert!(matches!(alice.send(&ready("alice")).await, Err(TransportError::Closed)));
}
