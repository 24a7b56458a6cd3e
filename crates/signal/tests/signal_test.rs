use signal::{
    IceCandidate, MqttConfig, ParticipantId, Signal, SignalEvent, SignalMessage, SignalType,
    SignalingChannel,
};
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};
use tracing::info;

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_max_level(tracing::Level::INFO).try_init();
}

fn test_config(room: &str) -> MqttConfig {
    MqttConfig {
        broker_host: "127.0.0.1".to_string(),
        broker_port: 1883,
        room: room.to_string(),
        ..Default::default()
    }
}

/// Next relayed message, skipping connection notifications.
async fn next_message(event_rx: &mut mpsc::UnboundedReceiver<SignalEvent>) -> SignalMessage {
    loop {
        match timeout(Duration::from_secs(5), event_rx.recv()).await {
            Ok(Some(SignalEvent::Message(msg))) => return msg,
            Ok(Some(event)) => info!("Received unrelated event: {:?}", event),
            Ok(None) => panic!("Channel closed unexpectedly"),
            Err(_) => panic!("Timed out waiting for signal message"),
        }
    }
}

// Needs an MQTT broker on 127.0.0.1:1883.
#[tokio::test]
#[ignore]
async fn test_offer_answer_exchange_over_broker() {
    init_tracing();

    let (alice, mut alice_rx) = Signal::connect(ParticipantId::from("alice"), test_config("t1"))
        .await
        .expect("Failed to create alice");
    let (bob, mut bob_rx) = Signal::connect(ParticipantId::from("bob"), test_config("t1"))
        .await
        .expect("Failed to create bob");

    assert!(matches!(
        timeout(Duration::from_secs(5), alice_rx.recv()).await,
        Ok(Some(SignalEvent::Connected))
    ));
    assert!(matches!(
        timeout(Duration::from_secs(5), bob_rx.recv()).await,
        Ok(Some(SignalEvent::Connected))
    ));
    // give both subscriptions time to settle
    tokio::time::sleep(Duration::from_millis(300)).await;

    let offer = SignalMessage::Offer { id: ParticipantId::from("alice"), sdp: "offer_sdp".into() };
    alice.send(&offer).await.expect("Failed to send offer");

    let msg = next_message(&mut bob_rx).await;
    assert_eq!(msg, offer);

    let answer =
        SignalMessage::Answer { id: ParticipantId::from("bob"), sdp: "answer_sdp".into() };
    bob.send(&answer).await.expect("Failed to send answer");
    assert_eq!(next_message(&mut alice_rx).await, answer);

    let ice = SignalMessage::candidate(ParticipantId::from("alice"), IceCandidate::new("ice_1"));
    alice.send(&ice).await.expect("Failed to send candidate");
    let msg = next_message(&mut bob_rx).await;
    assert_eq!(msg.signal_type(), SignalType::Candidate);
    assert_eq!(msg.ice_candidate(), Some(IceCandidate::new("ice_1")));

    // alice never sees her own frames echoed back
    match timeout(Duration::from_millis(500), alice_rx.recv()).await {
        Err(_) => info!("Alice correctly received no echo"),
        Ok(Some(event)) => panic!("Unexpected event: {:?}", event),
        Ok(None) => panic!("Channel closed unexpectedly"),
    }

    alice.disconnect().await;
    alice.disconnect().await;
    assert!(matches!(alice.send(&offer).await, Err(signal::TransportError::Closed)));
}

#[tokio::test]
async fn test_send_before_connected_fails() {
    init_tracing();

    // nothing listens on this port, so the link never comes up
    let config = MqttConfig {
        broker_host: "127.0.0.1".to_string(),
        broker_port: 1,
        reconnect_delay: Duration::from_millis(50),
        ..Default::default()
    };
    let (signal, _rx) = Signal::connect(ParticipantId::from("lonely"), config).await.unwrap();

    let ready = SignalMessage::Ready { id: ParticipantId::from("lonely") };
    assert!(matches!(signal.send(&ready).await, Err(signal::TransportError::NotConnected)));

    signal.disconnect().await;
    signal.disconnect().await;
    assert!(matches!(signal.send(&ready).await, Err(signal::TransportError::Closed)));
}
