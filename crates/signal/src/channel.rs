use crate::message::{ParticipantId, SignalMessage};
use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalEvent {
    Message(SignalMessage),
    Connected,
    Disconnected,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("signaling channel is not connected")]
    NotConnected,
    #[error("signaling channel is closed")]
    Closed,
    #[error("failed to encode signal message: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("relay error: {0}")]
    Relay(String),
}

/// Duplex link to the relay. Inbound traffic is delivered on the event receiver
/// handed out when the channel is connected; there is exactly one subscriber.
#[async_trait]
pub trait SignalingChannel: Send + Sync {
    fn local_id(&self) -> &ParticipantId;

    /// Fails instead of queueing when the link is down. Nothing is replayed after
    /// a reconnect.
    async fn send(&self, msg: &SignalMessage) -> Result<(), TransportError>;

    /// Safe to call more than once.
    async fn disconnect(&self);
}
