mod channel;
mod config;
mod message;
mod relay;
mod signal;
mod topics;

pub use channel::{SignalEvent, SignalingChannel, TransportError};
pub use config::MqttConfig;
pub use message::{IceCandidate, ParticipantId, SignalMessage, SignalType};
pub use relay::{MemoryChannel, MemoryRelay};
pub use signal::Signal;
