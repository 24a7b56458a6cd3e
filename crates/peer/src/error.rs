use crate::media::MediaError;
use crate::state::NegotiationState;
use signal::{SignalType, TransportError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CallError {
    #[error("media acquisition failed: {0}")]
    MediaAcquisition(#[from] MediaError),

    #[error("negotiation failed: {0}")]
    Negotiation(String),

    #[error("signaling transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("unexpected {signal} while {state}")]
    ProtocolViolation { signal: SignalType, state: NegotiationState },

    #[error("peer connection failed: {0}")]
    Connection(String),

    #[error("a call is already in progress")]
    SessionActive,

    #[error("operation cancelled by hangup")]
    Cancelled,

    #[error("call controller has shut down")]
    ControllerClosed,
}

impl CallError {
    /// Protocol violations are dropped; everything else ends the session.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::ProtocolViolation { .. })
    }
}
