mod candidate;
mod negotiator;
mod rtc;
mod transport;

pub mod config;
pub mod controller;
pub mod error;
pub mod media;
pub mod state;

pub use candidate::CandidateBuffer;
pub use config::{IceServer, PeerConfig};
pub use controller::{CallController, CallControllerBuilder, CallEvent};
pub use error::CallError;
pub use media::{
    Facing, MediaCapture, MediaConstraints, MediaError, MediaTrack, MediaTrackController,
    MediaTrackSet, SampleCapture, TrackKind,
};
pub use negotiator::{NegotiatorEvent, Session, SessionNegotiator};
pub use rtc::{RtcTransport, RtcTransportFactory};
pub use state::{CloseReason, ConnectionState, NegotiationState, Role};
pub use transport::{
    PeerTransport, RemoteMedia, SdpKind, TransportEvent, TransportEventSender, TransportFactory,
    TransportId,
};
