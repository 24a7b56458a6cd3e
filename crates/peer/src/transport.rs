use crate::error::CallError;
use crate::media::{MediaTrack, MediaTrackSet, TrackKind};
use async_trait::async_trait;
use signal::IceCandidate;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use webrtc::track::track_remote::TrackRemote;

/// Distinguishes the transports created over the lifetime of a negotiator, so
/// late events from an abandoned one can be told apart.
pub type TransportId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpKind {
    Offer,
    Answer,
}

/// A track the peer is sending us.
#[derive(Clone)]
pub struct RemoteMedia {
    pub kind: TrackKind,
    pub track_id: String,
    pub stream_id: String,
    /// `None` for transports that do not carry RTP.
    pub track: Option<Arc<TrackRemote>>,
}

impl fmt::Debug for RemoteMedia {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteMedia")
            .field("kind", &self.kind)
            .field("track_id", &self.track_id)
            .field("stream_id", &self.stream_id)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub enum TransportEvent {
    LocalCandidate(IceCandidate),
    Connected,
    Disconnected,
    Failed,
    RemoteTrack(RemoteMedia),
}

pub type TransportEventSender = mpsc::UnboundedSender<(TransportId, TransportEvent)>;

/// The peer connection primitive the negotiator drives.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn add_tracks(&self, tracks: &MediaTrackSet) -> Result<(), CallError>;

    /// Creates an offer and installs it as the local description.
    async fn create_offer(&self) -> Result<String, CallError>;

    /// Creates an offer for a connection that is already up without installing
    /// it. The offer is installed right before its answer is applied, so until
    /// then it can be dropped with [`PeerTransport::discard_offer`] and the
    /// connection stays stable.
    async fn prepare_offer(&self) -> Result<String, CallError>;

    /// Creates an answer and installs it as the local description.
    async fn create_answer(&self) -> Result<String, CallError>;

    async fn set_remote_description(&self, kind: SdpKind, sdp: &str) -> Result<(), CallError>;

    async fn add_candidate(&self, candidate: IceCandidate) -> Result<(), CallError>;

    async fn replace_video_track(&self, track: Arc<MediaTrack>) -> Result<(), CallError>;

    /// Drops the offer from [`PeerTransport::prepare_offer`] that has not been
    /// answered yet.
    async fn discard_offer(&self) -> Result<(), CallError>;

    async fn close(&self) -> Result<(), CallError>;
}

#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create(
        &self,
        id: TransportId,
        events: TransportEventSender,
    ) -> Result<Box<dyn PeerTransport>, CallError>;
}
