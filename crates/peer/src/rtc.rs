use crate::config::{PeerConfig, RTC_API};
use crate::error::CallError;
use crate::media::{MediaTrack, MediaTrackSet, TrackKind};
use crate::transport::{
    PeerTransport, RemoteMedia, SdpKind, TransportEvent, TransportEventSender, TransportFactory,
    TransportId,
};
use async_trait::async_trait;
use signal::IceCandidate;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, trace, warn};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;

fn negotiation_error(context: &str, e: webrtc::Error) -> CallError {
    CallError::Negotiation(format!("{}: {}", context, e))
}

/// Creates webrtc-rs peer connections from a [`PeerConfig`].
#[derive(Debug, Clone, Default)]
pub struct RtcTransportFactory {
    config: PeerConfig,
}

impl RtcTransportFactory {
    pub fn new(config: PeerConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl TransportFactory for RtcTransportFactory {
    async fn create(
        &self,
        id: TransportId,
        events: TransportEventSender,
    ) -> Result<Box<dyn PeerTransport>, CallError> {
        let transport = RtcTransport::new(id, &self.config, events).await?;
        Ok(Box::new(transport))
    }
}

pub struct RtcTransport {
    id: TransportId,
    pc: Arc<RTCPeerConnection>,
    video_sender: Mutex<Option<Arc<RTCRtpSender>>>,
    /// Renegotiation offer sent to the peer but not installed yet.
    prepared_offer: Mutex<Option<RTCSessionDescription>>,
}

impl RtcTransport {
    pub async fn new(
        id: TransportId,
        config: &PeerConfig,
        events: TransportEventSender,
    ) -> Result<Self, CallError> {
        let rtc_config = config.to_rtc_configuration();
        let pc = Arc::new(
            RTC_API
                .new_peer_connection(rtc_config)
                .await
                .map_err(|e| CallError::Connection(format!("create peer connection: {}", e)))?,
        );

        Self::setup_ice_candidate_callback(&pc, id, events.clone());
        Self::setup_connection_state_callback(&pc, id, events.clone());
        Self::setup_track_callback(&pc, id, events);

        debug!("Peer connection {} created", id);
        Ok(Self { id, pc, video_sender: Mutex::new(None), prepared_offer: Mutex::new(None) })
    }

    fn setup_ice_candidate_callback(
        pc: &RTCPeerConnection,
        id: TransportId,
        events: TransportEventSender,
    ) {
        pc.on_ice_candidate(Box::new(move |c| {
            let events = events.clone();
            Box::pin(async move {
                if let Some(candidate) = c {
                    match candidate.to_json() {
                        Ok(json) => {
                            let candidate = IceCandidate {
                                candidate: json.candidate,
                                sdp_mid: json.sdp_mid,
                                sdp_mline_index: json.sdp_mline_index,
                            };
                            let _ = events.send((id, TransportEvent::LocalCandidate(candidate)));
                        }
                        Err(e) => warn!("Failed to serialize local candidate on {}: {}", id, e),
                    }
                }
            })
        }));
    }

    fn setup_connection_state_callback(
        pc: &RTCPeerConnection,
        id: TransportId,
        events: TransportEventSender,
    ) {
        pc.on_peer_connection_state_change(Box::new(move |state| {
            let events = events.clone();
            Box::pin(async move {
                trace!("PeerConnection state for {}: {:?}", id, state);
                let event = match state {
                    RTCPeerConnectionState::Connected => TransportEvent::Connected,
                    RTCPeerConnectionState::Disconnected => TransportEvent::Disconnected,
                    RTCPeerConnectionState::Failed => {
                        warn!("PeerConnection failed for {}", id);
                        TransportEvent::Failed
                    }
                    _ => return,
                };
                let _ = events.send((id, event));
            })
        }));
    }

    fn setup_track_callback(pc: &RTCPeerConnection, id: TransportId, events: TransportEventSender) {
        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let events = events.clone();
            Box::pin(async move {
                let kind = match track.kind() {
                    RTPCodecType::Audio => TrackKind::Audio,
                    RTPCodecType::Video => TrackKind::Video,
                    other => {
                        warn!("Ignoring remote track of kind {:?} on {}", other, id);
                        return;
                    }
                };
                debug!("Remote {} track {} on {}", kind, track.id(), id);
                let media = RemoteMedia {
                    kind,
                    track_id: track.id(),
                    stream_id: track.stream_id(),
                    track: Some(track),
                };
                let _ = events.send((id, TransportEvent::RemoteTrack(media)));
            })
        }));
    }
}

#[async_trait]
impl PeerTransport for RtcTransport {
    async fn add_tracks(&self, tracks: &MediaTrackSet) -> Result<(), CallError> {
        for track in tracks.tracks() {
            let sender = self
                .pc
                .add_track(track.rtc_track())
                .await
                .map_err(|e| negotiation_error("add track", e))?;
            if track.kind() == TrackKind::Video {
                *self.video_sender.lock().await = Some(sender);
            }
            trace!("Added {} track {} to {}", track.kind(), track.id(), self.id);
        }
        Ok(())
    }

    async fn create_offer(&self) -> Result<String, CallError> {
        let offer =
            self.pc.create_offer(None).await.map_err(|e| negotiation_error("create offer", e))?;
        self.pc
            .set_local_description(offer.clone())
            .await
            .map_err(|e| negotiation_error("set local offer", e))?;
        Ok(offer.sdp)
    }

    async fn prepare_offer(&self) -> Result<String, CallError> {
        let offer =
            self.pc.create_offer(None).await.map_err(|e| negotiation_error("create offer", e))?;
        let sdp = offer.sdp.clone();
        *self.prepared_offer.lock().await = Some(offer);
        trace!("Prepared renegotiation offer on {}", self.id);
        Ok(sdp)
    }

    async fn create_answer(&self) -> Result<String, CallError> {
        let answer =
            self.pc.create_answer(None).await.map_err(|e| negotiation_error("create answer", e))?;
        self.pc
            .set_local_description(answer.clone())
            .await
            .map_err(|e| negotiation_error("set local answer", e))?;
        Ok(answer.sdp)
    }

    async fn set_remote_description(&self, kind: SdpKind, sdp: &str) -> Result<(), CallError> {
        let desc = match kind {
            SdpKind::Offer => RTCSessionDescription::offer(sdp.to_string()),
            SdpKind::Answer => RTCSessionDescription::answer(sdp.to_string()),
        }
        .map_err(|e| negotiation_error("parse remote description", e))?;
        if kind == SdpKind::Answer {
            if let Some(offer) = self.prepared_offer.lock().await.take() {
                self.pc
                    .set_local_description(offer)
                    .await
                    .map_err(|e| negotiation_error("set local offer", e))?;
            }
        }
        self.pc
            .set_remote_description(desc)
            .await
            .map_err(|e| negotiation_error("set remote description", e))
    }

    async fn add_candidate(&self, candidate: IceCandidate) -> Result<(), CallError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: None,
        };
        self.pc.add_ice_candidate(init).await.map_err(|e| negotiation_error("add candidate", e))
    }

    async fn replace_video_track(&self, track: Arc<MediaTrack>) -> Result<(), CallError> {
        let mut sender = self.video_sender.lock().await;
        match sender.as_ref() {
            Some(s) => s
                .replace_track(Some(track.rtc_track()))
                .await
                .map_err(|e| negotiation_error("replace video track", e))?,
            None => {
                *sender = Some(
                    self.pc
                        .add_track(track.rtc_track())
                        .await
                        .map_err(|e| negotiation_error("add video track", e))?,
                );
            }
        }
        debug!("Video track on {} replaced by {}", self.id, track.id());
        Ok(())
    }

    async fn discard_offer(&self) -> Result<(), CallError> {
        if self.prepared_offer.lock().await.take().is_some() {
            debug!("Discarded renegotiation offer on {}", self.id);
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), CallError> {
        self.pc.close().await.map_err(|e| CallError::Connection(format!("close: {}", e)))?;
        debug!("Closed PeerConnection {}", self.id);
        Ok(())
    }
}

impl Drop for RtcTransport {
    fn drop(&mut self) {
        let pc = self.pc.clone();
        let id = self.id;
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if pc.connection_state() != RTCPeerConnectionState::Closed {
                    if let Err(e) = pc.close().await {
                        warn!("Failed to close PeerConnection {}: {}", id, e);
                    }
                }
            });
        }
    }
}
