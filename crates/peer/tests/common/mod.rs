#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use peer::{
    CallError, MediaCapture, MediaConstraints, MediaTrack, MediaTrackSet, NegotiatorEvent,
    PeerTransport, SampleCapture, SdpKind, SessionNegotiator, TransportEvent, TransportEventSender,
    TransportFactory, TransportId,
};
use signal::{IceCandidate, ParticipantId, SignalMessage};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("debug,webrtc=off,webrtc_sctp=off,turn=error")
        .with_test_writer()
        .try_init();
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    AddTracks,
    CreateOffer,
    PrepareOffer,
    CreateAnswer,
    SetRemote(SdpKind, String),
    AddCandidate(String),
    ReplaceVideo(String),
    DiscardOffer,
    Close,
}

/// Signaling states of a peer connection. Like webrtc-rs, the fake cannot
/// leave `HaveLocalOffer` except by applying an answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Signaling {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
}

pub type OpLog = Arc<Mutex<Vec<(TransportId, Op)>>>;

/// Transport that records every call and reports connectivity as soon as both
/// descriptions are in place.
pub struct FakeFactory {
    label: String,
    log: OpLog,
    connects: bool,
    stalls: bool,
}

impl FakeFactory {
    pub fn new(label: &str) -> Self {
        Self { label: label.to_string(), log: OpLog::default(), connects: true, stalls: false }
    }

    /// Transports that negotiate but never report connectivity.
    pub fn unreachable(label: &str) -> Self {
        Self { connects: false, ..Self::new(label) }
    }

    /// Transports whose `set_remote_description` never completes.
    pub fn stalling(label: &str) -> Self {
        Self { stalls: true, ..Self::new(label) }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn log(&self) -> OpLog {
        self.log.clone()
    }
}

#[async_trait]
impl TransportFactory for FakeFactory {
    async fn create(
        &self,
        id: TransportId,
        events: TransportEventSender,
    ) -> Result<Box<dyn PeerTransport>, CallError> {
        Ok(Box::new(FakeTransport {
            id,
            label: self.label.clone(),
            events,
            log: self.log.clone(),
            local: Mutex::new(None),
            remote: Mutex::new(None),
            prepared: Mutex::new(None),
            signaling: Mutex::new(Signaling::Stable),
            version: AtomicU32::new(0),
            connected: AtomicBool::new(!self.connects),
            stalls: self.stalls,
        }))
    }
}

pub struct FakeTransport {
    id: TransportId,
    label: String,
    events: TransportEventSender,
    log: OpLog,
    local: Mutex<Option<String>>,
    remote: Mutex<Option<String>>,
    prepared: Mutex<Option<String>>,
    signaling: Mutex<Signaling>,
    version: AtomicU32,
    connected: AtomicBool,
    stalls: bool,
}

impl FakeTransport {
    fn record(&self, op: Op) {
        self.log.lock().push((self.id, op));
    }

    fn emit(&self, event: TransportEvent) {
        let _ = self.events.send((self.id, event));
    }

    fn new_sdp(&self, kind: &str) -> String {
        let version = self.version.fetch_add(1, Ordering::SeqCst);
        format!("v=0\r\no={}-{}-{}-{}\r\n", kind, self.label, self.id, version)
    }

    fn transition(&self, from: &[Signaling], to: Signaling, op: &str) -> Result<(), CallError> {
        let mut state = self.signaling.lock();
        if !from.contains(&*state) {
            return Err(CallError::Negotiation(format!("{} in {:?}", op, *state)));
        }
        *state = to;
        Ok(())
    }

    fn set_local(&self, sdp: String) -> String {
        *self.local.lock() = Some(sdp.clone());
        self.emit(TransportEvent::LocalCandidate(IceCandidate {
            candidate: format!("candidate:{}-{}", self.label, self.id),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
        }));
        self.maybe_connect();
        sdp
    }

    fn maybe_connect(&self) {
        let ready = self.local.lock().is_some() && self.remote.lock().is_some();
        if ready && !self.connected.swap(true, Ordering::SeqCst) {
            self.emit(TransportEvent::Connected);
        }
    }
}

#[async_trait]
impl PeerTransport for FakeTransport {
    async fn add_tracks(&self, _tracks: &MediaTrackSet) -> Result<(), CallError> {
        self.record(Op::AddTracks);
        Ok(())
    }

    async fn create_offer(&self) -> Result<String, CallError> {
        use Signaling::*;
        self.transition(&[Stable, HaveLocalOffer], HaveLocalOffer, "create offer")?;
        self.record(Op::CreateOffer);
        let sdp = self.new_sdp("offer");
        Ok(self.set_local(sdp))
    }

    async fn prepare_offer(&self) -> Result<String, CallError> {
        if *self.signaling.lock() != Signaling::Stable {
            return Err(CallError::Negotiation("prepare offer while negotiating".to_string()));
        }
        self.record(Op::PrepareOffer);
        let sdp = self.new_sdp("offer");
        *self.prepared.lock() = Some(sdp.clone());
        Ok(sdp)
    }

    async fn create_answer(&self) -> Result<String, CallError> {
        self.transition(&[Signaling::HaveRemoteOffer], Signaling::Stable, "create answer")?;
        self.record(Op::CreateAnswer);
        let sdp = self.new_sdp("answer");
        Ok(self.set_local(sdp))
    }

    async fn set_remote_description(&self, kind: SdpKind, sdp: &str) -> Result<(), CallError> {
        use Signaling::*;
        if !sdp.starts_with("v=0") {
            return Err(CallError::Negotiation(format!("malformed sdp: {}", sdp)));
        }
        if self.stalls {
            std::future::pending::<()>().await;
        }
        match kind {
            SdpKind::Offer => self.transition(&[Stable], HaveRemoteOffer, "apply remote offer")?,
            SdpKind::Answer => {
                let prepared = self.prepared.lock().take();
                if let Some(offer) = prepared {
                    self.transition(&[Stable], HaveLocalOffer, "install prepared offer")?;
                    *self.local.lock() = Some(offer);
                }
                self.transition(&[HaveLocalOffer], Stable, "apply remote answer")?;
            }
        }
        self.record(Op::SetRemote(kind, sdp.to_string()));
        *self.remote.lock() = Some(sdp.to_string());
        self.maybe_connect();
        Ok(())
    }

    async fn add_candidate(&self, candidate: IceCandidate) -> Result<(), CallError> {
        if candidate.candidate.starts_with("bad") {
            return Err(CallError::Negotiation("invalid candidate".to_string()));
        }
        self.record(Op::AddCandidate(candidate.candidate));
        Ok(())
    }

    async fn replace_video_track(&self, track: Arc<MediaTrack>) -> Result<(), CallError> {
        self.record(Op::ReplaceVideo(track.id().to_string()));
        Ok(())
    }

    async fn discard_offer(&self) -> Result<(), CallError> {
        self.record(Op::DiscardOffer);
        *self.prepared.lock() = None;
        Ok(())
    }

    async fn close(&self) -> Result<(), CallError> {
        self.record(Op::Close);
        Ok(())
    }
}

/// A negotiator wired to a [`FakeFactory`], driven by hand.
pub struct Harness {
    pub negotiator: SessionNegotiator,
    pub events: mpsc::UnboundedReceiver<NegotiatorEvent>,
    pub transport_rx: mpsc::UnboundedReceiver<(TransportId, TransportEvent)>,
    pub log: OpLog,
    pub capture: SampleCapture,
}

impl Harness {
    pub fn new(id: &str) -> Self {
        init_tracing();
        let factory = FakeFactory::new(id);
        let log = factory.log();
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        let (events_tx, events) = mpsc::unbounded_channel();
        let negotiator =
            SessionNegotiator::new(ParticipantId::new(id), Arc::new(factory), transport_tx, events_tx);
        Self { negotiator, events, transport_rx, log, capture: SampleCapture::new(id) }
    }

    /// A session that has acquired media and announced `ready`.
    pub async fn started(id: &str) -> Self {
        let mut h = Self::new(id);
        h.negotiator.begin().unwrap();
        let tracks = h.capture.acquire(&MediaConstraints::default()).await.unwrap();
        assert!(h.negotiator.media_ready(tracks));
        h
    }

    pub fn drain(&mut self) -> Vec<NegotiatorEvent> {
        let mut out = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            out.push(event);
        }
        out
    }

    /// Signaling messages emitted since the last drain.
    pub fn outbound(&mut self) -> Vec<SignalMessage> {
        self.drain()
            .into_iter()
            .filter_map(|e| match e {
                NegotiatorEvent::Outbound(msg) => Some(msg),
                _ => None,
            })
            .collect()
    }

    /// Feeds pending transport events into the negotiator.
    pub async fn pump(&mut self) {
        while let Ok((id, event)) = self.transport_rx.try_recv() {
            self.negotiator.handle_transport_event(id, event).await;
        }
    }

    pub fn ops(&self) -> Vec<Op> {
        self.log.lock().iter().map(|(_, op)| op.clone()).collect()
    }

    pub fn ops_on(&self, transport: TransportId) -> Vec<Op> {
        self.log.lock().iter().filter(|(id, _)| *id == transport).map(|(_, op)| op.clone()).collect()
    }

    pub fn clear_ops(&self) {
        self.log.lock().clear();
    }

    pub async fn signal(&mut self, msg: SignalMessage) -> Result<(), CallError> {
        self.negotiator.handle_signal(msg).await
    }
}

pub fn ready(from: &str) -> SignalMessage {
    SignalMessage::Ready { id: from.into() }
}

pub fn offer(from: &str, sdp: &str) -> SignalMessage {
    SignalMessage::Offer { id: from.into(), sdp: sdp.to_string() }
}

pub fn answer(from: &str, sdp: &str) -> SignalMessage {
    SignalMessage::Answer { id: from.into(), sdp: sdp.to_string() }
}

pub fn candidate(from: &str, c: &str) -> SignalMessage {
    SignalMessage::candidate(from.into(), IceCandidate::new(c))
}

pub fn bye(from: &str) -> SignalMessage {
    SignalMessage::Bye { id: from.into() }
}
