use crate::candidate::CandidateBuffer;
use crate::error::CallError;
use crate::media::{MediaError, MediaTrack, MediaTrackSet};
use crate::state::{CloseReason, ConnectionState, NegotiationState, Role};
use crate::transport::{
    PeerTransport, RemoteMedia, SdpKind, TransportEvent, TransportEventSender, TransportFactory,
    TransportId,
};
use signal::{IceCandidate, ParticipantId, SignalMessage, SignalType, TransportError};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

/// Output of the negotiator, consumed by whoever drives it.
#[derive(Debug, Clone)]
pub enum NegotiatorEvent {
    /// A message to publish on the signaling channel.
    Outbound(SignalMessage),
    StateChanged(ConnectionState),
    RemoteTrack(RemoteMedia),
    Terminated { session: u64, reason: CloseReason },
}

/// One call attempt.
pub struct Session {
    id: u64,
    role: Role,
    state: NegotiationState,
    local_description: Option<String>,
    remote_description: Option<String>,
    candidates: CandidateBuffer,
    transport: Option<Box<dyn PeerTransport>>,
    transport_id: Option<TransportId>,
    tracks: Option<MediaTrackSet>,
    offer_pending: bool,
    /// A renegotiation was abandoned while the relay was down.
    reoffer_on_restore: bool,
    connectivity: bool,
    failed: bool,
}

impl Session {
    fn new(id: u64) -> Self {
        Self {
            id,
            role: Role::Unset,
            state: NegotiationState::Idle,
            local_description: None,
            remote_description: None,
            candidates: CandidateBuffer::new(),
            transport: None,
            transport_id: None,
            tracks: None,
            offer_pending: false,
            reoffer_on_restore: false,
            connectivity: false,
            failed: false,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    pub fn local_description(&self) -> Option<&str> {
        self.local_description.as_deref()
    }

    pub fn remote_description(&self) -> Option<&str> {
        self.remote_description.as_deref()
    }

    pub fn pending_candidates(&self) -> usize {
        self.candidates.len()
    }

    pub fn has_transport(&self) -> bool {
        self.transport.is_some()
    }

    pub fn transport_id(&self) -> Option<TransportId> {
        self.transport_id
    }

    pub fn tracks(&self) -> Option<&MediaTrackSet> {
        self.tracks.as_ref()
    }

    /// True while a local offer waits for its answer.
    pub fn offer_pending(&self) -> bool {
        self.offer_pending
    }

    pub fn is_closed(&self) -> bool {
        self.state == NegotiationState::Closed
    }

    fn connection_state(&self) -> ConnectionState {
        match self.state {
            NegotiationState::Idle => ConnectionState::Idle,
            NegotiationState::Readying
            | NegotiationState::Offering
            | NegotiationState::Answering
            | NegotiationState::Negotiating => ConnectionState::Connecting,
            NegotiationState::Connected => ConnectionState::Connected,
            NegotiationState::Closed if self.failed => ConnectionState::Failed,
            NegotiationState::Closed => ConnectionState::Closed,
        }
    }

    fn transition(&mut self, to: NegotiationState) {
        if self.state != to {
            debug!("Session {}: {} -> {}", self.id, self.state, to);
            self.state = to;
        }
    }
}

/// The offer/answer state machine for one participant.
///
/// Every operation runs to completion before the next one starts; the caller
/// serializes signaling messages, transport events and local commands.
pub struct SessionNegotiator {
    local_id: ParticipantId,
    factory: Arc<dyn TransportFactory>,
    transport_tx: TransportEventSender,
    events: mpsc::UnboundedSender<NegotiatorEvent>,
    session: Option<Session>,
    connection: ConnectionState,
    next_session_id: u64,
    next_transport_id: TransportId,
}

impl SessionNegotiator {
    pub fn new(
        local_id: ParticipantId,
        factory: Arc<dyn TransportFactory>,
        transport_tx: TransportEventSender,
        events: mpsc::UnboundedSender<NegotiatorEvent>,
    ) -> Self {
        Self {
            local_id,
            factory,
            transport_tx,
            events,
            session: None,
            connection: ConnectionState::Idle,
            next_session_id: 0,
            next_transport_id: 0,
        }
    }

    pub fn local_id(&self) -> &ParticipantId {
        &self.local_id
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    pub fn state(&self) -> NegotiationState {
        self.session.as_ref().map_or(NegotiationState::Idle, |s| s.state)
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection
    }

    /// Creates a fresh session in `Idle`. Fails while another one is alive.
    pub fn begin(&mut self) -> Result<u64, CallError> {
        if self.session.as_ref().is_some_and(|s| !s.is_closed()) {
            return Err(CallError::SessionActive);
        }
        self.next_session_id += 1;
        let id = self.next_session_id;
        self.session = Some(Session::new(id));
        info!("Session {} started for {}", id, self.local_id);
        self.sync_state();
        Ok(id)
    }

    /// Local media is available: announce readiness to the peer.
    pub fn media_ready(&mut self, tracks: MediaTrackSet) -> bool {
        let Some(session) = self.session.as_mut() else {
            return false;
        };
        if session.state != NegotiationState::Idle {
            warn!("Session {}: media arrived in state {}, ignoring", session.id, session.state);
            return false;
        }
        session.tracks = Some(tracks);
        session.transition(NegotiationState::Readying);
        self.emit(NegotiatorEvent::Outbound(SignalMessage::Ready { id: self.local_id.clone() }));
        self.sync_state();
        true
    }

    /// Media could not be acquired. The session is discarded without ever
    /// leaving `Idle` and the failure is reported.
    pub fn media_failed(&mut self, error: &MediaError) {
        let Some(session) = self.session.take() else {
            return;
        };
        warn!("Session {}: local media unavailable: {}", session.id, error);
        self.set_connection(ConnectionState::Failed);
        self.emit(NegotiatorEvent::Terminated {
            session: session.id,
            reason: CloseReason::Failed(error.to_string()),
        });
    }

    /// Applies one inbound signaling message.
    ///
    /// Protocol violations are returned but leave the session untouched. Any
    /// other error has already closed the session when it is returned.
    pub async fn handle_signal(&mut self, msg: SignalMessage) -> Result<(), CallError> {
        if msg.sender() == &self.local_id {
            trace!("Ignoring own {} message", msg.signal_type());
            return Ok(());
        }
        let result = self.dispatch(msg).await;
        if let Err(e) = &result {
            if e.is_fatal() {
                self.fail(e.to_string()).await;
            } else {
                warn!("{}", e);
            }
        }
        self.sync_state();
        result
    }

    async fn dispatch(&mut self, msg: SignalMessage) -> Result<(), CallError> {
        let Some(session) = self.session.as_ref() else {
            trace!("No session, dropping {} from {}", msg.signal_type(), msg.sender());
            return Ok(());
        };
        if session.is_closed() {
            trace!("Session {} closed, dropping {}", session.id, msg.signal_type());
            return Ok(());
        }

        match msg {
            SignalMessage::Ready { id } => self.on_ready(id).await,
            SignalMessage::Offer { id, sdp } => self.on_offer(id, sdp).await,
            SignalMessage::Answer { id, sdp } => self.on_answer(id, sdp).await,
            msg @ SignalMessage::Candidate { .. } => {
                if let Some(candidate) = msg.ice_candidate() {
                    self.on_candidate(candidate).await;
                }
                Ok(())
            }
            SignalMessage::Bye { id } => {
                info!("Peer {} hung up", id);
                self.close(CloseReason::RemoteBye).await;
                Ok(())
            }
        }
    }

    async fn on_ready(&mut self, from: ParticipantId) -> Result<(), CallError> {
        let Some(session) = self.session.as_ref() else {
            return Ok(());
        };
        if session.state != NegotiationState::Readying || session.transport.is_some() {
            debug!("Already in call, ignoring ready from {}", from);
            return Ok(());
        }
        info!("Peer {} is ready, sending offer", from);
        self.ensure_transport().await?;
        self.send_offer(NegotiationState::Offering).await
    }

    async fn on_offer(&mut self, from: ParticipantId, sdp: String) -> Result<(), CallError> {
        let Some(session) = self.session.as_ref() else {
            return Ok(());
        };
        let state = session.state;
        let violation = CallError::ProtocolViolation { signal: SignalType::Offer, state };

        match state {
            NegotiationState::Readying => {
                self.ensure_transport().await?;
                self.answer(sdp, NegotiationState::Answering).await
            }
            NegotiationState::Negotiating if session.offer_pending => {
                if !self.yields_to(&from) {
                    debug!("Glare with {}: keeping local offer", from);
                    return Ok(());
                }
                info!("Glare with {}: yielding, answering remote offer", from);
                self.reset_transport().await;
                self.ensure_transport().await?;
                self.answer(sdp, NegotiationState::Answering).await
            }
            NegotiationState::Connected if session.offer_pending => {
                if !self.yields_to(&from) {
                    debug!("Renegotiation glare with {}: keeping local offer", from);
                    return Ok(());
                }
                info!("Renegotiation glare with {}: answering first, then offering again", from);
                self.discard_offer().await?;
                self.answer(sdp, NegotiationState::Connected).await?;
                self.send_offer(NegotiationState::Connected).await
            }
            NegotiationState::Connected => {
                if session.remote_description.as_deref() == Some(sdp.as_str()) {
                    return Err(violation);
                }
                debug!("Renegotiation offer from {}", from);
                self.answer(sdp, NegotiationState::Connected).await
            }
            _ => Err(violation),
        }
    }

    async fn on_answer(&mut self, from: ParticipantId, sdp: String) -> Result<(), CallError> {
        let Some(session) = self.session.as_mut() else {
            return Ok(());
        };
        if !session.offer_pending {
            return Err(CallError::ProtocolViolation {
                signal: SignalType::Answer,
                state: session.state,
            });
        }
        let transport = session
            .transport
            .as_ref()
            .ok_or_else(|| CallError::Negotiation("no transport for answer".to_string()))?;
        transport.set_remote_description(SdpKind::Answer, &sdp).await?;
        debug!("Session {}: applied answer from {}", session.id, from);
        session.remote_description = Some(sdp);
        session.offer_pending = false;
        self.apply_buffered_candidates().await;
        self.promote();
        Ok(())
    }

    async fn on_candidate(&mut self, candidate: IceCandidate) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        match (&session.transport, &session.remote_description) {
            (Some(transport), Some(_)) => {
                trace!("Session {}: applying candidate {}", session.id, candidate.candidate);
                if let Err(e) = transport.add_candidate(candidate).await {
                    warn!("Session {}: candidate rejected: {}", session.id, e);
                }
            }
            _ => {
                session.candidates.enqueue(candidate);
                trace!(
                    "Session {}: buffered candidate ({} pending)",
                    session.id,
                    session.candidates.len()
                );
            }
        }
    }

    /// Handles an event from a transport. Events from a transport the session no
    /// longer owns are dropped.
    pub async fn handle_transport_event(&mut self, transport_id: TransportId, event: TransportEvent) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if session.is_closed() || session.transport_id != Some(transport_id) {
            trace!("Dropping stale event from transport {}: {:?}", transport_id, event);
            return;
        }

        match event {
            TransportEvent::LocalCandidate(candidate) => {
                let msg = SignalMessage::candidate(self.local_id.clone(), candidate);
                self.emit(NegotiatorEvent::Outbound(msg));
            }
            TransportEvent::Connected => {
                session.connectivity = true;
                self.promote();
            }
            TransportEvent::Disconnected => {
                warn!("Session {}: peer connection interrupted", session.id);
            }
            TransportEvent::Failed => {
                self.fail(CallError::Connection("ice failed".to_string()).to_string()).await;
            }
            TransportEvent::RemoteTrack(media) => {
                info!("Session {}: remote {} track {}", session.id, media.kind, media.track_id);
                self.emit(NegotiatorEvent::RemoteTrack(media));
            }
        }
        self.sync_state();
    }

    /// Installs a new outgoing video track and renegotiates once. Ignored
    /// unless the session is connected.
    pub async fn replace_video(&mut self, track: Arc<MediaTrack>) -> Result<bool, CallError> {
        let Some(session) = self.session.as_mut() else {
            return Ok(false);
        };
        if session.state != NegotiationState::Connected {
            debug!("Session {}: not connected, ignoring video switch", session.id);
            return Ok(false);
        }
        let Some(transport) = session.transport.as_ref() else {
            return Ok(false);
        };
        if let Err(e) = transport.replace_video_track(track.clone()).await {
            self.fail(e.to_string()).await;
            return Err(e);
        }
        if let Some(tracks) = session.tracks.as_mut() {
            tracks.video = Some(track);
        }

        if self.session.as_ref().is_some_and(|s| !s.offer_pending) {
            if let Err(e) = self.send_offer(NegotiationState::Connected).await {
                self.fail(e.to_string()).await;
                return Err(e);
            }
        }
        self.sync_state();
        Ok(true)
    }

    /// Local hangup. Sends `bye` when the peer may know about the session.
    /// Returns false when there was nothing to close.
    pub async fn hangup(&mut self) -> bool {
        let Some(session) = self.session.as_ref() else {
            return false;
        };
        if session.is_closed() {
            return false;
        }
        if session.state != NegotiationState::Idle {
            self.emit(NegotiatorEvent::Outbound(SignalMessage::Bye { id: self.local_id.clone() }));
        }
        self.close(CloseReason::Hangup).await;
        self.sync_state();
        true
    }

    /// The signaling channel went down.
    pub async fn signal_lost(&mut self) {
        let Some(session) = self.session.as_ref() else {
            return;
        };
        let id = session.id;
        match session.state {
            NegotiationState::Offering
            | NegotiationState::Answering
            | NegotiationState::Negotiating => {
                self.fail(CallError::Transport(TransportError::NotConnected).to_string()).await;
            }
            NegotiationState::Connected if session.offer_pending => {
                debug!("Session {}: relay lost, renegotiating once it is back", id);
                if let Err(e) = self.discard_offer().await {
                    warn!("Session {}: failed to discard offer: {}", id, e);
                }
                if let Some(session) = self.session.as_mut() {
                    session.reoffer_on_restore = true;
                }
            }
            _ => {}
        }
        self.sync_state();
    }

    /// The signaling channel is back. A session still waiting for its peer
    /// announces itself again, and a renegotiation cut short by the outage is
    /// offered afresh.
    pub async fn signal_restored(&mut self) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        match session.state {
            NegotiationState::Readying if session.transport.is_none() => {
                debug!("Session {}: re-announcing ready", session.id);
                self.emit(NegotiatorEvent::Outbound(SignalMessage::Ready {
                    id: self.local_id.clone(),
                }));
            }
            NegotiationState::Connected if session.reoffer_on_restore => {
                debug!("Session {}: resuming renegotiation", session.id);
                session.reoffer_on_restore = false;
                if let Err(e) = self.send_offer(NegotiationState::Connected).await {
                    self.fail(e.to_string()).await;
                }
            }
            _ => {}
        }
        self.sync_state();
    }

    /// Ends the session with a fatal error. The peer is told with a `bye`
    /// once it may know about the session.
    pub async fn fail(&mut self, reason: impl Into<String>) {
        let announced = self
            .session
            .as_ref()
            .is_some_and(|s| !s.is_closed() && s.state != NegotiationState::Idle);
        if announced {
            self.emit(NegotiatorEvent::Outbound(SignalMessage::Bye { id: self.local_id.clone() }));
        }
        self.close(CloseReason::Failed(reason.into())).await;
        self.sync_state();
    }

    fn yields_to(&self, remote: &ParticipantId) -> bool {
        self.local_id < *remote
    }

    async fn ensure_transport(&mut self) -> Result<(), CallError> {
        let Some(session) = self.session.as_mut() else {
            return Err(CallError::Negotiation("no session".to_string()));
        };
        if session.transport.is_some() {
            return Ok(());
        }
        self.next_transport_id += 1;
        let id = self.next_transport_id;
        let transport = self.factory.create(id, self.transport_tx.clone()).await?;
        if let Some(tracks) = &session.tracks {
            transport.add_tracks(tracks).await?;
        }
        debug!("Session {}: transport {} ready", session.id, id);
        session.transport = Some(transport);
        session.transport_id = Some(id);
        Ok(())
    }

    /// Abandons the current transport after losing an initial glare.
    async fn reset_transport(&mut self) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if let Some(transport) = session.transport.take() {
            if let Err(e) = transport.close().await {
                warn!("Session {}: failed to close abandoned transport: {}", session.id, e);
            }
        }
        session.transport_id = None;
        session.local_description = None;
        session.offer_pending = false;
        session.connectivity = false;
    }

    /// Drops the unanswered renegotiation offer. The transport never installed
    /// it, so the connection is left as it was.
    async fn discard_offer(&mut self) -> Result<(), CallError> {
        let Some(session) = self.session.as_mut() else {
            return Ok(());
        };
        if let Some(transport) = &session.transport {
            transport.discard_offer().await?;
        }
        session.offer_pending = false;
        Ok(())
    }

    /// Creates and sends a local offer. `via` is the state held while the offer
    /// is being built; the session ends up `Negotiating`, or stays `Connected`
    /// for a renegotiation.
    async fn send_offer(&mut self, via: NegotiationState) -> Result<(), CallError> {
        let Some(session) = self.session.as_mut() else {
            return Ok(());
        };
        let renegotiation = session.state == NegotiationState::Connected;
        session.transition(via);
        let transport = session
            .transport
            .as_ref()
            .ok_or_else(|| CallError::Negotiation("no transport for offer".to_string()))?;
        let sdp = if renegotiation {
            transport.prepare_offer().await?
        } else {
            transport.create_offer().await?
        };
        if !renegotiation {
            session.role = Role::Offerer;
            session.transition(NegotiationState::Negotiating);
        }
        session.local_description = Some(sdp.clone());
        session.offer_pending = true;
        self.emit(NegotiatorEvent::Outbound(SignalMessage::Offer { id: self.local_id.clone(), sdp }));
        Ok(())
    }

    /// Applies a remote offer and sends back the answer.
    async fn answer(&mut self, sdp: String, via: NegotiationState) -> Result<(), CallError> {
        let Some(session) = self.session.as_mut() else {
            return Ok(());
        };
        let renegotiation = session.state == NegotiationState::Connected;
        session.transition(via);
        let transport = session
            .transport
            .as_ref()
            .ok_or_else(|| CallError::Negotiation("no transport for answer".to_string()))?;
        transport.set_remote_description(SdpKind::Offer, &sdp).await?;
        session.remote_description = Some(sdp);
        self.apply_buffered_candidates().await;

        let Some(session) = self.session.as_mut() else {
            return Ok(());
        };
        let transport = session
            .transport
            .as_ref()
            .ok_or_else(|| CallError::Negotiation("no transport for answer".to_string()))?;
        let answer = transport.create_answer().await?;
        session.local_description = Some(answer.clone());
        if !renegotiation {
            session.role = Role::Answerer;
            session.transition(NegotiationState::Negotiating);
        }
        self.emit(NegotiatorEvent::Outbound(SignalMessage::Answer {
            id: self.local_id.clone(),
            sdp: answer,
        }));
        self.promote();
        Ok(())
    }

    async fn apply_buffered_candidates(&mut self) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let Some(transport) = session.transport.as_ref() else {
            return;
        };
        if session.candidates.is_empty() {
            return;
        }
        debug!(
            "Session {}: applying {} buffered candidates",
            session.id,
            session.candidates.len()
        );
        for candidate in session.candidates.drain_in_order() {
            if let Err(e) = transport.add_candidate(candidate).await {
                warn!("Session {}: buffered candidate rejected: {}", session.id, e);
            }
        }
    }

    fn promote(&mut self) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if session.state == NegotiationState::Negotiating
            && session.remote_description.is_some()
            && !session.offer_pending
            && session.connectivity
        {
            session.transition(NegotiationState::Connected);
            info!("Session {} connected as {}", session.id, session.role);
        }
    }

    async fn close(&mut self, reason: CloseReason) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if session.is_closed() {
            return;
        }
        session.failed = matches!(reason, CloseReason::Failed(_));
        session.transition(NegotiationState::Closed);
        session.candidates.clear();
        session.offer_pending = false;
        session.reoffer_on_restore = false;
        session.tracks = None;
        if let Some(transport) = session.transport.take() {
            if let Err(e) = transport.close().await {
                warn!("Session {}: failed to close transport: {}", session.id, e);
            }
        }
        match &reason {
            CloseReason::Failed(e) => warn!("Session {} failed: {}", session.id, e),
            _ => info!("Session {} closed: {:?}", session.id, reason),
        }
        let id = session.id;
        self.sync_state();
        self.emit(NegotiatorEvent::Terminated { session: id, reason });
    }

    fn sync_state(&mut self) {
        if let Some(state) = self.session.as_ref().map(Session::connection_state) {
            self.set_connection(state);
        }
    }

    fn set_connection(&mut self, state: ConnectionState) {
        if self.connection != state {
            debug!("Connection state {} -> {}", self.connection, state);
            self.connection = state;
            self.emit(NegotiatorEvent::StateChanged(state));
        }
    }

    fn emit(&self, event: NegotiatorEvent) {
        if self.events.send(event).is_err() {
            trace!("Negotiator event receiver dropped");
        }
    }
}
