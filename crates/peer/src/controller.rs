use crate::config::PeerConfig;
use crate::error::CallError;
use crate::media::{
    MediaCapture, MediaConstraints, MediaTrackController, MediaTrackSet, SampleCapture, TrackKind,
};
use crate::negotiator::{NegotiatorEvent, SessionNegotiator};
use crate::rtc::RtcTransportFactory;
use crate::state::{CloseReason, ConnectionState, NegotiationState};
use crate::transport::{RemoteMedia, TransportEvent, TransportFactory, TransportId};
use anyhow::{anyhow, Result};
use parking_lot::Mutex;
use signal::{ParticipantId, SignalEvent, SignalMessage, SignalingChannel, TransportError};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

const EVENT_CAPACITY: usize = 64;

/// Notifications for the application layer.
#[derive(Debug, Clone)]
pub enum CallEvent {
    State(ConnectionState),
    LocalMedia(MediaTrackSet),
    RemoteMedia(RemoteMedia),
    Ended(CloseReason),
}

enum Command {
    StartCall(oneshot::Sender<Result<(), CallError>>),
    Hangup(oneshot::Sender<bool>),
    Toggle(TrackKind, oneshot::Sender<Option<bool>>),
    SwitchCamera(oneshot::Sender<Result<bool, CallError>>),
}

/// Handle to a running call. All work happens on the event loop spawned by
/// [`CallControllerBuilder::run`]; this type only sends it commands.
pub struct CallController {
    local_id: ParticipantId,
    command_tx: mpsc::UnboundedSender<Command>,
    state_rx: watch::Receiver<ConnectionState>,
    event_tx: broadcast::Sender<CallEvent>,
    cancel: Arc<Mutex<CancellationToken>>,
}

/// Builder for CallController
#[derive(Default)]
pub struct CallControllerBuilder {
    signaling: Option<(Arc<dyn SignalingChannel>, mpsc::UnboundedReceiver<SignalEvent>)>,
    peer_config: Option<PeerConfig>,
    capture: Option<Arc<dyn MediaCapture>>,
    transport: Option<Arc<dyn TransportFactory>>,
    constraints: Option<MediaConstraints>,
}

impl CallControllerBuilder {
    /// The channel and its inbound event stream. The channel's id becomes the
    /// local participant id.
    pub fn signaling(
        mut self,
        channel: Arc<dyn SignalingChannel>,
        events: mpsc::UnboundedReceiver<SignalEvent>,
    ) -> Self {
        self.signaling = Some((channel, events));
        self
    }

    pub fn peer(mut self, config: PeerConfig) -> Self {
        self.peer_config = Some(config);
        self
    }

    pub fn capture(mut self, capture: Arc<dyn MediaCapture>) -> Self {
        self.capture = Some(capture);
        self
    }

    /// Overrides the webrtc-rs transport.
    pub fn transport(mut self, factory: Arc<dyn TransportFactory>) -> Self {
        self.transport = Some(factory);
        self
    }

    pub fn constraints(mut self, constraints: MediaConstraints) -> Self {
        self.constraints = Some(constraints);
        self
    }

    /// Build and start the CallController
    pub async fn run(self) -> Result<(Arc<CallController>, JoinHandle<()>)> {
        let (signaling, signal_rx) =
            self.signaling.ok_or_else(|| anyhow!("signaling channel is required"))?;
        let peer_config = self.peer_config.unwrap_or_default();
        let local_id = signaling.local_id().clone();
        let capture: Arc<dyn MediaCapture> = match self.capture {
            Some(capture) => capture,
            None => Arc::new(SampleCapture::new(local_id.as_str())),
        };
        let factory: Arc<dyn TransportFactory> = match self.transport {
            Some(factory) => factory,
            None => Arc::new(RtcTransportFactory::new(peer_config.clone())),
        };

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        let (negotiator_tx, negotiator_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Idle);
        let (event_tx, _) = broadcast::channel(EVENT_CAPACITY);
        let cancel = Arc::new(Mutex::new(CancellationToken::new()));

        let call_loop = CallLoop {
            negotiator: SessionNegotiator::new(local_id.clone(), factory, transport_tx, negotiator_tx),
            negotiator_rx,
            media: MediaTrackController::new(),
            capture,
            constraints: self.constraints.unwrap_or_default(),
            signaling,
            inbox: SignalInbox::new(signal_rx),
            connect_timeout: peer_config.connect_timeout,
            deadline: None,
            bye_pending: None,
            state_tx,
            event_tx: event_tx.clone(),
            cancel: cancel.clone(),
        };

        let controller =
            Arc::new(CallController { local_id, command_tx, state_rx, event_tx, cancel });

        let handle = tokio::spawn(call_loop.run(command_rx, transport_rx));
        info!("CallController started for {}", controller.local_id);
        Ok((controller, handle))
    }
}

impl CallController {
    /// Create a builder for CallController
    pub fn builder() -> CallControllerBuilder {
        CallControllerBuilder::default()
    }

    pub fn local_id(&self) -> &ParticipantId {
        &self.local_id
    }

    /// Starts a new call attempt. Resolves once local media is up and the peer
    /// has been told we are ready.
    pub async fn start_call(&self) -> Result<(), CallError> {
        // installed here so a hangup right behind this call reaches the new attempt
        *self.cancel.lock() = CancellationToken::new();
        self.request(Command::StartCall).await?
    }

    /// Ends the current call. Returns false when there was nothing to end.
    pub async fn hangup(&self) -> bool {
        self.cancel.lock().cancel();
        self.request(Command::Hangup).await.unwrap_or(false)
    }

    /// Returns the new `enabled` value of the local audio track, if any.
    pub async fn toggle_audio(&self) -> Option<bool> {
        self.request(|tx| Command::Toggle(TrackKind::Audio, tx)).await.ok().flatten()
    }

    pub async fn toggle_video(&self) -> Option<bool> {
        self.request(|tx| Command::Toggle(TrackKind::Video, tx)).await.ok().flatten()
    }

    /// Flips the camera facing. Returns `Ok(false)` when no call is connected.
    pub async fn switch_camera(&self) -> Result<bool, CallError> {
        self.request(Command::SwitchCamera).await?
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.event_tx.subscribe()
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, CallError> {
        let (tx, rx) = oneshot::channel();
        self.command_tx.send(command(tx)).map_err(|_| CallError::ControllerClosed)?;
        rx.await.map_err(|_| CallError::ControllerClosed)
    }
}

/// Runs `fut` unless the call is hung up first.
async fn cancellable<T>(
    token: &CancellationToken,
    fut: impl Future<Output = Result<T, CallError>>,
) -> Result<T, CallError> {
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(CallError::Cancelled),
        r = fut => r,
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Why a negotiation step was abandoned before it finished.
enum Interrupt {
    Cancelled,
    RemoteBye(SignalMessage),
    DeadlineExpired,
}

/// Inbound signaling events. While a step is in flight a `bye` from the peer
/// aborts it and everything else is held back until the step is done.
struct SignalInbox {
    rx: mpsc::UnboundedReceiver<SignalEvent>,
    deferred: VecDeque<SignalEvent>,
}

impl SignalInbox {
    fn new(rx: mpsc::UnboundedReceiver<SignalEvent>) -> Self {
        Self { rx, deferred: VecDeque::new() }
    }

    async fn recv(&mut self) -> Option<SignalEvent> {
        match self.deferred.pop_front() {
            Some(event) => Some(event),
            None => self.rx.recv().await,
        }
    }

    async fn run_step<T>(
        &mut self,
        token: &CancellationToken,
        deadline: Option<Instant>,
        step: impl Future<Output = Result<T, CallError>>,
    ) -> Result<Result<T, CallError>, Interrupt> {
        tokio::pin!(step);
        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => return Err(Interrupt::Cancelled),
                _ = sleep_until_deadline(deadline) => return Err(Interrupt::DeadlineExpired),
                Some(event) = self.rx.recv() => match event {
                    SignalEvent::Message(msg @ SignalMessage::Bye { .. }) => {
                        return Err(Interrupt::RemoteBye(msg));
                    }
                    event => self.deferred.push_back(event),
                },
                r = &mut step => return Ok(r),
            }
        }
    }
}

/// The event loop. Owns the negotiator and the local tracks.
struct CallLoop {
    negotiator: SessionNegotiator,
    negotiator_rx: mpsc::UnboundedReceiver<NegotiatorEvent>,
    media: MediaTrackController,
    capture: Arc<dyn MediaCapture>,
    constraints: MediaConstraints,
    signaling: Arc<dyn SignalingChannel>,
    inbox: SignalInbox,
    connect_timeout: std::time::Duration,
    deadline: Option<Instant>,
    bye_pending: Option<SignalMessage>,
    state_tx: watch::Sender<ConnectionState>,
    event_tx: broadcast::Sender<CallEvent>,
    cancel: Arc<Mutex<CancellationToken>>,
}

impl CallLoop {
    async fn run(
        mut self,
        mut command_rx: mpsc::UnboundedReceiver<Command>,
        mut transport_rx: mpsc::UnboundedReceiver<(TransportId, TransportEvent)>,
    ) {
        loop {
            tokio::select! {
                biased;
                Some((id, event)) = transport_rx.recv() => {
                    self.handle_transport_event(id, event).await;
                }
                Some(event) = self.inbox.recv() => {
                    self.handle_signal_event(event).await;
                }
                command = command_rx.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => {
                        debug!("All controller handles dropped");
                        break;
                    }
                },
                _ = sleep_until_deadline(self.deadline) => {
                    self.on_connect_timeout().await;
                }
            }
            self.update_deadline();
        }

        self.cancel.lock().cancel();
        self.negotiator.hangup().await;
        self.flush().await;
        self.media.release();
        debug!("CallController event loop exited");
    }

    fn token(&self) -> CancellationToken {
        self.cancel.lock().clone()
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::StartCall(reply) => {
                let result = self.start_call().await;
                self.flush().await;
                let _ = reply.send(result);
            }
            Command::Hangup(reply) => {
                let closed = self.negotiator.hangup().await;
                self.flush().await;
                self.media.release();
                let _ = reply.send(closed);
            }
            Command::Toggle(kind, reply) => {
                let _ = reply.send(self.media.toggle(kind));
            }
            Command::SwitchCamera(reply) => {
                let result = self.switch_camera().await;
                self.flush().await;
                let _ = reply.send(result);
            }
        }
    }

    async fn start_call(&mut self) -> Result<(), CallError> {
        self.negotiator.begin()?;
        // a bye still owed to the previous peer must not end the new call
        self.bye_pending = None;
        let token = self.token();

        let constraints = self.constraints;
        let capture = self.capture.clone();
        let acquired = cancellable(&token, async {
            self.media.acquire(capture.as_ref(), &constraints).await.map_err(CallError::from)
        })
        .await;

        match acquired {
            Ok(tracks) => {
                let _ = self.event_tx.send(CallEvent::LocalMedia(tracks.clone()));
                self.negotiator.media_ready(tracks);
                Ok(())
            }
            Err(CallError::MediaAcquisition(e)) => {
                error!("Failed to acquire local media: {}", e);
                self.negotiator.media_failed(&e);
                Err(CallError::MediaAcquisition(e))
            }
            Err(e) => {
                debug!("Call start aborted: {}", e);
                self.media.release();
                Err(e)
            }
        }
    }

    async fn switch_camera(&mut self) -> Result<bool, CallError> {
        if self.negotiator.state() != NegotiationState::Connected {
            debug!("Camera switch ignored in state {}", self.negotiator.state());
            return Ok(false);
        }
        let token = self.token();
        let capture = self.capture.clone();
        let track = cancellable(&token, async {
            self.media.switch_facing(capture.as_ref()).await.map_err(CallError::from)
        })
        .await?;
        if let Some(tracks) = self.media.tracks() {
            let _ = self.event_tx.send(CallEvent::LocalMedia(tracks.clone()));
        }
        let step =
            self.inbox.run_step(&token, self.deadline, self.negotiator.replace_video(track)).await;
        match step {
            Ok(result) => result,
            Err(interrupt) => {
                self.interrupted(interrupt).await;
                Err(CallError::Cancelled)
            }
        }
    }

    async fn handle_signal_event(&mut self, event: SignalEvent) {
        match event {
            SignalEvent::Message(msg) => {
                trace!("Received {} from {}", msg.signal_type(), msg.sender());
                let token = self.token();
                let step =
                    self.inbox.run_step(&token, self.deadline, self.negotiator.handle_signal(msg));
                match step.await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => debug!("Signal message not applied: {}", e),
                    Err(interrupt) => self.interrupted(interrupt).await,
                }
            }
            SignalEvent::Connected => {
                info!("Signaling connected");
                if let Some(bye) = self.bye_pending.take() {
                    info!("Delivering pending bye");
                    self.send(bye).await;
                }
                self.negotiator.signal_restored().await;
            }
            SignalEvent::Disconnected => {
                warn!("Signaling disconnected");
                self.negotiator.signal_lost().await;
            }
        }
        self.flush().await;
    }

    async fn handle_transport_event(&mut self, id: TransportId, event: TransportEvent) {
        let token = self.token();
        let negotiator = &mut self.negotiator;
        let step = self.inbox.run_step(&token, self.deadline, async {
            negotiator.handle_transport_event(id, event).await;
            Ok::<_, CallError>(())
        });
        if let Err(interrupt) = step.await {
            debug!("Transport event from {} interrupted", id);
            self.interrupted(interrupt).await;
        }
        self.flush().await;
    }

    /// Finishes what an abandoned step was racing against.
    async fn interrupted(&mut self, interrupt: Interrupt) {
        match interrupt {
            Interrupt::Cancelled => debug!("Step cancelled by hangup"),
            Interrupt::RemoteBye(bye) => {
                info!("Peer hung up while a step was in flight");
                if let Err(e) = self.negotiator.handle_signal(bye).await {
                    debug!("Bye not applied: {}", e);
                }
            }
            Interrupt::DeadlineExpired => self.on_connect_timeout().await,
        }
    }

    async fn on_connect_timeout(&mut self) {
        self.deadline = None;
        warn!("Peer connection not established within {:?}", self.connect_timeout);
        let error = CallError::Connection(format!("timed out after {:?}", self.connect_timeout));
        self.negotiator.fail(error.to_string()).await;
        self.flush().await;
    }

    fn update_deadline(&mut self) {
        if self.negotiator.state() == NegotiationState::Negotiating {
            if self.deadline.is_none() {
                self.deadline = Some(Instant::now() + self.connect_timeout);
            }
        } else {
            self.deadline = None;
        }
    }

    /// Handles everything the negotiator emitted since the last call.
    async fn flush(&mut self) {
        while let Ok(event) = self.negotiator_rx.try_recv() {
            match event {
                NegotiatorEvent::Outbound(msg) => self.send(msg).await,
                NegotiatorEvent::StateChanged(state) => {
                    info!("Call state: {}", state);
                    if state.is_terminal() {
                        self.deadline = None;
                    }
                    self.state_tx.send_replace(state);
                    let _ = self.event_tx.send(CallEvent::State(state));
                }
                NegotiatorEvent::RemoteTrack(media) => {
                    let _ = self.event_tx.send(CallEvent::RemoteMedia(media));
                }
                NegotiatorEvent::Terminated { session, reason } => {
                    debug!("Session {} terminated", session);
                    self.media.release();
                    let _ = self.event_tx.send(CallEvent::Ended(reason));
                }
            }
        }
    }

    async fn send(&mut self, msg: SignalMessage) {
        trace!("Sending {}", msg.signal_type());
        let Err(e) = self.signaling.send(&msg).await else {
            return;
        };
        match msg {
            SignalMessage::Bye { .. } if matches!(e, TransportError::NotConnected) => {
                warn!("Relay unreachable, bye will be sent on reconnect");
                self.bye_pending = Some(msg);
            }
            SignalMessage::Ready { .. } => {
                warn!("Failed to send ready: {}, will retry on reconnect", e);
            }
            SignalMessage::Offer { .. } | SignalMessage::Answer { .. } => {
                error!("Failed to send {}: {}", msg.signal_type(), e);
                self.negotiator.fail(CallError::Transport(e).to_string()).await;
            }
            _ => warn!("Failed to send {}: {}", msg.signal_type(), e),
        }
    }
}
