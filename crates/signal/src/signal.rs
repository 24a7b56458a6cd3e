use anyhow::Result;
use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, trace, warn};

use crate::channel::{SignalEvent, SignalingChannel, TransportError};
use crate::config;
use crate::message::{ParticipantId, SignalMessage};
use crate::topics;

/// MQTT-backed signaling channel. Both participants of a room share one topic; the
/// broker is the relay.
pub struct Signal {
    id: ParticipantId,
    topic: String,
    client: AsyncClient,
    connected: Arc<AtomicBool>,
    closed: AtomicBool,
    event_loop_handle: JoinHandle<()>,
}

impl Signal {
    pub async fn connect(
        id: ParticipantId,
        config: config::MqttConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<SignalEvent>)> {
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let topic = topics::get_signal_topic(&config.room);
        let client_id = format!("{}_{}", config.room, id);

        let mut mqtt_options = MqttOptions::new(client_id, &config.broker_host, config.broker_port);
        mqtt_options.set_keep_alive(Duration::from_secs(config.keep_alive));
        mqtt_options.set_clean_session(config.clean_session);

        if let (Some(ref user), Some(ref pass)) = (&config.username, &config.password) {
            mqtt_options.set_credentials(user, pass);
        }

        let (client, event_loop) = AsyncClient::new(mqtt_options, 10);
        let connected = Arc::new(AtomicBool::new(false));

        let event_loop_handle = Self::start_event_loop(
            event_loop,
            event_tx,
            client.clone(),
            id.clone(),
            topic.clone(),
            connected.clone(),
            config.reconnect_delay,
        );

        Ok((
            Self { id, topic, client, connected, closed: AtomicBool::new(false), event_loop_handle },
            event_rx,
        ))
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn start_event_loop(
        mut event_loop: EventLoop,
        event_tx: mpsc::UnboundedSender<SignalEvent>,
        client: AsyncClient,
        id: ParticipantId,
        topic: String,
        connected: Arc<AtomicBool>,
        reconnect_delay: Duration,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                match event_loop.poll().await {
                    Ok(event) => match event {
                        Event::Incoming(Packet::ConnAck(_)) => {
                            // clean sessions drop subscriptions, so resubscribe on every ack
                            if let Err(e) = client.try_subscribe(topic.clone(), QoS::ExactlyOnce) {
                                error!("Failed to subscribe signal topic: {}", e);
                                break;
                            }
                            connected.store(true, Ordering::SeqCst);
                            debug!("Signal connected to relay as {}", id);
                            let _ = event_tx.send(SignalEvent::Connected);
                        }
                        Event::Incoming(Packet::Publish(p)) => {
                            Self::handle_publish(&id, &event_tx, p);
                        }
                        Event::Incoming(Packet::Disconnect) => {
                            warn!("Disconnected by MQTT broker");
                            if connected.swap(false, Ordering::SeqCst) {
                                let _ = event_tx.send(SignalEvent::Disconnected);
                            }
                        }
                        Event::Outgoing(Outgoing::Disconnect) => {
                            debug!("Signal for {} sent disconnect", id);
                            break;
                        }
                        _ => {}
                    },
                    Err(e) => {
                        if connected.swap(false, Ordering::SeqCst) {
                            warn!("Lost relay connection: {}", e);
                            let _ = event_tx.send(SignalEvent::Disconnected);
                        } else {
                            debug!("Relay unreachable: {}", e);
                        }
                        if event_tx.is_closed() {
                            break;
                        }
                        // the next poll reconnects
                        tokio::time::sleep(reconnect_delay).await;
                    }
                }
            }
            connected.store(false, Ordering::SeqCst);
            debug!("Signal event loop exited for {}", id);
        })
    }

    fn handle_publish(
        local_id: &ParticipantId,
        event_tx: &mpsc::UnboundedSender<SignalEvent>,
        p: rumqttc::Publish,
    ) {
        if topics::split_signal_topic(&p.topic).is_none() {
            warn!("Unknown topic: {}", &p.topic);
            return;
        }
        match serde_json::from_slice::<SignalMessage>(&p.payload) {
            Ok(msg) if msg.sender() == local_id => {
                trace!("Dropping echoed {} from self", msg.signal_type());
            }
            Ok(msg) => {
                trace!("Received {} from {}", msg.signal_type(), msg.sender());
                let _ = event_tx.send(SignalEvent::Message(msg));
            }
            Err(e) => warn!("Malformed signal frame on {}: {}", p.topic, e),
        }
    }
}

#[async_trait]
impl SignalingChannel for Signal {
    fn local_id(&self) -> &ParticipantId {
        &self.id
    }

    async fn send(&self, msg: &SignalMessage) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        let payload = serde_json::to_vec(msg)?;
        self.client
            .publish(&self.topic, QoS::ExactlyOnce, false, payload)
            .await
            .map_err(|e| TransportError::Relay(e.to_string()))?;
        trace!("Sent {} to {}", msg.signal_type(), self.topic);
        Ok(())
    }

    async fn disconnect(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if self.is_connected() {
            if let Err(e) = self.client.disconnect().await {
                warn!("Failed to send MQTT disconnect for {}: {}", self.id, e);
                self.event_loop_handle.abort();
            }
        } else {
            self.event_loop_handle.abort();
        }
        self.connected.store(false, Ordering::SeqCst);
        debug!("Signal disconnected for {}", self.id);
    }
}

impl Drop for Signal {
    fn drop(&mut self) {
        tracing::info!("Dropping Signal instance for {}", self.id);
        self.event_loop_handle.abort();
    }
}
