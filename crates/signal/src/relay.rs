use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, trace};

use crate::channel::{SignalEvent, SignalingChannel, TransportError};
use crate::message::{ParticipantId, SignalMessage};

struct Link {
    event_tx: mpsc::UnboundedSender<SignalEvent>,
    online: bool,
}

/// In-process relay: every message is fanned out to all other joined participants.
#[derive(Clone, Default)]
pub struct MemoryRelay {
    links: Arc<RwLock<HashMap<ParticipantId, Link>>>,
}

impl MemoryRelay {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn join(
        &self,
        id: impl Into<ParticipantId>,
    ) -> (MemoryChannel, mpsc::UnboundedReceiver<SignalEvent>) {
        let id = id.into();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let _ = event_tx.send(SignalEvent::Connected);

        let mut links = self.links.write().await;
        links.insert(id.clone(), Link { event_tx, online: true });
        info!("Relay participant joined: {}, total: {}", id, links.len());

        let channel =
            MemoryChannel { id, relay: self.clone(), closed: AtomicBool::new(false) };
        (channel, event_rx)
    }

    /// Simulates losing the link of one participant.
    pub async fn interrupt(&self, id: &ParticipantId) {
        if let Some(link) = self.links.write().await.get_mut(id) {
            if link.online {
                link.online = false;
                let _ = link.event_tx.send(SignalEvent::Disconnected);
                debug!("Relay link interrupted: {}", id);
            }
        }
    }

    pub async fn restore(&self, id: &ParticipantId) {
        if let Some(link) = self.links.write().await.get_mut(id) {
            if !link.online {
                link.online = true;
                let _ = link.event_tx.send(SignalEvent::Connected);
                debug!("Relay link restored: {}", id);
            }
        }
    }

    pub async fn participants(&self) -> usize {
        self.links.read().await.len()
    }

    async fn forward(
        &self,
        sender: &ParticipantId,
        msg: &SignalMessage,
    ) -> Result<(), TransportError> {
        let links = self.links.read().await;
        match links.get(sender) {
            Some(link) if link.online => {}
            Some(_) => return Err(TransportError::NotConnected),
            None => return Err(TransportError::Closed),
        }
        for (id, link) in links.iter().filter(|(id, link)| *id != sender && link.online) {
            trace!("Relaying {} from {} to {}", msg.signal_type(), sender, id);
            let _ = link.event_tx.send(SignalEvent::Message(msg.clone()));
        }
        Ok(())
    }

    async fn leave(&self, id: &ParticipantId) {
        let mut links = self.links.write().await;
        if links.remove(id).is_some() {
            info!("Relay participant left: {}, total: {}", id, links.len());
        }
    }
}

pub struct MemoryChannel {
    id: ParticipantId,
    relay: MemoryRelay,
    closed: AtomicBool,
}

#[async_trait]
impl SignalingChannel for MemoryChannel {
    fn local_id(&self) -> &ParticipantId {
        &self.id
    }

    async fn send(&self, msg: &SignalMessage) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        self.relay.forward(&self.id, msg).await
    }

    async fn disconnect(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.relay.leave(&self.id).await;
    }
}
