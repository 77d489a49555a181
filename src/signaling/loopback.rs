//! In-process relay that routes messages between registered peers.
//!
//! Behaves like the remote hub: delivery is by identity, in send order, and
//! sending to a peer that is not registered produces a `CallFailed` notice
//! for the sender instead of an error.

use super::{SignalingTransport, TransportError, TransportEvent};
use async_trait::async_trait;
use callcore::{InboundSignal, PeerId, SignalMessage};
use dashmap::DashMap;
use log::{debug, trace};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;

const CHANNEL_CAPACITY: usize = 256;

#[derive(Default)]
pub struct LoopbackRelay {
    peers: DashMap<PeerId, mpsc::Sender<TransportEvent>>,
}

impl LoopbackRelay {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Log `peer` in. A second registration replaces the first.
    pub fn register(
        self: &Arc<Self>,
        peer: PeerId,
    ) -> (Arc<LoopbackTransport>, mpsc::Receiver<TransportEvent>) {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        self.peers.insert(peer.clone(), tx);
        debug!(target: "Signaling/Loopback", "{peer} registered");
        let transport = Arc::new(LoopbackTransport {
            relay: Arc::clone(self),
            local: peer,
            connected: AtomicBool::new(true),
        });
        (transport, rx)
    }

    pub fn is_registered(&self, peer: &PeerId) -> bool {
        self.peers.contains_key(peer)
    }

    async fn deliver(&self, to: &PeerId, event: TransportEvent) -> bool {
        // Clone the sender so no map guard is held across the await.
        let Some(tx) = self.peers.get(to).map(|entry| entry.value().clone()) else {
            return false;
        };
        tx.send(event).await.is_ok()
    }
}

/// One peer's handle on a [`LoopbackRelay`].
pub struct LoopbackTransport {
    relay: Arc<LoopbackRelay>,
    local: PeerId,
    connected: AtomicBool,
}

impl LoopbackTransport {
    pub fn local_peer(&self) -> &PeerId {
        &self.local
    }

    /// Simulate the relay connection dropping or coming back. The change is
    /// reported on this peer's own event stream.
    pub async fn set_connected(&self, connected: bool) {
        if self.connected.swap(connected, Ordering::AcqRel) == connected {
            return;
        }
        let event = if connected {
            TransportEvent::Connected
        } else {
            TransportEvent::Disconnected
        };
        self.relay.deliver(&self.local, event).await;
    }
}

#[async_trait]
impl SignalingTransport for LoopbackTransport {
    async fn send(&self, to: &PeerId, message: SignalMessage) -> Result<(), TransportError> {
        if !self.connected.load(Ordering::Acquire) {
            return Err(TransportError::NotConnected);
        }
        trace!(target: "Signaling/Loopback", "{} -> {to}: {}", self.local, message.kind());
        let signal = InboundSignal::Message {
            from: self.local.clone(),
            message,
        };
        if !self.relay.deliver(to, TransportEvent::Signal(signal)).await {
            let notice = InboundSignal::CallFailed {
                reason: format!("{to} is not connected"),
            };
            self.relay
                .deliver(&self.local, TransportEvent::Signal(notice))
                .await;
        }
        Ok(())
    }
}
