//! Drives a [`CallController`] from a signaling transport's event stream.

use super::controller::CallController;
use crate::signaling::TransportEvent;
use log::{debug, info};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Dispatches transport events to the controller one at a time, in arrival
/// order.
#[derive(Clone)]
pub struct CallHandler {
    controller: Arc<CallController>,
}

impl CallHandler {
    pub fn new(controller: Arc<CallController>) -> Self {
        Self { controller }
    }

    pub async fn handle(&self, event: TransportEvent) {
        match event {
            TransportEvent::Signal(signal) => self.controller.handle_signal(signal).await,
            TransportEvent::Connected => {
                debug!(target: "Call/Handler", "signaling connected");
                self.controller.on_connectivity(true);
            }
            TransportEvent::Disconnected => {
                debug!(target: "Call/Handler", "signaling disconnected");
                self.controller.on_connectivity(false);
            }
        }
    }

    /// Process events until the transport closes its stream.
    pub async fn run(self, mut events: mpsc::Receiver<TransportEvent>) {
        while let Some(event) = events.recv().await {
            self.handle(event).await;
        }
        info!(target: "Call/Handler", "transport event stream closed");
    }

    pub fn spawn(
        controller: Arc<CallController>,
        events: mpsc::Receiver<TransportEvent>,
    ) -> JoinHandle<()> {
        tokio::spawn(Self::new(controller).run(events))
    }
}
