//! WebSocket transport to a relay hub.
//!
//! Logs in by connecting to `<url>?peer=<identity>`, then exchanges JSON text
//! frames (see [`callcore::protocol`]). A background task owns the socket and
//! reconnects with backoff when it drops.

use super::{SignalingTransport, TransportError, TransportEvent};
use async_trait::async_trait;
use callcore::{Envelope, InboundSignal, PeerId, SignalMessage};
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, trace, warn};
use rand::Rng;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{Notify, mpsc};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

const OUTBOUND_CAPACITY: usize = 64;
const EVENT_CAPACITY: usize = 100;

#[derive(Clone, Debug)]
pub struct WsConfig {
    /// Relay endpoint, e.g. `ws://localhost:8080/signal`.
    pub url: String,
    pub local_peer: PeerId,
    pub reconnect_initial_delay: Duration,
    pub reconnect_max_delay: Duration,
    /// `None` retries forever.
    pub max_reconnect_attempts: Option<u32>,
}

impl WsConfig {
    pub fn new(url: impl Into<String>, local_peer: PeerId) -> Self {
        Self {
            url: url.into(),
            local_peer,
            reconnect_initial_delay: Duration::from_secs(1),
            reconnect_max_delay: Duration::from_secs(30),
            max_reconnect_attempts: None,
        }
    }

    /// The login URL: the relay endpoint with our identity as a query parameter.
    pub fn login_url(&self) -> String {
        let separator = if self.url.contains('?') { '&' } else { '?' };
        format!(
            "{}{}peer={}",
            self.url,
            separator,
            urlencoding::encode(self.local_peer.as_str())
        )
    }

    /// Delay before reconnect attempt `attempt` (1-based), without jitter.
    fn backoff(&self, attempt: u32) -> Duration {
        self.reconnect_initial_delay
            .saturating_mul(attempt)
            .min(self.reconnect_max_delay)
    }
}

pub struct WsSignalingTransport {
    outbound: mpsc::Sender<String>,
    connected: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
}

impl WsSignalingTransport {
    /// Connect and log in. The first attempt is made before returning so a
    /// bad URL or unreachable relay surfaces immediately.
    pub async fn connect(
        config: WsConfig,
    ) -> Result<(Arc<Self>, mpsc::Receiver<TransportEvent>), TransportError> {
        let url = config.login_url();
        info!(target: "Signaling/Ws", "Dialing {}", config.url);
        let (ws, _response) = connect_async(url.as_str())
            .await
            .map_err(|e| TransportError::WebSocket(e.to_string()))?;

        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let (event_tx, event_rx) = mpsc::channel(EVENT_CAPACITY);
        let connected = Arc::new(AtomicBool::new(true));
        let shutdown = Arc::new(Notify::new());

        let _ = event_tx.send(TransportEvent::Connected).await;

        tokio::spawn(run(
            ws,
            config,
            outbound_rx,
            event_tx,
            Arc::clone(&connected),
            Arc::clone(&shutdown),
        ));

        let transport = Arc::new(Self {
            outbound: outbound_tx,
            connected,
            shutdown,
        });
        Ok((transport, event_rx))
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Close the socket and stop reconnecting.
    pub fn disconnect(&self) {
        self.connected.store(false, Ordering::Release);
        self.shutdown.notify_one();
    }
}

#[async_trait]
impl SignalingTransport for WsSignalingTransport {
    async fn send(&self, to: &PeerId, message: SignalMessage) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        let kind = message.kind();
        let frame = Envelope::addressed(to.clone(), message).encode()?;
        trace!(target: "Signaling/Ws", "--> {kind} to {to}");
        self.outbound
            .send(frame)
            .await
            .map_err(|_| TransportError::NotConnected)
    }
}

enum PumpExit {
    Shutdown,
    Lost,
}

async fn run(
    mut ws: Ws,
    config: WsConfig,
    mut outbound: mpsc::Receiver<String>,
    events: mpsc::Sender<TransportEvent>,
    connected: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
) {
    loop {
        match pump(&mut ws, &mut outbound, &events, &shutdown).await {
            PumpExit::Shutdown => {
                connected.store(false, Ordering::Release);
                let _ = ws.close(None).await;
                debug!(target: "Signaling/Ws", "Shutdown signaled, closing socket");
                return;
            }
            PumpExit::Lost => {
                connected.store(false, Ordering::Release);
                // Frames queued for the dead socket are not replayed.
                let mut dropped = 0usize;
                while outbound.try_recv().is_ok() {
                    dropped += 1;
                }
                if dropped > 0 {
                    warn!(target: "Signaling/Ws", "Dropped {dropped} unsent frame(s)");
                }
                if events.send(TransportEvent::Disconnected).await.is_err() {
                    return;
                }
            }
        }

        match reconnect(&config, &shutdown).await {
            Some(fresh) => {
                ws = fresh;
                connected.store(true, Ordering::Release);
                if events.send(TransportEvent::Connected).await.is_err() {
                    return;
                }
            }
            None => return,
        }
    }
}

async fn pump(
    ws: &mut Ws,
    outbound: &mut mpsc::Receiver<String>,
    events: &mpsc::Sender<TransportEvent>,
    shutdown: &Notify,
) -> PumpExit {
    loop {
        tokio::select! {
            _ = shutdown.notified() => return PumpExit::Shutdown,
            frame = outbound.recv() => {
                let Some(frame) = frame else {
                    return PumpExit::Shutdown;
                };
                if let Err(e) = ws.send(Message::text(frame)).await {
                    error!(target: "Signaling/Ws", "WebSocket send error: {e}");
                    return PumpExit::Lost;
                }
            }
            incoming = ws.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    match InboundSignal::decode(text.as_str()) {
                        Ok(signal) => {
                            if events.send(TransportEvent::Signal(signal)).await.is_err() {
                                warn!(target: "Signaling/Ws", "Event receiver dropped, closing");
                                return PumpExit::Shutdown;
                            }
                        }
                        Err(e) => warn!(target: "Signaling/Ws", "Dropping undecodable frame: {e}"),
                    }
                }
                Some(Ok(Message::Close(_))) => {
                    trace!(target: "Signaling/Ws", "Received close frame");
                    return PumpExit::Lost;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    error!(target: "Signaling/Ws", "Error reading from websocket: {e}");
                    return PumpExit::Lost;
                }
                None => {
                    trace!(target: "Signaling/Ws", "Websocket stream ended");
                    return PumpExit::Lost;
                }
            }
        }
    }
}

async fn reconnect(config: &WsConfig, shutdown: &Notify) -> Option<Ws> {
    let url = config.login_url();
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        if config
            .max_reconnect_attempts
            .is_some_and(|max| attempt > max)
        {
            error!(target: "Signaling/Ws", "Giving up after {} reconnect attempts", attempt - 1);
            return None;
        }

        let base = config.backoff(attempt);
        let jitter_ms = rand::rng().random_range(0..=base.as_millis() as u64 / 4);
        let delay = base + Duration::from_millis(jitter_ms);
        info!(target: "Signaling/Ws", "Will attempt to reconnect in {delay:?} (attempt {attempt})");

        tokio::select! {
            _ = shutdown.notified() => return None,
            _ = tokio::time::sleep(delay) => {}
        }

        match connect_async(url.as_str()).await {
            Ok((ws, _)) => {
                info!(target: "Signaling/Ws", "Reconnected to {}", config.url);
                return Some(ws);
            }
            Err(e) => warn!(target: "Signaling/Ws", "Reconnect failed: {e}"),
        }
    }
}
