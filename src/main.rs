use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::Local;
use clap::{Parser, Subcommand};
use log::{error, info, warn};
use peercall::media::SilentMediaSource;
use peercall::peer::rtc::RtcPeerConnectionFactory;
use peercall::signaling::loopback::LoopbackRelay;
use peercall::signaling::ws::{WsConfig, WsSignalingTransport};
use peercall::{CallConfig, CallController, CallEvent, CallHandler, IntentOutcome, MediaKind, PeerId};
use tokio::sync::broadcast;

// Two ways to try the call stack:
//
//   cargo run --features webrtc -- loopback --media video --hold 5
//       alice calls bob in-process; bob answers automatically
//
//   cargo run --features webrtc -- connect --url ws://localhost:8080/signal --peer alice --call bob
//   cargo run --features webrtc -- connect --url ws://localhost:8080/signal --peer bob --auto-answer
//       two processes talking through a relay hub; Ctrl-C hangs up

#[derive(Parser)]
#[command(name = "peercall-demo", about = "One-to-one WebRTC call negotiation demo")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Call between two in-process peers over the loopback relay.
    Loopback {
        #[arg(long, default_value = "audio")]
        media: MediaKind,
        /// Seconds to stay connected before hanging up.
        #[arg(long, default_value_t = 3)]
        hold: u64,
    },
    /// Log in to a relay hub over WebSocket.
    Connect {
        #[arg(long)]
        url: String,
        #[arg(long)]
        peer: String,
        /// Place a call to this peer once connected.
        #[arg(long)]
        call: Option<String>,
        #[arg(long, default_value = "audio")]
        media: MediaKind,
        /// Accept incoming calls without asking.
        #[arg(long)]
        auto_answer: bool,
        /// Ring timeout in seconds.
        #[arg(long, default_value_t = 45)]
        ring_timeout: u64,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format(|buf, record| {
            use std::io::Write;
            writeln!(
                buf,
                "{} [{:<5}] [{}] - {}",
                Local::now().format("%H:%M:%S"),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .init();

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("Failed to build tokio runtime");

    rt.block_on(async {
        match cli.command {
            Command::Loopback { media, hold } => run_loopback(media, Duration::from_secs(hold)).await,
            Command::Connect {
                url,
                peer,
                call,
                media,
                auto_answer,
                ring_timeout,
            } => {
                let config =
                    CallConfig::default().with_ring_timeout(Duration::from_secs(ring_timeout));
                run_connect(url, PeerId::new(peer), call.map(PeerId::new), media, auto_answer, config)
                    .await
            }
        }
    })
}

fn controller_for(
    local: PeerId,
    config: CallConfig,
    signaling: Arc<dyn peercall::signaling::SignalingTransport>,
) -> Arc<CallController> {
    let connections = Arc::new(RtcPeerConnectionFactory::new(config.stun_servers.clone()));
    CallController::new(local, config, signaling, Arc::new(SilentMediaSource), connections)
}

/// Print events for one side; accept the first incoming call if asked to.
fn watch_events(label: &'static str, controller: Arc<CallController>, auto_answer: bool) {
    let mut events = controller.subscribe();
    tokio::spawn(async move {
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("[{label}] missed {n} events");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return,
            };
            info!("[{label}] {}", serde_json::to_string(&event).unwrap_or_default());
            if auto_answer
                && matches!(event, CallEvent::Ringing { role: peercall::CallRole::Callee, .. })
            {
                match controller.accept_incoming().await {
                    Ok(outcome) => info!("[{label}] accept: {outcome:?}"),
                    Err(e) => error!("[{label}] accept failed: {e}"),
                }
            }
        }
    });
}

async fn run_loopback(media: MediaKind, hold: Duration) -> anyhow::Result<()> {
    let relay = LoopbackRelay::new();
    let config = CallConfig::default();

    let (alice_transport, alice_events) = relay.register(PeerId::new("alice"));
    let (bob_transport, bob_events) = relay.register(PeerId::new("bob"));

    let alice = controller_for(PeerId::new("alice"), config.clone(), alice_transport);
    let bob = controller_for(PeerId::new("bob"), config, bob_transport);

    CallHandler::spawn(alice.clone(), alice_events);
    CallHandler::spawn(bob.clone(), bob_events);
    watch_events("alice", alice.clone(), false);
    watch_events("bob", bob.clone(), true);

    let outcome = alice
        .place_call(PeerId::new("bob"), media)
        .await
        .context("placing call")?;
    info!("place_call: {outcome:?}");

    tokio::time::sleep(hold).await;
    if let Some(snapshot) = alice.snapshot().await {
        info!("alice: {}", serde_json::to_string(&snapshot)?);
    }
    info!("hang_up: {:?}", alice.hang_up().await);

    // Let bob process the EndCall.
    tokio::time::sleep(Duration::from_millis(200)).await;
    if let Some(ended) = bob.last_ended().await {
        info!("bob's call ended: {:?}", ended.end_reason);
    }
    Ok(())
}

async fn run_connect(
    url: String,
    local: PeerId,
    callee: Option<PeerId>,
    media: MediaKind,
    auto_answer: bool,
    config: CallConfig,
) -> anyhow::Result<()> {
    let (transport, events) = WsSignalingTransport::connect(WsConfig::new(url, local.clone()))
        .await
        .context("connecting to relay")?;

    let controller = controller_for(local, config, transport.clone());
    CallHandler::spawn(controller.clone(), events);
    watch_events("local", controller.clone(), auto_answer);

    if let Some(callee) = callee {
        match controller.place_call(callee, media).await? {
            IntentOutcome::Done => {}
            other => warn!("call not placed: {other:?}"),
        }
    }

    tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
    info!("hang_up: {:?}", controller.hang_up().await);
    transport.disconnect();
    Ok(())
}
