//! HubNet host binary entry point
//!
//! Connects to a signaling relay and hosts joiners until Ctrl+C.
//!
//! # Usage
//!
//! ```bash
//! # Host on a local relay with a session password
//! cargo run --bin hubnet_host -- \
//!   --signaling-url ws://localhost:8080/rtc \
//!   --password hunter2
//!
//! # Configure STUN/TURN servers and capacity
//! cargo run --bin hubnet_host -- \
//!   --stun-servers stun:stun.l.google.com:19302 \
//!   --turn-servers turn:turn.example.org:3478:user:secret \
//!   --max-capacity 40
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use clap::Parser;
use hubnet_webrtc::codec::JsonCodec;
use hubnet_webrtc::peer::{PeerLinkFactory, RtcPeerLinkFactory};
use hubnet_webrtc::signaling::RelaySocket;
use hubnet_webrtc::{
    ConnectionOrchestrator, HostConfig, HostEvent, JoinerInit, SessionHost, TurnServerConfig,
};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// HubNet Web host
///
/// Admits joiners through a signaling relay and serves them over WebRTC
/// data channels.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Signaling relay WebSocket URL
    #[arg(long, default_value = "ws://localhost:8080/rtc", env = "HUBNET_SIGNALING_URL")]
    signaling_url: String,

    /// Host ID announced to the relay
    #[arg(long, env = "HUBNET_HOST_ID")]
    host_id: Option<String>,

    /// Session password; any password is accepted when unset
    #[arg(long, env = "HUBNET_PASSWORD")]
    password: Option<String>,

    /// STUN servers (comma-separated)
    #[arg(
        long,
        value_delimiter = ',',
        default_value = "stun:stun.l.google.com:19302"
    )]
    stun_servers: Vec<String>,

    /// TURN servers (format: turn:host:port:username:password, comma-separated)
    #[arg(long, value_delimiter = ',', env = "HUBNET_TURN_SERVERS")]
    turn_servers: Vec<String>,

    /// Maximum admitted joiners
    #[arg(long, default_value_t = 10, env = "HUBNET_MAX_CAPACITY")]
    max_capacity: usize,

    /// Renegotiations requested from relayed joiners before accepting them
    #[arg(long, default_value_t = 10, env = "HUBNET_RELAY_RETRY_LIMIT")]
    relay_retry_limit: u32,

    /// Delay before a renegotiating channel is closed, in milliseconds
    #[arg(long, default_value_t = 10_000, env = "HUBNET_RENEGOTIATION_CLOSE_DELAY_MS")]
    renegotiation_close_delay_ms: u64,

    /// Codec worker cap (defaults to the CPU count)
    #[arg(long, env = "HUBNET_CODEC_WORKERS")]
    codec_workers: Option<usize>,

    /// Role handed to every joiner in its initial model
    #[arg(long, default_value = "student", env = "HUBNET_JOINER_ROLE")]
    joiner_role: String,
}

/// Session with a fixed password and an empty initial model
struct StaticSession {
    password: Option<String>,
    role: String,
}

#[async_trait]
impl SessionHost for StaticSession {
    fn password_matches(&self, password: Option<&str>) -> bool {
        match &self.password {
            Some(expected) => password == Some(expected.as_str()),
            None => true,
        }
    }

    async fn await_joiner_init(&self, _peer_id: &str, _username: &str) -> hubnet_webrtc::Result<JoinerInit> {
        Ok(JoinerInit {
            role: self.role.clone(),
            state: serde_json::json!({}),
            view: serde_json::json!({}),
        })
    }
}

fn parse_turn_server(s: &str) -> anyhow::Result<TurnServerConfig> {
    let parts: Vec<&str> = s.split(':').collect();
    if parts.len() < 5 {
        return Err(anyhow!(
            "Invalid TURN server format: '{}'. Expected: turn:host:port:username:password",
            s
        ));
    }

    let protocol = parts[0];
    if protocol != "turn" && protocol != "turns" {
        return Err(anyhow!(
            "Invalid TURN protocol: '{}'. Expected 'turn' or 'turns'",
            protocol
        ));
    }

    // Credential may contain colons
    Ok(TurnServerConfig {
        url: format!("{}:{}:{}", protocol, parts[1], parts[2]),
        username: parts[3].to_string(),
        credential: parts[4..].join(":"),
    })
}

fn build_config_from_args(args: &Args) -> anyhow::Result<HostConfig> {
    let turn_servers = args
        .turn_servers
        .iter()
        .map(|turn| parse_turn_server(turn))
        .collect::<anyhow::Result<Vec<_>>>()?;

    let mut config = HostConfig {
        signaling_url: args.signaling_url.clone(),
        stun_servers: args.stun_servers.clone(),
        ..Default::default()
    }
    .with_turn_servers(turn_servers)
    .with_max_capacity(args.max_capacity)
    .with_relay_retry_limit(args.relay_retry_limit)
    .with_renegotiation_close_delay(Duration::from_millis(args.renegotiation_close_delay_ms));

    if let Some(host_id) = &args.host_id {
        config = config.with_host_id(host_id);
    }
    if let Some(workers) = args.codec_workers {
        config = config.with_codec_workers(workers);
    }

    config.validate()?;
    Ok(config)
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let (shutdown_tx, shutdown_rx) = mpsc::unbounded_channel();
    let interrupted = Arc::new(AtomicBool::new(false));
    let interrupted_handler = Arc::clone(&interrupted);

    ctrlc::set_handler(move || {
        if interrupted_handler.swap(true, Ordering::SeqCst) {
            eprintln!("Shutdown already in progress, forcing immediate exit");
            std::process::exit(0);
        }
        eprintln!("\nCtrl+C received, shutting down...");
        let _ = shutdown_tx.send(());

        std::thread::spawn(|| {
            std::thread::sleep(Duration::from_secs(3));
            eprintln!("Graceful shutdown timed out (3s), forcing exit");
            std::process::exit(0);
        });
    })
    .context("Failed to set Ctrl+C handler")?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(num_cpus::get())
        .thread_name("hubnet-worker")
        .enable_all()
        .build()?;

    runtime.block_on(async_main(args, shutdown_rx))
}

async fn async_main(args: Args, mut shutdown: mpsc::UnboundedReceiver<()>) -> anyhow::Result<()> {
    init_tracing();

    let config = build_config_from_args(&args)?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        signaling_url = %config.signaling_url,
        max_capacity = config.max_capacity,
        stun_servers = config.stun_servers.len(),
        turn_servers = config.turn_servers.len(),
        relay_retry_limit = config.relay_retry_limit,
        codec_workers = config.codec_worker_cap(),
        "HubNet host starting"
    );

    let session = Arc::new(StaticSession {
        password: args.password.clone(),
        role: args.joiner_role.clone(),
    });
    let (host, events) = ConnectionOrchestrator::new(config.clone(), session, Arc::new(JsonCodec))?;
    host.start()?;
    tokio::spawn(log_events(events));

    let (socket, inbox) = RelaySocket::connect(&config.signaling_url).await?;
    let factory: Arc<dyn PeerLinkFactory> = Arc::new(RtcPeerLinkFactory::new(config));

    info!("Host running. Press Ctrl+C to shutdown.");
    let outcome = tokio::select! {
        _ = shutdown.recv() => Ok(()),
        result = host.serve_relay(socket, inbox, factory) => result,
    };

    host.teardown().await;
    info!(bytes_sent = host.get_bandwidth(), "HubNet host shut down");
    outcome.map_err(Into::into)
}

async fn log_events(mut events: mpsc::UnboundedReceiver<HostEvent>) {
    let mut last_count = None;
    while let Some(event) = events.recv().await {
        match event {
            HostEvent::PeerCount(count) => {
                if last_count != Some(count) {
                    info!(peers = count, "Active joiners changed");
                    last_count = Some(count);
                }
            }
            HostEvent::LoggedIn { peer_id, username } => {
                info!(peer_id = %peer_id, username = %username, "Joiner logged in");
            }
            HostEvent::Chat { username, message, .. } => {
                info!(username = %username, "Chat: {}", message);
            }
            HostEvent::PingMeasured { peer_id, millis } => {
                tracing::debug!(peer_id = %peer_id, millis, "Ping measured");
            }
            HostEvent::Relay { peer_id, payload } => {
                info!(peer_id = %peer_id, payload = %payload, "Relay message");
            }
            HostEvent::UnknownMessage { peer_id, message_type } => {
                warn!(peer_id = %peer_id, message_type = %message_type, "Unknown message");
            }
            HostEvent::Notice(text) => warn!("{}", text),
            HostEvent::Disconnected { peer_id } => info!(peer_id = %peer_id, "Joiner disconnected"),
        }
    }
}

fn init_tracing() {
    // RUST_LOG wins; otherwise info
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}
