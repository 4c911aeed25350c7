//! VoiceMesh client binary
//!
//! Joins an audio room through the relay server and keeps a direct WebRTC
//! connection to every other participant until Ctrl+C.
//!
//! # Usage
//!
//! ```bash
//! # Join a room on a local relay
//! voicemesh-client --server-url ws://localhost:8000/ws --room standup
//!
//! # Load settings from a file, override retries, log as JSON
//! voicemesh-client --config voicemesh.toml --max-retries 8 --log-json
//!
//! # Custom STUN/TURN servers
//! voicemesh-client --room standup \
//!   --stun-servers stun:stun.example.org:3478 \
//!   --turn-servers turn:turn.example.org:3478:user:secret
//! ```

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use voicemesh_core::candidate::CandidateType;
use voicemesh_core::config::TurnServerConfig;
use voicemesh_core::{
    CandidatePolicy, ClientConfig, PeerId, PeerSessionManager, RelayMessage, SessionConfig,
    SessionEvent,
};
use voicemesh_webrtc::{NullCaptureDevices, RelayClient, RelayEvent, WebRtcTransportFactory};

const DEFAULT_LOG_FILTER: &str = "info,voicemesh_core=debug,voicemesh_webrtc=debug";

/// VoiceMesh audio room client
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Relay server URL (ws:// or wss://); the identity is appended as a path segment
    #[arg(long, env = "VOICEMESH_SERVER_URL")]
    server_url: Option<String>,

    /// Local identity (generated when absent)
    #[arg(long, env = "VOICEMESH_IDENTITY")]
    identity: Option<String>,

    /// Room to join
    #[arg(long, env = "VOICEMESH_ROOM")]
    room: Option<String>,

    /// Configuration file (TOML, or JSON by extension)
    #[arg(long, env = "VOICEMESH_CONFIG")]
    config: Option<PathBuf>,

    /// Capture device id
    #[arg(long, env = "VOICEMESH_DEVICE")]
    device: Option<String>,

    /// Session timing preset: lan, mobile
    #[arg(long, env = "VOICEMESH_PRESET")]
    preset: Option<SessionPreset>,

    /// Negotiation attempts per peer before giving up
    #[arg(long, env = "VOICEMESH_MAX_RETRIES")]
    max_retries: Option<u32>,

    /// Time allowed for one offer/answer exchange in milliseconds
    #[arg(long, env = "VOICEMESH_NEGOTIATION_TIMEOUT_MS")]
    negotiation_timeout_ms: Option<u64>,

    /// STUN servers (comma-separated)
    #[arg(long, value_delimiter = ',', env = "VOICEMESH_STUN_SERVERS")]
    stun_servers: Vec<String>,

    /// TURN servers (format: turn:host:port:username:password, comma-separated)
    #[arg(long, value_delimiter = ',', env = "VOICEMESH_TURN_SERVERS")]
    turn_servers: Vec<String>,

    /// Emit logs as JSON lines
    #[arg(long, default_value_t = false, env = "VOICEMESH_LOG_JSON")]
    log_json: bool,
}

/// Session timing preset
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum SessionPreset {
    /// Short timeouts and backoff for local networks
    Lan,
    /// Long timeouts and more retries for flaky links
    Mobile,
}

impl From<SessionPreset> for SessionConfig {
    fn from(preset: SessionPreset) -> Self {
        match preset {
            SessionPreset::Lan => SessionConfig::aggressive(),
            SessionPreset::Mobile => SessionConfig::conservative(),
        }
    }
}

/// Parse TURN server string (format: turn:host:port:username:password)
fn parse_turn_server(s: &str) -> Result<TurnServerConfig, String> {
    let parts: Vec<&str> = s.split(':').collect();
    if parts.len() < 5 {
        return Err(format!(
            "Invalid TURN server format: '{}'. Expected: turn:host:port:username:password",
            s
        ));
    }

    let protocol = parts[0];
    if protocol != "turn" && protocol != "turns" {
        return Err(format!(
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

/// File settings (or defaults) with CLI/environment overrides applied
fn build_config(args: &Args) -> anyhow::Result<ClientConfig> {
    let mut config = match &args.config {
        Some(path) => ClientConfig::from_file(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => ClientConfig::default(),
    };

    if let Some(preset) = args.preset {
        info!("Using {:?} session preset", preset);
        let policy = config.session.candidate_policy.clone();
        config.session = preset.into();
        // A policy set in the config file wins over the preset's
        if policy != CandidatePolicy::default() {
            config.session.candidate_policy = policy;
        }
    }
    if let Some(max_retries) = args.max_retries {
        config.session.max_retries = max_retries;
    }
    if let Some(timeout_ms) = args.negotiation_timeout_ms {
        config.session.negotiation_timeout_ms = timeout_ms;
    }
    if let Some(url) = &args.server_url {
        config.relay.server_url = url.clone();
    }
    if !args.stun_servers.is_empty() {
        config.ice.stun_servers = args.stun_servers.clone();
    }
    for turn in &args.turn_servers {
        let turn = parse_turn_server(turn).map_err(anyhow::Error::msg)?;
        info!("Adding TURN server: {} (user: {})", turn.url, turn.username);
        config.ice.turn_servers.push(turn);
    }
    if !args.turn_servers.is_empty()
        && config.session.candidate_policy.denies(CandidateType::Relay)
    {
        info!("TURN servers given, allowing relay candidates");
        config.session.candidate_policy.allow(CandidateType::Relay);
    }
    if args.identity.is_some() {
        config.identity = args.identity.clone();
    }
    if args.room.is_some() {
        config.room = args.room.clone();
    }
    if args.device.is_some() {
        config.device = args.device.clone();
    }

    if config.identity.is_none() {
        let generated = uuid::Uuid::new_v4().simple().to_string();
        config.identity = Some(format!("user-{}", &generated[..8]));
    }

    config.validate()?;
    Ok(config)
}

fn init_tracing(json: bool) -> anyhow::Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(DEFAULT_LOG_FILTER))?;

    let registry = tracing_subscriber::registry().with(env_filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
    Ok(())
}

fn log_event(event: &SessionEvent) {
    match event {
        SessionEvent::PeerConnected(peer_id) => info!(peer_id = %peer_id, "Peer connected"),
        SessionEvent::PeerDisconnected(peer_id) => warn!(peer_id = %peer_id, "Peer disconnected"),
        SessionEvent::ConnectionFailed(peer_id) => {
            error!(peer_id = %peer_id, "Connection failed after all retries")
        }
        SessionEvent::StateChanged { .. } => {}
    }
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_json)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .thread_name("voicemesh-worker")
        .enable_all()
        .build()?;

    runtime.block_on(run(args))
}

async fn run(args: Args) -> anyhow::Result<()> {
    let config = build_config(&args)?;
    let room = config
        .room
        .clone()
        .context("a room is required (--room or `room` in the config file)")?;
    let identity = config.identity.clone().unwrap_or_default();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        identity = %identity,
        room = %room,
        server_url = %config.relay.server_url,
        "VoiceMesh client starting"
    );

    let (relay, mut relay_events) = RelayClient::connect(config.relay.clone(), &identity).await?;
    let factory = Arc::new(WebRtcTransportFactory::new(config.ice.clone())?);
    let devices = Arc::new(NullCaptureDevices::new());

    let manager = PeerSessionManager::builder(
        PeerId::from(identity.clone()),
        factory,
        relay.clone(),
        devices,
    )
    .config(config.session.clone())
    .build()?;

    let mut events = manager.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => log_event(&event),
                Err(RecvError::Lagged(skipped)) => warn!("Skipped {} session events", skipped),
                Err(RecvError::Closed) => break,
            }
        }
    });

    manager.start_capture(config.device.as_deref()).await?;

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("Ctrl+C received, shutting down");
                break;
            }
            event = relay_events.recv() => match event {
                Some(RelayEvent::Connected) => {
                    info!(room = %room, "Relay connected, joining room");
                    relay.enqueue(RelayMessage::JoinRoom { room_id: room.clone() })?;
                }
                Some(RelayEvent::Disconnected) => {
                    warn!("Relay disconnected; existing peer connections stay up");
                }
                Some(RelayEvent::Message(message)) => manager.on_relay_message(message).await,
                Some(RelayEvent::GaveUp) | None => {
                    error!("Relay unavailable, shutting down");
                    break;
                }
            }
        }
    }

    let status = manager.status().await;
    info!(
        connected = status.connected_peers().len(),
        sessions = status.sessions.len(),
        "Closing peer sessions"
    );
    manager.shutdown_all().await;
    relay.disconnect();
    Ok(())
}
