use clap::{Parser, ValueEnum};
use client::game::ClientSession;
use client::identity::IdentityProvider;
use client::input::{MovementPattern, ScriptedIntent};
use client::network::Client;
use log::info;
use shared::prediction::{CorrectionMode, OverflowPolicy, PredictionConfig, DEFAULT_MAX_PENDING};
use shared::Role;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Overflow {
    DropOldest,
    Freeze,
}

impl From<Overflow> for OverflowPolicy {
    fn from(overflow: Overflow) -> Self {
        match overflow {
            Overflow::DropOldest => OverflowPolicy::DropOldest,
            Overflow::Freeze => OverflowPolicy::Freeze,
        }
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server address to connect to
    #[arg(short = 's', long, default_value = "127.0.0.1:8080")]
    server: String,

    /// File holding this peer's persistent id
    #[arg(short = 'i', long, default_value = "peer.id")]
    identity_file: PathBuf,

    /// Forget the stored id and create a new one
    #[arg(long)]
    reset_identity: bool,

    /// Join as a spectator
    #[arg(long)]
    spectator: bool,

    /// Mark ready as soon as the lobby is visible
    #[arg(short, long)]
    ready: bool,

    /// Scripted movement once an entity is assigned
    #[arg(long, value_enum, default_value = "circle")]
    pattern: MovementPattern,

    /// Unacknowledged inputs kept for replay
    #[arg(long, default_value_t = DEFAULT_MAX_PENDING)]
    max_pending: usize,

    /// What to do when the replay buffer is full
    #[arg(long, value_enum, default_value = "freeze")]
    overflow: Overflow,

    /// Fade corrections out, removing this share of the error per step (0..1)
    #[arg(long)]
    smooth: Option<f32>,

    /// Simulate network latency in milliseconds
    #[arg(short = 'l', long, default_value = "0")]
    fake_ping: u64,
}

impl Args {
    fn prediction_config(&self) -> PredictionConfig {
        PredictionConfig {
            max_pending: self.max_pending.max(1),
            overflow: self.overflow.into(),
            correction: match self.smooth {
                Some(blend) => CorrectionMode::Smooth { blend },
                None => CorrectionMode::Snap,
            },
            ..PredictionConfig::default()
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();

    let identity = IdentityProvider::new(&args.identity_file);
    if args.reset_identity {
        identity.reset_persistent_id()?;
    }
    let persistent_id = identity.get_or_create_persistent_id()?;
    let role = Role::from_spectator_flag(args.spectator);

    info!("Starting client as {} ({:?})", persistent_id, role);
    info!("Connecting to: {}", args.server);
    if args.fake_ping > 0 {
        info!("Simulating {}ms latency", args.fake_ping);
    }

    let session = ClientSession::new(persistent_id, role, args.prediction_config());
    let intents = Box::new(ScriptedIntent::new(args.pattern));

    let mut client = Client::new(&args.server, session, intents, args.ready, args.fake_ping).await?;

    client.run().await?;

    Ok(())
}
