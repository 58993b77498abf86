use clap::Parser;
use log::{info, warn};
use server::config::{SessionConfig, StartPolicy, DEFAULT_GRACE_PERIOD, DEFAULT_SETTLE_DELAY};
use server::error::ConfigError;
use server::map::MapDefinition;
use server::network::{HostCommand, Server, ServerMessage};
use server::protocol::SessionProtocol;
use shared::{is_valid_persistent_id, Role, DEFAULT_MAX_SLOTS, MAX_PERSISTENT_ID_LEN};
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server IP address to bind to
    #[arg(short = 'H', long, default_value = "127.0.0.1")]
    host: String,

    /// Server port to listen on
    #[arg(short, long, default_value = "8080")]
    port: u16,

    /// Rows in the session snapshot (at most 16)
    #[arg(long, default_value_t = DEFAULT_MAX_SLOTS)]
    max_slots: usize,

    /// Concurrent transport connections accepted
    #[arg(long, default_value = "16")]
    max_connections: usize,

    /// Seconds a disconnected participant keeps its slot and entity
    #[arg(long, default_value_t = DEFAULT_GRACE_PERIOD.as_secs())]
    grace_secs: u64,

    /// Milliseconds before a disconnect is believed
    #[arg(long, default_value_t = DEFAULT_SETTLE_DELAY.as_millis() as u64)]
    settle_ms: u64,

    /// Seconds of silence before a connection is dropped
    #[arg(long, default_value = "5")]
    connection_timeout_secs: u64,

    /// Connected participants needed to start
    #[arg(long, default_value = "1")]
    min_players: usize,

    /// Count spectators towards --min-players
    #[arg(long)]
    count_spectators: bool,

    /// Turn away new identities once every slot is taken
    #[arg(long)]
    reject_new_when_full: bool,

    /// Start the game as soon as everyone is ready
    #[arg(long)]
    auto_start: bool,

    /// Persistent id of the local host participant; no local participant if omitted
    #[arg(long)]
    host_id: Option<String>,

    /// Seat the local host as a spectator
    #[arg(long)]
    host_spectator: bool,

    /// Map declaration (JSON); the built-in arena if omitted
    #[arg(short, long)]
    map: Option<PathBuf>,
}

impl Args {
    fn session_config(&self) -> SessionConfig {
        SessionConfig {
            max_slots: self.max_slots,
            settle_delay: Duration::from_millis(self.settle_ms),
            grace_period: Duration::from_secs(self.grace_secs),
            start_policy: StartPolicy {
                min_players: self.min_players,
                count_spectators: self.count_spectators,
            },
            reject_new_when_full: self.reject_new_when_full,
            auto_start: self.auto_start,
        }
    }
}

/// Feeds console lines to the server as host commands.
fn spawn_console(server_tx: mpsc::UnboundedSender<ServerMessage>) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();

        while let Ok(Some(line)) = lines.next_line().await {
            if line.trim().is_empty() {
                continue;
            }
            match line.parse::<HostCommand>() {
                Ok(command) => {
                    if server_tx.send(ServerMessage::HostCommand(command)).is_err() {
                        break;
                    }
                }
                Err(e) => warn!("{} (try start, ready, unready, spectate, play, status, quit)", e),
            }
        }
    });
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();

    let config = args.session_config();
    config.validate()?;
    if let Some(host_id) = args.host_id.as_deref().filter(|id| !is_valid_persistent_id(id)) {
        return Err(ConfigError::Invalid(format!(
            "host id '{}' must be 1 to {} bytes",
            host_id, MAX_PERSISTENT_ID_LEN
        ))
        .into());
    }

    let map = match &args.map {
        Some(path) => MapDefinition::load(path)?,
        None => MapDefinition::default(),
    };
    info!(
        "Map '{}' with {} spawn points",
        map.name,
        map.spawn_points.len()
    );

    let address = format!("{}:{}", args.host, args.port);
    let protocol = SessionProtocol::new(config, map);
    let mut server = Server::new(
        &address,
        protocol,
        args.max_connections,
        Duration::from_secs(args.connection_timeout_secs),
    )
    .await?;

    if let Some(host_id) = &args.host_id {
        let role = Role::from_spectator_flag(args.host_spectator);
        info!("Local host '{}' joins as {:?}", host_id, role);
        server.register_host(host_id, role).await;
    }

    let server_tx = server.message_sender();
    spawn_console(server_tx.clone());

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl+C, shutting down gracefully...");
            let _ = server_tx.send(ServerMessage::Shutdown);
        }
    });

    info!("Type 'start' to begin once everyone is ready");
    server.run().await?;

    Ok(())
}
