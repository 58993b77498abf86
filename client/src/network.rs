use crate::game::ClientSession;
use crate::input::IntentSource;
use log::{error, info, warn};
use shared::{Packet, MAX_PACKET_SIZE, PROTOCOL_VERSION};
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::time::{interval, sleep, MissedTickBehavior};

/// Simulation step of the peer (60Hz)
const STEP: Duration = Duration::from_micros(16_667);
const JOIN_RETRY: Duration = Duration::from_millis(500);
const HEARTBEAT: Duration = Duration::from_secs(1);
/// Silence from the server after which the peer says hello again
const SERVER_SILENCE: Duration = Duration::from_secs(5);
const STATUS_EVERY: Duration = Duration::from_secs(5);

pub struct Client {
    socket: UdpSocket,
    server_addr: SocketAddr,
    session: ClientSession,
    intents: Box<dyn IntentSource + Send>,
    auto_ready: bool,

    fake_ping_ms: u64,
    last_heard: Instant,
}

impl Client {
    pub async fn new(
        server_addr: &str,
        session: ClientSession,
        intents: Box<dyn IntentSource + Send>,
        auto_ready: bool,
        fake_ping_ms: u64,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        let server_addr = server_addr.parse()?;

        Ok(Client {
            socket,
            server_addr,
            session,
            intents,
            auto_ready,
            fake_ping_ms,
            last_heard: Instant::now(),
        })
    }

    pub fn session(&self) -> &ClientSession {
        &self.session
    }

    async fn connect(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        info!("Connecting to server at {}...", self.server_addr);
        self.send_packet(&Packet::Hello {
            client_version: PROTOCOL_VERSION,
        })
        .await
    }

    async fn send_packet(&self, packet: &Packet) -> Result<(), Box<dyn std::error::Error>> {
        if self.fake_ping_ms > 0 {
            sleep(Duration::from_millis(self.fake_ping_ms / 2)).await;
        }

        let data = packet.encode()?;
        self.socket.send_to(&data, self.server_addr).await?;
        Ok(())
    }

    async fn send_all(&self, packets: Vec<Packet>) {
        for packet in packets {
            if let Err(e) = self.send_packet(&packet).await {
                error!("Error sending {:?}: {}", packet, e);
            }
        }
    }

    async fn handle_packet(&mut self, packet: Packet) {
        self.last_heard = Instant::now();

        let was_synced = self.session.has_snapshot();
        let mut replies = self.session.handle_packet(packet);

        if !was_synced && self.session.has_snapshot() && self.auto_ready && !self.session.is_ready()
        {
            replies.extend(self.session.set_ready(true));
        }

        self.send_all(replies).await;
    }

    /// Re-sends whatever the handshake is still waiting on.
    async fn retry_handshake(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        if self.session.connection_id().is_none() {
            self.connect().await
        } else if self.session.needs_join_retry() {
            let join = self.session.join_packet();
            self.send_packet(&join).await
        } else {
            Ok(())
        }
    }

    fn log_status(&self) {
        let stats = self.session.stats();
        let mover = self.session.mover();
        let position = mover.display_position();
        info!(
            "Entity {:?} at ({:.2}, {:.2}, {:.2}); tick {} acked {}, {} pending; corrections {} (max error {:.3}, ignored {})",
            self.session.entity(),
            position.x,
            position.y,
            position.z,
            mover.last_tick(),
            mover.acknowledged_tick(),
            mover.pending_len(),
            stats.applied,
            stats.max_error,
            stats.ignored
        );
        if mover.is_frozen() {
            warn!("Prediction frozen waiting for acknowledgements");
        }
    }

    pub async fn run(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        self.connect().await?;

        let mut step_interval = interval(STEP);
        step_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut retry_interval = interval(JOIN_RETRY);
        let mut heartbeat_interval = interval(HEARTBEAT);
        let mut status_interval = interval(STATUS_EVERY);
        let dt = STEP.as_secs_f32();

        let mut buffer = [0u8; MAX_PACKET_SIZE];

        loop {
            tokio::select! {
                result = self.socket.recv_from(&mut buffer) => {
                    match result {
                        Ok((len, _)) => {
                            if self.fake_ping_ms > 0 {
                                sleep(Duration::from_millis(self.fake_ping_ms / 2)).await;
                            }

                            match Packet::decode(&buffer[..len]) {
                                Ok(packet) => self.handle_packet(packet).await,
                                Err(e) => warn!("Malformed packet from server: {}", e),
                            }
                        },
                        Err(e) => error!("Error receiving packet: {}", e),
                    }

                    if let Some(reason) = self.session.rejection() {
                        error!("Giving up: {}", reason);
                        return Ok(());
                    }
                },

                _ = step_interval.tick() => {
                    let intent = self.intents.sample(dt);
                    if let Some(input) = self.session.step(intent, dt) {
                        if let Err(e) = self.send_packet(&input).await {
                            error!("Error sending input: {}", e);
                        }
                    }
                },

                _ = retry_interval.tick() => {
                    if self.session.connection_id().is_some()
                        && self.last_heard.elapsed() > SERVER_SILENCE
                    {
                        warn!("Server silent for {:?}, reconnecting", SERVER_SILENCE);
                        self.session.connection_lost();
                        self.last_heard = Instant::now();
                    }
                    if let Err(e) = self.retry_handshake().await {
                        error!("Error retrying handshake: {}", e);
                    }
                },

                _ = heartbeat_interval.tick() => {
                    if self.session.connection_id().is_some() {
                        if let Err(e) = self.send_packet(&Packet::Heartbeat).await {
                            error!("Error sending heartbeat: {}", e);
                        }
                    }
                },

                _ = status_interval.tick() => {
                    if self.session.is_game_started() {
                        self.log_status();
                    }
                },

                _ = tokio::signal::ctrl_c() => {
                    info!("Leaving session");
                    break;
                },
            }
        }

        if self.session.connection_id().is_some() {
            let _ = self.send_packet(&Packet::Goodbye).await;
        }

        Ok(())
    }
}
