//! Server network layer: UDP transport and the single-writer session loop
//!
//! Socket I/O, timeout detection and timers all run in their own tasks and
//! report back over channels. Only [`Server::run`] touches the
//! [`SessionProtocol`], one event at a time, and carries out the effects
//! each event produces.

use crate::client_manager::ClientManager;
use crate::protocol::{Effect, SessionProtocol, SessionTimer, TimerKey};
use crate::scheduler::{Fired, TimerScheduler};
use log::{debug, error, info, warn};
use shared::{
    ConnectionId, Packet, Role, AUTHORITY_CONNECTION_ID, MAX_PACKET_SIZE, PROTOCOL_VERSION,
};
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, RwLock};

/// Messages sent from network tasks and the host console to the main loop
#[derive(Debug)]
pub enum ServerMessage {
    PacketReceived {
        packet: Packet,
        addr: SocketAddr,
    },
    ConnectionTimeout {
        connection_id: ConnectionId,
    },
    HostCommand(HostCommand),
    Shutdown,
}

/// Messages sent from the main loop to the sender task
#[derive(Debug)]
pub enum GameMessage {
    SendPacket {
        packet: Packet,
        addr: SocketAddr,
    },
    BroadcastPacket {
        packet: Packet,
        exclude: Option<ConnectionId>,
    },
}

/// Commands the operator of the authority types on its console
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostCommand {
    Start,
    Ready(bool),
    Role(Role),
    Status,
    Quit,
}

impl FromStr for HostCommand {
    type Err = String;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        match line.trim().to_ascii_lowercase().as_str() {
            "start" => Ok(HostCommand::Start),
            "ready" => Ok(HostCommand::Ready(true)),
            "unready" => Ok(HostCommand::Ready(false)),
            "spectate" => Ok(HostCommand::Role(Role::Spectator)),
            "play" => Ok(HostCommand::Role(Role::Player)),
            "status" => Ok(HostCommand::Status),
            "quit" | "exit" => Ok(HostCommand::Quit),
            other => Err(format!("unknown command '{}'", other)),
        }
    }
}

/// Authority node coordinating networking and the session
pub struct Server {
    socket: Arc<UdpSocket>,
    clients: Arc<RwLock<ClientManager>>,
    protocol: SessionProtocol,
    timers: TimerScheduler<TimerKey, SessionTimer>,
    host_identity: Option<String>,

    // Communication channels
    server_tx: mpsc::UnboundedSender<ServerMessage>,
    server_rx: mpsc::UnboundedReceiver<ServerMessage>,
    game_tx: mpsc::UnboundedSender<GameMessage>,
    game_rx: mpsc::UnboundedReceiver<GameMessage>,
    fired_rx: mpsc::UnboundedReceiver<Fired<TimerKey>>,
}

impl Server {
    pub async fn new(
        addr: &str,
        protocol: SessionProtocol,
        max_connections: usize,
        connection_timeout: Duration,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        info!("Server listening on {}", socket.local_addr()?);

        let (server_tx, server_rx) = mpsc::unbounded_channel();
        let (game_tx, game_rx) = mpsc::unbounded_channel();
        let (timers, fired_rx) = TimerScheduler::new();

        Ok(Server {
            socket,
            clients: Arc::new(RwLock::new(ClientManager::new(
                max_connections,
                connection_timeout,
            ))),
            protocol,
            timers,
            host_identity: None,
            server_tx,
            server_rx,
            game_tx,
            game_rx,
            fired_rx,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Handle for feeding host commands or a shutdown into the main loop
    pub fn message_sender(&self) -> mpsc::UnboundedSender<ServerMessage> {
        self.server_tx.clone()
    }

    pub fn protocol(&self) -> &SessionProtocol {
        &self.protocol
    }

    /// Seats the authority's own participant on the local connection.
    pub async fn register_host(&mut self, persistent_id: &str, role: Role) {
        self.host_identity = Some(persistent_id.to_string());
        let effects = self.protocol.register_authority(persistent_id, role);
        self.execute(effects).await;
    }

    /// Spawns task that continuously listens for incoming packets
    fn spawn_network_receiver(&self) {
        let socket = Arc::clone(&self.socket);
        let server_tx = self.server_tx.clone();

        tokio::spawn(async move {
            let mut buffer = [0u8; MAX_PACKET_SIZE];

            loop {
                match socket.recv_from(&mut buffer).await {
                    Ok((len, addr)) => match Packet::decode(&buffer[..len]) {
                        Ok(packet) => {
                            if let Err(e) =
                                server_tx.send(ServerMessage::PacketReceived { packet, addr })
                            {
                                error!("Failed to send packet to main loop: {}", e);
                                break;
                            }
                        }
                        Err(e) => warn!("Malformed packet from {}: {}", addr, e),
                    },
                    Err(e) => {
                        error!("Error receiving packet: {}", e);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                }
            }
        });
    }

    /// Spawns task that drains the outgoing packet queue
    fn spawn_network_sender(&mut self) {
        let socket = Arc::clone(&self.socket);
        let clients = Arc::clone(&self.clients);
        let mut game_rx = std::mem::replace(&mut self.game_rx, mpsc::unbounded_channel().1);

        tokio::spawn(async move {
            while let Some(message) = game_rx.recv().await {
                match message {
                    GameMessage::SendPacket { packet, addr } => {
                        if let Err(e) = Self::send_packet_impl(&socket, &packet, addr).await {
                            error!("Failed to send packet to {}: {}", addr, e);
                        }
                    }
                    GameMessage::BroadcastPacket { packet, exclude } => {
                        let client_addrs = {
                            let clients_guard = clients.read().await;
                            clients_guard.get_client_addrs()
                        };

                        for (client_id, addr) in client_addrs {
                            if Some(client_id) == exclude {
                                continue;
                            }

                            if let Err(e) = Self::send_packet_impl(&socket, &packet, addr).await {
                                error!("Failed to send to connection {}: {}", client_id, e);
                            }
                        }
                    }
                }
            }
        });
    }

    /// Spawns task that reports connections gone silent
    fn spawn_timeout_checker(&self) {
        let clients = Arc::clone(&self.clients);
        let server_tx = self.server_tx.clone();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));

            loop {
                interval.tick().await;

                let timed_out = {
                    let mut clients_guard = clients.write().await;
                    clients_guard.check_timeouts()
                };

                for connection_id in timed_out {
                    if let Err(e) = server_tx.send(ServerMessage::ConnectionTimeout { connection_id })
                    {
                        error!("Failed to send timeout message: {}", e);
                        return;
                    }
                }
            }
        });
    }

    async fn send_packet_impl(
        socket: &UdpSocket,
        packet: &Packet,
        addr: SocketAddr,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let data = packet.encode()?;
        socket.send_to(&data, addr).await?;
        Ok(())
    }

    fn send_packet(&self, packet: Packet, addr: SocketAddr) {
        if let Err(e) = self.game_tx.send(GameMessage::SendPacket { packet, addr }) {
            error!("Failed to queue packet for sending: {}", e);
        }
    }

    fn broadcast_packet(&self, packet: Packet, exclude: Option<ConnectionId>) {
        if let Err(e) = self.game_tx.send(GameMessage::BroadcastPacket { packet, exclude }) {
            error!("Failed to queue broadcast packet: {}", e);
        }
    }

    /// Carries out what the protocol asked for.
    async fn execute(&mut self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Send { to, packet } => {
                    if to == AUTHORITY_CONNECTION_ID {
                        Self::deliver_local(&packet);
                        continue;
                    }
                    let addr = self.clients.read().await.addr_of(to);
                    match addr {
                        Some(addr) => self.send_packet(packet, addr),
                        None => debug!("Dropping {:?} for closed connection {}", packet, to),
                    }
                }
                Effect::Broadcast { packet } => {
                    if self.host_identity.is_some() {
                        Self::deliver_local(&packet);
                    }
                    self.broadcast_packet(packet, None);
                }
                Effect::Schedule { timer, delay } => {
                    debug!("Arming {:?} in {:?}", timer, delay);
                    self.timers.schedule(timer.key(), delay, timer);
                }
                Effect::Cancel { key } => {
                    if self.timers.cancel(&key) {
                        debug!("Cancelled {:?} timer for {}", key.kind, key.persistent_id);
                    }
                }
            }
        }
    }

    /// The host's own view of traffic addressed to it.
    fn deliver_local(packet: &Packet) {
        match packet {
            Packet::SessionSnapshot { slots } => {
                for row in slots {
                    debug!("[host] {}", row);
                }
            }
            Packet::GameStarted => info!("[host] Game started"),
            Packet::EntityAssigned {
                entity_id,
                position,
                ..
            } => info!(
                "[host] Controlling entity {} at ({:.1}, {:.1}, {:.1})",
                entity_id, position.x, position.y, position.z
            ),
            other => debug!("[host] {:?}", other),
        }
    }

    async fn handle_packet(&mut self, packet: Packet, addr: SocketAddr) {
        match packet {
            Packet::Hello { client_version } => self.handle_hello(client_version, addr).await,

            Packet::Goodbye => {
                let connection_id = {
                    let mut clients = self.clients.write().await;
                    let id = clients.find_client_by_addr(addr);
                    if let Some(id) = id {
                        clients.remove_client(id);
                    }
                    id
                };
                if let Some(connection_id) = connection_id {
                    let effects = self.protocol.on_disconnected(connection_id);
                    self.execute(effects).await;
                }
            }

            other => {
                let connection_id = {
                    let mut clients = self.clients.write().await;
                    let id = clients.find_client_by_addr(addr);
                    if let Some(id) = id {
                        clients.touch(id);
                    }
                    id
                };
                let Some(connection_id) = connection_id else {
                    warn!("Packet from {} without a connection, ignoring", addr);
                    return;
                };

                if other == Packet::Heartbeat {
                    self.send_packet(Packet::Heartbeat, addr);
                    return;
                }

                let effects = self.protocol.handle_message(connection_id, other);
                self.execute(effects).await;
            }
        }
    }

    async fn handle_hello(&mut self, client_version: u32, addr: SocketAddr) {
        info!(
            "Peer connecting from {} (version: {})",
            addr, client_version
        );

        if client_version != PROTOCOL_VERSION {
            warn!(
                "Rejecting {}: protocol version {} (expected {})",
                addr, client_version, PROTOCOL_VERSION
            );
            self.send_packet(
                Packet::Rejected {
                    reason: format!("Protocol version {} required", PROTOCOL_VERSION),
                },
                addr,
            );
            return;
        }

        // A repeated hello replaces the old connection from that address
        let existing = {
            let mut clients = self.clients.write().await;
            let id = clients.find_client_by_addr(addr);
            if let Some(id) = id {
                clients.remove_client(id);
            }
            id
        };
        if let Some(existing_id) = existing {
            info!("Replacing connection {} from {}", existing_id, addr);
            let effects = self.protocol.on_disconnected(existing_id);
            self.execute(effects).await;
        }

        let connection_id = {
            let mut clients = self.clients.write().await;
            clients.add_client(addr)
        };

        match connection_id {
            Some(connection_id) => {
                self.send_packet(Packet::Welcome { connection_id }, addr);
                let effects = self.protocol.on_connected(connection_id);
                self.execute(effects).await;
            }
            None => self.send_packet(
                Packet::Rejected {
                    reason: "Server full".to_string(),
                },
                addr,
            ),
        }
    }

    async fn handle_host_command(&mut self, command: HostCommand) {
        let effects = match command {
            HostCommand::Start => self.protocol.try_start_game(),
            HostCommand::Ready(ready) => match self.host_identity.clone() {
                Some(id) => self.protocol.set_ready(&id, ready),
                None => {
                    warn!("No local host participant registered");
                    Vec::new()
                }
            },
            HostCommand::Role(role) => match self.host_identity.clone() {
                Some(id) => self.protocol.set_role(&id, role),
                None => {
                    warn!("No local host participant registered");
                    Vec::new()
                }
            },
            HostCommand::Status => {
                info!(
                    "Phase {:?}, {} participants, can start: {}",
                    self.protocol.phase(),
                    self.protocol.registry().len(),
                    self.protocol.can_start()
                );
                for row in self.protocol.snapshot().slots {
                    info!("  {}", row);
                }
                Vec::new()
            }
            HostCommand::Quit => Vec::new(),
        };
        self.execute(effects).await;
    }

    async fn handle_fired(&mut self, fired: Fired<TimerKey>) {
        match self.timers.take_fired(&fired) {
            Some(timer) => {
                let effects = self.protocol.on_timer(timer);
                self.execute(effects).await;
            }
            None => debug!("Discarding superseded timer {:?}", fired.key),
        }
    }

    /// Tells every peer the session is going away.
    async fn say_goodbye(&self) {
        let client_addrs = self.clients.read().await.get_client_addrs();
        for (client_id, addr) in client_addrs {
            if let Err(e) = Self::send_packet_impl(&self.socket, &Packet::Goodbye, addr).await {
                warn!("Failed to say goodbye to connection {}: {}", client_id, e);
            }
        }
    }

    /// Main server loop coordinating all operations
    pub async fn run(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        self.spawn_network_receiver();
        self.spawn_network_sender();
        self.spawn_timeout_checker();

        info!("Server started successfully");

        loop {
            tokio::select! {
                message = self.server_rx.recv() => {
                    match message {
                        Some(ServerMessage::PacketReceived { packet, addr }) => {
                            self.handle_packet(packet, addr).await;
                        }
                        Some(ServerMessage::ConnectionTimeout { connection_id }) => {
                            info!("Connection {} timed out", connection_id);
                            let effects = self.protocol.on_disconnected(connection_id);
                            self.execute(effects).await;
                        }
                        Some(ServerMessage::HostCommand(HostCommand::Quit))
                        | Some(ServerMessage::Shutdown)
                        | None => {
                            info!("Server shutting down");
                            break;
                        }
                        Some(ServerMessage::HostCommand(command)) => {
                            self.handle_host_command(command).await;
                        }
                    }
                }

                Some(fired) = self.fired_rx.recv() => {
                    self.handle_fired(fired).await;
                }
            }
        }

        self.say_goodbye().await;
        Ok(())
    }
}
