//! Transport connection table for the authority
//!
//! This module tracks which UDP addresses currently hold a connection:
//! - Connection lifecycle (handshake, goodbye, timeout)
//! - Connection id allocation, starting at 1 since 0 is the local host
//! - Liveness tracking from any received datagram
//! - Capacity limits on concurrent connections
//!
//! A connection here is a transport concept only. Which persistent identity
//! speaks over it is the session registry's business.

use log::info;
use shared::ConnectionId;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// A live transport connection
#[derive(Debug)]
pub struct Client {
    /// Connection id assigned at handshake
    pub id: ConnectionId,
    /// Address responses are sent to
    pub addr: SocketAddr,
    /// Last time any datagram arrived from this address
    pub last_seen: Instant,
}

impl Client {
    pub fn new(id: ConnectionId, addr: SocketAddr) -> Self {
        Self {
            id,
            addr,
            last_seen: Instant::now(),
        }
    }

    pub fn touch(&mut self) {
        self.last_seen = Instant::now();
    }

    /// Returns true once the connection has been silent for longer than `timeout`
    pub fn is_timed_out(&self, timeout: Duration) -> bool {
        self.last_seen.elapsed() > timeout
    }
}

/// Table of live connections, indexed by id and by address
pub struct ClientManager {
    clients: HashMap<ConnectionId, Client>,
    by_addr: HashMap<SocketAddr, ConnectionId>,
    next_client_id: ConnectionId,
    max_clients: usize,
    timeout: Duration,
}

impl ClientManager {
    pub fn new(max_clients: usize, timeout: Duration) -> Self {
        Self {
            clients: HashMap::new(),
            by_addr: HashMap::new(),
            next_client_id: 1,
            max_clients,
            timeout,
        }
    }

    /// Opens a connection for `addr` and returns its id
    ///
    /// Returns `None` when the table is at capacity. Ids are never reused
    /// within a server run.
    pub fn add_client(&mut self, addr: SocketAddr) -> Option<ConnectionId> {
        if self.clients.len() >= self.max_clients {
            return None;
        }

        let client_id = self.next_client_id;
        self.next_client_id += 1;

        info!("Connection {} opened from {}", client_id, addr);
        self.clients.insert(client_id, Client::new(client_id, addr));
        self.by_addr.insert(addr, client_id);

        Some(client_id)
    }

    pub fn remove_client(&mut self, client_id: ConnectionId) -> bool {
        match self.clients.remove(&client_id) {
            Some(client) => {
                if self.by_addr.get(&client.addr) == Some(&client_id) {
                    self.by_addr.remove(&client.addr);
                }
                info!("Connection {} closed ({})", client.id, client.addr);
                true
            }
            None => false,
        }
    }

    pub fn find_client_by_addr(&self, addr: SocketAddr) -> Option<ConnectionId> {
        self.by_addr.get(&addr).copied()
    }

    pub fn addr_of(&self, client_id: ConnectionId) -> Option<SocketAddr> {
        self.clients.get(&client_id).map(|client| client.addr)
    }

    /// Records activity for a connection; false if it is unknown
    pub fn touch(&mut self, client_id: ConnectionId) -> bool {
        match self.clients.get_mut(&client_id) {
            Some(client) => {
                client.touch();
                true
            }
            None => false,
        }
    }

    /// Removes and returns every connection that has gone silent
    pub fn check_timeouts(&mut self) -> Vec<ConnectionId> {
        let timed_out: Vec<ConnectionId> = self
            .clients
            .iter()
            .filter(|(_, client)| client.is_timed_out(self.timeout))
            .map(|(id, _)| *id)
            .collect();

        for client_id in &timed_out {
            self.remove_client(*client_id);
        }

        timed_out
    }

    pub fn get_client_addrs(&self) -> Vec<(ConnectionId, SocketAddr)> {
        self.clients
            .iter()
            .map(|(id, client)| (*id, client.addr))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}
