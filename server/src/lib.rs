//! # Session Authority Library
//!
//! This library provides the authoritative side of a small multiplayer
//! session. It owns the single source of truth for who is in the session,
//! what role each participant plays, whether they are ready, and which
//! in-world entity each of them controls. It also answers every movement
//! input with the authoritative position peers reconcile against.
//!
//! ## Core Responsibilities
//!
//! ### Participant Tracking
//! Participants are keyed by a persistent identity that survives
//! reconnects, not by their transport connection. A peer that drops and
//! comes back within the grace period resumes its record, readiness and
//! entity; one that stays away is removed and its entity despawned.
//!
//! ### Entity Ownership
//! Every player has at most one avatar for the lifetime of its record.
//! Reconnects move ownership of that avatar to the new connection instead
//! of spawning a second one. Spectators get a passive observer.
//!
//! ### Movement Authority
//! Peers predict their own movement and send one input per tick. The
//! authority applies each input once, in tick order, and replies with the
//! resulting position and the acknowledged tick.
//!
//! ## Architecture Design
//!
//! ### Sans-IO State Machine
//! [`protocol::SessionProtocol`] never touches sockets or clocks. Each event
//! returns a list of [`protocol::Effect`]s (sends, broadcasts, timers to arm
//! or cancel) that the network layer carries out. The whole state machine
//! can therefore be driven from plain unit tests.
//!
//! ### Single-Writer Event Loop
//! [`network::Server::run`] is the only place protocol state changes.
//! Socket reads, timeout checks and timers run as separate tasks and feed
//! the loop through channels, so every transition and the snapshot that
//! follows it happen without interleaving.
//!
//! ### Settle and Grace Timers
//! A transport disconnect is only believed after a short settle delay, and
//! a disconnected participant is only removed after the grace period. Both
//! are cancellable, generation-checked timers from [`scheduler`], so a
//! reconnect that races a timer always wins.
//!
//! ## Module Organization
//!
//! - `registry`: participant records, slot order and snapshots
//! - `protocol`: the session state machine and message dispatch
//! - `lifecycle`: spawning, restoring, re-owning and despawning entities
//! - `scheduler`: cancellable one-shot timers
//! - `map`: spawn points and the avatar template
//! - `client_manager`: UDP connection table and liveness
//! - `network`: sockets, the event loop and the host console commands
//! - `config` / `error`: configuration and error types
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::config::SessionConfig;
//! use server::map::MapDefinition;
//! use server::network::Server;
//! use server::protocol::SessionProtocol;
//! use shared::Role;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let protocol = SessionProtocol::new(SessionConfig::default(), MapDefinition::default());
//!     let mut server = Server::new("127.0.0.1:8080", protocol, 16, Duration::from_secs(5)).await?;
//!
//!     // The host plays too, seated on connection 0
//!     server.register_host("host", Role::Player).await;
//!
//!     server.run().await?;
//!     Ok(())
//! }
//! ```

pub mod client_manager;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod map;
pub mod network;
pub mod protocol;
pub mod registry;
pub mod scheduler;
