//! # Session Peer Library
//!
//! This library provides a headless peer for the session authority. It
//! joins under a persistent identity, follows the lobby, and once it has
//! been handed an entity drives it with client-side prediction.
//!
//! ## Architecture Overview
//!
//! ### Client-Side Prediction
//! Movement is applied locally the moment it is produced and sent to the
//! authority tagged with a tick number. The peer never waits for the
//! authority before moving.
//!
//! ### Server Reconciliation
//! Each correction from the authority carries an authoritative position and
//! the tick it acknowledges. The peer drops acknowledged inputs, adopts the
//! authoritative position and replays the rest on top. Stale corrections
//! are ignored.
//!
//! ### Reconnection
//! The identity lives in a file, so a restarted or reconnecting peer is
//! recognised by the authority and gets its slot and entity back.
//!
//! ## Module Organization
//!
//! ### Identity Module (`identity`)
//! Reads, creates and resets the persistent id file.
//!
//! ### Input Module (`input`)
//! The [`input::IntentSource`] seam plus scripted movement patterns.
//!
//! ### Game Module (`game`)
//! [`game::ClientSession`], the peer's view of the session and owner of the
//! predictor. Pure state: packets in, replies out.
//!
//! ### Network Module (`network`)
//! UDP socket handling, the handshake and join retries, heartbeats and the
//! 60Hz simulation step.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use client::game::ClientSession;
//! use client::identity::IdentityProvider;
//! use client::input::{MovementPattern, ScriptedIntent};
//! use client::network::Client;
//! use shared::prediction::PredictionConfig;
//! use shared::Role;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let id = IdentityProvider::new("peer.id").get_or_create_persistent_id()?;
//!     let session = ClientSession::new(id, Role::Player, PredictionConfig::default());
//!     let intents = Box::new(ScriptedIntent::new(MovementPattern::Circle));
//!
//!     let mut client = Client::new("127.0.0.1:8080", session, intents, true, 0).await?;
//!     client.run().await?;
//!     Ok(())
//! }
//! ```

pub mod game;
pub mod identity;
pub mod input;
pub mod network;
