//! Error taxonomy for the authority.
//!
//! Unknown identities and connections are usually not surfaced as errors at
//! all: the registry answers `None`/`false` and the protocol logs and moves
//! on. The types here cover the cases a caller has to branch on.

use shared::ConnectionId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("lobby is full ({max_slots} slots)")]
    LobbyFull { max_slots: usize },
    #[error("persistent id must be 1 to {max_len} bytes, got {len}")]
    InvalidIdentity { len: usize, max_len: usize },
    #[error("unknown persistent id {0}")]
    UnknownIdentity(String),
    #[error("unknown connection {0}")]
    UnknownConnection(ConnectionId),
    #[error("connection {connection_id} may not act for {persistent_id}")]
    IdentityMismatch {
        connection_id: ConnectionId,
        persistent_id: String,
    },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SpawnError {
    #[error("map declares no avatar template")]
    MissingTemplate,
    #[error("ownership of entity {entity_id} may not move to the authority's local connection")]
    AuthorityOwnership { entity_id: u32 },
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse map {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}
