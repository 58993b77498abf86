//! Session state machine on the authority
//!
//! [`SessionProtocol`] owns the registry and the lifecycle manager and is
//! the only thing that mutates them. It never touches a socket or a clock:
//! each entry point returns the [`Effect`]s the caller must carry out
//! (messages to send, timers to arm or disarm). The network loop feeds it
//! one event at a time, which keeps every transition and the snapshot that
//! follows it atomic.
//!
//! Per participant the states are
//! `Unseen -> Connected(role) -> DisconnectedGrace -> Removed`, with a join
//! during the grace period leading back to `Connected`.

use crate::config::SessionConfig;
use crate::error::SessionError;
use crate::lifecycle::{EntityLifecycleManager, SpawnOutcome};
use crate::map::MapDefinition;
use crate::registry::{JoinKind, SessionRegistry, SessionSnapshot};
use log::{debug, error, info, warn};
use shared::prediction::PredictedInput;
use shared::{
    is_valid_persistent_id, ConnectionId, Packet, Role, Tick, Vec2, AUTHORITY_CONNECTION_ID,
    MAX_PERSISTENT_ID_LEN,
};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    DisconnectSettle,
    GraceExpiry,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TimerKey {
    pub persistent_id: String,
    pub kind: TimerKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionTimer {
    /// Believe a transport disconnect once it has settled.
    DisconnectSettle {
        persistent_id: String,
        connection_id: ConnectionId,
    },
    /// Remove a participant that never came back.
    GraceExpiry { persistent_id: String },
}

impl SessionTimer {
    pub fn key(&self) -> TimerKey {
        match self {
            SessionTimer::DisconnectSettle { persistent_id, .. } => TimerKey {
                persistent_id: persistent_id.clone(),
                kind: TimerKind::DisconnectSettle,
            },
            SessionTimer::GraceExpiry { persistent_id } => TimerKey {
                persistent_id: persistent_id.clone(),
                kind: TimerKind::GraceExpiry,
            },
        }
    }
}

/// Work the protocol asks its host to carry out.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    Send { to: ConnectionId, packet: Packet },
    Broadcast { packet: Packet },
    Schedule { timer: SessionTimer, delay: Duration },
    Cancel { key: TimerKey },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Lobby,
    InGame,
}

pub struct SessionProtocol {
    config: SessionConfig,
    registry: SessionRegistry,
    lifecycle: EntityLifecycleManager,
    phase: SessionPhase,
}

impl SessionProtocol {
    pub fn new(config: SessionConfig, map: MapDefinition) -> Self {
        Self {
            registry: SessionRegistry::new(config.max_slots),
            lifecycle: EntityLifecycleManager::new(map),
            phase: SessionPhase::Lobby,
            config,
        }
    }

    /// Registers the authority's own participant on the local connection.
    /// The host is ready from the start.
    pub fn register_authority(&mut self, persistent_id: &str, role: Role) -> Vec<Effect> {
        self.lifecycle.set_authority_identity(persistent_id);
        let mut effects = self.handle_join(AUTHORITY_CONNECTION_ID, persistent_id, role);
        if self.registry.set_ready(persistent_id, true) {
            self.after_state_change(&mut effects);
        }
        effects
    }

    pub fn on_connected(&mut self, connection_id: ConnectionId) -> Vec<Effect> {
        debug!("Connection {} up, awaiting join", connection_id);
        Vec::new()
    }

    /// Transport lost a connection. The registry is only updated once the
    /// settle delay has passed without a reconnect.
    pub fn on_disconnected(&mut self, connection_id: ConnectionId) -> Vec<Effect> {
        self.lifecycle.release_observer(connection_id);

        let Some(persistent_id) = self.registry.identity_for(connection_id) else {
            debug!("Connection {} closed before joining", connection_id);
            return Vec::new();
        };

        vec![Effect::Schedule {
            timer: SessionTimer::DisconnectSettle {
                persistent_id: persistent_id.to_string(),
                connection_id,
            },
            delay: self.config.settle_delay,
        }]
    }

    /// Single dispatch point for everything a peer can send.
    pub fn handle_message(&mut self, sender: ConnectionId, packet: Packet) -> Vec<Effect> {
        match packet {
            Packet::Join {
                persistent_id,
                desired_role,
            } => self.handle_join(sender, &persistent_id, desired_role),
            Packet::LobbySyncRequest => {
                debug!("Lobby sync for connection {}", sender);
                vec![Effect::Send {
                    to: sender,
                    packet: self.snapshot().to_packet(),
                }]
            }
            Packet::SetReady {
                persistent_id,
                ready,
            } => match self.authorize(sender, &persistent_id) {
                Ok(()) => self.set_ready(&persistent_id, ready),
                Err(e) => {
                    warn!("Ready request rejected: {}", e);
                    Vec::new()
                }
            },
            Packet::SetRole {
                persistent_id,
                is_spectator,
            } => match self.authorize(sender, &persistent_id) {
                Ok(()) => self.set_role(&persistent_id, Role::from_spectator_flag(is_spectator)),
                Err(e) => {
                    warn!("Role request rejected: {}", e);
                    Vec::new()
                }
            },
            Packet::MovementInput {
                intent,
                delta_time,
                tick,
            } => self.handle_input(sender, intent, delta_time, tick),
            other => {
                warn!("Unexpected packet from connection {}: {:?}", sender, other);
                Vec::new()
            }
        }
    }

    fn authorize(&self, sender: ConnectionId, persistent_id: &str) -> Result<(), SessionError> {
        match self.registry.identity_for(sender) {
            Some(id) if id == persistent_id => Ok(()),
            Some(_) => Err(SessionError::IdentityMismatch {
                connection_id: sender,
                persistent_id: persistent_id.to_string(),
            }),
            None => Err(SessionError::UnknownConnection(sender)),
        }
    }

    fn handle_join(
        &mut self,
        connection_id: ConnectionId,
        persistent_id: &str,
        desired_role: Role,
    ) -> Vec<Effect> {
        if !is_valid_persistent_id(persistent_id) {
            let reason = SessionError::InvalidIdentity {
                len: persistent_id.len(),
                max_len: MAX_PERSISTENT_ID_LEN,
            };
            warn!("Turning away connection {}: {}", connection_id, reason);
            return vec![Effect::Send {
                to: connection_id,
                packet: Packet::Rejected {
                    reason: reason.to_string(),
                },
            }];
        }

        if self.config.reject_new_when_full
            && !self.registry.contains(persistent_id)
            && self.registry.is_full()
        {
            let reason = SessionError::LobbyFull {
                max_slots: self.registry.max_slots(),
            };
            warn!("Turning away {}: {}", persistent_id, reason);
            return vec![Effect::Send {
                to: connection_id,
                packet: Packet::Rejected {
                    reason: reason.to_string(),
                },
            }];
        }

        let (outcome, _) = self
            .registry
            .upsert_on_join(persistent_id, connection_id, desired_role);

        let mut effects = Vec::new();
        if outcome.kind != JoinKind::Created {
            for kind in [TimerKind::DisconnectSettle, TimerKind::GraceExpiry] {
                effects.push(Effect::Cancel {
                    key: TimerKey {
                        persistent_id: persistent_id.to_string(),
                        kind,
                    },
                });
            }
        }

        if let Some(displaced) = outcome.displaced {
            self.begin_grace(&displaced, &mut effects);
        }

        if self.phase == SessionPhase::InGame {
            if desired_role == Role::Player {
                self.lifecycle.release_observer(connection_id);
            }
            self.sync_entity(persistent_id, &mut effects);
        }

        self.after_state_change(&mut effects);
        effects
    }

    /// Ready toggle for a known identity; spectators and unknown ids are ignored.
    pub fn set_ready(&mut self, persistent_id: &str, ready: bool) -> Vec<Effect> {
        let mut effects = Vec::new();
        if self.registry.set_ready(persistent_id, ready) {
            self.after_state_change(&mut effects);
        } else {
            debug!("Ready state for {} ignored", persistent_id);
        }
        effects
    }

    pub fn set_role(&mut self, persistent_id: &str, role: Role) -> Vec<Effect> {
        let Some(previous) = self.registry.set_role(persistent_id, role) else {
            warn!(
                "Role change ignored: {}",
                SessionError::UnknownIdentity(persistent_id.to_string())
            );
            return Vec::new();
        };

        let mut effects = Vec::new();
        if self.phase == SessionPhase::InGame && previous != role {
            if let (Role::Player, Some(connection_id)) = (
                role,
                self.registry
                    .get(persistent_id)
                    .and_then(|record| record.connection_id),
            ) {
                self.lifecycle.release_observer(connection_id);
            }
            self.sync_entity(persistent_id, &mut effects);
        }

        self.after_state_change(&mut effects);
        effects
    }

    /// Starts the session if the start precondition holds.
    pub fn try_start_game(&mut self) -> Vec<Effect> {
        if self.phase == SessionPhase::InGame {
            debug!("Session already started");
            return Vec::new();
        }
        if !self.can_start() {
            info!("Cannot start game. Not all players are ready.");
            return Vec::new();
        }

        info!("All players ready. Starting game...");
        self.phase = SessionPhase::InGame;

        let mut effects = vec![Effect::Broadcast {
            packet: Packet::GameStarted,
        }];
        let identities: Vec<String> = self
            .registry
            .ordered()
            .iter()
            .map(|record| record.persistent_id.clone())
            .collect();
        for persistent_id in identities {
            self.sync_entity(&persistent_id, &mut effects);
        }
        effects.push(self.broadcast_snapshot());
        effects
    }

    /// Handles a timer whose notice survived cancellation checks. State is
    /// re-checked here as well, since the participant may have come back.
    pub fn on_timer(&mut self, timer: SessionTimer) -> Vec<Effect> {
        let mut effects = Vec::new();
        match timer {
            SessionTimer::DisconnectSettle {
                persistent_id,
                connection_id,
            } => {
                if self.registry.identity_for(connection_id) != Some(persistent_id.as_str()) {
                    debug!(
                        "Disconnect of {} on {} superseded by a reconnect",
                        persistent_id, connection_id
                    );
                    return effects;
                }
                if self.registry.mark_disconnected(connection_id).is_none() {
                    return effects;
                }
                info!(
                    "Player {} disconnected. Character remains in scene.",
                    persistent_id
                );
                self.begin_grace(&persistent_id, &mut effects);
                self.after_state_change(&mut effects);
            }
            SessionTimer::GraceExpiry { persistent_id } => {
                let still_gone = self
                    .registry
                    .get(&persistent_id)
                    .is_some_and(|record| !record.connected);
                if !still_gone {
                    debug!("Grace expiry for {} ignored", persistent_id);
                    return effects;
                }
                if let Some(record) = self.registry.remove(&persistent_id) {
                    if let Some(entity_id) = record.owned_entity {
                        self.lifecycle.despawn(entity_id);
                    }
                }
                info!("Grace period for {} elapsed, slot freed", persistent_id);
                self.after_state_change(&mut effects);
            }
        }
        effects
    }

    fn handle_input(
        &mut self,
        sender: ConnectionId,
        intent: Vec2,
        delta_time: f32,
        tick: Tick,
    ) -> Vec<Effect> {
        let Some(persistent_id) = self.registry.identity_for(sender) else {
            warn!("Movement from unjoined connection {}", sender);
            return Vec::new();
        };
        let Some(record) = self.registry.get(persistent_id) else {
            return Vec::new();
        };
        if record.role.is_spectator() {
            warn!("Movement from spectator {} dropped", persistent_id);
            return Vec::new();
        }
        let Some(entity_id) = record.owned_entity else {
            debug!("Movement from {} without an entity", persistent_id);
            return Vec::new();
        };

        let input = PredictedInput {
            intent,
            delta_time,
            tick,
        };
        match self.lifecycle.apply_input(entity_id, sender, &input) {
            Some(correction) => vec![Effect::Send {
                to: sender,
                packet: correction.into(),
            }],
            None => Vec::new(),
        }
    }

    /// Starts the grace window for a participant that lost its connection.
    /// Its avatar stops taking input until the participant is back.
    fn begin_grace(&mut self, persistent_id: &str, effects: &mut Vec<Effect>) {
        if let Some(entity_id) = self
            .registry
            .get(persistent_id)
            .and_then(|record| record.owned_entity)
        {
            self.lifecycle.set_movement_enabled(entity_id, false);
        }
        effects.push(Effect::Schedule {
            timer: SessionTimer::GraceExpiry {
                persistent_id: persistent_id.to_string(),
            },
            delay: self.config.grace_period,
        });
    }

    /// Brings a participant's entity in line with its record and tells the
    /// owner when it was given a new or re-owned avatar.
    fn sync_entity(&mut self, persistent_id: &str, effects: &mut Vec<Effect>) {
        let slot_index = self.registry.slot_index(persistent_id).unwrap_or(0);
        let Some(record) = self.registry.get_mut(persistent_id) else {
            return;
        };

        match self.lifecycle.spawn_or_restore(record, slot_index) {
            Ok(SpawnOutcome::Spawned { entity_id })
            | Ok(SpawnOutcome::Restored {
                entity_id,
                ownership_changed: true,
            }) => {
                if let Some((to, packet)) = self.lifecycle.assignment(entity_id) {
                    effects.push(Effect::Send { to, packet });
                }
            }
            Ok(_) => {}
            Err(e) => error!("Failed to spawn entity for {}: {}", persistent_id, e),
        }
    }

    fn after_state_change(&mut self, effects: &mut Vec<Effect>) {
        effects.push(self.broadcast_snapshot());
        if self.config.auto_start && self.phase == SessionPhase::Lobby && self.can_start() {
            effects.extend(self.try_start_game());
        }
    }

    fn broadcast_snapshot(&self) -> Effect {
        Effect::Broadcast {
            packet: self.snapshot().to_packet(),
        }
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.registry.snapshot()
    }

    pub fn can_start(&self) -> bool {
        self.registry.can_start(&self.config.start_policy)
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn lifecycle(&self) -> &EntityLifecycleManager {
        &self.lifecycle
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }
}
