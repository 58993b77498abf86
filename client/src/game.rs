//! The peer's view of the session
//!
//! [`ClientSession`] turns packets from the authority into local state and
//! tells the caller what to send back. It owns the predictor for the
//! entity this peer controls; the network layer only moves bytes.

use log::{debug, info, warn};
use shared::prediction::{Correction, CorrectionOutcome, PredictedMover, PredictionConfig};
use shared::{ConnectionId, EntityId, Packet, Role, Vec2, Vec3};

/// Running totals of reconciliation, for the periodic status line.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CorrectionStats {
    pub applied: u32,
    pub ignored: u32,
    pub last_error: f32,
    pub max_error: f32,
}

pub struct ClientSession {
    persistent_id: String,
    role: Role,
    ready: bool,
    connection_id: Option<ConnectionId>,
    has_snapshot: bool,
    slots: Vec<String>,
    game_started: bool,
    entity: Option<EntityId>,
    mover: PredictedMover,
    stats: CorrectionStats,
    rejection: Option<String>,
}

impl ClientSession {
    pub fn new(persistent_id: impl Into<String>, role: Role, prediction: PredictionConfig) -> Self {
        Self {
            persistent_id: persistent_id.into(),
            role,
            ready: false,
            connection_id: None,
            has_snapshot: false,
            slots: Vec::new(),
            game_started: false,
            entity: None,
            mover: PredictedMover::new(Vec3::ZERO, prediction),
            stats: CorrectionStats::default(),
            rejection: None,
        }
    }

    pub fn join_packet(&self) -> Packet {
        Packet::Join {
            persistent_id: self.persistent_id.clone(),
            desired_role: self.role,
        }
    }

    /// True while the join has not been confirmed by a snapshot.
    pub fn needs_join_retry(&self) -> bool {
        self.connection_id.is_some() && !self.has_snapshot
    }

    /// Applies one packet from the authority and returns the replies.
    pub fn handle_packet(&mut self, packet: Packet) -> Vec<Packet> {
        match packet {
            Packet::Welcome { connection_id } => {
                info!("Connected as connection {}", connection_id);
                self.connection_id = Some(connection_id);
                self.has_snapshot = false;
                vec![self.join_packet()]
            }

            Packet::Rejected { reason } => {
                warn!("Rejected by server: {}", reason);
                self.rejection = Some(reason);
                Vec::new()
            }

            Packet::SessionSnapshot { slots } => {
                let first = !self.has_snapshot;
                self.has_snapshot = true;
                if slots != self.slots {
                    for row in &slots {
                        info!("  {}", row);
                    }
                    self.slots = slots;
                }
                if first {
                    vec![Packet::LobbySyncRequest]
                } else {
                    Vec::new()
                }
            }

            Packet::GameStarted => {
                info!("Game started");
                self.game_started = true;
                Vec::new()
            }

            Packet::EntityAssigned {
                entity_id,
                position,
                move_speed,
            } => {
                info!(
                    "Controlling entity {} at ({:.1}, {:.1}, {:.1})",
                    entity_id, position.x, position.y, position.z
                );
                self.entity = Some(entity_id);
                self.game_started = true;
                self.mover.reset(position, move_speed);
                Vec::new()
            }

            Packet::MovementCorrection {
                authoritative_position,
                acknowledged_tick,
            } => {
                if self.entity.is_none() {
                    debug!("Correction without an entity, ignoring");
                    return Vec::new();
                }
                let outcome = self.mover.apply_correction(Correction {
                    authoritative_position,
                    acknowledged_tick,
                });
                match outcome {
                    CorrectionOutcome::Applied { error, .. } => {
                        self.stats.applied += 1;
                        self.stats.last_error = error;
                        self.stats.max_error = self.stats.max_error.max(error);
                    }
                    CorrectionOutcome::Stale { .. } | CorrectionOutcome::Foreign { .. } => {
                        self.stats.ignored += 1;
                    }
                }
                Vec::new()
            }

            Packet::Goodbye => {
                warn!("Server closed the session");
                self.connection_lost();
                Vec::new()
            }

            Packet::Heartbeat => Vec::new(),

            other => {
                warn!("Unexpected packet from server: {:?}", other);
                Vec::new()
            }
        }
    }

    /// Forgets everything tied to the current connection. The persistent
    /// id, role and readiness carry over to the next join.
    pub fn connection_lost(&mut self) {
        self.connection_id = None;
        self.has_snapshot = false;
        self.entity = None;
    }

    /// Requests a readiness change. Spectators have nothing to toggle.
    pub fn set_ready(&mut self, ready: bool) -> Option<Packet> {
        if self.role.is_spectator() {
            return None;
        }
        self.ready = ready;
        Some(Packet::SetReady {
            persistent_id: self.persistent_id.clone(),
            ready,
        })
    }

    pub fn set_role(&mut self, role: Role) -> Packet {
        self.role = role;
        Packet::SetRole {
            persistent_id: self.persistent_id.clone(),
            is_spectator: role.is_spectator(),
        }
    }

    /// Advances local prediction by one step and returns the input to send.
    pub fn step(&mut self, intent: Vec2, delta_time: f32) -> Option<Packet> {
        if self.entity.is_none() || self.role.is_spectator() {
            return None;
        }
        self.mover
            .step(intent, delta_time)
            .map(|input| input.to_packet())
    }

    pub fn persistent_id(&self) -> &str {
        &self.persistent_id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub fn connection_id(&self) -> Option<ConnectionId> {
        self.connection_id
    }

    pub fn has_snapshot(&self) -> bool {
        self.has_snapshot
    }

    pub fn slots(&self) -> &[String] {
        &self.slots
    }

    pub fn is_game_started(&self) -> bool {
        self.game_started
    }

    pub fn entity(&self) -> Option<EntityId> {
        self.entity
    }

    pub fn mover(&self) -> &PredictedMover {
        &self.mover
    }

    pub fn stats(&self) -> CorrectionStats {
        self.stats
    }

    pub fn rejection(&self) -> Option<&str> {
        self.rejection.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use shared::MOVE_SPEED;

    fn session() -> ClientSession {
        ClientSession::new("peer", Role::Player, PredictionConfig::default())
    }

    fn assigned(session: &mut ClientSession, position: Vec3) {
        session.handle_packet(Packet::EntityAssigned {
            entity_id: 3,
            position,
            move_speed: MOVE_SPEED,
        });
    }

    #[test]
    fn test_welcome_triggers_join() {
        let mut session = session();

        let replies = session.handle_packet(Packet::Welcome { connection_id: 4 });

        assert_eq!(
            replies,
            vec![Packet::Join {
                persistent_id: "peer".to_string(),
                desired_role: Role::Player
            }]
        );
        assert!(session.needs_join_retry());
    }

    #[test]
    fn test_first_snapshot_requests_sync_once() {
        let mut session = session();
        session.handle_packet(Packet::Welcome { connection_id: 1 });
        let slots = vec!["Player 1 (peer) [Connected, Not Ready]".to_string()];

        let first = session.handle_packet(Packet::SessionSnapshot { slots: slots.clone() });
        let second = session.handle_packet(Packet::SessionSnapshot { slots: slots.clone() });

        assert_eq!(first, vec![Packet::LobbySyncRequest]);
        assert!(second.is_empty());
        assert!(!session.needs_join_retry());
        assert_eq!(session.slots(), slots.as_slice());
    }

    #[test]
    fn test_no_input_before_assignment() {
        let mut session = session();
        assert!(session.step(Vec2::new(1.0, 0.0), 0.1).is_none());
    }

    #[test]
    fn test_step_sends_numbered_inputs() {
        let mut session = session();
        assigned(&mut session, Vec3::new(1.0, 0.0, 1.0));

        let first = session.step(Vec2::new(1.0, 0.0), 0.1).unwrap();
        let second = session.step(Vec2::new(1.0, 0.0), 0.1).unwrap();

        assert!(matches!(first, Packet::MovementInput { tick: 1, .. }));
        assert!(matches!(second, Packet::MovementInput { tick: 2, .. }));
        assert_approx_eq!(session.mover().position().x, 1.0 + 2.0 * MOVE_SPEED * 0.1, 1e-5);
    }

    #[test]
    fn test_correction_tracks_stats() {
        let mut session = session();
        assigned(&mut session, Vec3::ZERO);
        session.step(Vec2::new(1.0, 0.0), 0.1);
        session.step(Vec2::new(1.0, 0.0), 0.1);

        session.handle_packet(Packet::MovementCorrection {
            authoritative_position: Vec3::new(MOVE_SPEED * 0.1, 0.0, 0.0),
            acknowledged_tick: 1,
        });
        session.handle_packet(Packet::MovementCorrection {
            authoritative_position: Vec3::ZERO,
            acknowledged_tick: 0,
        });

        let stats = session.stats();
        assert_eq!(stats.applied, 1);
        assert_eq!(stats.ignored, 1);
        assert_approx_eq!(stats.last_error, 0.0, 1e-5);
        assert_eq!(session.mover().pending_len(), 1);
    }

    #[test]
    fn test_reassignment_resets_prediction() {
        let mut session = session();
        assigned(&mut session, Vec3::ZERO);
        session.step(Vec2::new(0.0, 1.0), 0.1);

        assigned(&mut session, Vec3::new(6.0, 0.0, 6.0));

        assert_eq!(session.mover().pending_len(), 0);
        assert_eq!(session.mover().position(), Vec3::new(6.0, 0.0, 6.0));
        let next = session.step(Vec2::new(0.0, 1.0), 0.1).unwrap();
        assert!(matches!(next, Packet::MovementInput { tick: 1, .. }));
    }

    #[test]
    fn test_spectator_cannot_ready_or_move() {
        let mut session = ClientSession::new("watcher", Role::Spectator, PredictionConfig::default());
        assigned(&mut session, Vec3::ZERO);

        assert!(session.set_ready(true).is_none());
        assert!(session.step(Vec2::new(1.0, 0.0), 0.1).is_none());

        let packet = session.set_role(Role::Player);
        assert_eq!(
            packet,
            Packet::SetRole {
                persistent_id: "watcher".to_string(),
                is_spectator: false
            }
        );
        assert!(session.set_ready(true).is_some());
    }

    #[test]
    fn test_goodbye_drops_connection_state() {
        let mut session = session();
        session.handle_packet(Packet::Welcome { connection_id: 2 });
        session.handle_packet(Packet::SessionSnapshot { slots: vec![] });
        assigned(&mut session, Vec3::ZERO);

        session.handle_packet(Packet::Goodbye);

        assert_eq!(session.connection_id(), None);
        assert_eq!(session.entity(), None);
        assert!(!session.has_snapshot());
    }

    #[test]
    fn test_rejection_recorded() {
        let mut session = session();
        session.handle_packet(Packet::Rejected {
            reason: "Server full".to_string(),
        });
        assert_eq!(session.rejection(), Some("Server full"));
    }
}
