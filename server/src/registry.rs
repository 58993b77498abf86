//! Authoritative participant records for a session
//!
//! The registry maps each persistent identity to exactly one
//! [`ParticipantRecord`] and keeps a second index from the live transport
//! connection back to that identity. Both maps are updated together on
//! every join, disconnect and removal, so a connection id never outlives
//! the connection it named.
//!
//! Lookups with unknown keys are not errors here: they answer `None` or
//! `false` and the caller decides whether that is worth a log line.

use crate::config::StartPolicy;
use log::{info, warn};
use shared::{ConnectionId, EntityId, Packet, Role};
use std::collections::HashMap;

pub const EMPTY_SLOT: &str = "Empty Slot";

/// Everything the authority knows about one human participant.
#[derive(Debug, Clone, PartialEq)]
pub struct ParticipantRecord {
    /// Stable identity supplied by the peer; primary key
    pub persistent_id: String,
    /// Live transport handle, `None` while disconnected
    pub connection_id: Option<ConnectionId>,
    pub role: Role,
    pub connected: bool,
    /// Only meaningful for players
    pub ready: bool,
    /// In-world entity bound to this participant; written by the lifecycle manager
    pub owned_entity: Option<EntityId>,
    /// Connection id at first join; fixes the slot order for good
    join_order: ConnectionId,
}

impl ParticipantRecord {
    fn new(persistent_id: &str, connection_id: ConnectionId, role: Role) -> Self {
        Self {
            persistent_id: persistent_id.to_string(),
            connection_id: Some(connection_id),
            role,
            connected: true,
            ready: false,
            owned_entity: None,
            join_order: connection_id,
        }
    }

    /// Spectators are always reported as ready.
    pub fn reports_ready(&self) -> bool {
        self.role.is_spectator() || self.ready
    }

    pub fn join_order(&self) -> ConnectionId {
        self.join_order
    }

    fn display_row(&self, slot: usize) -> String {
        let status = if self.connected {
            "Connected"
        } else {
            "Disconnected"
        };
        let ready = if self.reports_ready() {
            "Ready"
        } else {
            "Not Ready"
        };
        format!(
            "Player {} ({}) [{}, {}]",
            slot + 1,
            self.persistent_id,
            status,
            ready
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinKind {
    /// First join of a never-seen identity
    Created,
    /// Known identity arriving on a new connection or after a disconnect
    Reconnected,
    /// Repeat of a join on the same live connection
    Refreshed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinOutcome {
    pub kind: JoinKind,
    /// Connection the record was bound to before this join
    pub previous_connection: Option<ConnectionId>,
    /// Another identity that was bound to the joining connection and lost it
    pub displaced: Option<String>,
}

/// Ordered, padded rendering of every slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub slots: Vec<String>,
}

impl SessionSnapshot {
    pub fn to_packet(&self) -> Packet {
        Packet::SessionSnapshot {
            slots: self.slots.clone(),
        }
    }
}

pub struct SessionRegistry {
    /// Records indexed by persistent id
    records: HashMap<String, ParticipantRecord>,
    /// Live connection id to persistent id
    by_connection: HashMap<ConnectionId, String>,
    max_slots: usize,
}

impl SessionRegistry {
    pub fn new(max_slots: usize) -> Self {
        Self {
            records: HashMap::new(),
            by_connection: HashMap::new(),
            max_slots,
        }
    }

    /// Creates or resumes the record for `persistent_id` on `connection_id`.
    ///
    /// Calling this again with the same arguments changes nothing. A known
    /// identity keeps its record, readiness and entity; its old connection
    /// id is dropped from the reverse index.
    pub fn upsert_on_join(
        &mut self,
        persistent_id: &str,
        connection_id: ConnectionId,
        desired_role: Role,
    ) -> (JoinOutcome, &ParticipantRecord) {
        let displaced = self.detach_foreign_connection(persistent_id, connection_id);

        let outcome = match self.records.get_mut(persistent_id) {
            Some(record) => {
                let previous = record.connection_id;
                let kind = if record.connected && previous == Some(connection_id) {
                    JoinKind::Refreshed
                } else {
                    JoinKind::Reconnected
                };

                if let Some(old) = previous.filter(|old| *old != connection_id) {
                    if self.by_connection.get(&old).map(String::as_str) == Some(persistent_id) {
                        self.by_connection.remove(&old);
                    }
                }

                record.connection_id = Some(connection_id);
                record.connected = true;
                record.role = desired_role;

                if kind == JoinKind::Reconnected {
                    info!(
                        "Participant {} resumed on connection {} (was {:?})",
                        persistent_id, connection_id, previous
                    );
                }

                JoinOutcome {
                    kind,
                    previous_connection: previous,
                    displaced,
                }
            }
            None => {
                let record = ParticipantRecord::new(persistent_id, connection_id, desired_role);
                info!(
                    "New participant {} as {:?} on connection {}",
                    persistent_id, desired_role, connection_id
                );
                self.records.insert(persistent_id.to_string(), record);

                JoinOutcome {
                    kind: JoinKind::Created,
                    previous_connection: None,
                    displaced,
                }
            }
        };

        self.by_connection
            .insert(connection_id, persistent_id.to_string());

        let record = &self.records[persistent_id];
        (outcome, record)
    }

    /// A connection can speak for one identity at a time; if it was bound to
    /// a different one, that record loses it.
    fn detach_foreign_connection(
        &mut self,
        persistent_id: &str,
        connection_id: ConnectionId,
    ) -> Option<String> {
        let owner = self.by_connection.get(&connection_id)?.clone();
        if owner == persistent_id {
            return None;
        }

        warn!(
            "Connection {} switched identity from {} to {}",
            connection_id, owner, persistent_id
        );
        self.by_connection.remove(&connection_id);
        if let Some(record) = self.records.get_mut(&owner) {
            record.connected = false;
            record.connection_id = None;
        }
        Some(owner)
    }

    /// Marks the identity behind `connection_id` as disconnected.
    ///
    /// The record and its entity stay; the connection id is forgotten.
    /// Returns the affected identity, or `None` for an unknown connection.
    pub fn mark_disconnected(&mut self, connection_id: ConnectionId) -> Option<String> {
        let Some(persistent_id) = self.by_connection.remove(&connection_id) else {
            warn!("Disconnect for unknown connection {}", connection_id);
            return None;
        };

        let record = self.records.get_mut(&persistent_id)?;
        record.connected = false;
        record.connection_id = None;

        info!(
            "Participant {} disconnected (connection {})",
            persistent_id, connection_id
        );
        Some(persistent_id)
    }

    /// Updates readiness. Returns false for unknown identities and for
    /// spectators, whose readiness is fixed.
    pub fn set_ready(&mut self, persistent_id: &str, ready: bool) -> bool {
        match self.records.get_mut(persistent_id) {
            Some(record) if record.role.is_spectator() => false,
            Some(record) => {
                record.ready = ready;
                info!("Participant {} ready state: {}", persistent_id, ready);
                true
            }
            None => false,
        }
    }

    /// Changes the role and returns the previous one. Any entity reference
    /// is left in place.
    pub fn set_role(&mut self, persistent_id: &str, role: Role) -> Option<Role> {
        let record = self.records.get_mut(persistent_id)?;
        let previous = record.role;
        record.role = role;
        if previous != role {
            info!(
                "Participant {} changed role {:?} -> {:?}",
                persistent_id, previous, role
            );
        }
        Some(previous)
    }

    /// Permanently drops a record together with any live reverse mapping.
    pub fn remove(&mut self, persistent_id: &str) -> Option<ParticipantRecord> {
        let record = self.records.remove(persistent_id)?;
        if let Some(connection_id) = record.connection_id {
            self.by_connection.remove(&connection_id);
        }
        info!("Participant {} removed from session", persistent_id);
        Some(record)
    }

    pub fn get(&self, persistent_id: &str) -> Option<&ParticipantRecord> {
        self.records.get(persistent_id)
    }

    pub(crate) fn get_mut(&mut self, persistent_id: &str) -> Option<&mut ParticipantRecord> {
        self.records.get_mut(persistent_id)
    }

    pub fn identity_for(&self, connection_id: ConnectionId) -> Option<&str> {
        self.by_connection.get(&connection_id).map(String::as_str)
    }

    /// Records in slot order: ascending connection id at first join.
    pub fn ordered(&self) -> Vec<&ParticipantRecord> {
        let mut records: Vec<&ParticipantRecord> = self.records.values().collect();
        records.sort_by(|a, b| {
            a.join_order
                .cmp(&b.join_order)
                .then_with(|| a.persistent_id.cmp(&b.persistent_id))
        });
        records
    }

    pub fn slot_index(&self, persistent_id: &str) -> Option<usize> {
        self.ordered()
            .iter()
            .position(|record| record.persistent_id == persistent_id)
    }

    /// Full rendering of the session, `max_slots` rows long.
    pub fn snapshot(&self) -> SessionSnapshot {
        let ordered = self.ordered();
        let slots = (0..self.max_slots)
            .map(|slot| match ordered.get(slot) {
                Some(record) => record.display_row(slot),
                None => EMPTY_SLOT.to_string(),
            })
            .collect();
        SessionSnapshot { slots }
    }

    /// Start precondition: enough counted participants connected, and every
    /// connected player ready.
    pub fn can_start(&self, policy: &StartPolicy) -> bool {
        let mut counted = 0;
        for record in self.records.values().filter(|r| r.connected) {
            if record.role == Role::Player {
                if !record.ready {
                    return false;
                }
                counted += 1;
            } else if policy.count_spectators {
                counted += 1;
            }
        }
        counted >= policy.min_players.max(1)
    }

    pub fn contains(&self, persistent_id: &str) -> bool {
        self.records.contains_key(persistent_id)
    }

    pub fn is_full(&self) -> bool {
        self.records.len() >= self.max_slots
    }

    pub fn max_slots(&self) -> usize {
        self.max_slots
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> SessionRegistry {
        SessionRegistry::new(5)
    }

    #[test]
    fn test_first_join_creates_unready_record() {
        let mut registry = registry();

        let (outcome, record) = registry.upsert_on_join("A", 1, Role::Player);

        assert_eq!(outcome.kind, JoinKind::Created);
        assert_eq!(record.connection_id, Some(1));
        assert!(record.connected);
        assert!(!record.ready);
        assert_eq!(record.owned_entity, None);
        assert_eq!(registry.identity_for(1), Some("A"));
    }

    #[test]
    fn test_join_is_idempotent() {
        let mut registry = registry();
        registry.upsert_on_join("A", 1, Role::Player);
        let first = registry.snapshot();

        let (outcome, _) = registry.upsert_on_join("A", 1, Role::Player);

        assert_eq!(outcome.kind, JoinKind::Refreshed);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.snapshot(), first);
    }

    #[test]
    fn test_reconnect_rebinds_connection_and_drops_stale_mapping() {
        let mut registry = registry();
        registry.upsert_on_join("A", 1, Role::Player);
        registry.set_ready("A", true);
        registry.mark_disconnected(1);

        let (outcome, record) = registry.upsert_on_join("A", 7, Role::Player);

        assert_eq!(outcome.kind, JoinKind::Reconnected);
        assert_eq!(outcome.previous_connection, None);
        assert_eq!(record.connection_id, Some(7));
        assert!(record.ready);
        assert_eq!(registry.identity_for(1), None);
        assert_eq!(registry.identity_for(7), Some("A"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_reconnect_before_disconnect_settles() {
        let mut registry = registry();
        registry.upsert_on_join("A", 1, Role::Player);

        let (outcome, _) = registry.upsert_on_join("A", 2, Role::Player);
        assert_eq!(outcome.kind, JoinKind::Reconnected);
        assert_eq!(outcome.previous_connection, Some(1));

        // The late disconnect for the old connection must not touch the record.
        assert_eq!(registry.mark_disconnected(1), None);
        assert!(registry.get("A").unwrap().connected);
    }

    #[test]
    fn test_mark_disconnected_keeps_entity() {
        let mut registry = registry();
        registry.upsert_on_join("A", 1, Role::Player);
        registry.get_mut("A").unwrap().owned_entity = Some(42);

        assert_eq!(registry.mark_disconnected(1), Some("A".to_string()));

        let record = registry.get("A").unwrap();
        assert!(!record.connected);
        assert_eq!(record.connection_id, None);
        assert_eq!(record.owned_entity, Some(42));
    }

    #[test]
    fn test_unknown_keys_are_no_ops() {
        let mut registry = registry();
        assert_eq!(registry.mark_disconnected(99), None);
        assert!(!registry.set_ready("ghost", true));
        assert_eq!(registry.set_role("ghost", Role::Spectator), None);
        assert!(registry.remove("ghost").is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_connection_switching_identity_displaces_previous_owner() {
        let mut registry = registry();
        registry.upsert_on_join("A", 3, Role::Player);

        let (outcome, _) = registry.upsert_on_join("B", 3, Role::Player);

        assert_eq!(outcome.displaced, Some("A".to_string()));
        assert!(!registry.get("A").unwrap().connected);
        assert_eq!(registry.identity_for(3), Some("B"));
    }

    #[test]
    fn test_two_players_ready_snapshot() {
        let mut registry = registry();
        registry.upsert_on_join("A", 1, Role::Player);
        registry.upsert_on_join("B", 2, Role::Player);
        registry.set_ready("A", true);
        registry.set_ready("B", true);

        assert_eq!(
            registry.snapshot().slots,
            vec![
                "Player 1 (A) [Connected, Ready]",
                "Player 2 (B) [Connected, Ready]",
                "Empty Slot",
                "Empty Slot",
                "Empty Slot",
            ]
        );
        assert!(registry.can_start(&StartPolicy::default()));
    }

    #[test]
    fn test_slot_order_follows_first_connection() {
        let mut registry = registry();
        registry.upsert_on_join("late", 9, Role::Player);
        registry.upsert_on_join("host", 0, Role::Player);
        registry.upsert_on_join("early", 2, Role::Player);

        // Reconnecting on a higher connection id keeps the original slot.
        registry.mark_disconnected(2);
        registry.upsert_on_join("early", 15, Role::Player);

        let order: Vec<&str> = registry
            .ordered()
            .iter()
            .map(|r| r.persistent_id.as_str())
            .collect();
        assert_eq!(order, vec!["host", "early", "late"]);
        assert_eq!(registry.slot_index("host"), Some(0));
    }

    #[test]
    fn test_spectator_always_reported_ready() {
        let mut registry = registry();
        registry.upsert_on_join("S", 1, Role::Spectator);

        assert!(!registry.set_ready("S", false));
        assert_eq!(
            registry.snapshot().slots[0],
            "Player 1 (S) [Connected, Ready]"
        );

        registry.set_role("S", Role::Player);
        assert_eq!(
            registry.snapshot().slots[0],
            "Player 1 (S) [Connected, Not Ready]"
        );
    }

    #[test]
    fn test_disconnected_row() {
        let mut registry = registry();
        registry.upsert_on_join("A", 1, Role::Player);
        registry.mark_disconnected(1);

        assert_eq!(
            registry.snapshot().slots[0],
            "Player 1 (A) [Disconnected, Not Ready]"
        );
    }

    #[test]
    fn test_can_start_requires_a_player() {
        let mut registry = registry();
        let policy = StartPolicy::default();
        assert!(!registry.can_start(&policy));

        registry.upsert_on_join("S", 1, Role::Spectator);
        assert!(!registry.can_start(&policy));

        registry.upsert_on_join("A", 2, Role::Player);
        assert!(!registry.can_start(&policy));

        registry.set_ready("A", true);
        assert!(registry.can_start(&policy));
    }

    #[test]
    fn test_can_start_ignores_disconnected_players() {
        let mut registry = registry();
        registry.upsert_on_join("A", 1, Role::Player);
        registry.upsert_on_join("B", 2, Role::Player);
        registry.set_ready("A", true);
        registry.mark_disconnected(2);

        assert!(registry.can_start(&StartPolicy::default()));
    }

    #[test]
    fn test_can_start_with_counted_spectators() {
        let mut registry = registry();
        registry.upsert_on_join("A", 1, Role::Player);
        registry.upsert_on_join("S", 2, Role::Spectator);
        registry.set_ready("A", true);

        let two_needed = StartPolicy {
            min_players: 2,
            count_spectators: false,
        };
        assert!(!registry.can_start(&two_needed));

        let spectators_count = StartPolicy {
            min_players: 2,
            count_spectators: true,
        };
        assert!(registry.can_start(&spectators_count));
    }

    #[test]
    fn test_remove_clears_reverse_mapping() {
        let mut registry = registry();
        registry.upsert_on_join("A", 1, Role::Player);

        let removed = registry.remove("A").unwrap();

        assert_eq!(removed.persistent_id, "A");
        assert_eq!(registry.identity_for(1), None);
        assert_eq!(registry.snapshot().slots[0], EMPTY_SLOT);
    }

    #[test]
    fn test_snapshot_truncates_to_max_slots() {
        let mut registry = SessionRegistry::new(2);
        registry.upsert_on_join("A", 1, Role::Player);
        registry.upsert_on_join("B", 2, Role::Player);
        registry.upsert_on_join("C", 3, Role::Player);

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.slots.len(), 2);
        assert!(registry.is_full());
    }

    #[test]
    fn test_largest_snapshot_fits_one_packet() {
        use shared::{MAX_PACKET_SIZE, MAX_PERSISTENT_ID_LEN, MAX_SLOTS_LIMIT};

        let mut registry = SessionRegistry::new(MAX_SLOTS_LIMIT);
        for slot in 0..MAX_SLOTS_LIMIT {
            let id = format!("{:x>width$}", slot, width = MAX_PERSISTENT_ID_LEN);
            let connection_id = slot as ConnectionId + 1;
            registry.upsert_on_join(&id, connection_id, Role::Player);
            registry.mark_disconnected(connection_id);
        }

        let encoded = registry.snapshot().to_packet().encode().unwrap();
        assert!(encoded.len() <= MAX_PACKET_SIZE, "{} bytes", encoded.len());
    }
}
