//! Spawning, restoring and re-owning in-world entities on the authority.
//!
//! Every non-spectator participant gets at most one avatar for the lifetime
//! of its record. Reconnects reuse it and move ownership to the new
//! connection instead of instantiating a second one. Spectators get a
//! passive observer per connection, which is not tracked as owned.

use crate::error::SpawnError;
use crate::map::MapDefinition;
use crate::registry::ParticipantRecord;
use log::{debug, info, warn};
use shared::prediction::{AuthoritativeMover, Correction, InputRejection, PredictedInput};
use shared::{ConnectionId, EntityId, Packet, Vec3, AUTHORITY_CONNECTION_ID};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Avatar,
    Observer,
}

#[derive(Debug, Clone)]
pub struct WorldEntity {
    pub id: EntityId,
    pub kind: EntityKind,
    /// Connection allowed to drive this entity
    pub owner: Option<ConnectionId>,
    pub movement_enabled: bool,
    mover: AuthoritativeMover,
}

impl WorldEntity {
    pub fn position(&self) -> Vec3 {
        self.mover.position()
    }

    pub fn mover(&self) -> &AuthoritativeMover {
        &self.mover
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpawnOutcome {
    Spawned {
        entity_id: EntityId,
    },
    Restored {
        entity_id: EntityId,
        ownership_changed: bool,
    },
    Observer {
        entity_id: EntityId,
        created: bool,
    },
    /// Disconnected spectator: nothing to create
    Skipped,
}

pub struct EntityLifecycleManager {
    map: MapDefinition,
    entities: HashMap<EntityId, WorldEntity>,
    observers: HashMap<ConnectionId, EntityId>,
    next_entity_id: EntityId,
    authority_identity: Option<String>,
}

impl EntityLifecycleManager {
    pub fn new(map: MapDefinition) -> Self {
        Self {
            map,
            entities: HashMap::new(),
            observers: HashMap::new(),
            next_entity_id: 1,
            authority_identity: None,
        }
    }

    /// Identity that legitimately owns the authority's local connection.
    pub fn set_authority_identity(&mut self, persistent_id: &str) {
        self.authority_identity = Some(persistent_id.to_string());
    }

    /// Makes sure `record` has exactly one live entity matching its state.
    ///
    /// An existing avatar is reused: ownership follows the record's current
    /// connection and movement is enabled only while connected. Otherwise a
    /// new avatar is placed at `spawn_point(slot_index)`, owned by the
    /// record's connection, or unowned and disabled if it is offline.
    pub fn spawn_or_restore(
        &mut self,
        record: &mut ParticipantRecord,
        slot_index: usize,
    ) -> Result<SpawnOutcome, SpawnError> {
        if record.role.is_spectator() {
            // A kept avatar stays in the world but nobody drives it.
            if let Some(entity_id) = record.owned_entity {
                self.set_movement_enabled(entity_id, false);
            }
            return Ok(match (record.connected, record.connection_id) {
                (true, Some(connection_id)) => {
                    let (entity_id, created) = self.ensure_observer(connection_id);
                    SpawnOutcome::Observer { entity_id, created }
                }
                _ => SpawnOutcome::Skipped,
            });
        }

        if let Some(entity_id) = record.owned_entity {
            if self.is_live_avatar(entity_id) {
                return self.restore(entity_id, record);
            }
            warn!(
                "Entity {} of {} is gone, spawning a replacement",
                entity_id, record.persistent_id
            );
        }

        let template = self.map.avatar.ok_or(SpawnError::MissingTemplate)?;
        let position = self.map.spawn_point(slot_index);
        let owner = if record.connected {
            record.connection_id
        } else {
            None
        };

        let entity_id = self.allocate_id();
        self.entities.insert(
            entity_id,
            WorldEntity {
                id: entity_id,
                kind: EntityKind::Avatar,
                owner,
                movement_enabled: record.connected,
                mover: AuthoritativeMover::new(position, template.move_speed),
            },
        );
        record.owned_entity = Some(entity_id);

        info!(
            "Spawned avatar {} for {} at ({:.1}, {:.1}, {:.1}), owner {:?}",
            entity_id, record.persistent_id, position.x, position.y, position.z, owner
        );
        Ok(SpawnOutcome::Spawned { entity_id })
    }

    fn restore(
        &mut self,
        entity_id: EntityId,
        record: &ParticipantRecord,
    ) -> Result<SpawnOutcome, SpawnError> {
        let mut ownership_changed = false;
        if let (true, Some(connection_id)) = (record.connected, record.connection_id) {
            let current_owner = self.entities.get(&entity_id).and_then(|e| e.owner);
            if current_owner != Some(connection_id) {
                self.transfer_ownership(entity_id, connection_id, &record.persistent_id)?;
                ownership_changed = true;
            }
        }

        self.set_movement_enabled(entity_id, record.connected);
        Ok(SpawnOutcome::Restored {
            entity_id,
            ownership_changed,
        })
    }

    /// Hands control of an entity to another connection.
    ///
    /// The authority's local connection only ever receives an entity on
    /// behalf of the authority's own identity.
    pub fn transfer_ownership(
        &mut self,
        entity_id: EntityId,
        to: ConnectionId,
        persistent_id: &str,
    ) -> Result<(), SpawnError> {
        if to == AUTHORITY_CONNECTION_ID
            && self.authority_identity.as_deref() != Some(persistent_id)
        {
            warn!(
                "Refusing to hand entity {} of {} to the local connection",
                entity_id, persistent_id
            );
            return Err(SpawnError::AuthorityOwnership { entity_id });
        }

        if let Some(entity) = self.entities.get_mut(&entity_id) {
            let previous = entity.owner.replace(to);
            entity.mover.restart_sequence();
            info!(
                "Entity {} ownership {:?} -> {} ({})",
                entity_id, previous, to, persistent_id
            );
        }
        Ok(())
    }

    /// Passive observer for a spectating connection, created at most once.
    pub fn ensure_observer(&mut self, connection_id: ConnectionId) -> (EntityId, bool) {
        if let Some(&entity_id) = self.observers.get(&connection_id) {
            return (entity_id, false);
        }

        let entity_id = self.allocate_id();
        self.entities.insert(
            entity_id,
            WorldEntity {
                id: entity_id,
                kind: EntityKind::Observer,
                owner: Some(connection_id),
                movement_enabled: false,
                mover: AuthoritativeMover::new(Vec3::ZERO, 0.0),
            },
        );
        self.observers.insert(connection_id, entity_id);
        info!("Observer {} created for connection {}", entity_id, connection_id);
        (entity_id, true)
    }

    pub fn release_observer(&mut self, connection_id: ConnectionId) -> Option<EntityId> {
        let entity_id = self.observers.remove(&connection_id)?;
        self.entities.remove(&entity_id);
        debug!("Observer {} released", entity_id);
        Some(entity_id)
    }

    pub fn set_movement_enabled(&mut self, entity_id: EntityId, enabled: bool) -> bool {
        match self.entities.get_mut(&entity_id) {
            Some(entity) => {
                entity.movement_enabled = enabled;
                true
            }
            None => false,
        }
    }

    /// Destroys an entity; true only for the call that actually removed it.
    pub fn despawn(&mut self, entity_id: EntityId) -> bool {
        match self.entities.remove(&entity_id) {
            Some(entity) => {
                info!("Despawned {:?} {}", entity.kind, entity_id);
                true
            }
            None => false,
        }
    }

    /// Applies an input received from `sender` for `entity_id`.
    pub fn apply_input(
        &mut self,
        entity_id: EntityId,
        sender: ConnectionId,
        input: &PredictedInput,
    ) -> Option<Correction> {
        let Some(entity) = self.entities.get_mut(&entity_id) else {
            warn!("Input for unknown entity {}", entity_id);
            return None;
        };

        if entity.kind != EntityKind::Avatar || entity.owner != Some(sender) {
            warn!(
                "Connection {} does not control entity {} (owner {:?})",
                sender, entity_id, entity.owner
            );
            return None;
        }
        if !entity.movement_enabled {
            debug!("Movement disabled for entity {}, dropping tick {}", entity_id, input.tick);
            return None;
        }

        match entity.mover.apply(input) {
            Ok(correction) => Some(correction),
            Err(InputRejection::Duplicate {
                tick,
                last_processed,
            }) => {
                debug!(
                    "Duplicate input tick {} for entity {} (last {})",
                    tick, entity_id, last_processed
                );
                None
            }
            Err(InputRejection::NonFinite) => {
                warn!("Non-finite input from connection {}", sender);
                None
            }
        }
    }

    /// Notice telling the owner which entity it drives and where it stands.
    pub fn assignment(&self, entity_id: EntityId) -> Option<(ConnectionId, Packet)> {
        let entity = self.entities.get(&entity_id)?;
        let owner = entity.owner?;
        if entity.kind != EntityKind::Avatar {
            return None;
        }
        Some((
            owner,
            Packet::EntityAssigned {
                entity_id,
                position: entity.position(),
                move_speed: entity.mover.move_speed(),
            },
        ))
    }

    pub fn entity(&self, entity_id: EntityId) -> Option<&WorldEntity> {
        self.entities.get(&entity_id)
    }

    pub fn observer_for(&self, connection_id: ConnectionId) -> Option<EntityId> {
        self.observers.get(&connection_id).copied()
    }

    pub fn avatar_count(&self) -> usize {
        self.entities
            .values()
            .filter(|e| e.kind == EntityKind::Avatar)
            .count()
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    fn is_live_avatar(&self, entity_id: EntityId) -> bool {
        self.entities
            .get(&entity_id)
            .is_some_and(|e| e.kind == EntityKind::Avatar)
    }

    fn allocate_id(&mut self) -> EntityId {
        let id = self.next_entity_id;
        self.next_entity_id += 1;
        id
    }
}
