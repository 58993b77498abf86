use serde::{Deserialize, Serialize};
use std::ops::{Add, AddAssign, Mul, Sub};

pub mod prediction;

pub const PROTOCOL_VERSION: u32 = 1;
pub const MOVE_SPEED: f32 = 5.0;
pub const DEFAULT_MAX_SLOTS: usize = 5;
/// Squared magnitude below which a movement intent counts as idle.
pub const INTENT_DEADZONE_SQ: f32 = 0.0001;
/// Connection id reserved for the authority's own local participant.
pub const AUTHORITY_CONNECTION_ID: ConnectionId = 0;
/// Receive buffer size on both ends; every packet must encode within it.
pub const MAX_PACKET_SIZE: usize = 2048;
/// Longest persistent id the authority accepts.
pub const MAX_PERSISTENT_ID_LEN: usize = 64;
/// Most slots a session may have. At `MAX_PERSISTENT_ID_LEN` per id the
/// full snapshot still fits in `MAX_PACKET_SIZE`.
pub const MAX_SLOTS_LIMIT: usize = 16;

pub type ConnectionId = u32;
pub type EntityId = u32;
pub type Tick = u32;

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Player,
    Spectator,
}

impl Role {
    pub fn from_spectator_flag(is_spectator: bool) -> Self {
        if is_spectator {
            Role::Spectator
        } else {
            Role::Player
        }
    }

    pub fn is_spectator(self) -> bool {
        self == Role::Spectator
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Default)]
pub struct Vec2 {
    pub x: f32,
    pub y: f32,
}

impl Vec2 {
    pub const ZERO: Vec2 = Vec2 { x: 0.0, y: 0.0 };

    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    pub fn length_squared(&self) -> f32 {
        self.x * self.x + self.y * self.y
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Default)]
pub struct Vec3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Vec3 {
    pub const ZERO: Vec3 = Vec3 {
        x: 0.0,
        y: 0.0,
        z: 0.0,
    };

    pub fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    pub fn length(&self) -> f32 {
        (self.x * self.x + self.y * self.y + self.z * self.z).sqrt()
    }

    pub fn distance(&self, other: Vec3) -> f32 {
        (*self - other).length()
    }
}

impl Add for Vec3 {
    type Output = Vec3;

    fn add(self, rhs: Vec3) -> Vec3 {
        Vec3::new(self.x + rhs.x, self.y + rhs.y, self.z + rhs.z)
    }
}

impl AddAssign for Vec3 {
    fn add_assign(&mut self, rhs: Vec3) {
        self.x += rhs.x;
        self.y += rhs.y;
        self.z += rhs.z;
    }
}

impl Sub for Vec3 {
    type Output = Vec3;

    fn sub(self, rhs: Vec3) -> Vec3 {
        Vec3::new(self.x - rhs.x, self.y - rhs.y, self.z - rhs.z)
    }
}

impl Mul<f32> for Vec3 {
    type Output = Vec3;

    fn mul(self, rhs: f32) -> Vec3 {
        Vec3::new(self.x * rhs, self.y * rhs, self.z * rhs)
    }
}

/// Every message exchanged between the authority and its peers.
///
/// The first block is transport plumbing, the rest is the session and
/// movement protocol. Each variant is serialized by bincode through the
/// derived tag, so there are no stringly-typed message names.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub enum Packet {
    Hello {
        client_version: u32,
    },
    Welcome {
        connection_id: ConnectionId,
    },
    Rejected {
        reason: String,
    },
    Heartbeat,
    Goodbye,

    Join {
        persistent_id: String,
        desired_role: Role,
    },
    LobbySyncRequest,
    SessionSnapshot {
        slots: Vec<String>,
    },
    SetReady {
        persistent_id: String,
        ready: bool,
    },
    SetRole {
        persistent_id: String,
        is_spectator: bool,
    },
    GameStarted,
    EntityAssigned {
        entity_id: EntityId,
        position: Vec3,
        move_speed: f32,
    },

    MovementInput {
        intent: Vec2,
        delta_time: f32,
        tick: Tick,
    },
    MovementCorrection {
        authoritative_position: Vec3,
        acknowledged_tick: Tick,
    },
}

impl Packet {
    pub fn encode(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }
}

/// Ids must be non-empty and at most `MAX_PERSISTENT_ID_LEN` bytes.
pub fn is_valid_persistent_id(persistent_id: &str) -> bool {
    !persistent_id.is_empty() && persistent_id.len() <= MAX_PERSISTENT_ID_LEN
}

/// Returns true when an intent is too small to be worth a tick.
pub fn is_negligible(intent: Vec2) -> bool {
    intent.length_squared() < INTENT_DEADZONE_SQ
}

/// Displacement produced by one unit of movement input.
///
/// The planar intent maps onto the ground plane: `(x, 0, y) * speed * dt`.
/// Peer prediction, peer replay and the authority all go through this.
pub fn movement_delta(intent: Vec2, speed: f32, delta_time: f32) -> Vec3 {
    Vec3::new(intent.x, 0.0, intent.y) * speed * delta_time
}

pub fn apply_movement(position: &mut Vec3, intent: Vec2, speed: f32, delta_time: f32) {
    *position += movement_delta(intent, speed, delta_time);
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    #[test]
    fn test_movement_delta_maps_intent_to_ground_plane() {
        let delta = movement_delta(Vec2::new(1.0, -0.5), 5.0, 0.1);
        assert_approx_eq!(delta.x, 0.5, 1e-6);
        assert_eq!(delta.y, 0.0);
        assert_approx_eq!(delta.z, -0.25, 1e-6);
    }

    #[test]
    fn test_apply_movement_accumulates() {
        let mut position = Vec3::new(1.0, 2.0, 3.0);
        apply_movement(&mut position, Vec2::new(0.0, 1.0), MOVE_SPEED, 0.2);
        apply_movement(&mut position, Vec2::new(0.0, 1.0), MOVE_SPEED, 0.2);
        assert_approx_eq!(position.x, 1.0, 1e-6);
        assert_approx_eq!(position.y, 2.0, 1e-6);
        assert_approx_eq!(position.z, 5.0, 1e-5);
    }

    #[test]
    fn test_negligible_intent_threshold() {
        assert!(is_negligible(Vec2::ZERO));
        assert!(is_negligible(Vec2::new(0.005, 0.005)));
        assert!(!is_negligible(Vec2::new(0.02, 0.0)));
        assert!(!is_negligible(Vec2::new(-1.0, 0.0)));
    }

    #[test]
    fn test_persistent_id_bounds() {
        assert!(!is_valid_persistent_id(""));
        assert!(is_valid_persistent_id("a"));
        assert!(is_valid_persistent_id(&"x".repeat(MAX_PERSISTENT_ID_LEN)));
        assert!(!is_valid_persistent_id(&"x".repeat(MAX_PERSISTENT_ID_LEN + 1)));
    }

    #[test]
    fn test_role_from_spectator_flag() {
        assert_eq!(Role::from_spectator_flag(true), Role::Spectator);
        assert_eq!(Role::from_spectator_flag(false), Role::Player);
        assert!(Role::Spectator.is_spectator());
        assert!(!Role::Player.is_spectator());
    }

    #[test]
    fn test_vec3_distance() {
        let a = Vec3::new(0.0, 0.0, 0.0);
        let b = Vec3::new(3.0, 0.0, 4.0);
        assert_approx_eq!(a.distance(b), 5.0, 1e-6);
    }

    #[test]
    fn test_packet_serialization_join() {
        let packet = Packet::Join {
            persistent_id: "3f2a-player".to_string(),
            desired_role: Role::Spectator,
        };
        let bytes = packet.encode().unwrap();

        match Packet::decode(&bytes).unwrap() {
            Packet::Join {
                persistent_id,
                desired_role,
            } => {
                assert_eq!(persistent_id, "3f2a-player");
                assert_eq!(desired_role, Role::Spectator);
            }
            _ => panic!("Wrong packet type after deserialization"),
        }
    }

    #[test]
    fn test_packet_serialization_snapshot_keeps_slot_order() {
        let slots = vec![
            "Player 1 (A) [Connected, Ready]".to_string(),
            "Empty Slot".to_string(),
        ];
        let packet = Packet::SessionSnapshot {
            slots: slots.clone(),
        };

        let decoded = Packet::decode(&packet.encode().unwrap()).unwrap();
        assert_eq!(decoded, Packet::SessionSnapshot { slots });
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(Packet::decode(&[]).is_err());
        assert!(Packet::decode(&[0xFF, 0xFF, 0xFF, 0xFF]).is_err());
    }
}
