//! Map declaration: where avatars appear and what they are built from.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use shared::{Vec3, MOVE_SPEED};
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AvatarTemplate {
    pub move_speed: f32,
}

impl Default for AvatarTemplate {
    fn default() -> Self {
        Self {
            move_speed: MOVE_SPEED,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapDefinition {
    pub name: String,
    #[serde(default)]
    pub spawn_points: Vec<Vec3>,
    #[serde(default)]
    pub avatar: Option<AvatarTemplate>,
}

impl Default for MapDefinition {
    fn default() -> Self {
        Self {
            name: "arena".to_string(),
            spawn_points: vec![
                Vec3::new(-6.0, 0.0, -6.0),
                Vec3::new(6.0, 0.0, -6.0),
                Vec3::new(-6.0, 0.0, 6.0),
                Vec3::new(6.0, 0.0, 6.0),
            ],
            avatar: Some(AvatarTemplate::default()),
        }
    }
}

impl MapDefinition {
    pub fn from_json(text: &str, origin: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(text).map_err(|source| ConfigError::Parse {
            path: origin.to_string(),
            source,
        })
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let display = path.display().to_string();
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: display.clone(),
            source,
        })?;
        Self::from_json(&text, &display)
    }

    /// Spawn location for a slot; the origin when the map declares none.
    pub fn spawn_point(&self, slot_index: usize) -> Vec3 {
        if self.spawn_points.is_empty() {
            Vec3::ZERO
        } else {
            self.spawn_points[slot_index % self.spawn_points.len()]
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spawn_point_wraps_around() {
        let map = MapDefinition::default();
        assert_eq!(map.spawn_point(0), map.spawn_points[0]);
        assert_eq!(map.spawn_point(5), map.spawn_points[1]);
    }

    #[test]
    fn test_spawn_point_without_points_is_origin() {
        let map = MapDefinition {
            name: "void".into(),
            spawn_points: vec![],
            avatar: None,
        };
        assert_eq!(map.spawn_point(3), Vec3::ZERO);
    }

    #[test]
    fn test_parse_map_json() {
        let text = r#"{
            "name": "yard",
            "spawn_points": [{"x": 1.0, "y": 0.0, "z": 2.0}],
            "avatar": {"move_speed": 7.5}
        }"#;
        let map = MapDefinition::from_json(text, "yard.json").unwrap();
        assert_eq!(map.name, "yard");
        assert_eq!(map.spawn_points, vec![Vec3::new(1.0, 0.0, 2.0)]);
        assert_eq!(map.avatar, Some(AvatarTemplate { move_speed: 7.5 }));
    }

    #[test]
    fn test_map_without_avatar_parses() {
        let map = MapDefinition::from_json(r#"{"name": "bare"}"#, "bare.json").unwrap();
        assert!(map.avatar.is_none());
        assert!(map.spawn_points.is_empty());
    }

    #[test]
    fn test_parse_error_names_origin() {
        let err = MapDefinition::from_json("{not json", "broken.json").unwrap_err();
        assert!(err.to_string().contains("broken.json"));
    }
}
